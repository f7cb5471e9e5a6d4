//! Replication of entity state to peers.
//!
//! Each peer is introduced to an entity with a reliable `EntitySpawn` before
//! the entity shows up in its best-effort snapshots. Peers that are loading a
//! scene get nothing here; they receive a full refresh when they acknowledge.

use session_shared::{
    ecs::{EntityId, World},
    health::Health,
    math::Pose,
    net::{ConnectionId, DamageCause, EntitySnapshot, EntitySpawn, EntityState, NetMsg},
};

use crate::{
    outbox::Outbox,
    registry::{ConnectionRegistry, ConnectionView},
};

/// Server-side component: the connection an entity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner(pub ConnectionId);

fn entity_states(world: &World) -> Vec<EntityState> {
    world
        .iter::<Health>()
        .map(|(id, health)| EntityState {
            id,
            health: health.current(),
            pose: world.get::<Pose>(id).copied().unwrap_or_default(),
        })
        .collect()
}

fn introduce(world: &World, view: &mut ConnectionView, outbox: &mut Outbox) {
    view.replica.retain(|id| world.contains(*id));
    for (id, health) in world.iter::<Health>() {
        if view.replica.insert(id) {
            outbox.reliable(
                view.id(),
                NetMsg::EntitySpawn(EntitySpawn {
                    id,
                    owner: world.get::<Owner>(id).map(|o| o.0),
                    max_health: health.max(),
                    health: health.current(),
                    pose: world.get::<Pose>(id).copied().unwrap_or_default(),
                }),
            );
        }
    }
}

/// Periodic snapshot to every peer that is not loading.
pub fn broadcast_snapshot(
    world: &World,
    registry: &mut ConnectionRegistry,
    outbox: &mut Outbox,
    tick: u32,
) {
    let entities = entity_states(world);
    for view in registry.iter_mut() {
        if view.is_loading_level() {
            continue;
        }
        introduce(world, view, outbox);
        if !entities.is_empty() {
            outbox.unreliable(
                view.id(),
                NetMsg::EntitySnapshot(EntitySnapshot {
                    tick,
                    entities: entities.clone(),
                }),
            );
        }
    }
}

/// Forgets everything the peer was told and re-sends the whole world.
pub fn full_refresh(
    world: &World,
    registry: &mut ConnectionRegistry,
    outbox: &mut Outbox,
    connection: ConnectionId,
    tick: u32,
) {
    let Some(view) = registry.get_mut(connection) else {
        return;
    };
    view.replica.clear();
    introduce(world, view, outbox);
    let entities = entity_states(world);
    if !entities.is_empty() {
        outbox.unreliable(
            connection,
            NetMsg::EntitySnapshot(EntitySnapshot { tick, entities }),
        );
    }
}

/// Sends the destruction payload to every peer that knows the entity.
pub fn announce_destroyed(
    registry: &mut ConnectionRegistry,
    outbox: &mut Outbox,
    entity: EntityId,
    death_cause: Option<DamageCause>,
) {
    for view in registry.iter_mut() {
        if view.replica.forget(entity) {
            outbox.reliable(
                view.id(),
                NetMsg::EntityDestroyed {
                    entity,
                    death_cause: death_cause.clone(),
                },
            );
        }
    }
}

/// Drops every peer's view. Peers clear their own replicas on `LoadScene`.
pub fn reset_all(registry: &mut ConnectionRegistry) {
    for view in registry.iter_mut() {
        view.replica.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn world_with(ids: &[u64]) -> World {
        let mut world = World::default();
        for &id in ids {
            world.register(EntityId(id));
            world.insert(EntityId(id), Health::new(100));
            world.insert(EntityId(id), Pose::ORIGIN);
        }
        world
    }

    fn kinds(outbox: &mut Outbox) -> Vec<(u32, &'static str)> {
        outbox
            .drain()
            .into_iter()
            .map(|o| (o.to.0, o.msg.kind()))
            .collect()
    }

    #[test]
    fn spawn_precedes_first_snapshot_only_once() {
        let world = world_with(&[1]);
        let mut reg = ConnectionRegistry::new();
        reg.add(ConnectionId(1));
        let mut out = Outbox::new();

        broadcast_snapshot(&world, &mut reg, &mut out, 0);
        assert_eq!(
            kinds(&mut out),
            vec![(1, "EntitySpawn"), (1, "EntitySnapshot")]
        );
        broadcast_snapshot(&world, &mut reg, &mut out, 1);
        assert_eq!(kinds(&mut out), vec![(1, "EntitySnapshot")]);
    }

    #[test]
    fn loading_peers_get_no_updates() {
        let world = world_with(&[1]);
        let mut reg = ConnectionRegistry::new();
        reg.add(ConnectionId(1));
        reg.get_mut(ConnectionId(1))
            .unwrap()
            .begin_loading(Duration::ZERO);
        let mut out = Outbox::new();
        broadcast_snapshot(&world, &mut reg, &mut out, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn full_refresh_reintroduces_everything() {
        let world = world_with(&[1, 2]);
        let mut reg = ConnectionRegistry::new();
        reg.add(ConnectionId(1));
        let mut out = Outbox::new();
        broadcast_snapshot(&world, &mut reg, &mut out, 0);
        out.drain();

        full_refresh(&world, &mut reg, &mut out, ConnectionId(1), 1);
        assert_eq!(
            kinds(&mut out),
            vec![(1, "EntitySpawn"), (1, "EntitySpawn"), (1, "EntitySnapshot")]
        );
    }

    #[test]
    fn destroyed_goes_only_to_peers_that_know_the_entity() {
        let world = world_with(&[1]);
        let mut reg = ConnectionRegistry::new();
        reg.add(ConnectionId(1));
        reg.add(ConnectionId(2));
        reg.get_mut(ConnectionId(2))
            .unwrap()
            .begin_loading(Duration::ZERO);
        let mut out = Outbox::new();
        broadcast_snapshot(&world, &mut reg, &mut out, 0);
        out.drain();

        announce_destroyed(&mut reg, &mut out, EntityId(1), None);
        assert_eq!(kinds(&mut out), vec![(1, "EntityDestroyed")]);
        assert!(!reg.get(ConnectionId(1)).unwrap().replica().knows(EntityId(1)));
    }
}
