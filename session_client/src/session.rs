//! Client protocol state.
//!
//! [`ClientSession`] is socket-free: feed it server messages with
//! [`ClientSession::handle`] and send whatever [`ClientSession::finish_loading`]
//! returns. It tracks the scene handshake and a replica world of
//! [`HealthReplica`] + [`Pose`] components, raising [`ReplicaEvent`]s to
//! subscribers.

use session_shared::{
    ecs::{EntityId, World},
    event::{Observers, SubscriptionId},
    health::{HealthReplica, ReplicaEvent},
    math::Pose,
    net::{ConnectionId, EntitySnapshot, EntitySpawn, NetMsg},
};
use tracing::{debug, info, trace};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Handshake done, no scene yet.
    Connected,
    /// Got `LoadScene`, not acknowledged yet.
    LoadingScene,
    /// Scene acknowledged; receiving entity state.
    InScene,
    Disconnected,
}

pub struct ClientSession {
    connection: ConnectionId,
    state: ClientState,
    scene_name: Option<String>,
    generation: u32,
    world: World,
    last_snapshot_tick: Option<u32>,
    events: Observers<ReplicaEvent>,
    server_messages: Vec<String>,
    disconnect_reason: Option<String>,
}

impl ClientSession {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            state: ClientState::Connected,
            scene_name: None,
            generation: 0,
            world: World::default(),
            last_snapshot_tick: None,
            events: Observers::new(),
            server_messages: Vec::new(),
            disconnect_reason: None,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn scene_name(&self) -> Option<&str> {
        self.scene_name.as_deref()
    }

    /// Generation of the latest `LoadScene` received.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_loading(&self) -> bool {
        self.state == ClientState::LoadingScene
    }

    pub fn replica(&self, entity: EntityId) -> Option<&HealthReplica> {
        self.world.get::<HealthReplica>(entity)
    }

    pub fn pose(&self, entity: EntityId) -> Option<Pose> {
        self.world.get::<Pose>(entity).copied()
    }

    pub fn replicas(&self) -> impl Iterator<Item = &HealthReplica> {
        self.world.iter::<HealthReplica>().map(|(_, r)| r)
    }

    /// The entity this client embodies, if any.
    pub fn owned_entity(&self) -> Option<EntityId> {
        self.replicas().find(|r| r.is_owned()).map(|r| r.entity())
    }

    pub fn server_messages(&self) -> &[String] {
        &self.server_messages
    }

    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnect_reason.as_deref()
    }

    pub fn subscribe(&mut self, f: impl FnMut(&ReplicaEvent) + Send + 'static) -> SubscriptionId {
        self.events.subscribe(f)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn handle(&mut self, msg: NetMsg) {
        if self.state == ClientState::Disconnected {
            return;
        }
        match msg {
            NetMsg::LoadScene {
                scene_name,
                generation,
            } => self.on_load_scene(scene_name, generation),
            NetMsg::EntitySpawn(spawn) => self.on_entity_spawn(spawn),
            NetMsg::EntitySnapshot(snapshot) => self.on_snapshot(snapshot),
            NetMsg::EntityDestroyed {
                entity,
                death_cause,
            } => {
                let Some(replica) = self.world.get::<HealthReplica>(entity).cloned() else {
                    return;
                };
                self.world.despawn(entity);
                debug!(entity = %entity, cause = ?death_cause, "Entity destroyed");
                replica.destroyed(death_cause, &mut self.events);
            }
            NetMsg::OwnerHurt { entity } => {
                if self.replica(entity).is_some_and(|r| r.is_owned()) {
                    self.events.emit(&ReplicaEvent::OwnerHurtSignal { entity });
                }
            }
            NetMsg::ServerPrint { message } => {
                info!(message = %message, "Server message");
                self.server_messages.push(message);
            }
            NetMsg::Disconnect { reason } => self.mark_disconnected(reason),
            other => debug!(kind = other.kind(), "Unhandled message"),
        }
    }

    fn on_load_scene(&mut self, scene_name: String, generation: u32) {
        if generation <= self.generation {
            trace!(generation, current = self.generation, "Old LoadScene");
            return;
        }
        info!(scene = %scene_name, generation, "Loading scene");
        self.scene_name = Some(scene_name);
        self.generation = generation;
        self.world.clear();
        self.last_snapshot_tick = None;
        self.state = ClientState::LoadingScene;
    }

    fn on_entity_spawn(&mut self, spawn: EntitySpawn) {
        if self.state != ClientState::InScene {
            return;
        }
        let owned = spawn.owner == Some(self.connection);
        self.world.register(spawn.id);
        self.world.insert(
            spawn.id,
            HealthReplica::new(spawn.id, spawn.health, spawn.max_health, owned),
        );
        self.world.insert(spawn.id, spawn.pose);
        debug!(entity = %spawn.id, owned, health = spawn.health, "Entity spawned");
    }

    fn on_snapshot(&mut self, snapshot: EntitySnapshot) {
        if self.state != ClientState::InScene {
            return;
        }
        if self.last_snapshot_tick.is_some_and(|last| snapshot.tick < last) {
            trace!(tick = snapshot.tick, "Out-of-order snapshot");
            return;
        }
        self.last_snapshot_tick = Some(snapshot.tick);
        for state in snapshot.entities {
            let Some(replica) = self.world.get_mut::<HealthReplica>(state.id) else {
                continue;
            };
            replica.apply_snapshot(state.health, &mut self.events);
            if let Some(pose) = self.world.get_mut::<Pose>(state.id) {
                *pose = state.pose;
            }
        }
    }

    /// Marks the pending scene as loaded. Returns the acknowledgement to send,
    /// or `None` if nothing is loading.
    pub fn finish_loading(&mut self) -> Option<NetMsg> {
        if self.state != ClientState::LoadingScene {
            return None;
        }
        self.state = ClientState::InScene;
        debug!(generation = self.generation, "Scene loaded");
        Some(NetMsg::LoadSceneDone {
            generation: self.generation,
        })
    }

    /// Moves to `Disconnected`. The first reason recorded is kept.
    pub fn mark_disconnected(&mut self, reason: impl Into<String>) {
        if self.state == ClientState::Disconnected {
            return;
        }
        let reason = reason.into();
        info!(reason = %reason, "Disconnected");
        self.disconnect_reason = Some(reason);
        self.state = ClientState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_shared::net::{DamageCause, EntityState};
    use std::sync::{Arc, Mutex};

    fn in_scene(connection: u32) -> ClientSession {
        let mut s = ClientSession::new(ConnectionId(connection));
        s.handle(NetMsg::LoadScene {
            scene_name: "arena".into(),
            generation: 1,
        });
        s.finish_loading();
        s
    }

    fn spawn(id: u64, owner: u32, health: u8) -> NetMsg {
        NetMsg::EntitySpawn(EntitySpawn {
            id: EntityId(id),
            owner: Some(ConnectionId(owner)),
            max_health: 100,
            health,
            pose: Pose::ORIGIN,
        })
    }

    fn snapshot(tick: u32, id: u64, health: u8) -> NetMsg {
        NetMsg::EntitySnapshot(EntitySnapshot {
            tick,
            entities: vec![EntityState {
                id: EntityId(id),
                health,
                pose: Pose::ORIGIN,
            }],
        })
    }

    fn recorder(s: &mut ClientSession) -> Arc<Mutex<Vec<ReplicaEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        s.subscribe(move |e| l.lock().unwrap().push(e.clone()));
        log
    }

    #[test]
    fn load_scene_acks_its_generation_once() {
        let mut s = ClientSession::new(ConnectionId(1));
        assert_eq!(s.finish_loading(), None);
        s.handle(NetMsg::LoadScene {
            scene_name: "arena".into(),
            generation: 3,
        });
        assert!(s.is_loading());
        assert_eq!(
            s.finish_loading(),
            Some(NetMsg::LoadSceneDone { generation: 3 })
        );
        assert_eq!(s.finish_loading(), None);
        assert_eq!(s.state(), ClientState::InScene);
    }

    #[test]
    fn new_scene_clears_replicas() {
        let mut s = in_scene(1);
        s.handle(spawn(5, 1, 100));
        assert_eq!(s.owned_entity(), Some(EntityId(5)));
        s.handle(NetMsg::LoadScene {
            scene_name: "dust".into(),
            generation: 2,
        });
        assert!(s.replica(EntityId(5)).is_none());
    }

    #[test]
    fn snapshot_drop_raises_hurt_for_owner() {
        let mut s = in_scene(1);
        s.handle(spawn(5, 1, 100));
        s.handle(spawn(6, 2, 100));
        let log = recorder(&mut s);

        s.handle(snapshot(10, 5, 60));
        s.handle(snapshot(11, 6, 90));
        s.handle(snapshot(12, 6, 95));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ReplicaEvent::Hurt {
                    entity: EntityId(5),
                    previous: 100,
                    current: 60
                },
                ReplicaEvent::LocalPlayerHurt {
                    entity: EntityId(5)
                },
                ReplicaEvent::Hurt {
                    entity: EntityId(6),
                    previous: 100,
                    current: 90
                },
            ]
        );
        assert_eq!(s.replica(EntityId(6)).unwrap().health(), 95);
    }

    #[test]
    fn older_snapshot_is_ignored() {
        let mut s = in_scene(1);
        s.handle(spawn(5, 1, 100));
        s.handle(snapshot(10, 5, 50));
        s.handle(snapshot(9, 5, 80));
        assert_eq!(s.replica(EntityId(5)).unwrap().health(), 50);
    }

    #[test]
    fn destroyed_raises_died_with_cause() {
        let mut s = in_scene(1);
        s.handle(spawn(5, 1, 40));
        let log = recorder(&mut s);
        let cause = Some(DamageCause::new("rocket"));
        s.handle(NetMsg::EntityDestroyed {
            entity: EntityId(5),
            death_cause: cause.clone(),
        });
        assert!(s.replica(EntityId(5)).is_none());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ReplicaEvent::Died {
                    entity: EntityId(5),
                    cause: cause.clone()
                },
                ReplicaEvent::LocalPlayerDied {
                    entity: EntityId(5),
                    cause
                },
            ]
        );
    }

    #[test]
    fn owner_hurt_only_for_owned_entity() {
        let mut s = in_scene(1);
        s.handle(spawn(5, 1, 100));
        s.handle(spawn(6, 2, 100));
        let log = recorder(&mut s);
        s.handle(NetMsg::OwnerHurt {
            entity: EntityId(6),
        });
        s.handle(NetMsg::OwnerHurt {
            entity: EntityId(5),
        });
        assert_eq!(
            *log.lock().unwrap(),
            vec![ReplicaEvent::OwnerHurtSignal {
                entity: EntityId(5)
            }]
        );
    }

    #[test]
    fn entity_messages_while_loading_are_dropped() {
        let mut s = ClientSession::new(ConnectionId(1));
        s.handle(NetMsg::LoadScene {
            scene_name: "arena".into(),
            generation: 1,
        });
        s.handle(spawn(5, 1, 100));
        assert!(s.replica(EntityId(5)).is_none());
    }
}
