//! The authoritative session.
//!
//! `Session` owns every piece of core state and is mutated only from the tick
//! loop. Network input arrives as [`Session::connect`], [`Session::disconnect`]
//! and [`Session::handle_message`] calls between ticks; output is queued in the
//! [`Outbox`] and drained by the IO layer.

use std::time::Duration;

use session_shared::{
    config::ServerConfig,
    ecs::{EntityId, World},
    event::{Observers, SubscriptionId},
    health::{DamageOutcome, Health},
    net::{ConnectionId, DamageCause, NetMsg},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::SessionError,
    match_state::{MatchState, MatchStateMachine},
    outbox::{Outbox, Outgoing},
    policy::{DeathmatchPolicy, MatchContext, MatchPolicy, PolicyFactory},
    registry::ConnectionRegistry,
    replication::{self, Owner},
    respawn::RespawnScheduler,
    scene::{AckOutcome, ImmediateSceneLoader, SceneCoordinator, SceneLoader},
    spawn::{
        EntityFactory, LocalEntityFactory, PrefabRef, SpawnPointRegistry, SpawnPoints,
        SpawnResult, SpawnedEntity, Spawner,
    },
};

/// Raised when an entity survives a hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DamageEvent {
    pub entity: EntityId,
    pub owner: Option<ConnectionId>,
    pub amount: u32,
    pub remaining: u8,
    pub cause: DamageCause,
}

/// Raised when an entity's health reaches zero, before it is destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathEvent {
    pub entity: EntityId,
    pub owner: Option<ConnectionId>,
    pub cause: DamageCause,
}

/// External collaborators injected into a session.
pub struct Collaborators {
    pub scene_loader: Box<dyn SceneLoader>,
    pub entity_factory: Box<dyn EntityFactory>,
    pub spawn_points: Box<dyn SpawnPoints>,
    pub policy_factory: PolicyFactory,
}

impl Collaborators {
    /// In-process collaborators: scenes load instantly, entities are
    /// allocated locally, every match is a deathmatch with the configured
    /// prefab.
    pub fn local(cfg: &ServerConfig) -> Self {
        let prefab = PrefabRef::new(cfg.player_prefab.clone(), cfg.player_max_health);
        Self {
            scene_loader: Box::new(ImmediateSceneLoader),
            entity_factory: Box::new(LocalEntityFactory::default()),
            spawn_points: Box::new(SpawnPointRegistry::new(cfg.spawn_points.clone())),
            policy_factory: Box::new(move |_scene: &str| -> Box<dyn MatchPolicy> {
                Box::new(DeathmatchPolicy::new(prefab.clone()))
            }),
        }
    }
}

pub struct Session {
    registry: ConnectionRegistry,
    scene: SceneCoordinator,
    current_match: Option<MatchStateMachine>,
    spawner: Spawner,
    world: World,
    outbox: Outbox,
    scene_loader: Box<dyn SceneLoader>,
    policy_factory: PolicyFactory,
    respawn_delay: Duration,
    snapshot_interval: u32,
    tick: u32,
    now: Duration,
    damage_events: Observers<DamageEvent>,
    death_events: Observers<DeathEvent>,
}

impl Session {
    pub fn new(cfg: &ServerConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            scene_loader,
            entity_factory,
            spawn_points,
            policy_factory,
        } = collaborators;
        Self {
            registry: ConnectionRegistry::new(),
            scene: SceneCoordinator::new(),
            current_match: None,
            spawner: Spawner::new(entity_factory, spawn_points, cfg.rng_seed),
            world: World::default(),
            outbox: Outbox::new(),
            scene_loader,
            policy_factory,
            respawn_delay: cfg.respawn_delay(),
            snapshot_interval: cfg.snapshot_interval_ticks,
            tick: 0,
            now: Duration::ZERO,
            damage_events: Observers::new(),
            death_events: Observers::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn scene(&self) -> &SceneCoordinator {
        &self.scene
    }

    pub fn generation(&self) -> u32 {
        self.scene.generation()
    }

    pub fn scene_name(&self) -> Option<&str> {
        self.scene.scene_name()
    }

    pub fn current_match(&self) -> Option<&MatchStateMachine> {
        self.current_match.as_ref()
    }

    pub fn match_state(&self) -> Option<MatchState> {
        self.current_match.as_ref().map(|m| m.state())
    }

    /// Number of ticks run so far.
    pub fn tick_count(&self) -> u32 {
        self.tick
    }

    /// Session time of the latest tick.
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn pawn_of(&self, connection: ConnectionId) -> Option<EntityId> {
        self.registry
            .get(connection)
            .and_then(|v| v.controller().pawn())
    }

    pub fn health_of(&self, entity: EntityId) -> Option<Health> {
        self.world.get::<Health>(entity).copied()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        self.outbox.drain()
    }

    pub fn on_damage(&mut self, f: impl FnMut(&DamageEvent) + Send + 'static) -> SubscriptionId {
        self.damage_events.subscribe(f)
    }

    pub fn on_death(&mut self, f: impl FnMut(&DeathEvent) + Send + 'static) -> SubscriptionId {
        self.death_events.subscribe(f)
    }

    /// Runs `f` against the current match with a context borrowing the rest
    /// of the session. `None` if no scene has been loaded.
    fn with_match<R>(
        &mut self,
        f: impl FnOnce(&mut MatchStateMachine, &mut MatchContext<'_>) -> R,
    ) -> Option<R> {
        let current = self.current_match.as_mut()?;
        let mut ctx = MatchContext {
            registry: &mut self.registry,
            spawner: &mut self.spawner,
            scene_name: self.scene.scene_name().unwrap_or_default(),
            generation: self.scene.generation(),
            scene_loading: self.scene.is_loading(),
            now: self.now,
        };
        Some(f(current, &mut ctx))
    }

    /// A new peer finished the transport handshake.
    pub fn connect(&mut self, connection: ConnectionId) -> Result<(), SessionError> {
        if !self.registry.add(connection) {
            return Ok(());
        }
        info!(connection = ?connection, players = self.registry.len(), "Player joined");

        if let Some(msg) = self.scene.load_message() {
            if let Some(view) = self.registry.get_mut(connection) {
                view.begin_loading(self.now);
            }
            self.outbox.reliable(connection, msg);
        }

        self.with_match(|m, ctx| m.handle_new_player(ctx, connection))
            .unwrap_or(Ok(()))
    }

    /// A peer went away. Unknown connections are ignored.
    pub fn disconnect(&mut self, connection: ConnectionId) {
        let Some(view) = self.registry.remove(connection) else {
            return;
        };
        if let Some(current) = self.current_match.as_mut() {
            current.forget_connection(connection);
        }
        if let Some(pawn) = view.controller().pawn() {
            self.destroy_entity(pawn, None);
        }
        info!(connection = ?connection, players = self.registry.len(), "Player left");
        self.check_all_loaded();
    }

    pub fn handle_message(&mut self, connection: ConnectionId, msg: NetMsg) {
        if !self.registry.contains(connection) {
            trace!(connection = ?connection, kind = msg.kind(), "Message from unknown connection");
            return;
        }
        match msg {
            NetMsg::LoadSceneDone { generation } => self.on_load_scene_done(connection, generation),
            other => debug!(connection = ?connection, kind = other.kind(), "Ignoring message"),
        }
    }

    fn on_load_scene_done(&mut self, connection: ConnectionId, generation: u32) {
        if generation != self.scene.generation() {
            trace!(
                connection = ?connection,
                generation,
                current = self.scene.generation(),
                "Stale LoadSceneDone"
            );
            return;
        }
        let loading = self
            .registry
            .get(connection)
            .is_some_and(|v| v.is_loading_level());
        if !loading {
            trace!(connection = ?connection, generation, "Duplicate LoadSceneDone");
            return;
        }
        if self.scene.acknowledge(generation) == AckOutcome::Stale {
            return;
        }
        if let Some(view) = self.registry.get_mut(connection) {
            view.finish_loading();
        }
        debug!(
            connection = ?connection,
            generation,
            acks = self.scene.ack_count(),
            "Scene acknowledged"
        );
        replication::full_refresh(
            &self.world,
            &mut self.registry,
            &mut self.outbox,
            connection,
            self.tick,
        );
        self.check_all_loaded();
    }

    fn check_all_loaded(&mut self) {
        if !self.scene.try_complete(&self.registry) {
            return;
        }
        let generation = self.scene.generation();
        info!(
            generation,
            scene = self.scene.scene_name().unwrap_or_default(),
            "All clients loaded"
        );
        if let Some(current) = self.current_match.as_mut() {
            current.policy_mut().on_all_clients_loaded(generation);
        }
    }

    /// Moves every peer to `scene_name` under a new generation and starts a
    /// fresh match for it.
    pub fn load_scene(&mut self, scene_name: &str) -> Result<u32, SessionError> {
        if scene_name.is_empty() {
            return Err(SessionError::EmptySceneName);
        }

        self.with_match(|m, ctx| m.start_to_leave_map(ctx));

        let generation = self.scene.begin_load(scene_name);

        let entities: Vec<EntityId> = self.world.entities().collect();
        for entity in entities {
            self.spawner.release(entity);
        }
        self.world.clear();
        for view in self.registry.iter_mut() {
            view.controller.reset();
        }
        replication::reset_all(&mut self.registry);

        let msg = NetMsg::LoadScene {
            scene_name: scene_name.to_string(),
            generation,
        };
        self.outbox.broadcast_reliable(self.registry.ids(), &msg);

        for view in self.registry.iter_mut() {
            view.begin_loading(self.now);
        }

        self.scene.start_server_load(self.scene_loader.as_mut());

        let policy = (self.policy_factory)(scene_name);
        self.current_match = Some(MatchStateMachine::new(
            scene_name,
            policy,
            RespawnScheduler::new(self.respawn_delay),
        ));

        info!(
            scene = %scene_name,
            generation,
            players = self.registry.len(),
            "Loading scene"
        );
        Ok(generation)
    }

    /// Advances the session to `now`. A match error (a spawn that could not be
    /// requested) is returned after the rest of the tick has run.
    pub fn tick(&mut self, now: Duration) -> Result<(), SessionError> {
        self.now = now;

        if let Some(result) = self.scene.poll_load() {
            match result {
                Ok(()) => info!(
                    scene = self.scene.scene_name().unwrap_or_default(),
                    generation = self.scene.generation(),
                    "Scene ready on server"
                ),
                Err(e) => error!(
                    scene = self.scene.scene_name().unwrap_or_default(),
                    error = %e,
                    "Scene load failed"
                ),
            }
        }

        self.process_spawns();

        let match_result = self.with_match(|m, ctx| m.tick(ctx)).unwrap_or(Ok(()));

        if self.snapshot_interval > 0 && self.tick % self.snapshot_interval == 0 {
            replication::broadcast_snapshot(
                &self.world,
                &mut self.registry,
                &mut self.outbox,
                self.tick,
            );
        }
        self.tick = self.tick.wrapping_add(1);
        match_result
    }

    fn process_spawns(&mut self) {
        for result in self.spawner.poll() {
            match result {
                SpawnResult::Ready {
                    connection,
                    generation,
                    entity,
                } => self.complete_spawn(connection, generation, entity),
                SpawnResult::Failed {
                    connection,
                    generation,
                    error,
                } => {
                    warn!(connection = ?connection, generation, error = %error, "Spawn failed");
                    if generation == self.scene.generation() {
                        if let Some(view) = self.registry.get_mut(connection) {
                            view.controller.clear_spawn_pending();
                        }
                    }
                }
            }
        }
    }

    fn complete_spawn(&mut self, connection: ConnectionId, generation: u32, spawned: SpawnedEntity) {
        let current = generation == self.scene.generation();
        let Some(view) = self.registry.get_mut(connection).filter(|_| current) else {
            debug!(connection = ?connection, entity = %spawned.id, "Spawn abandoned");
            self.spawner.release(spawned.id);
            return;
        };
        if view.controller.pawn().is_some() {
            view.controller.clear_spawn_pending();
            debug!(connection = ?connection, entity = %spawned.id, "Already embodied");
            self.spawner.release(spawned.id);
            return;
        }
        view.controller.bind(spawned.id);

        let id = spawned.id;
        self.world.register(id);
        self.world.insert(id, Health::new(spawned.prefab.max_health));
        self.world.insert(id, spawned.pose);
        self.world.insert(id, Owner(connection));
        info!(
            connection = ?connection,
            entity = %id,
            prefab = %spawned.prefab.name,
            position = ?spawned.pose.position,
            "Player spawned"
        );
        if let Some(current) = self.current_match.as_mut() {
            current.policy_mut().on_player_spawned(connection, id);
        }
    }

    pub fn start_match(&mut self) -> Result<(), SessionError> {
        self.with_match(|m, ctx| m.start_match(ctx))
            .unwrap_or(Ok(()))
    }

    pub fn end_match(&mut self) {
        self.with_match(|m, ctx| m.end_match(ctx));
    }

    pub fn start_to_leave_map(&mut self) {
        self.with_match(|m, ctx| m.start_to_leave_map(ctx));
    }

    /// Authoritative damage. Unknown or dead entities are ignored.
    pub fn apply_damage(
        &mut self,
        entity: EntityId,
        amount: u32,
        cause: DamageCause,
    ) -> DamageOutcome {
        let Some(health) = self.world.get_mut::<Health>(entity) else {
            return DamageOutcome::Ignored;
        };
        let outcome = health.apply_damage(amount);
        let owner = self.world.get::<Owner>(entity).map(|o| o.0);

        match outcome {
            DamageOutcome::Ignored => {}
            DamageOutcome::Damaged { remaining } => {
                debug!(entity = %entity, amount, remaining, cause = %cause.kind, "Entity damaged");
                if let Some(current) = self.current_match.as_mut() {
                    current
                        .policy_mut()
                        .on_entity_damaged(entity, amount, &cause);
                }
                self.damage_events.emit(&DamageEvent {
                    entity,
                    owner,
                    amount,
                    remaining,
                    cause,
                });
                if let Some(owner) = owner {
                    let reachable = self
                        .registry
                        .get(owner)
                        .is_some_and(|v| !v.is_loading_level());
                    if reachable {
                        self.outbox.reliable(owner, NetMsg::OwnerHurt { entity });
                    }
                }
            }
            DamageOutcome::Died => self.die(entity, owner, cause),
        }
        outcome
    }

    /// Restores health up to max. Returns the amount restored.
    pub fn heal(&mut self, entity: EntityId, amount: u32) -> u8 {
        self.world
            .get_mut::<Health>(entity)
            .map(|h| h.heal(amount))
            .unwrap_or(0)
    }

    /// Kills regardless of remaining health. False if unknown or already dead.
    pub fn kill(&mut self, entity: EntityId, reason: impl Into<String>) -> bool {
        let Some(health) = self.world.get_mut::<Health>(entity) else {
            return false;
        };
        if !health.kill() {
            return false;
        }
        let owner = self.world.get::<Owner>(entity).map(|o| o.0);
        self.die(entity, owner, DamageCause::new(reason));
        true
    }

    fn die(&mut self, entity: EntityId, owner: Option<ConnectionId>, cause: DamageCause) {
        info!(entity = %entity, owner = ?owner, cause = %cause.kind, "Entity died");
        if let Some(current) = self.current_match.as_mut() {
            current.policy_mut().on_entity_died(entity, &cause);
        }
        self.death_events.emit(&DeathEvent {
            entity,
            owner,
            cause: cause.clone(),
        });
        self.destroy_entity(entity, Some(cause));
    }

    fn destroy_entity(&mut self, entity: EntityId, death_cause: Option<DamageCause>) {
        if let Some(Owner(owner)) = self.world.get::<Owner>(entity).copied() {
            if let Some(view) = self.registry.get_mut(owner) {
                view.controller.unbind(entity);
            }
        }
        if !self.world.despawn(entity) {
            return;
        }
        self.spawner.release(entity);
        replication::announce_destroyed(&mut self.registry, &mut self.outbox, entity, death_cause);
    }

    /// Peers that have been loading for at least `timeout`.
    pub fn stalled_loaders(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.registry
            .iter()
            .filter(|v| {
                v.loading_since()
                    .is_some_and(|since| self.now.saturating_sub(since) >= timeout)
            })
            .map(|v| v.id())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn session() -> Session {
        let cfg = ServerConfig {
            rng_seed: Some(3),
            ..ServerConfig::default()
        };
        Session::new(&cfg, Collaborators::local(&cfg))
    }

    fn sent(s: &mut Session) -> Vec<(u32, NetMsg)> {
        s.drain_outbox()
            .into_iter()
            .map(|o| (o.to.0, o.msg))
            .collect()
    }

    #[test]
    fn empty_scene_name_is_rejected() {
        let mut s = session();
        assert_eq!(s.load_scene(""), Err(SessionError::EmptySceneName));
        assert_eq!(s.generation(), 0);
    }

    #[test]
    fn connect_before_any_load_sends_nothing() {
        let mut s = session();
        s.connect(ConnectionId(1)).unwrap();
        assert!(s.outbox().is_empty());
        assert!(!s.registry().get(ConnectionId(1)).unwrap().is_loading_level());
    }

    #[test]
    fn ack_clears_loading_and_fires_all_loaded() {
        let mut s = session();
        s.connect(ConnectionId(1)).unwrap();
        assert_eq!(s.load_scene("arena"), Ok(1));
        assert_eq!(
            sent(&mut s),
            vec![(
                1,
                NetMsg::LoadScene {
                    scene_name: "arena".into(),
                    generation: 1
                }
            )]
        );
        assert!(!s.scene().all_acked());

        s.handle_message(ConnectionId(1), NetMsg::LoadSceneDone { generation: 1 });
        assert!(!s.registry().get(ConnectionId(1)).unwrap().is_loading_level());
        assert!(s.scene().all_acked());

        // Second ack from the same peer is not counted.
        s.handle_message(ConnectionId(1), NetMsg::LoadSceneDone { generation: 1 });
        assert_eq!(s.scene().ack_count(), 1);
    }

    #[test]
    fn spawn_binds_pawn_then_snapshot_introduces_it() {
        let mut s = session();
        s.connect(ConnectionId(1)).unwrap();
        s.load_scene("arena").unwrap();
        s.handle_message(ConnectionId(1), NetMsg::LoadSceneDone { generation: 1 });
        sent(&mut s);

        // Tick 0: scene finishes, match starts, spawn requested.
        s.tick(Duration::ZERO).unwrap();
        assert_eq!(s.match_state(), Some(MatchState::InProgress));
        assert_eq!(s.pawn_of(ConnectionId(1)), None);

        // Tick 1: completion is bound and replicated.
        s.tick(Duration::from_millis(16)).unwrap();
        let pawn = s.pawn_of(ConnectionId(1)).unwrap();
        assert_eq!(s.health_of(pawn), Some(Health::new(100)));
        let kinds: Vec<_> = sent(&mut s).into_iter().map(|(_, m)| m.kind()).collect();
        assert_eq!(kinds, vec!["EntitySpawn", "EntitySnapshot"]);
    }

    #[test]
    fn damage_notifies_owner_and_death_destroys() {
        let mut s = session();
        s.connect(ConnectionId(1)).unwrap();
        s.load_scene("arena").unwrap();
        s.handle_message(ConnectionId(1), NetMsg::LoadSceneDone { generation: 1 });
        s.tick(Duration::ZERO).unwrap();
        s.tick(Duration::from_millis(16)).unwrap();
        let pawn = s.pawn_of(ConnectionId(1)).unwrap();
        sent(&mut s);

        let deaths = Arc::new(Mutex::new(Vec::new()));
        let sink = deaths.clone();
        s.on_death(move |e| sink.lock().unwrap().push(e.clone()));

        let cause = DamageCause::new("rocket");
        assert_eq!(
            s.apply_damage(pawn, 30, cause.clone()),
            DamageOutcome::Damaged { remaining: 70 }
        );
        assert_eq!(sent(&mut s), vec![(1, NetMsg::OwnerHurt { entity: pawn })]);

        assert_eq!(s.apply_damage(pawn, 200, cause.clone()), DamageOutcome::Died);
        assert_eq!(deaths.lock().unwrap().len(), 1);
        assert_eq!(s.pawn_of(ConnectionId(1)), None);
        assert!(!s.world().contains(pawn));
        assert_eq!(s.apply_damage(pawn, 1, cause), DamageOutcome::Ignored);
    }

    /// Only even connection ids have a body to spawn.
    struct EvenOnly;

    impl MatchPolicy for EvenOnly {
        fn player_prefab(&self, connection: ConnectionId) -> Option<PrefabRef> {
            (connection.0 % 2 == 0).then(|| PrefabRef::new("player", 100))
        }
    }

    #[test]
    fn missing_prefab_fails_only_that_player() {
        let cfg = ServerConfig {
            rng_seed: Some(3),
            ..ServerConfig::default()
        };
        let mut collaborators = Collaborators::local(&cfg);
        collaborators.policy_factory =
            Box::new(|_scene: &str| -> Box<dyn MatchPolicy> { Box::new(EvenOnly) });
        let mut s = Session::new(&cfg, collaborators);
        for id in [1, 2, 4] {
            s.connect(ConnectionId(id)).unwrap();
        }
        s.load_scene("arena").unwrap();
        for id in [1, 2, 4] {
            s.handle_message(ConnectionId(id), NetMsg::LoadSceneDone { generation: 1 });
        }

        assert_eq!(
            s.tick(Duration::ZERO),
            Err(SessionError::MissingPrefab {
                connection: ConnectionId(1)
            })
        );
        assert_eq!(s.tick_count(), 1);
        assert_eq!(s.match_state(), Some(MatchState::InProgress));

        assert_eq!(s.tick(Duration::from_millis(16)), Ok(()));
        assert_eq!(s.tick_count(), 2);
        assert!(s.pawn_of(ConnectionId(2)).is_some());
        assert!(s.pawn_of(ConnectionId(4)).is_some());
        assert_eq!(s.pawn_of(ConnectionId(1)), None);
    }

    #[test]
    fn kill_and_heal_on_unknown_entity_do_nothing() {
        let mut s = session();
        assert!(!s.kill(EntityId(99), "test"));
        assert_eq!(s.heal(EntityId(99), 10), 0);
    }

    #[test]
    fn stalled_loaders_respect_timeout() {
        let mut s = session();
        s.connect(ConnectionId(1)).unwrap();
        s.load_scene("arena").unwrap();
        s.tick(Duration::from_secs(59)).unwrap();
        assert!(s.stalled_loaders(Duration::from_secs(60)).is_empty());
        s.tick(Duration::from_secs(60)).unwrap();
        assert_eq!(
            s.stalled_loaders(Duration::from_secs(60)),
            vec![ConnectionId(1)]
        );
    }
}
