//! Shared fixtures for the scenario and socket tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use session_server::{
    policy::{DeathmatchPolicy, MatchContext, MatchPolicy},
    scene::ImmediateSceneLoader,
    session::{Collaborators, Session},
    spawn::{EntityFactory, PrefabRef, SpawnCompletion, SpawnPointRegistry, SpawnedEntity},
    MatchState, SessionError,
};
use session_shared::{
    config::ServerConfig,
    ecs::EntityId,
    math::Pose,
    net::{ConnectionId, DamageCause, NetMsg},
};
use tokio::sync::oneshot;

/// Installs a test-writer subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// What the factory has been asked to do.
#[derive(Debug, Default)]
pub struct FactoryLog {
    pub instantiated: Vec<PrefabRef>,
    pub released: Vec<EntityId>,
}

/// Completes immediately like the local factory, and records every call.
pub struct RecordingFactory {
    next_id: u64,
    log: Arc<Mutex<FactoryLog>>,
}

impl RecordingFactory {
    pub fn new() -> (Self, Arc<Mutex<FactoryLog>>) {
        let log = Arc::new(Mutex::new(FactoryLog::default()));
        (
            Self {
                next_id: 1,
                log: log.clone(),
            },
            log,
        )
    }
}

impl EntityFactory for RecordingFactory {
    fn instantiate(&mut self, prefab: &PrefabRef, pose: Pose) -> SpawnCompletion {
        let (tx, rx) = oneshot::channel();
        let id = EntityId(self.next_id);
        self.next_id += 1;
        if let Ok(mut log) = self.log.lock() {
            log.instantiated.push(prefab.clone());
        }
        let _ = tx.send(Ok(SpawnedEntity {
            id,
            prefab: prefab.clone(),
            pose,
        }));
        rx
    }

    fn release(&mut self, entity: EntityId) {
        if let Ok(mut log) = self.log.lock() {
            log.released.push(entity);
        }
    }
}

type PendingSender = oneshot::Sender<anyhow::Result<SpawnedEntity>>;

/// Spawn requests the test completes by hand.
#[derive(Default, Clone)]
pub struct ManualSpawns {
    pending: Arc<Mutex<Vec<(PrefabRef, Pose, PendingSender)>>>,
    released: Arc<Mutex<Vec<EntityId>>>,
}

impl ManualSpawns {
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn released(&self) -> Vec<EntityId> {
        self.released.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Completes the oldest request with `id`. False if nothing is pending.
    pub fn complete_next(&self, id: EntityId) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        if pending.is_empty() {
            return false;
        }
        let (prefab, pose, tx) = pending.remove(0);
        tx.send(Ok(SpawnedEntity { id, prefab, pose })).is_ok()
    }
}

/// Factory side of [`ManualSpawns`].
pub struct ManualFactory(pub ManualSpawns);

impl EntityFactory for ManualFactory {
    fn instantiate(&mut self, prefab: &PrefabRef, pose: Pose) -> SpawnCompletion {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.0.pending.lock() {
            pending.push((prefab.clone(), pose, tx));
        }
        rx
    }

    fn release(&mut self, entity: EntityId) {
        if let Ok(mut released) = self.0.released.lock() {
            released.push(entity);
        }
    }
}

/// Hook calls observed by [`RecordingPolicy`].
#[derive(Debug, Default)]
pub struct HookLog {
    pub all_loaded: Vec<u32>,
    pub spawned: Vec<(ConnectionId, EntityId)>,
    pub damaged: Vec<(EntityId, u32)>,
    pub died: Vec<(EntityId, DamageCause)>,
    pub match_started: usize,
    pub match_ended: usize,
    pub left_map: usize,
}

/// Deathmatch rules plus a record of every hook call.
pub struct RecordingPolicy {
    inner: DeathmatchPolicy,
    log: Arc<Mutex<HookLog>>,
}

impl RecordingPolicy {
    pub fn new(prefab: PrefabRef, log: Arc<Mutex<HookLog>>) -> Self {
        Self {
            inner: DeathmatchPolicy::new(prefab),
            log,
        }
    }

    fn record(&self, f: impl FnOnce(&mut HookLog)) {
        if let Ok(mut log) = self.log.lock() {
            f(&mut log);
        }
    }
}

impl MatchPolicy for RecordingPolicy {
    fn player_prefab(&self, connection: ConnectionId) -> Option<PrefabRef> {
        self.inner.player_prefab(connection)
    }

    fn on_match_started(&mut self, ctx: &mut MatchContext<'_>) -> Result<(), SessionError> {
        self.record(|l| l.match_started += 1);
        self.spawn_unembodied(ctx)
    }

    fn on_match_ended(&mut self, _ctx: &mut MatchContext<'_>) {
        self.record(|l| l.match_ended += 1);
    }

    fn on_leaving_map(&mut self, _ctx: &mut MatchContext<'_>) {
        self.record(|l| l.left_map += 1);
    }

    fn on_player_spawned(&mut self, connection: ConnectionId, entity: EntityId) {
        self.record(|l| l.spawned.push((connection, entity)));
    }

    fn on_all_clients_loaded(&mut self, generation: u32) {
        self.record(|l| l.all_loaded.push(generation));
    }

    fn on_entity_damaged(&mut self, entity: EntityId, amount: u32, _cause: &DamageCause) {
        self.record(|l| l.damaged.push((entity, amount)));
    }

    fn on_entity_died(&mut self, entity: EntityId, cause: &DamageCause) {
        self.record(|l| l.died.push((entity, cause.clone())));
    }
}

/// Config used by the scenario tests: fixed seed, 5s respawn delay.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        rng_seed: Some(42),
        respawn_delay_ms: 5_000,
        ..ServerConfig::default()
    }
}

/// A session with a recording policy and the given factory.
pub fn recording_session(
    cfg: &ServerConfig,
    factory: Box<dyn EntityFactory>,
) -> (Session, Arc<Mutex<HookLog>>) {
    let hooks = Arc::new(Mutex::new(HookLog::default()));
    let prefab = PrefabRef::new(cfg.player_prefab.clone(), cfg.player_max_health);
    let policy_hooks = hooks.clone();
    let collaborators = Collaborators {
        scene_loader: Box::new(ImmediateSceneLoader),
        entity_factory: factory,
        spawn_points: Box::new(SpawnPointRegistry::new(cfg.spawn_points.clone())),
        policy_factory: Box::new(move |_scene: &str| -> Box<dyn MatchPolicy> {
            Box::new(RecordingPolicy::new(prefab.clone(), policy_hooks.clone()))
        }),
    };
    (Session::new(cfg, collaborators), hooks)
}

/// Connects `connection`, acknowledges the current scene, and ticks at `now`.
pub fn join_and_load(session: &mut Session, connection: ConnectionId, now: Duration) {
    let _ = session.connect(connection);
    let generation = session.generation();
    session.handle_message(connection, NetMsg::LoadSceneDone { generation });
    let _ = session.tick(now);
}

/// Ticks every `step` from `from` (inclusive) to `to` (inclusive).
pub fn tick_range(
    session: &mut Session,
    from: Duration,
    to: Duration,
    step: Duration,
) -> Result<(), SessionError> {
    let mut now = from;
    while now <= to {
        session.tick(now)?;
        now += step;
    }
    Ok(())
}

/// True once the match is running.
pub fn in_progress(session: &Session) -> bool {
    session.match_state() == Some(MatchState::InProgress)
}
