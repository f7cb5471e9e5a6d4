//! Spawning players.
//!
//! Three collaborators meet here:
//! - [`SpawnPoints`]: where players may appear.
//! - [`EntityFactory`]: instantiates entities asynchronously. Completion is a
//!   `oneshot` continuation that the session polls once per tick.
//! - [`Spawner`]: picks a pose, issues the request, and remembers which
//!   connection and scene generation it was for so the completion can be
//!   re-validated.

use anyhow::anyhow;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, RngCore, SeedableRng};
use session_shared::{
    ecs::EntityId,
    math::{Pose, SpawnPoint, Vec3},
    net::ConnectionId,
};
use tokio::sync::oneshot::{self, error::TryRecvError};

/// Identity of the entity instantiated for a player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefabRef {
    pub name: String,
    pub max_health: u8,
}

impl PrefabRef {
    pub fn new(name: impl Into<String>, max_health: u8) -> Self {
        Self {
            name: name.into(),
            max_health,
        }
    }
}

/// A finished instantiation.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnedEntity {
    pub id: EntityId,
    pub prefab: PrefabRef,
    pub pose: Pose,
}

/// Completion handle for an instantiation request.
pub type SpawnCompletion = oneshot::Receiver<anyhow::Result<SpawnedEntity>>;

/// Registry of spawn locations.
pub trait SpawnPoints: Send {
    fn points(&self) -> &[SpawnPoint];

    /// Picks a position inside `point`.
    fn random_position(&self, point: &SpawnPoint, rng: &mut dyn RngCore) -> Vec3;
}

/// Spawn points from configuration, sampled uniformly inside each box.
#[derive(Debug, Clone, Default)]
pub struct SpawnPointRegistry {
    points: Vec<SpawnPoint>,
}

impl SpawnPointRegistry {
    pub fn new(points: Vec<SpawnPoint>) -> Self {
        Self { points }
    }

    pub fn add(&mut self, point: SpawnPoint) {
        self.points.push(point);
    }
}

fn jitter(rng: &mut dyn RngCore, extent: f32) -> f32 {
    let e = extent.abs();
    if e > 0.0 && e.is_finite() {
        rng.gen_range(-e..=e)
    } else {
        0.0
    }
}

impl SpawnPoints for SpawnPointRegistry {
    fn points(&self) -> &[SpawnPoint] {
        &self.points
    }

    fn random_position(&self, point: &SpawnPoint, rng: &mut dyn RngCore) -> Vec3 {
        point.origin.add(Vec3::new(
            jitter(rng, point.extent.x),
            jitter(rng, point.extent.y),
            jitter(rng, point.extent.z),
        ))
    }
}

/// Asynchronous entity instantiation.
pub trait EntityFactory: Send {
    fn instantiate(&mut self, prefab: &PrefabRef, pose: Pose) -> SpawnCompletion;

    /// Called when an entity is torn down or its spawn was abandoned.
    fn release(&mut self, _entity: EntityId) {}
}

/// In-process factory: allocates ids and completes immediately.
#[derive(Debug)]
pub struct LocalEntityFactory {
    next_id: u64,
}

impl Default for LocalEntityFactory {
    fn default() -> Self {
        Self { next_id: 1 }
    }
}

impl EntityFactory for LocalEntityFactory {
    fn instantiate(&mut self, prefab: &PrefabRef, pose: Pose) -> SpawnCompletion {
        let (tx, rx) = oneshot::channel();
        let id = EntityId(self.next_id);
        self.next_id += 1;
        let _ = tx.send(Ok(SpawnedEntity {
            id,
            prefab: prefab.clone(),
            pose,
        }));
        rx
    }
}

/// Outcome of a finished request, tagged with what it was for.
#[derive(Debug)]
pub enum SpawnResult {
    Ready {
        connection: ConnectionId,
        generation: u32,
        entity: SpawnedEntity,
    },
    Failed {
        connection: ConnectionId,
        generation: u32,
        error: anyhow::Error,
    },
}

struct PendingSpawn {
    connection: ConnectionId,
    generation: u32,
    completion: SpawnCompletion,
}

/// Issues spawn requests and collects their completions.
pub struct Spawner {
    factory: Box<dyn EntityFactory>,
    spawn_points: Box<dyn SpawnPoints>,
    rng: StdRng,
    pending: Vec<PendingSpawn>,
}

impl Spawner {
    pub fn new(
        factory: Box<dyn EntityFactory>,
        spawn_points: Box<dyn SpawnPoints>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            factory,
            spawn_points,
            rng,
            pending: Vec::new(),
        }
    }

    /// Uniformly random spawn point, randomized position within it, the
    /// point's rotation. Origin pose if no points are registered.
    pub fn choose_pose(&mut self) -> Pose {
        let Some(point) = self.spawn_points.points().choose(&mut self.rng).copied() else {
            return Pose::ORIGIN;
        };
        let position = self.spawn_points.random_position(&point, &mut self.rng);
        Pose::new(position, point.rotation)
    }

    /// Requests an entity for `connection`. Returns the chosen pose.
    pub fn begin(&mut self, connection: ConnectionId, generation: u32, prefab: &PrefabRef) -> Pose {
        let pose = self.choose_pose();
        let completion = self.factory.instantiate(prefab, pose);
        self.pending.push(PendingSpawn {
            connection,
            generation,
            completion,
        });
        pose
    }

    /// Collects every request that has completed since the last poll.
    pub fn poll(&mut self) -> Vec<SpawnResult> {
        let mut done = Vec::new();
        self.pending.retain_mut(|p| match p.completion.try_recv() {
            Ok(Ok(entity)) => {
                done.push(SpawnResult::Ready {
                    connection: p.connection,
                    generation: p.generation,
                    entity,
                });
                false
            }
            Ok(Err(error)) => {
                done.push(SpawnResult::Failed {
                    connection: p.connection,
                    generation: p.generation,
                    error,
                });
                false
            }
            Err(TryRecvError::Empty) => true,
            Err(TryRecvError::Closed) => {
                done.push(SpawnResult::Failed {
                    connection: p.connection,
                    generation: p.generation,
                    error: anyhow!("entity factory dropped the request"),
                });
                false
            }
        });
        done
    }

    pub fn release(&mut self, entity: EntityId) {
        self.factory.release(entity);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
