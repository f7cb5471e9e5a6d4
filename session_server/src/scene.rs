//! Scene transition coordinator.
//!
//! Every `LoadScene` bumps the generation. Peers acknowledge with the
//! generation they loaded; anything else is stale and dropped. The "all
//! loaded" event fires once per generation, when no live connection is still
//! loading, so a peer that leaves mid-load never blocks the rest.
//!
//! The coordinator holds the protocol state. The [`Session`](crate::session::Session)
//! applies its decisions to the registry, the world, and the outbox.

use session_shared::net::NetMsg;
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::registry::ConnectionRegistry;

/// Completion handle for a server-side scene load.
pub type SceneLoadCompletion = oneshot::Receiver<anyhow::Result<()>>;

/// Loads scene content on the server.
pub trait SceneLoader: Send {
    fn load(&mut self, scene_name: &str) -> SceneLoadCompletion;
}

/// Loader for scenes with no server-side content: completes immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateSceneLoader;

impl SceneLoader for ImmediateSceneLoader {
    fn load(&mut self, _scene_name: &str) -> SceneLoadCompletion {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        rx
    }
}

/// What happened to an incoming `LoadSceneDone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Generation does not match the current one.
    Stale,
    /// Current generation, counted.
    Accepted,
}

#[derive(Default)]
pub struct SceneCoordinator {
    generation: u32,
    scene_name: Option<String>,
    ack_count: usize,
    all_acked: bool,
    load: Option<SceneLoadCompletion>,
}

impl SceneCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn scene_name(&self) -> Option<&str> {
        self.scene_name.as_deref()
    }

    pub fn ack_count(&self) -> usize {
        self.ack_count
    }

    /// True once "all loaded" has fired for the current generation.
    pub fn all_acked(&self) -> bool {
        self.all_acked
    }

    /// True while the server-side load is still running.
    pub fn is_loading(&self) -> bool {
        self.load.is_some()
    }

    /// Starts a new generation for `scene_name`. Returns the new generation.
    pub fn begin_load(&mut self, scene_name: &str) -> u32 {
        self.generation += 1;
        self.ack_count = 0;
        self.all_acked = false;
        self.scene_name = Some(scene_name.to_string());
        self.load = None;
        self.generation
    }

    /// Kicks off the server-side load of the current scene.
    pub fn start_server_load(&mut self, loader: &mut dyn SceneLoader) {
        if let Some(name) = self.scene_name.as_deref() {
            self.load = Some(loader.load(name));
        }
    }

    /// The handshake message for the current generation, once any load has
    /// happened.
    pub fn load_message(&self) -> Option<NetMsg> {
        self.scene_name.as_ref().map(|name| NetMsg::LoadScene {
            scene_name: name.clone(),
            generation: self.generation,
        })
    }

    /// Checks an acknowledgement's generation and counts it if current.
    pub fn acknowledge(&mut self, generation: u32) -> AckOutcome {
        if generation != self.generation || self.scene_name.is_none() {
            return AckOutcome::Stale;
        }
        self.ack_count += 1;
        AckOutcome::Accepted
    }

    /// Fires at most once per generation, when no live connection is loading.
    pub fn try_complete(&mut self, registry: &ConnectionRegistry) -> bool {
        if self.all_acked || self.scene_name.is_none() || !registry.all_loaded() {
            return false;
        }
        self.all_acked = true;
        true
    }

    /// Polls the server-side load. `Some` once, when it finishes.
    pub fn poll_load(&mut self) -> Option<anyhow::Result<()>> {
        let rx = self.load.as_mut()?;
        let result = match rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => Err(anyhow::anyhow!("scene loader dropped the request")),
        };
        self.load = None;
        Some(result)
    }
}
