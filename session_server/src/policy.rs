//! Gameplay policy hooks.
//!
//! A [`MatchPolicy`] is injected per match. Every hook has a default; game
//! modes override what they need. Hooks that act on the session receive a
//! [`MatchContext`], a short-lived view over the connection registry and the
//! spawner.

use std::time::Duration;

use session_shared::{ecs::EntityId, net::ConnectionId, net::DamageCause};
use tracing::debug;

use crate::{
    error::SessionError,
    match_state::MatchState,
    registry::ConnectionRegistry,
    spawn::{PrefabRef, Spawner},
};

/// What a policy hook may see and do during one call.
pub struct MatchContext<'a> {
    pub(crate) registry: &'a mut ConnectionRegistry,
    pub(crate) spawner: &'a mut Spawner,
    pub(crate) scene_name: &'a str,
    pub(crate) generation: u32,
    pub(crate) scene_loading: bool,
    pub(crate) now: Duration,
}

impl<'a> MatchContext<'a> {
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// True while the server-side scene load is still running.
    pub fn is_scene_loading(&self) -> bool {
        self.scene_loading
    }

    pub fn scene_name(&self) -> &str {
        self.scene_name
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Session time of the current tick.
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    pub fn pawn_of(&self, connection: ConnectionId) -> Option<EntityId> {
        self.registry
            .get(connection)
            .and_then(|v| v.controller().pawn())
    }

    /// Connected, no pawn, no spawn in flight.
    pub fn needs_body(&self, connection: ConnectionId) -> bool {
        self.registry
            .get(connection)
            .is_some_and(|v| v.controller().needs_body())
    }

    pub fn unembodied_players(&self) -> Vec<ConnectionId> {
        self.registry
            .iter()
            .filter(|v| v.controller().needs_body())
            .map(|v| v.id())
            .collect()
    }

    /// Starts instantiating `prefab` for `connection`. Returns false if the
    /// connection is gone or already has (or is getting) a body.
    pub fn begin_spawn(&mut self, connection: ConnectionId, prefab: &PrefabRef) -> bool {
        let Some(view) = self.registry.get_mut(connection) else {
            return false;
        };
        if !view.controller.needs_body() {
            return false;
        }
        view.controller.mark_spawn_pending();
        let pose = self.spawner.begin(connection, self.generation, prefab);
        debug!(connection = ?connection, prefab = %prefab.name, ?pose, "Spawn requested");
        true
    }
}

/// Overridable policy points for one match.
pub trait MatchPolicy: Send {
    fn ready_to_start_match(&self, ctx: &MatchContext<'_>) -> bool {
        ctx.connection_count() > 0 && !ctx.is_scene_loading()
    }

    fn ready_to_end_match(&self, ctx: &MatchContext<'_>) -> bool {
        ctx.connection_count() == 0 && !ctx.is_scene_loading()
    }

    /// Prefab for a player's body. There is no sensible default: a policy
    /// that spawns players must provide one.
    fn player_prefab(&self, _connection: ConnectionId) -> Option<PrefabRef> {
        None
    }

    /// Resolves the prefab and requests the body.
    fn spawn_player(
        &mut self,
        ctx: &mut MatchContext<'_>,
        connection: ConnectionId,
    ) -> Result<(), SessionError> {
        let prefab = self
            .player_prefab(connection)
            .ok_or(SessionError::MissingPrefab { connection })?;
        ctx.begin_spawn(connection, &prefab);
        Ok(())
    }

    /// Requests a body for every connected player without one. A failure for
    /// one player does not stop the others; the first error is returned after
    /// every player has been tried.
    fn spawn_unembodied(&mut self, ctx: &mut MatchContext<'_>) -> Result<(), SessionError> {
        let mut first_error = None;
        for connection in ctx.unembodied_players() {
            if let Err(e) = self.spawn_player(ctx, connection) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn on_match_started(&mut self, ctx: &mut MatchContext<'_>) -> Result<(), SessionError> {
        self.spawn_unembodied(ctx)
    }

    fn on_match_ended(&mut self, _ctx: &mut MatchContext<'_>) {}

    fn on_leaving_map(&mut self, _ctx: &mut MatchContext<'_>) {}

    /// Default spawns late arrivals immediately once the match is running;
    /// earlier arrivals wait for the bulk spawn.
    fn on_new_player(
        &mut self,
        ctx: &mut MatchContext<'_>,
        connection: ConnectionId,
        state: MatchState,
    ) -> Result<(), SessionError> {
        if state == MatchState::InProgress {
            self.spawn_player(ctx, connection)?;
        }
        Ok(())
    }

    fn on_player_spawned(&mut self, _connection: ConnectionId, _entity: EntityId) {}

    fn on_all_clients_loaded(&mut self, _generation: u32) {}

    fn on_entity_damaged(&mut self, _entity: EntityId, _amount: u32, _cause: &DamageCause) {}

    fn on_entity_died(&mut self, _entity: EntityId, _cause: &DamageCause) {}
}

/// Builds the policy for a freshly loaded scene.
pub type PolicyFactory = Box<dyn FnMut(&str) -> Box<dyn MatchPolicy> + Send>;

/// Free-for-all: every player gets the same prefab.
#[derive(Debug, Clone)]
pub struct DeathmatchPolicy {
    prefab: PrefabRef,
}

impl DeathmatchPolicy {
    pub fn new(prefab: PrefabRef) -> Self {
        Self { prefab }
    }
}

impl MatchPolicy for DeathmatchPolicy {
    fn player_prefab(&self, _connection: ConnectionId) -> Option<PrefabRef> {
        Some(self.prefab.clone())
    }
}
