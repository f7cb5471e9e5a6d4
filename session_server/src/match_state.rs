//! Match state machine.
//!
//! `WaitingToStart → InProgress → WaitingPostMatch → LeavingMap`, never
//! backwards. Calls from the wrong phase are logged and ignored. One machine
//! exists per loaded scene; it owns the policy and the respawn queue.

use std::fmt;

use session_shared::net::ConnectionId;
use tracing::{debug, info, warn};

use crate::{
    error::SessionError,
    policy::{MatchContext, MatchPolicy},
    respawn::RespawnScheduler,
};

/// Phase of the current match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchState {
    WaitingToStart,
    InProgress,
    WaitingPostMatch,
    LeavingMap,
}

impl fmt::Display for MatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchState::WaitingToStart => "WaitingToStart",
            MatchState::InProgress => "InProgress",
            MatchState::WaitingPostMatch => "WaitingPostMatch",
            MatchState::LeavingMap => "LeavingMap",
        };
        f.write_str(s)
    }
}

pub struct MatchStateMachine {
    scene_name: String,
    state: MatchState,
    policy: Box<dyn MatchPolicy>,
    respawns: RespawnScheduler,
}

impl MatchStateMachine {
    pub fn new(
        scene_name: impl Into<String>,
        policy: Box<dyn MatchPolicy>,
        respawns: RespawnScheduler,
    ) -> Self {
        Self {
            scene_name: scene_name.into(),
            state: MatchState::WaitingToStart,
            policy,
            respawns,
        }
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    pub fn scene_name(&self) -> &str {
        &self.scene_name
    }

    pub fn respawns(&self) -> &RespawnScheduler {
        &self.respawns
    }

    pub(crate) fn policy_mut(&mut self) -> &mut dyn MatchPolicy {
        self.policy.as_mut()
    }

    pub fn start_match(&mut self, ctx: &mut MatchContext<'_>) -> Result<(), SessionError> {
        if self.state != MatchState::WaitingToStart {
            warn!(state = %self.state, scene = %self.scene_name, "start_match ignored");
            return Ok(());
        }
        self.state = MatchState::InProgress;
        info!(scene = %self.scene_name, players = ctx.connection_count(), "Match started");
        self.policy.on_match_started(ctx)
    }

    pub fn end_match(&mut self, ctx: &mut MatchContext<'_>) {
        if self.state != MatchState::InProgress {
            warn!(state = %self.state, scene = %self.scene_name, "end_match ignored");
            return;
        }
        self.state = MatchState::WaitingPostMatch;
        info!(scene = %self.scene_name, "Match ended");
        self.policy.on_match_ended(ctx);
    }

    pub fn start_to_leave_map(&mut self, ctx: &mut MatchContext<'_>) {
        if self.state == MatchState::InProgress {
            self.end_match(ctx);
        }
        if self.state != MatchState::WaitingPostMatch {
            warn!(state = %self.state, scene = %self.scene_name, "start_to_leave_map ignored");
            return;
        }
        self.state = MatchState::LeavingMap;
        info!(scene = %self.scene_name, "Leaving map");
        self.policy.on_leaving_map(ctx);
    }

    /// Per-tick evaluation. Does nothing once the match has ended.
    pub fn tick(&mut self, ctx: &mut MatchContext<'_>) -> Result<(), SessionError> {
        match self.state {
            MatchState::WaitingToStart => {
                if self.policy.ready_to_start_match(ctx) {
                    self.start_match(ctx)?;
                }
            }
            MatchState::InProgress => {
                self.respawn_step(ctx)?;
                if self.policy.ready_to_end_match(ctx) {
                    self.end_match(ctx);
                }
            }
            MatchState::WaitingPostMatch | MatchState::LeavingMap => {}
        }
        Ok(())
    }

    /// Queues every bodiless player, then spawns at most the single earliest
    /// due request.
    fn respawn_step(&mut self, ctx: &mut MatchContext<'_>) -> Result<(), SessionError> {
        for connection in ctx.unembodied_players() {
            if self.respawns.enqueue(ctx.now(), connection) {
                debug!(connection = ?connection, delay = ?self.respawns.delay(), "Respawn queued");
            }
        }
        let Some(request) = self.respawns.pop_due(ctx.now()) else {
            return Ok(());
        };
        if !ctx.needs_body(request.connection) {
            debug!(connection = ?request.connection, "Respawn discarded");
            return Ok(());
        }
        self.policy.spawn_player(ctx, request.connection)
    }

    pub fn handle_new_player(
        &mut self,
        ctx: &mut MatchContext<'_>,
        connection: ConnectionId,
    ) -> Result<(), SessionError> {
        self.policy.on_new_player(ctx, connection, self.state)
    }

    /// Drops the connection's pending respawn.
    pub fn forget_connection(&mut self, connection: ConnectionId) {
        self.respawns.purge(connection);
    }
}
