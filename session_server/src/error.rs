//! Session errors.
//!
//! Only faults surface here. Invalid phase transitions are logged and
//! ignored, stale acknowledgements and vanished targets are dropped silently.

use std::fmt;

use session_shared::net::ConnectionId;

/// Error type for session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The match policy does not provide a prefab for this player.
    MissingPrefab { connection: ConnectionId },
    /// `load_scene` was called with an empty name.
    EmptySceneName,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::MissingPrefab { connection } => {
                write!(f, "match policy has no player prefab for {connection:?}")
            }
            SessionError::EmptySceneName => write!(f, "scene name must not be empty"),
        }
    }
}

impl std::error::Error for SessionError {}
