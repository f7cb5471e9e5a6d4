//! Authoritative match session server.

pub mod error;
pub mod match_state;
pub mod outbox;
pub mod policy;
pub mod registry;
pub mod replication;
pub mod respawn;
pub mod scene;
pub mod server;
pub mod session;
pub mod spawn;

pub use error::SessionError;
pub use match_state::{MatchState, MatchStateMachine};
pub use policy::{DeathmatchPolicy, MatchContext, MatchPolicy, PolicyFactory};
pub use server::GameServer;
pub use session::{Collaborators, DamageEvent, DeathEvent, Session};
