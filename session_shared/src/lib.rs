//! `session_shared`
//!
//! Shared libraries used by both the session server and its clients.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (net, ecs, math, events, health).
//! - Traits for abstraction and dependency injection.
//! - No `unsafe`.

pub mod config;
pub mod ecs;
pub mod event;
pub mod health;
pub mod math;
pub mod net;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::ecs::*;
    pub use crate::event::*;
    pub use crate::health::*;
    pub use crate::math::*;
    pub use crate::net::*;
}
