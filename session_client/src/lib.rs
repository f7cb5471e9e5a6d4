//! `session_client`
//!
//! Client-side systems:
//! - Connection management (reliable + unreliable channels)
//! - Scene-load handshake
//! - Health/death projection of server entities

pub mod client;
pub mod session;

pub use client::GameClient;
pub use session::{ClientSession, ClientState};
