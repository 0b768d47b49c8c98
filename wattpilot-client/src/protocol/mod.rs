//! Charger protocol implementation
//!
//! JSON over WebSocket with a challenge-response login keyed by a hashed
//! password, followed by full and delta property updates.

pub mod client;
pub mod messages;
pub mod session;
pub mod types;

pub use client::{ClientError, WattpilotClient};
pub use messages::{InboundMessage, OutboundMessage, WireError};
pub use session::{CachedHash, DeviceInfo, HashJob, Session, SessionState};
pub use types::*;
