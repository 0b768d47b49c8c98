//! # Wattpilot client
//!
//! Client for the JSON-over-WebSocket protocol spoken by Wattpilot EV chargers,
//! locally (`ws://<host>/ws`) or through the vendor cloud relay.
//!
//! ## Architecture
//!
//! ```text
//! caller ──connect / send_update──► WattpilotClient
//!                                       │ spawns
//!                                       ▼
//!                          ┌──────── connection task ────────┐
//!   WebSocket frames ─────►│ Session (hello, auth, status)   │
//!                          │    │ updates        │ events     │
//!                          │    ▼                ▼            │
//!                          │ PropertyStore   EventDispatcher ─┼──► handlers
//!                          └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use wattpilot_client::{ClientConfig, EventKind, WattpilotClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = WattpilotClient::new(ClientConfig::local("192.168.1.50", "password"))?;
//!     client.on(EventKind::Property, |event| println!("{:?}", event));
//!     client.connect()?;
//!
//!     if client.wait_until_ready(Duration::from_secs(15)).await {
//!         client.set_power(16).await?;
//!     }
//!     client.disconnect(false);
//!     Ok(())
//! }
//! ```

pub mod coerce;
pub mod config;
pub mod events;
pub mod hash;
pub mod properties;
pub mod protocol;

pub use coerce::{coerce, coerce_input, coerce_str, ForceType};
pub use config::{ClientConfig, ConfigError, Transport};
pub use events::{Event, EventDispatcher, EventHandler, EventKind};
pub use hash::{hash_password, HashError, HashedPassword};
pub use properties::{DerivedFields, PropertyStore, PropertyValue};
pub use protocol::{
    ClientError, DeviceInfo, HashScheme, InboundMessage, LoadMode, OutboundMessage,
    SessionState, WattpilotClient, WireError,
};
