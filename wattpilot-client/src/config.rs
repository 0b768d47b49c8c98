//! Client configuration
//!
//! Where to connect, with which credentials, and how to behave when the
//! connection drops.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Cloud relay endpoint; the serial is appended as the last path segment
pub const CLOUD_URL_BASE: &str = "wss://app.wattpilot.io/app/";

/// App protocol version announced to the cloud relay
pub const CLOUD_APP_VERSION: &str = "1.2.9";

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cloud connections require the charger serial")]
    MissingCloudSerial,

    #[error("Host must not be empty")]
    EmptyHost,
}

/// How the socket reaches the charger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Directly on the local network
    Local { host: String },
    /// Through the vendor cloud relay
    Cloud,
}

/// Complete client configuration
#[derive(Clone)]
pub struct ClientConfig {
    pub transport: Transport,
    pub password: Option<String>,
    /// Charger serial; learned from `hello` when not configured
    pub serial: Option<String>,
    pub reconnect_interval: Duration,
    pub auto_reconnect: bool,
    /// Used by callers waiting for the first full status
    pub init_timeout: Duration,
    /// Fixed seed for auth nonces (tests)
    pub rng_seed: Option<u64>,
    /// Largest WebSocket message read or written, in bytes; library default when unset
    pub max_message_size: Option<usize>,
}

impl ClientConfig {
    /// Charger on the local network
    pub fn local(host: impl Into<String>, password: impl Into<String>) -> Self {
        Self::with_transport(Transport::Local { host: host.into() }, password.into())
    }

    /// Charger reached through the cloud relay
    pub fn cloud(serial: impl Into<String>, password: impl Into<String>) -> Self {
        Self::with_transport(Transport::Cloud, password.into()).with_serial(serial)
    }

    fn with_transport(transport: Transport, password: String) -> Self {
        Self {
            transport,
            password: Some(password).filter(|p| !p.is_empty()),
            serial: None,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            auto_reconnect: true,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            rng_seed: None,
            max_message_size: None,
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into()).filter(|s| !s.is_empty());
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn without_auto_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = Some(bytes);
        self
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.transport {
            Transport::Local { host } if host.trim().is_empty() => Err(ConfigError::EmptyHost),
            Transport::Cloud if self.serial.is_none() => Err(ConfigError::MissingCloudSerial),
            _ => Ok(()),
        }
    }

    /// WebSocket URL for this configuration
    pub fn url(&self) -> Result<String, ConfigError> {
        self.validate()?;
        match &self.transport {
            Transport::Local { host } => Ok(format!("ws://{}/ws", host.trim())),
            Transport::Cloud => {
                let serial = self.serial.as_deref().ok_or(ConfigError::MissingCloudSerial)?;
                Ok(format!(
                    "{}{}?version={}",
                    CLOUD_URL_BASE, serial, CLOUD_APP_VERSION
                ))
            }
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("transport", &self.transport)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("serial", &self.serial)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("init_timeout", &self.init_timeout)
            .field("rng_seed", &self.rng_seed)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}
