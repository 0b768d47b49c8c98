//! Charger session state machine
//!
//! Processes one inbound text frame at a time and reports what happened:
//! events to dispatch, frames to send back and whether the socket must be
//! closed for good. No I/O happens here; the client owns the socket.
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingHello -> AwaitingAuthChallenge
//!     -> Authenticating -> Connected { initialized: false }
//!     -> Connected { initialized: true }
//! ```

use rand::rngs::StdRng;
use rand::RngCore;
use tracing::{debug, error, info, warn};

use super::messages::*;
use super::types::{HashScheme, UnknownHashScheme, FLEX_DEVICE_TYPE};
use crate::events::Event;
use crate::hash::{hash_password, HashError, HashedPassword};
use crate::properties::{PropertyStore, PropertyValue};

/// Random bytes in the client nonce (hex encoded on the wire)
const TOKEN3_BYTES: usize = 16;

/// authError message that makes retrying pointless
pub const WRONG_PASSWORD: &str = "Wrong password";

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Socket being opened
    Connecting,
    /// Socket open, waiting for hello
    AwaitingHello,
    AwaitingAuthChallenge,
    /// auth frame sent
    Authenticating,
    Connected { initialized: bool },
}

/// Device identity learned from hello
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub serial: Option<String>,
    pub hostname: Option<String>,
    pub friendly_name: Option<String>,
    pub version: Option<String>,
    pub manufacturer: Option<String>,
    pub devicetype: Option<String>,
    pub protocol: Option<i64>,
    pub secured: Option<i64>,
}

/// What one frame produced
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// Events in dispatch order, starting with the raw message
    pub events: Vec<Event>,
    /// Frames to send, in order
    pub replies: Vec<OutboundMessage>,
    /// Close the socket and do not reconnect
    pub close: bool,
}

/// Password hash bound to the inputs it was derived from
#[derive(Debug, Clone)]
pub struct CachedHash {
    scheme: HashScheme,
    serial: String,
    hashed: HashedPassword,
}

/// Password hash a frame is about to need
///
/// Produced by [`Session::hash_job`] so the client can run the key derivation
/// without holding the session.
pub struct HashJob {
    scheme: HashScheme,
    serial: String,
    password: String,
}

impl HashJob {
    pub fn scheme(&self) -> HashScheme {
        self.scheme
    }

    pub fn compute(self) -> Result<CachedHash, HashError> {
        let hashed = hash_password(&self.password, &self.serial, self.scheme)?;
        Ok(CachedHash {
            scheme: self.scheme,
            serial: self.serial,
            hashed,
        })
    }
}

impl std::fmt::Debug for HashJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashJob")
            .field("scheme", &self.scheme)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

/// Per-connection protocol state
pub struct Session {
    state: SessionState,
    connected: bool,
    password: Option<String>,
    serial: Option<String>,
    device: DeviceInfo,
    scheme: HashScheme,
    hash: Option<CachedHash>,
    token3: Option<String>,
    request_id: u64,
    rng: StdRng,
}

impl Session {
    pub fn new(password: Option<String>, serial: Option<String>, rng: StdRng) -> Self {
        Self {
            state: SessionState::Disconnected,
            connected: false,
            password,
            serial,
            device: DeviceInfo::default(),
            scheme: HashScheme::default(),
            hash: None,
            token3: None,
            request_id: 0,
            rng,
        }
    }

    /// Fresh session for the next connection attempt
    ///
    /// Keeps credentials, the learned serial, device identity and the
    /// password hash. Request ids restart.
    pub fn renewed(&self, rng: StdRng) -> Self {
        Self {
            password: self.password.clone(),
            serial: self.serial.clone(),
            device: self.device.clone(),
            scheme: self.scheme,
            hash: self.hash.clone(),
            ..Self::new(None, None, rng)
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn hash_scheme(&self) -> HashScheme {
        self.scheme
    }

    pub fn hashed_password(&self) -> Option<&HashedPassword> {
        self.hash.as_ref().map(|cached| &cached.hashed)
    }

    pub fn token3(&self) -> Option<&str> {
        self.token3.as_deref()
    }

    pub fn is_secured(&self) -> bool {
        self.device.secured.is_some_and(|s| s > 0)
    }

    pub fn begin_connect(&mut self) {
        self.state = SessionState::Connecting;
    }

    pub fn socket_opened(&mut self) {
        self.state = SessionState::AwaitingHello;
    }

    pub fn socket_closed(&mut self) {
        self.connected = false;
        self.state = SessionState::Disconnected;
    }

    /// Next request id; the first request of a session gets 1
    pub fn next_request_id(&mut self) -> u64 {
        self.request_id += 1;
        self.request_id
    }

    /// Final form of an outgoing request, secured when the charger asked for it
    pub fn prepare(&self, message: OutboundMessage) -> Result<OutboundMessage, WireError> {
        if !self.is_secured() || message.request_id().is_none() {
            return Ok(message);
        }
        match self.hashed_password() {
            Some(key) => message.secure(key),
            None => {
                warn!(
                    kind = message.type_name(),
                    "Secured session without password hash, sending plain"
                );
                Ok(message)
            }
        }
    }

    /// Password hash that `message` will need and that is not cached yet
    pub fn hash_job(&self, message: &InboundMessage) -> Option<HashJob> {
        match message {
            InboundMessage::Hello(hello) => self.job_for(
                default_scheme(hello.devicetype.as_deref()),
                Some(hello.serial.as_str()),
            ),
            InboundMessage::AuthRequired(challenge) => self.job_for(
                self.challenge_scheme(challenge).unwrap_or(self.scheme),
                self.serial.as_deref(),
            ),
            _ => None,
        }
    }

    /// Store a hash computed from a [`HashJob`]
    pub fn cache_hash(&mut self, cached: CachedHash) {
        self.hash = Some(cached);
    }

    /// Process one text frame
    pub fn handle_text(&mut self, text: &str, store: &PropertyStore) -> FrameOutcome {
        self.handle_frame(text, InboundMessage::parse(text), store)
    }

    /// Process one frame that was already parsed
    pub fn handle_frame(
        &mut self,
        text: &str,
        parsed: Result<InboundMessage, WireError>,
        store: &PropertyStore,
    ) -> FrameOutcome {
        let mut out = FrameOutcome::default();
        out.events.push(Event::Message(text.to_string()));
        debug!(frame = text, "Message received");

        let message = match parsed {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return out;
            }
        };

        match message {
            InboundMessage::Hello(hello) => self.on_hello(hello, &mut out),
            InboundMessage::AuthRequired(challenge) => self.on_auth_required(challenge, &mut out),
            InboundMessage::AuthSuccess => {
                info!(serial = ?self.serial, "Authentication successful");
                self.connected = true;
                self.state = SessionState::Connected { initialized: false };
                out.events.push(Event::AuthSuccess);
            }
            InboundMessage::AuthError(auth_error) => self.on_auth_error(auth_error, &mut out),
            InboundMessage::FullStatus(status) => {
                let applied = store.apply_full(&status.status, status.partial);
                push_properties(&mut out, applied.changed);
                out.events.push(Event::FullStatus(status.clone()));
                if !status.partial {
                    out.events.push(Event::FullStatusFinished(status));
                }
                if applied.newly_initialized {
                    info!(properties = store.len(), "All properties initialized");
                    if let SessionState::Connected { .. } = self.state {
                        self.state = SessionState::Connected { initialized: true };
                    }
                    out.events.push(Event::Initialized);
                }
            }
            InboundMessage::DeltaStatus(status) => {
                push_properties(&mut out, store.apply_delta(&status.status));
                out.events.push(Event::DeltaStatus(status));
            }
            InboundMessage::Response(response) => {
                if response.success {
                    if let Some(status) = &response.status {
                        push_properties(&mut out, store.apply_response(status));
                    }
                } else {
                    error!(
                        request_id = ?response.request_id,
                        reason = response.message.as_deref().unwrap_or(""),
                        "Charger rejected request"
                    );
                }
                out.events.push(Event::Response(response));
            }
            InboundMessage::ClearInverters(raw) => out.events.push(Event::ClearInverters(raw)),
            InboundMessage::UpdateInverter(raw) => out.events.push(Event::UpdateInverter(raw)),
            InboundMessage::Unknown { kind, .. } => {
                debug!(kind = kind.as_str(), "Ignoring unknown message type");
            }
        }

        out
    }

    fn on_hello(&mut self, hello: HelloMessage, out: &mut FrameOutcome) {
        info!(
            serial = hello.serial.as_str(),
            devicetype = ?hello.devicetype,
            secured = ?hello.secured,
            "Hello from charger"
        );

        self.device = DeviceInfo {
            serial: Some(hello.serial.clone()),
            hostname: hello.hostname.clone(),
            friendly_name: hello.friendly_name.clone(),
            version: hello.version.clone(),
            manufacturer: hello.manufacturer.clone(),
            devicetype: hello.devicetype.clone(),
            protocol: hello.protocol,
            secured: hello.secured,
        };
        self.serial = Some(hello.serial.clone());
        self.scheme = default_scheme(self.device.devicetype.as_deref());
        self.update_hash();

        self.state = SessionState::AwaitingAuthChallenge;
        out.events.push(Event::Hello(hello));
    }

    fn on_auth_required(&mut self, challenge: AuthRequiredMessage, out: &mut FrameOutcome) {
        self.scheme = self.challenge_scheme(&challenge).unwrap_or_else(|e| {
            warn!(error = %e, "Keeping previous hash scheme");
            self.scheme
        });
        self.update_hash();

        let mut nonce = [0u8; TOKEN3_BYTES];
        self.rng.fill_bytes(&mut nonce);
        let token3 = hex::encode(nonce);

        let key = self
            .hashed_password()
            .map(HashedPassword::as_bytes)
            .unwrap_or_default();
        if key.is_empty() {
            warn!("No password hash available, authentication will fail");
        }
        let hash = auth_hash(&challenge.token1, &challenge.token2, &token3, key);

        debug!(scheme = %self.scheme, "Answering auth challenge");
        out.replies.push(OutboundMessage::Auth {
            token3: token3.clone(),
            hash,
        });
        self.token3 = Some(token3);
        self.state = SessionState::Authenticating;
        out.events.push(Event::AuthRequired(challenge));
    }

    fn on_auth_error(&mut self, auth_error: AuthErrorMessage, out: &mut FrameOutcome) {
        if auth_error.message == WRONG_PASSWORD {
            error!(reason = auth_error.message.as_str(), "Authentication failed");
            self.connected = false;
            self.state = SessionState::Disconnected;
            out.close = true;
        } else {
            warn!(reason = auth_error.message.as_str(), "Authentication error");
        }
        out.events.push(Event::AuthError(auth_error));
    }

    fn challenge_scheme(
        &self,
        challenge: &AuthRequiredMessage,
    ) -> Result<HashScheme, UnknownHashScheme> {
        match challenge.hash.as_deref() {
            Some(name) => name.parse(),
            None => Ok(default_scheme(self.device.devicetype.as_deref())),
        }
    }

    fn job_for(&self, scheme: HashScheme, serial: Option<&str>) -> Option<HashJob> {
        let (Some(password), Some(serial)) = (&self.password, serial) else {
            return None;
        };
        let cached = self
            .hash
            .as_ref()
            .is_some_and(|h| h.scheme == scheme && h.serial == serial);
        if cached {
            return None;
        }
        Some(HashJob {
            scheme,
            serial: serial.to_string(),
            password: password.clone(),
        })
    }

    fn update_hash(&mut self) {
        if self.password.is_none() || self.serial.is_none() {
            info!("Password or serial unknown, keeping current password hash");
            return;
        }
        let Some(job) = self.job_for(self.scheme, self.serial.as_deref()) else {
            return;
        };

        debug!(scheme = %self.scheme, "Generating password hash");
        match job.compute() {
            Ok(cached) => self.hash = Some(cached),
            Err(e) => error!(error = %e, scheme = %self.scheme, "Password hashing failed"),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("connected", &self.connected)
            .field("serial", &self.serial)
            .field("scheme", &self.scheme)
            .field("has_hash", &self.hash.is_some())
            .field("request_id", &self.request_id)
            .finish()
    }
}

fn default_scheme(devicetype: Option<&str>) -> HashScheme {
    match devicetype {
        Some(FLEX_DEVICE_TYPE) => HashScheme::Bcrypt,
        _ => HashScheme::Pbkdf2,
    }
}

fn push_properties(out: &mut FrameOutcome, changed: Vec<(String, PropertyValue)>) {
    out.events
        .extend(changed.into_iter().map(|(key, value)| Event::Property { key, value }));
}
