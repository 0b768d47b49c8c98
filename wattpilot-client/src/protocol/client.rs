//! Charger WebSocket client
//!
//! Owns the connection task for one charger:
//! - WebSocket connection (local `ws://` or cloud `wss://`)
//! - Frame processing through the session state machine
//! - Event dispatch to registered handlers
//! - Fixed-interval reconnection after unexpected closes
//! - Property writes, secured when the charger requires it

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::messages::{InboundMessage, OutboundMessage, WireError};
use super::session::{DeviceInfo, FrameOutcome, Session, SessionState};
use super::types::LoadMode;
use crate::coerce::{coerce_input, ForceType};
use crate::config::{ClientConfig, ConfigError};
use crate::events::{Event, EventDispatcher, EventHandler, EventKind};
use crate::properties::{DerivedFields, PropertyStore, PropertyValue};

/// Frames queued for the writer task
const OUTGOING_QUEUE: usize = 64;

/// How long the writer may take to flush after the read loop ends
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Poll interval of [`WattpilotClient::wait_until_ready`]
const READY_POLL: Duration = Duration::from_millis(50);

/// Errors returned by the client API
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Not connected to charger")]
    NotConnected,

    #[error("Connection task already running")]
    AlreadyRunning,

    #[error("No tokio runtime available")]
    NoRuntime,

    #[error("Unknown property: {0}")]
    UnknownProperty(String),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Connection closed")]
    ConnectionClosed,
}

enum Outgoing {
    Frame(String),
    Close,
}

/// How a socket session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    /// Credentials rejected; reconnecting cannot help
    Rejected,
}

struct Inner {
    config: ClientConfig,
    url: String,
    store: PropertyStore,
    events: EventDispatcher,
    session: Mutex<Session>,
    outgoing: Mutex<Option<mpsc::Sender<Outgoing>>>,
    auto_reconnect: AtomicBool,
    /// Bumped on every disconnect request
    control: watch::Sender<u64>,
    task: Mutex<Option<JoinHandle<()>>>,
    attempts: AtomicU64,
}

/// Client for one charger
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct WattpilotClient {
    inner: Arc<Inner>,
}

impl WattpilotClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_events(config, EventDispatcher::new())
    }

    /// Create a client with handlers registered up front
    ///
    /// Handlers for [`EventKind::Init`] only fire when registered this way.
    pub fn with_events(config: ClientConfig, events: EventDispatcher) -> Result<Self, ClientError> {
        let url = config.url()?;
        let session = Session::new(
            config.password.clone(),
            config.serial.clone(),
            nonce_rng(config.rng_seed, 0),
        );
        let (control, _) = watch::channel(0);

        let client = Self {
            inner: Arc::new(Inner {
                auto_reconnect: AtomicBool::new(config.auto_reconnect),
                config,
                url,
                store: PropertyStore::new(),
                events,
                session: Mutex::new(session),
                outgoing: Mutex::new(None),
                control,
                task: Mutex::new(None),
                attempts: AtomicU64::new(0),
            }),
        };

        info!("Wattpilot client initialized for {}", client.inner.url);
        client.inner.events.dispatch(&Event::Init);
        Ok(client)
    }

    /// Start the connection task
    ///
    /// Returns immediately; progress is reported through events and
    /// [`is_connected`](Self::is_connected) /
    /// [`all_properties_initialized`](Self::all_properties_initialized).
    pub fn connect(&self) -> Result<(), ClientError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ClientError::NoRuntime)?;

        {
            let mut task = self.inner.task.lock();
            if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return Err(ClientError::AlreadyRunning);
            }

            self.inner
                .auto_reconnect
                .store(self.inner.config.auto_reconnect, Ordering::SeqCst);
            let control = self.inner.control.subscribe();
            let inner = self.inner.clone();
            *task = Some(runtime.spawn(inner.run(control)));
        }

        info!("Wattpilot connecting");
        self.inner.events.dispatch(&Event::Connect);
        Ok(())
    }

    /// Drop the current socket
    ///
    /// With `auto_reconnect` the client reconnects after the configured
    /// interval, otherwise the connection task ends.
    pub fn disconnect(&self, auto_reconnect: bool) {
        self.inner
            .auto_reconnect
            .store(auto_reconnect, Ordering::SeqCst);
        self.inner.control.send_modify(|n| *n = n.wrapping_add(1));
        self.inner.session.lock().socket_closed();

        info!("Wattpilot disconnected (auto reconnect: {})", auto_reconnect);
        self.inner.events.dispatch(&Event::Disconnect);
    }

    /// Wait for the connection task to finish
    pub async fn join(&self) {
        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Connection task failed: {}", e);
            }
        }
    }

    /// Wait until authenticated and the first full status was applied
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while !(self.is_connected() && self.all_properties_initialized()) {
                tokio::time::sleep(READY_POLL).await;
            }
        })
        .await
        .is_ok()
    }

    /// [`wait_until_ready`](Self::wait_until_ready) with the configured init timeout
    pub async fn wait_for_init(&self) -> bool {
        self.wait_until_ready(self.inner.config.init_timeout).await
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Write a property; returns the request id
    ///
    /// The result of the write arrives later as a [`Event::Response`].
    pub async fn send_update(
        &self,
        key: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<u64, ClientError> {
        let value = value.into();
        debug!("Sending update {}={}", key, value);
        self.send_request(|id| OutboundMessage::set_value(id, key, value))
            .await
    }

    /// Set the charging current in amps
    pub async fn set_power(&self, amps: u32) -> Result<u64, ClientError> {
        self.send_update("amp", amps).await
    }

    pub async fn set_mode(&self, mode: LoadMode) -> Result<u64, ClientError> {
        self.send_update("lmo", mode.code()).await
    }

    pub async fn pair_inverter(&self, inverter_id: &str) -> Result<u64, ClientError> {
        self.send_request(|request_id| OutboundMessage::PairInverter {
            request_id,
            inverter_id: inverter_id.to_string(),
        })
        .await
    }

    pub async fn unpair_inverter(&self, inverter_id: &str) -> Result<u64, ClientError> {
        self.send_request(|request_id| OutboundMessage::UnpairInverter {
            request_id,
            inverter_id: inverter_id.to_string(),
        })
        .await
    }

    /// Write a property from user-supplied text
    ///
    /// JSON lists and records are sent as structured values. Keys the charger
    /// never reported are rejected unless `allow_unknown`.
    pub async fn set_property(
        &self,
        key: &str,
        raw: &str,
        force: Option<ForceType>,
        allow_unknown: bool,
    ) -> Result<u64, ClientError> {
        if !allow_unknown && !self.inner.store.contains(key) {
            error!("Charger does not have property: {}", key);
            return Err(ClientError::UnknownProperty(key.to_string()));
        }
        self.send_update(key, coerce_input(raw, force)).await
    }

    async fn send_request(
        &self,
        build: impl FnOnce(u64) -> OutboundMessage,
    ) -> Result<u64, ClientError> {
        let sender = self
            .inner
            .outgoing
            .lock()
            .clone()
            .ok_or(ClientError::NotConnected)?;
        let permit = sender
            .reserve()
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        // Ids are assigned and queued under one lock so frames leave in id order
        let mut session = self.inner.session.lock();
        if !session.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let request_id = session.next_request_id();
        let frame = session.prepare(build(request_id))?.to_json()?;
        permit.send(Outgoing::Frame(frame));
        Ok(request_id)
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().is_connected()
    }

    pub fn all_properties_initialized(&self) -> bool {
        self.inner.store.is_initialized()
    }

    pub fn all_props(&self) -> HashMap<String, PropertyValue> {
        self.inner.store.all()
    }

    pub fn get(&self, key: &str) -> Option<PropertyValue> {
        self.inner.store.get(key)
    }

    pub fn derived(&self) -> DerivedFields {
        self.inner.store.derived()
    }

    pub fn store(&self) -> &PropertyStore {
        &self.inner.store
    }

    /// Charger serial, configured or learned from hello
    pub fn serial(&self) -> Option<String> {
        self.inner.session.lock().serial().map(str::to_string)
    }

    /// Charger name (its hostname)
    pub fn name(&self) -> Option<String> {
        self.inner.session.lock().device().hostname.clone()
    }

    pub fn device(&self) -> DeviceInfo {
        self.inner.session.lock().device().clone()
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.session.lock().state()
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Connection attempts made so far
    pub fn connection_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    pub fn add_event_handler(&self, kind: EventKind, handler: EventHandler) {
        self.inner.events.add_handler(kind, handler);
    }

    pub fn remove_event_handler(&self, kind: EventKind, handler: &EventHandler) -> bool {
        self.inner.events.remove_handler(kind, handler)
    }

    /// Register a closure, returning the handle for removal
    pub fn on<F>(&self, kind: EventKind, f: F) -> EventHandler
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, f)
    }
}

impl std::fmt::Debug for WattpilotClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WattpilotClient")
            .field("url", &self.inner.url)
            .field("session", &*self.inner.session.lock())
            .field("properties", &self.inner.store.len())
            .finish()
    }
}

fn nonce_rng(seed: Option<u64>, attempt: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(attempt)),
        None => StdRng::from_entropy(),
    }
}

fn websocket_config(max_message_size: Option<usize>) -> Option<WebSocketConfig> {
    max_message_size.map(|limit| WebSocketConfig {
        max_message_size: Some(limit),
        max_frame_size: Some(limit),
        write_buffer_size: 0,
        max_write_buffer_size: limit.max(1),
        ..Default::default()
    })
}

/// Resolves once a disconnect has been requested since the last call
async fn disconnect_requested(control: &mut watch::Receiver<u64>) {
    if control.changed().await.is_err() {
        // Sender lives as long as the client; never resolve spuriously
        std::future::pending::<()>().await;
    }
}

impl Inner {
    /// Connection loop: connect, process frames, reconnect on unexpected close
    async fn run(self: Arc<Self>, mut control: watch::Receiver<u64>) {
        loop {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            {
                let mut session = self.session.lock();
                let fresh = session.renewed(nonce_rng(self.config.rng_seed, attempt));
                *session = fresh;
                session.begin_connect();
            }
            self.store.begin_connection();

            let end = self.connect_and_run(&mut control).await;

            if end == SessionEnd::Rejected {
                error!("Charger rejected the credentials, not reconnecting");
                break;
            }
            if !self.auto_reconnect.load(Ordering::SeqCst) {
                break;
            }

            info!("Reconnecting in {:?}", self.config.reconnect_interval);
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                _ = disconnect_requested(&mut control) => {}
            }
            if !self.auto_reconnect.load(Ordering::SeqCst) {
                break;
            }
        }

        info!("Connection loop finished");
    }

    /// One socket session, from connect to close
    async fn connect_and_run(&self, control: &mut watch::Receiver<u64>) -> SessionEnd {
        info!("Connecting to charger: {}", self.url);

        let ws_stream = tokio::select! {
            result = connect_async_with_config(
                self.url.as_str(),
                websocket_config(self.config.max_message_size),
                false,
            ) => {
                match result {
                    Ok((stream, _response)) => stream,
                    Err(e) => {
                        error!("WebSocket connection failed: {}", e);
                        self.session.lock().socket_closed();
                        self.events.dispatch(&Event::SocketError(e.to_string()));
                        self.events.dispatch(&Event::SocketClose {
                            code: None,
                            reason: e.to_string(),
                        });
                        return SessionEnd::Closed;
                    }
                }
            }
            _ = disconnect_requested(control) => {
                self.session.lock().socket_closed();
                return SessionEnd::Closed;
            }
        };

        info!("WebSocket connected to {}", self.url);
        self.session.lock().socket_opened();
        self.events.dispatch(&Event::SocketOpen);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::channel::<Outgoing>(OUTGOING_QUEUE);
        *self.outgoing.lock() = Some(send_tx.clone());

        let (failed_tx, mut writer_failed) = oneshot::channel::<String>();

        let mut writer = tokio::spawn(async move {
            while let Some(outgoing) = send_rx.recv().await {
                match outgoing {
                    Outgoing::Frame(text) => {
                        debug!("Message send: {}", text);
                        if let Err(e) = ws_tx.send(Message::Text(text)).await {
                            error!("Failed to send WebSocket message: {}", e);
                            let _ = failed_tx.send(e.to_string());
                            break;
                        }
                    }
                    Outgoing::Close => {
                        if let Err(e) = ws_tx.close().await {
                            debug!("Close handshake failed: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        let mut end = SessionEnd::Closed;
        let mut close_code = None;
        let mut close_reason = String::new();
        let mut writer_running = true;

        loop {
            tokio::select! {
                _ = disconnect_requested(control) => {
                    info!("Closing socket on request");
                    let _ = send_tx.send(Outgoing::Close).await;
                    break;
                }
                failure = &mut writer_failed, if writer_running => {
                    writer_running = false;
                    // Err means the writer finished without a send failure
                    if let Ok(reason) = failure {
                        self.events.dispatch(&Event::SocketError(reason));
                        break;
                    }
                }
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let outcome = self.process_frame(&text).await;

                            for reply in &outcome.replies {
                                match reply.to_json() {
                                    Ok(frame) => {
                                        if send_tx.send(Outgoing::Frame(frame)).await.is_err() {
                                            warn!("Writer gone, dropping {} frame", reply.type_name());
                                        }
                                    }
                                    Err(e) => error!("Failed to encode {}: {}", reply.type_name(), e),
                                }
                            }
                            for event in &outcome.events {
                                self.events.dispatch(event);
                            }

                            if outcome.close {
                                end = SessionEnd::Rejected;
                                let _ = send_tx.send(Outgoing::Close).await;
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            if let Some(frame) = frame {
                                close_code = Some(u16::from(frame.code));
                                close_reason = frame.reason.to_string();
                            }
                            info!("WebSocket closed by charger");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            self.events.dispatch(&Event::SocketError(e.to_string()));
                            break;
                        }
                        None => {
                            info!("WebSocket stream ended");
                            break;
                        }
                    }
                }
            }
        }

        self.outgoing.lock().take();
        drop(send_tx);
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            writer.abort();
        }

        self.session.lock().socket_closed();
        self.events.dispatch(&Event::SocketClose {
            code: close_code,
            reason: close_reason,
        });
        end
    }

    /// Run one frame through the session, deriving password hashes off the lock
    async fn process_frame(&self, text: &str) -> FrameOutcome {
        let parsed = InboundMessage::parse(text);

        let job = match &parsed {
            Ok(message) => self.session.lock().hash_job(message),
            Err(_) => None,
        };
        if let Some(job) = job {
            let scheme = job.scheme();
            match tokio::task::spawn_blocking(move || job.compute()).await {
                Ok(Ok(cached)) => self.session.lock().cache_hash(cached),
                Ok(Err(e)) => error!("Password hashing ({}) failed: {}", scheme, e),
                Err(e) => error!("Password hashing task failed: {}", e),
            }
        }

        self.session.lock().handle_frame(text, parsed, &self.store)
    }
}
