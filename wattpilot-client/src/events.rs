//! Client events and handler registry

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error};

use crate::properties::PropertyValue;
use crate::protocol::messages::{
    AuthErrorMessage, AuthRequiredMessage, HelloMessage, ResponseMessage, StatusMessage,
};

/// Event discriminant used to register handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Init,
    Connect,
    Disconnect,
    SocketOpen,
    SocketClose,
    SocketError,
    Message,
    Hello,
    AuthRequired,
    AuthSuccess,
    AuthError,
    FullStatus,
    FullStatusFinished,
    Initialized,
    DeltaStatus,
    Property,
    Response,
    ClearInverters,
    UpdateInverter,
}

/// Something that happened on the client or its connection
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Client constructed
    Init,
    /// `connect()` called
    Connect,
    /// `disconnect()` called
    Disconnect,
    SocketOpen,
    SocketClose {
        code: Option<u16>,
        reason: String,
    },
    SocketError(String),
    /// Raw text frame, emitted before any decoding
    Message(String),
    Hello(HelloMessage),
    AuthRequired(AuthRequiredMessage),
    AuthSuccess,
    AuthError(AuthErrorMessage),
    FullStatus(StatusMessage),
    /// A non-partial full status was applied
    FullStatusFinished(StatusMessage),
    /// First complete snapshot of this connection
    Initialized,
    DeltaStatus(StatusMessage),
    Property {
        key: String,
        value: PropertyValue,
    },
    Response(ResponseMessage),
    ClearInverters(Value),
    UpdateInverter(Value),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Init => EventKind::Init,
            Event::Connect => EventKind::Connect,
            Event::Disconnect => EventKind::Disconnect,
            Event::SocketOpen => EventKind::SocketOpen,
            Event::SocketClose { .. } => EventKind::SocketClose,
            Event::SocketError(_) => EventKind::SocketError,
            Event::Message(_) => EventKind::Message,
            Event::Hello(_) => EventKind::Hello,
            Event::AuthRequired(_) => EventKind::AuthRequired,
            Event::AuthSuccess => EventKind::AuthSuccess,
            Event::AuthError(_) => EventKind::AuthError,
            Event::FullStatus(_) => EventKind::FullStatus,
            Event::FullStatusFinished(_) => EventKind::FullStatusFinished,
            Event::Initialized => EventKind::Initialized,
            Event::DeltaStatus(_) => EventKind::DeltaStatus,
            Event::Property { .. } => EventKind::Property,
            Event::Response(_) => EventKind::Response,
            Event::ClearInverters(_) => EventKind::ClearInverters,
            Event::UpdateInverter(_) => EventKind::UpdateInverter,
        }
    }
}

/// Registered callback
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Per-kind ordered handler lists
///
/// Cloning shares the registry. Handlers may add or remove handlers while
/// being dispatched; changes take effect from the next dispatch.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handlers: Arc<RwLock<HashMap<EventKind, Vec<EventHandler>>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; the same handler may be registered more than once
    pub fn add_handler(&self, kind: EventKind, handler: EventHandler) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Register a closure and return the handle needed to remove it
    pub fn on<F>(&self, kind: EventKind, f: F) -> EventHandler
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(f);
        self.add_handler(kind, handler.clone());
        handler
    }

    /// Remove the first registration of `handler`, returns whether one was found
    pub fn remove_handler(&self, kind: EventKind, handler: &EventHandler) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };

        match list
            .iter()
            .position(|h| std::ptr::addr_eq(Arc::as_ptr(h), Arc::as_ptr(handler)))
        {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Invoke every handler registered for the event's kind, in order
    pub fn dispatch(&self, event: &Event) {
        let kind = event.kind();
        let snapshot = match self.handlers.read().get(&kind) {
            Some(list) => list.clone(),
            None => return,
        };

        debug!(?kind, handlers = snapshot.len(), "Dispatching event");
        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(?kind, "Event handler panicked");
            }
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        let total: usize = handlers.values().map(Vec::len).sum();
        f.debug_struct("EventDispatcher")
            .field("kinds", &handlers.len())
            .field("handlers", &total)
            .finish()
    }
}
