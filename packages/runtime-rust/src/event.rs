//! Lifecycle events raised while consuming from transports.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{DispatchContext, Envelope};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::BusError;

// ---------------------------------------------------------------------------
// BusEvent
// ---------------------------------------------------------------------------

/// Discriminant of a [`BusEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    MessageHandled,
    MessageFailed,
    SendFailedForRetry,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::MessageReceived,
        EventKind::MessageHandled,
        EventKind::MessageFailed,
        EventKind::SendFailedForRetry,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MessageReceived => "message_received",
            Self::MessageHandled => "message_handled",
            Self::MessageFailed => "message_failed",
            Self::SendFailedForRetry => "send_failed_for_retry",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    /// An envelope arrived from a transport, before dispatch.
    MessageReceived { envelope: Envelope, transport: String },
    /// Consumer-side dispatch succeeded. Carries the handled envelope.
    MessageHandled { envelope: Envelope, transport: String },
    /// Consumer-side dispatch failed.
    MessageFailed {
        envelope: Envelope,
        transport: String,
        error: Arc<BusError>,
    },
    /// Raised right after `MessageFailed`; drives the retry decision.
    SendFailedForRetry {
        envelope: Envelope,
        transport: String,
        error: Arc<BusError>,
    },
}

impl BusEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived { .. } => EventKind::MessageReceived,
            Self::MessageHandled { .. } => EventKind::MessageHandled,
            Self::MessageFailed { .. } => EventKind::MessageFailed,
            Self::SendFailedForRetry { .. } => EventKind::SendFailedForRetry,
        }
    }

    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        match self {
            Self::MessageReceived { envelope, .. }
            | Self::MessageHandled { envelope, .. }
            | Self::MessageFailed { envelope, .. }
            | Self::SendFailedForRetry { envelope, .. } => envelope,
        }
    }

    #[must_use]
    pub fn transport(&self) -> &str {
        match self {
            Self::MessageReceived { transport, .. }
            | Self::MessageHandled { transport, .. }
            | Self::MessageFailed { transport, .. }
            | Self::SendFailedForRetry { transport, .. } => transport,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&Arc<BusError>> {
        match self {
            Self::MessageFailed { error, .. } | Self::SendFailedForRetry { error, .. } => Some(error),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Listener / dispatcher traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EventListener: Send + Sync {
    /// # Errors
    ///
    /// A listener error is returned from the dispatcher after the remaining
    /// listeners have run.
    async fn on_event(&self, ctx: &DispatchContext, event: &BusEvent) -> anyhow::Result<()>;
}

/// Fans events out to the listeners subscribed to their kind.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Invokes every listener for `event.kind()`, in subscription order.
    ///
    /// # Errors
    ///
    /// Returns the first listener error.
    async fn dispatch(&self, ctx: &DispatchContext, event: &BusEvent) -> anyhow::Result<()>;

    fn add_listener(&self, kind: EventKind, listener: Arc<dyn EventListener>);
}

// ---------------------------------------------------------------------------
// LocalEventDispatcher
// ---------------------------------------------------------------------------

/// In-process dispatcher: listeners run sequentially on the caller's task.
#[derive(Default)]
pub struct LocalEventDispatcher {
    listeners: RwLock<HashMap<EventKind, Vec<Arc<dyn EventListener>>>>,
}

impl LocalEventDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }
}

#[async_trait]
impl EventDispatcher for LocalEventDispatcher {
    async fn dispatch(&self, ctx: &DispatchContext, event: &BusEvent) -> anyhow::Result<()> {
        let listeners = self
            .listeners
            .read()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        let mut first_error = None;
        for listener in listeners {
            if let Err(err) = listener.on_event(ctx, event).await {
                warn!(event = %event.kind(), error = %err, "event listener failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn add_listener(&self, kind: EventKind, listener: Arc<dyn EventListener>) {
        self.listeners.write().entry(kind).or_default().push(listener);
    }
}

impl fmt::Debug for LocalEventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        let counts: HashMap<EventKind, usize> =
            listeners.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("LocalEventDispatcher")
            .field("listeners", &counts)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// LogListener
// ---------------------------------------------------------------------------

/// Writes every event to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogListener;

#[async_trait]
impl EventListener for LogListener {
    async fn on_event(&self, _ctx: &DispatchContext, event: &BusEvent) -> anyhow::Result<()> {
        let message_type = event.envelope().message_type().name;
        match event.error() {
            Some(error) if event.kind() == EventKind::MessageFailed => warn!(
                event = %event.kind(),
                transport = event.transport(),
                message_type,
                error = %error,
                "message failed"
            ),
            _ => debug!(
                event = %event.kind(),
                transport = event.transport(),
                message_type,
                "bus event"
            ),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
