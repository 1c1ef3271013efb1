//! Error types for dispatch and wiring.

/// Errors returned by [`MessageBus`](crate::bus::MessageBus) dispatch.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no handlers registered for message type {message_type}")]
    NoHandlers { message_type: &'static str },
    #[error("handler {handler} failed for message type {message_type}: {source:#}")]
    HandlerFailed {
        handler: String,
        message_type: &'static str,
        source: anyhow::Error,
    },
    #[error("transport {transport} failed to send {message_type}: {source:#}")]
    SendFailed {
        transport: String,
        message_type: &'static str,
        source: anyhow::Error,
    },
    #[error("unknown transport: {name}")]
    UnknownTransport { name: String },
    #[error("unknown bus: {name}")]
    UnknownBus { name: String },
}

/// Errors that abort [`RuntimeBuilder::build`](crate::builder::RuntimeBuilder::build).
///
/// Every variant names the configuration key that caused it.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("{key}: default bus {name:?} is not declared under `buses`")]
    UnknownDefaultBus { key: String, name: String },
    #[error("{key}: unknown middleware {name:?}")]
    UnknownMiddleware { key: String, name: String },
    #[error("{key}: unknown message type {name:?}")]
    UnknownMessageType { key: String, name: String },
    #[error("{key}: unknown transport {name:?}")]
    UnknownTransport { key: String, name: String },
    #[error("{key}: transport {name:?} is declared more than once")]
    DuplicateTransport { key: String, name: String },
    #[error("{key}: no transport factory supports DSN {dsn:?}")]
    UnsupportedDsn { key: String, dsn: String },
    #[error("{key}: failed to create transport: {source:#}")]
    TransportCreation { key: String, source: anyhow::Error },
    #[error("{key}: handler {handler} is bound to unknown bus {bus:?}")]
    UnknownHandlerBus {
        key: String,
        handler: String,
        bus: String,
    },
    #[error("{key}: {source}")]
    Resolve {
        key: String,
        source: courier_core::ResolveError,
    },
}
