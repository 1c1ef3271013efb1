//! Courier runtime: middleware buses, handler dispatch, transports, and
//! retry/dead-letter handling built on the `courier-core` envelope model.

pub mod builder;
pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod retry;
pub mod routing;
pub mod telemetry;
pub mod transport;

pub use builder::{Runtime, RuntimeBuilder};
pub use bus::middleware::MiddlewareRegistry;
pub use bus::{BusDirectory, BusRequest, BusService, MessageBus, Middleware};
pub use config::{BusConfig, RetryConfig, RouteTarget, RuntimeConfig, TransportConfig};
pub use error::{BuildError, BusError};
pub use event::{BusEvent, EventDispatcher, EventKind, EventListener, LocalEventDispatcher};
pub use handler::{Handler, HandlerRegistry};
pub use retry::{MultiplierRetryStrategy, RetryStrategy, SendFailedMessageForRetryListener};
pub use routing::Router;
pub use telemetry::{init_tracing, TracingConfig};
pub use transport::{
    InMemoryTransport, InMemoryTransportFactory, ReceiveCallback, Transport, TransportFactory,
    TransportManager,
};
