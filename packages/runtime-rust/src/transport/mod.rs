//! Transports: named endpoints that carry envelopes out of and back into buses.

pub mod in_memory;
pub mod manager;

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{DispatchContext, Envelope, Serializer};
use futures_util::future::BoxFuture;

use crate::config::TransportConfig;
use crate::error::BusError;

pub use in_memory::{InMemoryTransport, InMemoryTransportFactory};
pub use manager::{TransportLocator, TransportManager};

/// Outcome of consuming one envelope. A failure tells the transport to
/// negatively acknowledge the delivery.
pub type ConsumeResult = Result<(), Arc<BusError>>;

/// Invoked by a transport for every consumed envelope.
pub type ReceiveCallback =
    Arc<dyn Fn(DispatchContext, Envelope) -> BoxFuture<'static, ConsumeResult> + Send + Sync>;

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// A named message endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Unique name used by routes, stamps, and configuration.
    fn name(&self) -> &str;

    /// Publishes an envelope.
    async fn send(&self, ctx: &DispatchContext, envelope: &Envelope) -> anyhow::Result<()>;

    /// Consumes envelopes, invoking `callback` for each, until `ctx` is
    /// cancelled. In-flight callbacks are drained before returning.
    async fn receive(&self, ctx: DispatchContext, callback: ReceiveCallback) -> anyhow::Result<()>;

    /// Re-publishes an envelope that failed processing.
    async fn retry(&self, ctx: &DispatchContext, envelope: &Envelope) -> anyhow::Result<()> {
        self.send(ctx, envelope).await
    }
}

// ---------------------------------------------------------------------------
// TransportFactory
// ---------------------------------------------------------------------------

/// Creates transports from configuration entries whose DSN it recognises.
pub trait TransportFactory: Send + Sync {
    fn supports(&self, dsn: &str) -> bool;

    /// # Errors
    ///
    /// Returns an error if the entry's options are invalid.
    fn create(
        &self,
        name: &str,
        config: &TransportConfig,
        serializer: Arc<dyn Serializer>,
    ) -> anyhow::Result<Arc<dyn Transport>>;
}
