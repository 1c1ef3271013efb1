//! Invokes the registered handlers for a message.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::{Envelope, HandledStamp, SentStamp};
use tower::{Layer, Service};
use tracing::debug;

use crate::bus::BusRequest;
use crate::error::BusError;
use crate::handler::HandlerRegistry;

// ---------------------------------------------------------------------------
// HandleMessageLayer
// ---------------------------------------------------------------------------

/// Runs every handler for the message's exact type, in registration order.
///
/// Envelopes already sent to a transport in this dispatch are passed through
/// untouched; they are handled when consumed.
#[derive(Clone)]
pub struct HandleMessageLayer {
    handlers: Arc<HandlerRegistry>,
    bus_name: Arc<str>,
    is_default_bus: bool,
}

impl HandleMessageLayer {
    #[must_use]
    pub fn new(handlers: Arc<HandlerRegistry>, bus_name: &str, is_default_bus: bool) -> Self {
        Self {
            handlers,
            bus_name: Arc::from(bus_name),
            is_default_bus,
        }
    }
}

impl<S> Layer<S> for HandleMessageLayer {
    type Service = HandleMessageService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HandleMessageService {
            inner,
            handlers: Arc::clone(&self.handlers),
            bus_name: Arc::clone(&self.bus_name),
            is_default_bus: self.is_default_bus,
        }
    }
}

// ---------------------------------------------------------------------------
// HandleMessageService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HandleMessageService<S> {
    inner: S,
    handlers: Arc<HandlerRegistry>,
    bus_name: Arc<str>,
    is_default_bus: bool,
}

impl<S> Service<BusRequest> for HandleMessageService<S>
where
    S: Service<BusRequest, Response = Envelope, Error = BusError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Envelope;
    type Error = BusError;
    type Future = Pin<Box<dyn Future<Output = Result<Envelope, BusError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: BusRequest) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if req.envelope.has::<SentStamp>() {
            return Box::pin(inner.call(req));
        }

        let message_type = req.envelope.message_type();
        let handlers =
            self.handlers
                .handlers_on(message_type.id, &self.bus_name, self.is_default_bus);

        Box::pin(async move {
            if handlers.is_empty() {
                return Err(BusError::NoHandlers {
                    message_type: message_type.name,
                });
            }

            let BusRequest { ctx, mut envelope } = req;
            for handler in &handlers {
                let result = handler
                    .call(&ctx, envelope.message())
                    .await
                    .map_err(|source| BusError::HandlerFailed {
                        handler: handler.name().to_string(),
                        message_type: message_type.name,
                        source,
                    })?;
                debug!(
                    message_type = message_type.name,
                    handler = handler.name(),
                    "message handled"
                );
                envelope = envelope.with_stamp(HandledStamp::new(handler.name(), result));
            }

            inner.call(BusRequest { ctx, envelope }).await
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
