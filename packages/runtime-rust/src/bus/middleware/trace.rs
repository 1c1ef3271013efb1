//! Dispatch timing and outcome via `tracing` spans.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use courier_core::{Envelope, MessageIdStamp};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::bus::BusRequest;
use crate::error::BusError;

// ---------------------------------------------------------------------------
// TraceLayer
// ---------------------------------------------------------------------------

/// Wraps each dispatch in a `dispatch` span and logs its duration and outcome.
#[derive(Debug, Clone)]
pub struct TraceLayer {
    bus_name: Arc<str>,
}

impl TraceLayer {
    #[must_use]
    pub fn new(bus_name: &str) -> Self {
        Self {
            bus_name: Arc::from(bus_name),
        }
    }
}

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceService {
            inner,
            bus_name: Arc::clone(&self.bus_name),
        }
    }
}

// ---------------------------------------------------------------------------
// TraceService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TraceService<S> {
    inner: S,
    bus_name: Arc<str>,
}

impl<S> Service<BusRequest> for TraceService<S>
where
    S: Service<BusRequest, Response = Envelope, Error = BusError> + Send,
    S::Future: Send + 'static,
{
    type Response = Envelope;
    type Error = BusError;
    type Future = Pin<Box<dyn Future<Output = Result<Envelope, BusError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: BusRequest) -> Self::Future {
        let message_type = req.envelope.message_type().name;
        let message_id = req
            .envelope
            .last::<MessageIdStamp>()
            .map_or_else(String::new, |s| s.id.clone());
        let trace_id = req.ctx.trace_id.clone().unwrap_or_default();

        let span = info_span!(
            "dispatch",
            bus = %self.bus_name,
            message_type,
            message_id = %message_id,
            trace_id = %trace_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let bus_name = Arc::clone(&self.bus_name);
        // Synchronous work in the inner services also belongs to the span.
        let fut = {
            let _entered = span.enter();
            self.inner.call(req)
        };

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(_) => "error",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                match &result {
                    Ok(_) => tracing::debug!(
                        bus = %bus_name,
                        message_type,
                        duration_ms,
                        "dispatch complete"
                    ),
                    Err(err) => tracing::warn!(
                        bus = %bus_name,
                        message_type,
                        duration_ms,
                        error = %err,
                        "dispatch failed"
                    ),
                }

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
