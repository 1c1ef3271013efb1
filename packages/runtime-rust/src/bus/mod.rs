//! Message buses: ordered middleware chains over a shared envelope pipeline.
//!
//! A bus is a stack of tower layers folded around an identity service. Each
//! middleware receives a [`BusRequest`], may stamp or short-circuit it, and
//! delegates to the next service; the innermost service returns the envelope
//! unchanged.

pub mod directory;
pub mod middleware;

use std::sync::Arc;

use courier_core::{DispatchContext, Envelope, Message, Stamp};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};

use crate::error::BusError;

pub use directory::BusDirectory;

// ---------------------------------------------------------------------------
// BusRequest / BusService
// ---------------------------------------------------------------------------

/// One pass through a middleware chain.
#[derive(Debug, Clone)]
pub struct BusRequest {
    pub ctx: DispatchContext,
    pub envelope: Envelope,
}

impl BusRequest {
    #[must_use]
    pub fn new(ctx: DispatchContext, envelope: Envelope) -> Self {
        Self { ctx, envelope }
    }
}

/// The type-erased "next" service every middleware wraps.
pub type BusService = BoxCloneSyncService<BusRequest, Envelope, BusError>;

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Object-safe view of a tower layer that wraps a [`BusService`].
///
/// Implemented for every compatible `Layer`, so middlewares are written as
/// ordinary layer/service pairs.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: BusService) -> BusService;
}

impl<L> Middleware for L
where
    L: Layer<BusService> + Send + Sync,
    L::Service: Service<BusRequest, Response = Envelope, Error = BusError>
        + Clone
        + Send
        + Sync
        + 'static,
    <L::Service as Service<BusRequest>>::Future: Send + 'static,
{
    fn wrap(&self, next: BusService) -> BusService {
        BoxCloneSyncService::new(self.layer(next))
    }
}

fn terminal() -> BusService {
    BoxCloneSyncService::new(tower::service_fn(|req: BusRequest| {
        std::future::ready(Ok::<_, BusError>(req.envelope))
    }))
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

/// A named middleware chain.
///
/// The chain is assembled once at construction; dispatching clones the boxed
/// service, so a bus is freely shareable across tasks.
#[derive(Clone)]
pub struct MessageBus {
    name: String,
    service: BusService,
    middleware_count: usize,
}

impl MessageBus {
    /// Builds a bus whose chain runs `middlewares` in slice order.
    #[must_use]
    pub fn new(name: impl Into<String>, middlewares: &[Arc<dyn Middleware>]) -> Self {
        let service = middlewares
            .iter()
            .rev()
            .fold(terminal(), |next, middleware| middleware.wrap(next));
        Self {
            name: name.into(),
            service,
            middleware_count: middlewares.len(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wraps `message` in a fresh envelope and dispatches it.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a middleware or handler.
    pub async fn dispatch<M: Message>(
        &self,
        ctx: &DispatchContext,
        message: M,
    ) -> Result<Envelope, BusError> {
        self.dispatch_envelope(ctx, Envelope::new(message)).await
    }

    /// Wraps `message`, appends `stamps`, and dispatches it.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a middleware or handler.
    pub async fn dispatch_with_stamps<M, I>(
        &self,
        ctx: &DispatchContext,
        message: M,
        stamps: I,
    ) -> Result<Envelope, BusError>
    where
        M: Message,
        I: IntoIterator<Item = Arc<dyn Stamp>>,
    {
        self.dispatch_envelope(ctx, Envelope::new(message).with_stamps(stamps))
            .await
    }

    /// Dispatches an existing envelope as-is.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a middleware or handler.
    pub async fn dispatch_envelope(
        &self,
        ctx: &DispatchContext,
        envelope: Envelope,
    ) -> Result<Envelope, BusError> {
        self.service
            .clone()
            .oneshot(BusRequest::new(ctx.clone(), envelope))
            .await
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("name", &self.name)
            .field("middleware_count", &self.middleware_count)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use courier_core::{BusNameStamp, RedeliveryStamp};
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug)]
    struct Ping;

    impl Message for Ping {}

    /// Records its label on the way in and stamps the envelope on the way out.
    #[derive(Clone)]
    struct RecordLayer {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl<S> Layer<S> for RecordLayer {
        type Service = RecordService<S>;

        fn layer(&self, inner: S) -> Self::Service {
            RecordService {
                inner,
                label: self.label,
                log: Arc::clone(&self.log),
            }
        }
    }

    #[derive(Clone)]
    struct RecordService<S> {
        inner: S,
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl<S> Service<BusRequest> for RecordService<S>
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
            self.log.lock().push(format!("enter:{}", self.label));
            let log = Arc::clone(&self.log);
            let label = self.label;
            let fut = self.inner.call(req);
            Box::pin(async move {
                let envelope = fut.await?;
                log.lock().push(format!("exit:{label}"));
                Ok(envelope.with_stamp(BusNameStamp::new(label)))
            })
        }
    }

    /// Short-circuits with an error without calling the next service.
    #[derive(Clone)]
    struct RejectLayer;

    impl<S> Layer<S> for RejectLayer {
        type Service = RejectService;

        fn layer(&self, _inner: S) -> Self::Service {
            RejectService
        }
    }

    #[derive(Clone)]
    struct RejectService;

    impl Service<BusRequest> for RejectService {
        type Response = Envelope;
        type Error = BusError;
        type Future = std::future::Ready<Result<Envelope, BusError>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: BusRequest) -> Self::Future {
            std::future::ready(Err(BusError::HandlerFailed {
                handler: "reject".to_string(),
                message_type: "Ping",
                source: anyhow::anyhow!("rejected"),
            }))
        }
    }

    fn record(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(RecordLayer {
            label,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn empty_chain_returns_envelope_unchanged() {
        let bus = MessageBus::new("default", &[]);
        let envelope = Envelope::new(Ping).with_stamp(RedeliveryStamp::new(2));

        let out = bus
            .dispatch_envelope(&DispatchContext::new(), envelope.clone())
            .await
            .unwrap();
        assert_eq!(out.stamps().len(), 1);
        assert!(Arc::ptr_eq(out.message_arc(), envelope.message_arc()));
    }

    #[tokio::test]
    async fn middlewares_run_in_order_and_unwind_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = MessageBus::new("default", &[record("a", &log), record("b", &log)]);

        let out = bus.dispatch(&DispatchContext::new(), Ping).await.unwrap();

        assert_eq!(*log.lock(), ["enter:a", "enter:b", "exit:b", "exit:a"]);
        let labels: Vec<&str> = out
            .all::<BusNameStamp>()
            .iter()
            .map(|s| s.bus_name.as_str())
            .collect();
        assert_eq!(labels, ["b", "a"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest_of_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = MessageBus::new(
            "default",
            &[
                record("a", &log),
                Arc::new(RejectLayer) as Arc<dyn Middleware>,
                record("b", &log),
            ],
        );

        let err = bus.dispatch(&DispatchContext::new(), Ping).await.unwrap_err();
        assert!(err.to_string().contains("rejected"));
        assert_eq!(*log.lock(), ["enter:a"]);
    }

    #[tokio::test]
    async fn extra_stamps_are_appended_before_the_chain_runs() {
        let bus = MessageBus::new("default", &[]);
        let out = bus
            .dispatch_with_stamps(
                &DispatchContext::new(),
                Ping,
                [Arc::new(RedeliveryStamp::new(1)) as Arc<dyn Stamp>],
            )
            .await
            .unwrap();
        assert_eq!(out.last::<RedeliveryStamp>().map(|s| s.retry_count), Some(1));
    }

    #[tokio::test]
    async fn bus_is_reusable_across_tasks() {
        let bus = Arc::new(MessageBus::new("default", &[]));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let bus = Arc::clone(&bus);
            handles.push(tokio::spawn(async move {
                bus.dispatch(&DispatchContext::new(), Ping).await.is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
    }
}
