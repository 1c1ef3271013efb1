//! Hands routed messages to their transports instead of handling them locally.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::{Envelope, ReceivedStamp, SentStamp, Stamp, TransportNameStamp};
use tower::{Layer, Service};
use tracing::debug;

use crate::bus::BusRequest;
use crate::error::BusError;
use crate::routing::Router;
use crate::transport::TransportLocator;

// ---------------------------------------------------------------------------
// SendMessageLayer
// ---------------------------------------------------------------------------

/// Sends the envelope to every transport selected for it.
///
/// Selection comes from the newest [`TransportNameStamp`] when present and
/// from the [`Router`] otherwise. After all sends succeed the envelope gains
/// one [`SentStamp`] per transport and the rest of the chain is skipped, so a
/// sent message is never also handled in the same dispatch. Envelopes
/// consumed from a transport, and envelopes with no selected transport, pass
/// straight through.
#[derive(Clone)]
pub struct SendMessageLayer {
    router: Arc<Router>,
    transports: TransportLocator,
}

impl SendMessageLayer {
    #[must_use]
    pub fn new(router: Arc<Router>, transports: TransportLocator) -> Self {
        Self { router, transports }
    }
}

impl<S> Layer<S> for SendMessageLayer {
    type Service = SendMessageService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SendMessageService {
            inner,
            router: Arc::clone(&self.router),
            transports: self.transports.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// SendMessageService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SendMessageService<S> {
    inner: S,
    router: Arc<Router>,
    transports: TransportLocator,
}

impl<S> Service<BusRequest> for SendMessageService<S>
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

        if req.envelope.has::<ReceivedStamp>() {
            return Box::pin(inner.call(req));
        }

        let targets: Vec<String> = match req.envelope.last::<TransportNameStamp>() {
            Some(stamp) => stamp.transports.clone(),
            None => self.router.transports_for(&req.envelope).to_vec(),
        };
        if targets.is_empty() {
            return Box::pin(inner.call(req));
        }

        let transports = self.transports.clone();
        Box::pin(async move {
            let BusRequest { ctx, envelope } = req;
            let message_type = envelope.message_type().name;

            for name in &targets {
                let transport = transports
                    .get(name)
                    .ok_or_else(|| BusError::UnknownTransport { name: name.clone() })?;
                transport
                    .send(&ctx, &envelope)
                    .await
                    .map_err(|source| BusError::SendFailed {
                        transport: name.clone(),
                        message_type,
                        source,
                    })?;
                debug!(transport = %name, message_type, "message sent");
            }

            let sent = targets
                .into_iter()
                .map(|name| Arc::new(SentStamp::new(name)) as Arc<dyn Stamp>);
            Ok(envelope.with_stamps(sent))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
