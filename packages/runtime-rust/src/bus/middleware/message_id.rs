//! Assigns a unique identifier to every dispatched message.

use std::task::{Context, Poll};

use courier_core::{Envelope, MessageIdStamp};
use tower::{Layer, Service};

use crate::bus::BusRequest;
use crate::error::BusError;

/// Appends a UUID v4 [`MessageIdStamp`] unless one is already present.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddMessageIdLayer;

impl<S> Layer<S> for AddMessageIdLayer {
    type Service = AddMessageIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AddMessageIdService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct AddMessageIdService<S> {
    inner: S,
}

impl<S> Service<BusRequest> for AddMessageIdService<S>
where
    S: Service<BusRequest, Response = Envelope, Error = BusError>,
{
    type Response = Envelope;
    type Error = BusError;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: BusRequest) -> Self::Future {
        if !req.envelope.has::<MessageIdStamp>() {
            req.envelope = req.envelope.with_stamp(MessageIdStamp::generate());
        }
        self.inner.call(req)
    }
}
