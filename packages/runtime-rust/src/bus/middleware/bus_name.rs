//! Stamps the name of the bus a message was first dispatched on.

use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::{BusNameStamp, Envelope};
use tower::{Layer, Service};

use crate::bus::BusRequest;
use crate::error::BusError;

/// Appends a [`BusNameStamp`] unless the envelope already carries one.
///
/// Envelopes consumed from a transport keep the bus name they were sent from.
#[derive(Debug, Clone)]
pub struct AddBusNameLayer {
    bus_name: Arc<str>,
}

impl AddBusNameLayer {
    #[must_use]
    pub fn new(bus_name: &str) -> Self {
        Self {
            bus_name: Arc::from(bus_name),
        }
    }
}

impl<S> Layer<S> for AddBusNameLayer {
    type Service = AddBusNameService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AddBusNameService {
            inner,
            bus_name: Arc::clone(&self.bus_name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AddBusNameService<S> {
    inner: S,
    bus_name: Arc<str>,
}

impl<S> Service<BusRequest> for AddBusNameService<S>
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
        if !req.envelope.has::<BusNameStamp>() {
            req.envelope = req
                .envelope
                .with_stamp(BusNameStamp::new(self.bus_name.as_ref()));
        }
        self.inner.call(req)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{DispatchContext, Message};

    use super::*;
    use crate::bus::{MessageBus, Middleware};

    #[derive(Debug)]
    struct Ping;

    impl Message for Ping {}

    #[tokio::test]
    async fn stamps_bus_name_once() {
        let layers: [Arc<dyn Middleware>; 1] = [Arc::new(AddBusNameLayer::new("commands"))];
        let bus = MessageBus::new("commands", &layers);
        let out = bus.dispatch(&DispatchContext::new(), Ping).await.unwrap();

        assert_eq!(out.all::<BusNameStamp>().len(), 1);
        assert_eq!(
            out.first::<BusNameStamp>().map(|s| s.bus_name.as_str()),
            Some("commands")
        );
    }

    #[tokio::test]
    async fn existing_bus_name_is_preserved() {
        let layers: [Arc<dyn Middleware>; 1] = [Arc::new(AddBusNameLayer::new("events"))];
        let bus = MessageBus::new("events", &layers);
        let envelope = Envelope::new(Ping).with_stamp(BusNameStamp::new("commands"));

        let out = bus
            .dispatch_envelope(&DispatchContext::new(), envelope)
            .await
            .unwrap();
        assert_eq!(out.all::<BusNameStamp>().len(), 1);
        assert_eq!(
            out.first::<BusNameStamp>().map(|s| s.bus_name.as_str()),
            Some("commands")
        );
    }
}
