//! Owns every transport and runs their consumers.

use std::sync::Arc;

use courier_core::{DispatchContext, Envelope, ReceivedStamp};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ConsumeResult, ReceiveCallback, Transport};
use crate::bus::BusDirectory;
use crate::event::{BusEvent, EventDispatcher};

#[derive(Default)]
struct ManagerState {
    transports: Vec<Arc<dyn Transport>>,
    running: bool,
    cancel: CancellationToken,
    consumers: Vec<JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// TransportLocator
// ---------------------------------------------------------------------------

/// Read-only, cloneable view of the manager's transports.
///
/// Handed to the send middleware and the retry listener so they can look up
/// transports by name without owning the manager.
#[derive(Clone)]
pub struct TransportLocator {
    state: Arc<Mutex<ManagerState>>,
}

impl TransportLocator {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.state
            .lock()
            .transports
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Transport names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.state
            .lock()
            .transports
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }
}

impl std::fmt::Debug for TransportLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLocator")
            .field("transports", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TransportManager
// ---------------------------------------------------------------------------

/// Registry and consumer supervisor for transports.
///
/// The transport list and the running flag share one lock, so `start`, `stop`,
/// and lookups never observe a half-updated state.
pub struct TransportManager {
    state: Arc<Mutex<ManagerState>>,
    events: Arc<dyn EventDispatcher>,
}

impl TransportManager {
    #[must_use]
    pub fn new(events: Arc<dyn EventDispatcher>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState::default())),
            events,
        }
    }

    #[must_use]
    pub fn locator(&self) -> TransportLocator {
        TransportLocator {
            state: Arc::clone(&self.state),
        }
    }

    /// Registers a transport. Lookups by name return the first transport
    /// registered under that name.
    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        debug!(transport = transport.name(), "transport registered");
        self.state.lock().transports.push(transport);
    }

    #[must_use]
    pub fn has_transport(&self, name: &str) -> bool {
        self.state.lock().transports.iter().any(|t| t.name() == name)
    }

    #[must_use]
    pub fn transport(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.locator().get(name)
    }

    /// Registered transport names, in registration order.
    #[must_use]
    pub fn transport_names(&self) -> Vec<String> {
        self.locator().names()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Starts one consumer task per named transport.
    ///
    /// Envelopes are dispatched on the bus that owns their message type.
    /// Names that match no transport are skipped with a warning. Calling
    /// `start` while already running is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(&self, ctx: &DispatchContext, names: &[String], buses: Arc<BusDirectory>) {
        let mut state = self.state.lock();
        if state.running {
            debug!("transport manager already running");
            return;
        }
        state.running = true;
        state.cancel = ctx.cancel.child_token();

        for name in names {
            let Some(transport) = state.transports.iter().find(|t| t.name() == name).cloned()
            else {
                warn!(transport = %name, "cannot consume unknown transport");
                continue;
            };

            let callback =
                consume_callback(name.clone(), Arc::clone(&buses), Arc::clone(&self.events));
            let consumer_ctx = DispatchContext {
                cancel: state.cancel.clone(),
                trace_id: ctx.trace_id.clone(),
            };
            let transport_name = name.clone();
            state.consumers.push(tokio::spawn(async move {
                info!(transport = %transport_name, "consumer started");
                if let Err(err) = transport.receive(consumer_ctx, callback).await {
                    error!(transport = %transport_name, error = %err, "consumer failed");
                }
            }));
        }
    }

    /// Cancels every consumer and waits for in-flight deliveries to drain.
    /// Calling `stop` while stopped is a no-op.
    pub async fn stop(&self) {
        let consumers = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.cancel.cancel();
            std::mem::take(&mut state.consumers)
        };

        for consumer in consumers {
            if let Err(err) = consumer.await {
                error!(error = %err, "consumer task panicked");
            }
        }
        info!("transport manager stopped");
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransportManager")
            .field("transports", &state.transports.len())
            .field("running", &state.running)
            .field("consumers", &state.consumers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Consumer callback
// ---------------------------------------------------------------------------

fn consume_callback(
    transport: String,
    buses: Arc<BusDirectory>,
    events: Arc<dyn EventDispatcher>,
) -> ReceiveCallback {
    Arc::new(move |ctx: DispatchContext, envelope: Envelope| {
        let transport = transport.clone();
        let buses = Arc::clone(&buses);
        let events = Arc::clone(&events);
        async move { consume(ctx, envelope, &transport, &buses, events.as_ref()).await }.boxed()
    })
}

async fn consume(
    ctx: DispatchContext,
    envelope: Envelope,
    transport: &str,
    buses: &BusDirectory,
    events: &dyn EventDispatcher,
) -> ConsumeResult {
    let already_stamped = envelope
        .last::<ReceivedStamp>()
        .is_some_and(|s| s.transport == transport);
    let envelope = if already_stamped {
        envelope
    } else {
        envelope.with_stamp(ReceivedStamp::new(transport))
    };

    emit(
        &ctx,
        events,
        BusEvent::MessageReceived {
            envelope: envelope.clone(),
            transport: transport.to_string(),
        },
    )
    .await;

    let bus = buses.bus_for(&envelope);
    match bus.dispatch_envelope(&ctx, envelope.clone()).await {
        Ok(handled) => {
            emit(
                &ctx,
                events,
                BusEvent::MessageHandled {
                    envelope: handled,
                    transport: transport.to_string(),
                },
            )
            .await;
            Ok(())
        }
        Err(err) => {
            let err = Arc::new(err);
            emit(
                &ctx,
                events,
                BusEvent::MessageFailed {
                    envelope: envelope.clone(),
                    transport: transport.to_string(),
                    error: Arc::clone(&err),
                },
            )
            .await;
            emit(
                &ctx,
                events,
                BusEvent::SendFailedForRetry {
                    envelope,
                    transport: transport.to_string(),
                    error: Arc::clone(&err),
                },
            )
            .await;
            Err(err)
        }
    }
}

async fn emit(ctx: &DispatchContext, events: &dyn EventDispatcher, event: BusEvent) {
    if let Err(err) = events.dispatch(ctx, &event).await {
        warn!(event = %event.kind(), error = %err, "event dispatch failed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use courier_core::{HandledStamp, Message};

    use super::*;
    use crate::bus::middleware::{AddBusNameLayer, HandleMessageLayer};
    use crate::bus::{MessageBus, Middleware};
    use crate::event::{EventKind, EventListener, LocalEventDispatcher};
    use crate::handler::{Handler, HandlerRegistry};
    use crate::transport::in_memory::{InMemoryOptions, InMemoryTransport};

    #[derive(Debug)]
    struct PlaceOrder {
        fail: bool,
    }

    impl Message for PlaceOrder {}

    struct OrderHandler;

    #[async_trait]
    impl Handler<PlaceOrder> for OrderHandler {
        type Output = ();

        async fn handle(&self, _ctx: &DispatchContext, message: &PlaceOrder) -> anyhow::Result<()> {
            if message.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    struct KindRecorder(Arc<Mutex<Vec<(EventKind, usize)>>>);

    #[async_trait]
    impl EventListener for KindRecorder {
        async fn on_event(&self, _ctx: &DispatchContext, event: &BusEvent) -> anyhow::Result<()> {
            let received = event.envelope().all::<ReceivedStamp>().len();
            self.0.lock().push((event.kind(), received));
            Ok(())
        }
    }

    fn directory() -> Arc<BusDirectory> {
        let mut handlers = HandlerRegistry::new();
        handlers.register::<PlaceOrder, _>(OrderHandler);
        let layers: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(AddBusNameLayer::new("default")),
            Arc::new(HandleMessageLayer::new(Arc::new(handlers), "default", true)),
        ];
        let mut buses = HashMap::new();
        buses.insert(
            "default".to_string(),
            Arc::new(MessageBus::new("default", &layers)),
        );
        Arc::new(BusDirectory::new("default", buses, HashMap::new()).unwrap())
    }

    fn manager() -> (TransportManager, Arc<InMemoryTransport>, Arc<Mutex<Vec<(EventKind, usize)>>>) {
        let events = Arc::new(LocalEventDispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            events.add_listener(kind, Arc::new(KindRecorder(Arc::clone(&log))));
        }
        let manager = TransportManager::new(events);
        let transport = Arc::new(InMemoryTransport::new("async", InMemoryOptions::default()));
        manager.add_transport(Arc::clone(&transport) as Arc<dyn Transport>);
        (manager, transport, log)
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn lookups_by_name() {
        let (manager, _transport, _log) = manager();
        assert!(manager.has_transport("async"));
        assert!(!manager.has_transport("sync"));
        assert!(manager.transport("async").is_some());
        assert_eq!(manager.locator().names(), ["async"]);
    }

    #[tokio::test]
    async fn consumed_messages_raise_received_then_handled() {
        let (manager, transport, log) = manager();
        let ctx = DispatchContext::new();
        transport
            .send(&ctx, &Envelope::new(PlaceOrder { fail: false }))
            .await
            .unwrap();

        manager.start(&ctx, &["async".to_string()], directory());
        assert!(manager.is_running());
        wait_for(|| log.lock().len() == 2).await;
        manager.stop().await;

        assert_eq!(
            *log.lock(),
            [(EventKind::MessageReceived, 1), (EventKind::MessageHandled, 1)]
        );
        assert_eq!(transport.acked(), 1);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn failures_raise_failed_then_retry_and_nack() {
        let (manager, transport, log) = manager();
        let ctx = DispatchContext::new();
        transport
            .send(&ctx, &Envelope::new(PlaceOrder { fail: true }))
            .await
            .unwrap();

        manager.start(&ctx, &["async".to_string()], directory());
        wait_for(|| log.lock().len() == 3).await;
        manager.stop().await;

        let kinds: Vec<EventKind> = log.lock().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            [
                EventKind::MessageReceived,
                EventKind::MessageFailed,
                EventKind::SendFailedForRetry
            ]
        );
        assert_eq!(transport.nacked(), 1);
    }

    #[tokio::test]
    async fn received_stamp_is_not_duplicated() {
        let (manager, transport, log) = manager();
        let ctx = DispatchContext::new();
        transport
            .send(
                &ctx,
                &Envelope::new(PlaceOrder { fail: false }).with_stamp(ReceivedStamp::new("async")),
            )
            .await
            .unwrap();

        manager.start(&ctx, &["async".to_string()], directory());
        wait_for(|| log.lock().len() == 2).await;
        manager.stop().await;

        assert!(log.lock().iter().all(|(_, received)| *received == 1));
    }

    #[tokio::test]
    async fn handled_envelope_carries_handled_stamp() {
        struct Capture(Arc<Mutex<Option<Envelope>>>);

        #[async_trait]
        impl EventListener for Capture {
            async fn on_event(&self, _ctx: &DispatchContext, event: &BusEvent) -> anyhow::Result<()> {
                *self.0.lock() = Some(event.envelope().clone());
                Ok(())
            }
        }

        let events = Arc::new(LocalEventDispatcher::new());
        let captured = Arc::new(Mutex::new(None));
        events.add_listener(EventKind::MessageHandled, Arc::new(Capture(Arc::clone(&captured))));
        let manager = TransportManager::new(events);
        let transport = Arc::new(InMemoryTransport::new("async", InMemoryOptions::default()));
        manager.add_transport(Arc::clone(&transport) as Arc<dyn Transport>);

        let ctx = DispatchContext::new();
        transport
            .send(&ctx, &Envelope::new(PlaceOrder { fail: false }))
            .await
            .unwrap();
        manager.start(&ctx, &["async".to_string()], directory());
        wait_for(|| captured.lock().is_some()).await;
        manager.stop().await;

        let envelope = captured.lock().clone().unwrap();
        assert!(envelope.has::<HandledStamp>());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (manager, _transport, _log) = manager();
        let ctx = DispatchContext::new();
        let names = ["async".to_string(), "missing".to_string()];

        manager.start(&ctx, &names, directory());
        manager.start(&ctx, &names, directory());
        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());

        manager.start(&ctx, &names, directory());
        assert!(manager.is_running());
        manager.stop().await;
    }
}
