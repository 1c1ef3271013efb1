//! In-process transport backed by a bounded tokio channel.
//!
//! Useful for tests and single-process deployments: `send` enqueues, and
//! `receive` fans the queue out to a fixed pool of worker tasks. With
//! serialization enabled every envelope is marshalled on send and
//! unmarshalled on receive, so in-process stamps are dropped exactly as they
//! would be on a real broker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use courier_core::{DispatchContext, Envelope, Headers, Serializer};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ReceiveCallback, Transport, TransportFactory};
use crate::config::TransportConfig;

/// DSN scheme handled by [`InMemoryTransportFactory`].
pub const IN_MEMORY_SCHEME: &str = "in-memory://";

const DEFAULT_POOL_SIZE: usize = 1;
const DEFAULT_CAPACITY: usize = 256;
const DEFAULT_HISTORY: usize = 64;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Tuning for an [`InMemoryTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InMemoryOptions {
    /// Number of concurrent consumer workers.
    pub pool_size: usize,
    /// Queue capacity; `send` waits when the queue is full.
    pub capacity: usize,
    /// Most recent published envelopes kept for [`InMemoryTransport::sent`];
    /// `0` keeps none.
    pub history: usize,
}

impl Default for InMemoryOptions {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            capacity: DEFAULT_CAPACITY,
            history: DEFAULT_HISTORY,
        }
    }
}

enum Queued {
    Envelope(Envelope),
    Encoded { body: Vec<u8>, headers: Headers },
}

// ---------------------------------------------------------------------------
// InMemoryTransport
// ---------------------------------------------------------------------------

struct Inner {
    name: String,
    serializer: Option<Arc<dyn Serializer>>,
    sent: Mutex<VecDeque<Envelope>>,
    acked: AtomicU64,
    nacked: AtomicU64,
}

impl Inner {
    fn record(&self, envelope: &Envelope, history: usize) {
        if history == 0 {
            return;
        }
        let mut sent = self.sent.lock();
        if sent.len() == history {
            sent.pop_front();
        }
        sent.push_back(envelope.clone());
    }

    async fn process(&self, ctx: &DispatchContext, callback: &ReceiveCallback, item: Queued) {
        let envelope = match item {
            Queued::Envelope(envelope) => envelope,
            Queued::Encoded { body, headers } => {
                let decoded: anyhow::Result<Envelope> = match &self.serializer {
                    Some(serializer) => serializer.unmarshal(&body, &headers).map_err(Into::into),
                    None => Err(anyhow::anyhow!("no serializer configured")),
                };
                match decoded {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(transport = %self.name, error = %err, "dropping undecodable payload");
                        self.nacked.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        };

        match callback(ctx.clone(), envelope).await {
            Ok(()) => {
                self.acked.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                debug!(transport = %self.name, error = %err, "delivery rejected");
                self.nacked.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Bounded in-process queue with a worker pool on the consuming side.
pub struct InMemoryTransport {
    inner: Arc<Inner>,
    options: InMemoryOptions,
    queue_tx: mpsc::Sender<Queued>,
    queue_rx: Mutex<Option<mpsc::Receiver<Queued>>>,
}

impl InMemoryTransport {
    /// A transport that passes envelopes through without serialization.
    #[must_use]
    pub fn new(name: impl Into<String>, options: InMemoryOptions) -> Self {
        Self::build(name.into(), options, None)
    }

    /// A transport that marshals every envelope through `serializer`.
    #[must_use]
    pub fn with_serializer(
        name: impl Into<String>,
        options: InMemoryOptions,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self::build(name.into(), options, Some(serializer))
    }

    fn build(name: String, options: InMemoryOptions, serializer: Option<Arc<dyn Serializer>>) -> Self {
        let options = InMemoryOptions {
            pool_size: options.pool_size.max(1),
            capacity: options.capacity.max(1),
            history: options.history,
        };
        let (queue_tx, queue_rx) = mpsc::channel(options.capacity);
        Self {
            inner: Arc::new(Inner {
                name,
                serializer,
                sent: Mutex::new(VecDeque::with_capacity(options.history)),
                acked: AtomicU64::new(0),
                nacked: AtomicU64::new(0),
            }),
            options,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    #[must_use]
    pub fn options(&self) -> InMemoryOptions {
        self.options
    }

    /// The last `history` envelopes successfully published, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<Envelope> {
        self.inner.sent.lock().iter().cloned().collect()
    }

    /// Deliveries the callback accepted.
    #[must_use]
    pub fn acked(&self) -> u64 {
        self.inner.acked.load(Ordering::Relaxed)
    }

    /// Deliveries the callback rejected or that could not be decoded.
    #[must_use]
    pub fn nacked(&self) -> u64 {
        self.inner.nacked.load(Ordering::Relaxed)
    }

    /// Envelopes waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn send(&self, ctx: &DispatchContext, envelope: &Envelope) -> anyhow::Result<()> {
        let item = match &self.inner.serializer {
            Some(serializer) => {
                let (body, headers) = serializer
                    .marshal(envelope)
                    .with_context(|| format!("transport {}: marshal failed", self.inner.name))?;
                Queued::Encoded { body, headers }
            }
            None => Queued::Envelope(envelope.clone()),
        };
        tokio::select! {
            biased;
            sent = self.queue_tx.send(item) => {
                if sent.is_err() {
                    bail!("transport {}: queue closed", self.inner.name);
                }
            }
            () = ctx.cancel.cancelled() => bail!("transport {}: send cancelled", self.inner.name),
        }
        self.inner.record(envelope, self.options.history);
        Ok(())
    }

    async fn receive(&self, ctx: DispatchContext, callback: ReceiveCallback) -> anyhow::Result<()> {
        let Some(mut upstream) = self.queue_rx.lock().take() else {
            bail!("transport {} is already being consumed", self.inner.name);
        };

        let (job_tx, job_rx) = mpsc::channel::<Queued>(self.options.pool_size);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        let mut workers = Vec::with_capacity(self.options.pool_size);
        for worker in 0..self.options.pool_size {
            let inner = Arc::clone(&self.inner);
            let job_rx = Arc::clone(&job_rx);
            let callback = Arc::clone(&callback);
            let ctx = ctx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = job_rx.lock().await.recv().await;
                    let Some(job) = job else { break };
                    inner.process(&ctx, &callback, job).await;
                }
                debug!(transport = %inner.name, worker, "worker stopped");
            }));
        }
        info!(
            transport = %self.inner.name,
            pool_size = self.options.pool_size,
            "consuming"
        );

        loop {
            tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => break,
                item = upstream.recv() => match item {
                    Some(item) => {
                        if job_tx.send(item).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        // Closing the job channel lets workers finish in-flight deliveries.
        drop(job_tx);
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(transport = %self.inner.name, error = %err, "worker panicked");
            }
        }

        // Undelivered envelopes stay queued for the next consumer.
        *self.queue_rx.lock() = Some(upstream);
        info!(transport = %self.inner.name, "consumer stopped");
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("name", &self.inner.name)
            .field("options", &self.options)
            .field("serialize", &self.inner.serializer.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// InMemoryTransportFactory
// ---------------------------------------------------------------------------

/// Builds [`InMemoryTransport`]s for `in-memory://` DSNs.
///
/// Recognised options: `pool_size` (default 1), `capacity` (default 256),
/// `history` (default 64), and `serialize` (default `false`).
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryTransportFactory;

impl TransportFactory for InMemoryTransportFactory {
    fn supports(&self, dsn: &str) -> bool {
        dsn.starts_with(IN_MEMORY_SCHEME)
    }

    fn create(
        &self,
        name: &str,
        config: &TransportConfig,
        serializer: Arc<dyn Serializer>,
    ) -> anyhow::Result<Arc<dyn Transport>> {
        let options = InMemoryOptions {
            pool_size: usize_option(config, "pool_size")?.unwrap_or(DEFAULT_POOL_SIZE),
            capacity: usize_option(config, "capacity")?.unwrap_or(DEFAULT_CAPACITY),
            history: match config.options.get("history") {
                None => DEFAULT_HISTORY,
                Some(value) => value
                    .as_u64()
                    .and_then(|n| usize::try_from(n).ok())
                    .with_context(|| {
                        format!("options.history must be a non-negative integer, got {value}")
                    })?,
            },
        };
        let serialize = match config.options.get("serialize") {
            None => false,
            Some(value) => value
                .as_bool()
                .with_context(|| format!("options.serialize must be a boolean, got {value}"))?,
        };

        let transport = if serialize {
            InMemoryTransport::with_serializer(name, options, serializer)
        } else {
            InMemoryTransport::new(name, options)
        };
        Ok(Arc::new(transport))
    }
}

fn usize_option(config: &TransportConfig, key: &str) -> anyhow::Result<Option<usize>> {
    let Some(value) = config.options.get(key) else {
        return Ok(None);
    };
    let parsed = value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .filter(|n| *n > 0)
        .with_context(|| format!("options.{key} must be a positive integer, got {value}"))?;
    Ok(Some(parsed))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use courier_core::{JsonSerializer, Message, ReceivedStamp, TypeResolver};
    use futures_util::FutureExt;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::error::BusError;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl Message for Ping {}

    fn collecting(seen: Arc<Mutex<Vec<Envelope>>>) -> ReceiveCallback {
        Arc::new(move |_ctx: DispatchContext, envelope: Envelope| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(envelope);
                Ok::<(), Arc<BusError>>(())
            }
            .boxed()
        })
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

    fn config(options: serde_json::Value) -> TransportConfig {
        TransportConfig {
            dsn: "in-memory://".to_string(),
            options: serde_json::from_value::<BTreeMap<String, serde_json::Value>>(options).unwrap(),
            retry: None,
        }
    }

    #[tokio::test]
    async fn delivers_sent_envelopes_to_callback() {
        let transport = Arc::new(InMemoryTransport::new("mem", InMemoryOptions::default()));
        let ctx = DispatchContext::new();
        for seq in 0..3 {
            transport.send(&ctx, &Envelope::new(Ping { seq })).await.unwrap();
        }
        assert_eq!(transport.queued(), 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = {
            let transport = Arc::clone(&transport);
            let ctx = ctx.clone();
            let callback = collecting(Arc::clone(&seen));
            tokio::spawn(async move { transport.receive(ctx, callback).await })
        };

        wait_for(|| seen.lock().len() == 3).await;
        ctx.cancel.cancel();
        consumer.await.unwrap().unwrap();

        let order: Vec<u32> = seen
            .lock()
            .iter()
            .map(|e| e.message_as::<Ping>().unwrap().seq)
            .collect();
        assert_eq!(order, [0, 1, 2]);
        assert_eq!(transport.acked(), 3);
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn history_keeps_only_the_newest_envelopes() {
        let options = InMemoryOptions {
            history: 2,
            ..InMemoryOptions::default()
        };
        let transport = Arc::new(InMemoryTransport::new("mem", options));
        let ctx = DispatchContext::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = {
            let transport = Arc::clone(&transport);
            let ctx = ctx.clone();
            let callback = collecting(Arc::clone(&seen));
            tokio::spawn(async move { transport.receive(ctx, callback).await })
        };

        for seq in 0..50 {
            transport.send(&ctx, &Envelope::new(Ping { seq })).await.unwrap();
        }
        wait_for(|| transport.acked() == 50).await;
        ctx.cancel.cancel();
        consumer.await.unwrap().unwrap();

        let kept: Vec<u32> = transport
            .sent()
            .iter()
            .map(|e| e.message_as::<Ping>().unwrap().seq)
            .collect();
        assert_eq!(kept, [48, 49]);

        let silent = InMemoryTransport::new(
            "quiet",
            InMemoryOptions {
                history: 0,
                ..InMemoryOptions::default()
            },
        );
        silent
            .send(&DispatchContext::new(), &Envelope::new(Ping { seq: 1 }))
            .await
            .unwrap();
        assert!(silent.sent().is_empty());
        assert_eq!(silent.queued(), 1);
    }

    #[tokio::test]
    async fn failed_sends_are_not_recorded() {
        let options = InMemoryOptions {
            capacity: 1,
            ..InMemoryOptions::default()
        };
        let transport = InMemoryTransport::new("mem", options);
        let ctx = DispatchContext::new();
        transport.send(&ctx, &Envelope::new(Ping { seq: 1 })).await.unwrap();

        let cancelled = DispatchContext::new();
        cancelled.cancel.cancel();
        let err = transport
            .send(&cancelled, &Envelope::new(Ping { seq: 2 }))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("cancelled"));
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.queued(), 1);
    }

    #[tokio::test]
    async fn rejected_deliveries_are_counted() {
        let transport = Arc::new(InMemoryTransport::new("mem", InMemoryOptions::default()));
        let ctx = DispatchContext::new();
        transport.send(&ctx, &Envelope::new(Ping { seq: 1 })).await.unwrap();

        let callback: ReceiveCallback = Arc::new(|_ctx: DispatchContext, _envelope: Envelope| {
            async {
                Err::<(), _>(Arc::new(BusError::NoHandlers {
                    message_type: "Ping",
                }))
            }
            .boxed()
        });
        let consumer = {
            let transport = Arc::clone(&transport);
            let ctx = ctx.clone();
            tokio::spawn(async move { transport.receive(ctx, callback).await })
        };

        wait_for(|| transport.nacked() == 1).await;
        ctx.cancel.cancel();
        consumer.await.unwrap().unwrap();
        assert_eq!(transport.acked(), 0);
    }

    #[tokio::test]
    async fn serialization_drops_in_process_stamps() {
        let mut resolver = TypeResolver::new();
        resolver.register_message::<Ping>("ping").unwrap();
        let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer::new(Arc::new(resolver)));
        let transport = Arc::new(InMemoryTransport::with_serializer(
            "mem",
            InMemoryOptions::default(),
            serializer,
        ));
        let ctx = DispatchContext::new();
        transport
            .send(&ctx, &Envelope::new(Ping { seq: 7 }).with_stamp(ReceivedStamp::new("other")))
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = {
            let transport = Arc::clone(&transport);
            let ctx = ctx.clone();
            let callback = collecting(Arc::clone(&seen));
            tokio::spawn(async move { transport.receive(ctx, callback).await })
        };
        wait_for(|| seen.lock().len() == 1).await;
        ctx.cancel.cancel();
        consumer.await.unwrap().unwrap();

        let received = seen.lock()[0].clone();
        assert_eq!(received.message_as::<Ping>().map(|p| p.seq), Some(7));
        assert!(!received.has::<ReceivedStamp>());
    }

    #[tokio::test]
    async fn second_concurrent_consumer_is_rejected() {
        let transport = Arc::new(InMemoryTransport::new("mem", InMemoryOptions::default()));
        let ctx = DispatchContext::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let transport = Arc::clone(&transport);
            let ctx = ctx.clone();
            let callback = collecting(Arc::clone(&seen));
            tokio::spawn(async move { transport.receive(ctx, callback).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = transport
            .receive(ctx.clone(), collecting(Arc::clone(&seen)))
            .await;
        assert!(second.is_err());

        ctx.cancel.cancel();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn queue_survives_consumer_restart() {
        let transport = Arc::new(InMemoryTransport::new("mem", InMemoryOptions::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let stopped = DispatchContext::new();
        stopped.cancel.cancel();
        transport
            .receive(stopped, collecting(Arc::clone(&seen)))
            .await
            .unwrap();

        let ctx = DispatchContext::new();
        transport.send(&ctx, &Envelope::new(Ping { seq: 1 })).await.unwrap();
        let consumer = {
            let transport = Arc::clone(&transport);
            let ctx = ctx.clone();
            let callback = collecting(Arc::clone(&seen));
            tokio::spawn(async move { transport.receive(ctx, callback).await })
        };
        wait_for(|| seen.lock().len() == 1).await;
        ctx.cancel.cancel();
        consumer.await.unwrap().unwrap();
    }

    #[test]
    fn factory_parses_options() {
        let resolver = Arc::new(TypeResolver::new());
        let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer::new(resolver));
        let factory = InMemoryTransportFactory;

        assert!(factory.supports("in-memory://"));
        assert!(!factory.supports("amqp://localhost"));

        let transport = factory
            .create(
                "mem",
                &config(serde_json::json!({"pool_size": 4, "serialize": true})),
                Arc::clone(&serializer),
            )
            .unwrap();
        assert_eq!(transport.name(), "mem");

        let err = factory
            .create("mem", &config(serde_json::json!({"pool_size": 0})), Arc::clone(&serializer))
            .err()
            .unwrap();
        assert!(err.to_string().contains("pool_size"));

        let err = factory
            .create("mem", &config(serde_json::json!({"serialize": "yes"})), Arc::clone(&serializer))
            .err()
            .unwrap();
        assert!(err.to_string().contains("serialize"));

        let err = factory
            .create("mem", &config(serde_json::json!({"history": -1})), Arc::clone(&serializer))
            .err()
            .unwrap();
        assert!(err.to_string().contains("history"));
        assert!(factory
            .create("mem", &config(serde_json::json!({"history": 0})), serializer)
            .is_ok());
    }
}
