//! Schedules redeliveries and dead-letters exhausted messages.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{
    ClockSource, DispatchContext, Envelope, ErrorDetailsStamp, HandledStamp, ReceivedStamp,
    RedeliveryStamp, SentStamp,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::strategy::RetryStrategy;
use crate::error::BusError;
use crate::event::{BusEvent, EventListener};
use crate::transport::TransportLocator;

/// Reacts to [`BusEvent::SendFailedForRetry`].
///
/// For an envelope received from the failing transport it records an
/// [`ErrorDetailsStamp`], asks the transport's [`RetryStrategy`] whether to
/// try again, and either re-publishes the envelope after the returned delay
/// or hands it to the failure transport.
pub struct SendFailedMessageForRetryListener {
    transports: TransportLocator,
    strategies: HashMap<String, Arc<dyn RetryStrategy>>,
    default_strategy: Arc<dyn RetryStrategy>,
    failure_transport: Option<String>,
    clock: Arc<dyn ClockSource>,
}

impl SendFailedMessageForRetryListener {
    #[must_use]
    pub fn new(
        transports: TransportLocator,
        default_strategy: Arc<dyn RetryStrategy>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            transports,
            strategies: HashMap::new(),
            default_strategy,
            failure_transport: None,
            clock,
        }
    }

    /// Overrides the strategy for one transport.
    #[must_use]
    pub fn with_strategy(
        mut self,
        transport: impl Into<String>,
        strategy: Arc<dyn RetryStrategy>,
    ) -> Self {
        self.strategies.insert(transport.into(), strategy);
        self
    }

    #[must_use]
    pub fn with_failure_transport(mut self, transport: impl Into<String>) -> Self {
        self.failure_transport = Some(transport.into());
        self
    }

    fn strategy_for(&self, transport: &str) -> &Arc<dyn RetryStrategy> {
        self.strategies
            .get(transport)
            .unwrap_or(&self.default_strategy)
    }

    async fn on_failure(
        &self,
        ctx: &DispatchContext,
        envelope: &Envelope,
        transport: &str,
        failure: &BusError,
    ) {
        match envelope.last::<ReceivedStamp>() {
            Some(received) if received.transport == transport => {}
            _ => {
                debug!(transport, "failure not received from this transport; ignoring");
                return;
            }
        }

        let attempt = envelope
            .last::<RedeliveryStamp>()
            .map_or(0, |s| s.retry_count.saturating_add(1));
        let envelope = envelope.with_stamp(ErrorDetailsStamp {
            message: failure.to_string(),
            occurred_at_ms: self.clock.now(),
            retry_count: attempt,
        });
        let message_type = envelope.message_type().name;

        match self.strategy_for(transport).should_retry(attempt) {
            Some(delay) => self.schedule_retry(ctx, envelope, transport, attempt, delay),
            None => self.reject(ctx, envelope, transport, attempt, message_type).await,
        }
    }

    fn schedule_retry(
        &self,
        ctx: &DispatchContext,
        envelope: Envelope,
        transport: &str,
        attempt: u32,
        delay: std::time::Duration,
    ) {
        let Some(target) = self.transports.get(transport) else {
            error!(transport, "cannot retry on unknown transport");
            return;
        };
        let envelope = strip_delivery_stamps(&envelope).with_stamp(RedeliveryStamp::new(attempt));
        let transport = transport.to_string();
        // Redelivery outlives the consumer that failed, so it gets its own token.
        let retry_ctx = DispatchContext {
            cancel: CancellationToken::new(),
            trace_id: ctx.trace_id.clone(),
        };

        #[allow(clippy::cast_possible_truncation)]
        let delay_ms = delay.as_millis() as u64;
        info!(
            transport = %transport,
            message_type = envelope.message_type().name,
            attempt,
            delay_ms,
            "scheduling redelivery"
        );

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = target.retry(&retry_ctx, &envelope).await {
                error!(transport = %transport, attempt, error = %err, "redelivery failed");
            }
        });
    }

    async fn reject(
        &self,
        ctx: &DispatchContext,
        envelope: Envelope,
        transport: &str,
        attempt: u32,
        message_type: &'static str,
    ) {
        let Some(failure_name) = &self.failure_transport else {
            warn!(transport, message_type, attempt, "retries exhausted; message dropped");
            return;
        };
        let Some(failure) = self.transports.get(failure_name) else {
            error!(failure_transport = %failure_name, "failure transport is not registered");
            return;
        };

        let envelope = strip_delivery_stamps(&envelope);
        match failure.send(ctx, &envelope).await {
            Ok(()) => warn!(
                transport,
                failure_transport = %failure_name,
                message_type,
                attempt,
                "retries exhausted; message moved to failure transport"
            ),
            Err(err) => error!(
                failure_transport = %failure_name,
                message_type,
                error = %err,
                "failed to send to failure transport"
            ),
        }
    }
}

/// Drops stamps that describe a single delivery; they must not follow the
/// envelope into its next one.
fn strip_delivery_stamps(envelope: &Envelope) -> Envelope {
    envelope
        .without::<ReceivedStamp>()
        .without::<HandledStamp>()
        .without::<SentStamp>()
}

#[async_trait]
impl EventListener for SendFailedMessageForRetryListener {
    async fn on_event(&self, ctx: &DispatchContext, event: &BusEvent) -> anyhow::Result<()> {
        if let BusEvent::SendFailedForRetry {
            envelope,
            transport,
            error,
        } = event
        {
            self.on_failure(ctx, envelope, transport, error).await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SendFailedMessageForRetryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendFailedMessageForRetryListener")
            .field("default_strategy", &self.default_strategy)
            .field("strategies", &self.strategies)
            .field("failure_transport", &self.failure_transport)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
