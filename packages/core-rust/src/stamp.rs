//! Envelope metadata: the `Stamp` trait and the canonical stamp kinds.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::message::AsAny;

/// A piece of metadata attached to an [`Envelope`](crate::Envelope).
///
/// The set is open: any `'static` type can become a stamp by implementing this
/// marker trait. Only stamps registered with a
/// [`TypeResolver`](crate::TypeResolver) survive serialization.
pub trait Stamp: AsAny + fmt::Debug {}

/// Downcasts a stamp trait object to its concrete kind.
pub(crate) fn downcast_stamp<T: Stamp>(stamp: &Arc<dyn Stamp>) -> Option<&T> {
    let stamp: &dyn Stamp = stamp.as_ref();
    stamp.as_any().downcast_ref::<T>()
}

/// Name of the bus the message was first dispatched on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusNameStamp {
    pub bus_name: String,
}

impl BusNameStamp {
    #[must_use]
    pub fn new(bus_name: impl Into<String>) -> Self {
        Self {
            bus_name: bus_name.into(),
        }
    }
}

impl Stamp for BusNameStamp {}

/// Unique message identifier, usable by transports as an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIdStamp {
    pub id: String,
}

impl MessageIdStamp {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Stamps a freshly generated UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

impl Stamp for MessageIdStamp {}

/// Records that the message was handed to a transport during this dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentStamp {
    pub transport: String,
}

impl SentStamp {
    #[must_use]
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
        }
    }
}

impl Stamp for SentStamp {}

/// Marks an envelope as consumed from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedStamp {
    pub transport: String,
}

impl ReceivedStamp {
    #[must_use]
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
        }
    }
}

impl Stamp for ReceivedStamp {}

/// Outcome of one successful handler invocation.
#[derive(Clone)]
pub struct HandledStamp {
    /// Human-readable handler identity.
    pub handler: String,
    result: Option<Arc<dyn Any + Send + Sync>>,
}

impl HandledStamp {
    /// Creates a stamp carrying the handler's result value, if it produced one.
    #[must_use]
    pub fn new(handler: impl Into<String>, result: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            handler: handler.into(),
            result,
        }
    }

    /// Returns the handler result if it has type `T`.
    #[must_use]
    pub fn result<T: Any>(&self) -> Option<&T> {
        self.result.as_deref().and_then(|r| r.downcast_ref::<T>())
    }

    /// Returns `true` if the handler produced a result value.
    #[must_use]
    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }
}

impl fmt::Debug for HandledStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandledStamp")
            .field("handler", &self.handler)
            .field("has_result", &self.result.is_some())
            .finish()
    }
}

impl Stamp for HandledStamp {}

/// Number of times the message has been re-published after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeliveryStamp {
    pub retry_count: u32,
}

impl RedeliveryStamp {
    #[must_use]
    pub fn new(retry_count: u32) -> Self {
        Self { retry_count }
    }
}

impl Stamp for RedeliveryStamp {}

/// Details of the failure that triggered a retry or dead-letter decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetailsStamp {
    /// Rendered error chain of the failure.
    pub message: String,
    /// Wall-clock milliseconds since Unix epoch when the failure was recorded.
    pub occurred_at_ms: u64,
    /// Attempt number the failure belongs to.
    pub retry_count: u32,
}

impl Stamp for ErrorDetailsStamp {}

/// Explicit transport selection that overrides the route table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportNameStamp {
    pub transports: Vec<String>,
}

impl TransportNameStamp {
    #[must_use]
    pub fn new<I, S>(transports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transports: transports.into_iter().map(Into::into).collect(),
        }
    }
}

impl Stamp for TransportNameStamp {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_message_ids_are_unique() {
        let a = MessageIdStamp::generate();
        let b = MessageIdStamp::generate();
        assert_ne!(a, b);
        assert_eq!(a.id.len(), 36);
    }

    #[test]
    fn handled_stamp_result_downcasts_by_type() {
        let stamp = HandledStamp::new("handler", Some(Arc::new(42_u32)));
        assert!(stamp.has_result());
        assert_eq!(stamp.result::<u32>(), Some(&42));
        assert!(stamp.result::<String>().is_none());

        let empty = HandledStamp::new("handler", None);
        assert!(!empty.has_result());
        assert!(empty.result::<u32>().is_none());
    }

    #[test]
    fn downcast_matches_exact_kind_only() {
        let stamp: Arc<dyn Stamp> = Arc::new(SentStamp::new("amqp"));
        assert!(downcast_stamp::<SentStamp>(&stamp).is_some());
        assert!(downcast_stamp::<ReceivedStamp>(&stamp).is_none());
    }

    #[test]
    fn error_details_serialize_camel_case() {
        let stamp = ErrorDetailsStamp {
            message: "boom".to_string(),
            occurred_at_ms: 7,
            retry_count: 1,
        };
        let json = serde_json::to_value(&stamp).unwrap();
        assert_eq!(json["occurredAtMs"], 7);
        assert_eq!(json["retryCount"], 1);
    }
}
