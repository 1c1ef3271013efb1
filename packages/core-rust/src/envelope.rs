//! Immutable message carrier.

use std::any::TypeId;
use std::sync::Arc;

use crate::message::{Message, MessageType};
use crate::stamp::{downcast_stamp, Stamp};

/// Wraps one application message together with its ordered stamps.
///
/// Envelopes are values: every "mutation" returns a new envelope and leaves the
/// original untouched. The message itself is shared by `Arc` across all derived
/// envelopes, so `Arc::ptr_eq` on [`Envelope::message_arc`] holds for the whole
/// pipeline.
#[derive(Debug, Clone)]
pub struct Envelope {
    message: Arc<dyn Message>,
    stamps: Vec<Arc<dyn Stamp>>,
}

impl Envelope {
    /// Wraps a message with no stamps.
    #[must_use]
    pub fn new<M: Message>(message: M) -> Self {
        Self::from_arc(Arc::new(message))
    }

    /// Wraps an already shared message.
    #[must_use]
    pub fn from_arc(message: Arc<dyn Message>) -> Self {
        Self {
            message,
            stamps: Vec::new(),
        }
    }

    /// Returns a copy of this envelope with `stamp` appended.
    #[must_use]
    pub fn with_stamp<S: Stamp>(&self, stamp: S) -> Self {
        self.with_stamp_arc(Arc::new(stamp))
    }

    /// Returns a copy of this envelope with a shared stamp appended.
    #[must_use]
    pub fn with_stamp_arc(&self, stamp: Arc<dyn Stamp>) -> Self {
        let mut stamps = Vec::with_capacity(self.stamps.len() + 1);
        stamps.extend(self.stamps.iter().cloned());
        stamps.push(stamp);
        Self {
            message: Arc::clone(&self.message),
            stamps,
        }
    }

    /// Returns a copy with every stamp from `stamps` appended in iteration order.
    #[must_use]
    pub fn with_stamps<I>(&self, stamps: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Stamp>>,
    {
        let mut next = self.clone();
        next.stamps.extend(stamps);
        next
    }

    /// Returns a copy with every stamp of kind `T` removed.
    #[must_use]
    pub fn without<T: Stamp>(&self) -> Self {
        let target = TypeId::of::<T>();
        Self {
            message: Arc::clone(&self.message),
            stamps: self
                .stamps
                .iter()
                .filter(|s| {
                    let s: &dyn Stamp = s.as_ref();
                    s.as_any().type_id() != target
                })
                .cloned()
                .collect(),
        }
    }

    /// All stamps in insertion order.
    #[must_use]
    pub fn stamps(&self) -> &[Arc<dyn Stamp>] {
        &self.stamps
    }

    /// All stamps of kind `T`, in insertion order.
    #[must_use]
    pub fn all<T: Stamp>(&self) -> Vec<&T> {
        self.stamps.iter().filter_map(downcast_stamp::<T>).collect()
    }

    /// The earliest stamp of kind `T`.
    #[must_use]
    pub fn first<T: Stamp>(&self) -> Option<&T> {
        self.stamps.iter().find_map(downcast_stamp::<T>)
    }

    /// The most recent stamp of kind `T`.
    #[must_use]
    pub fn last<T: Stamp>(&self) -> Option<&T> {
        self.stamps.iter().rev().find_map(downcast_stamp::<T>)
    }

    /// Returns `true` if at least one stamp of kind `T` is present.
    #[must_use]
    pub fn has<T: Stamp>(&self) -> bool {
        self.first::<T>().is_some()
    }

    /// The wrapped message.
    #[must_use]
    pub fn message(&self) -> &dyn Message {
        self.message.as_ref()
    }

    /// The wrapped message, shared.
    #[must_use]
    pub fn message_arc(&self) -> &Arc<dyn Message> {
        &self.message
    }

    /// The wrapped message if it has concrete type `M`.
    #[must_use]
    pub fn message_as<M: Message>(&self) -> Option<&M> {
        self.message().as_any().downcast_ref::<M>()
    }

    /// Runtime identity of the wrapped message's concrete type.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        MessageType::of_val(self.message())
    }

    /// `TypeId` of the wrapped message's concrete type.
    #[must_use]
    pub fn message_type_id(&self) -> TypeId {
        self.message().as_any().type_id()
    }
}
