//! Message-type to transport routing table.

use std::any::TypeId;
use std::collections::{BTreeSet, HashMap};

use courier_core::{Envelope, Message, MessageType};

/// Maps message types to the transports that should receive them.
///
/// Lookups are by exact type; unrouted messages are handled synchronously.
#[derive(Debug, Default, Clone)]
pub struct Router {
    routes: HashMap<TypeId, Vec<String>>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `message_type` to `transports`, replacing any existing route.
    pub fn add_route<I, S>(&mut self, message_type: MessageType, transports: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let transports: Vec<String> = transports.into_iter().map(Into::into).collect();
        tracing::debug!(
            message_type = message_type.name,
            transports = ?transports,
            "route added"
        );
        self.routes.insert(message_type.id, transports);
    }

    pub fn route<M, I, S>(&mut self, transports: I)
    where
        M: Message,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_route(MessageType::of::<M>(), transports);
    }

    /// Transports configured for the envelope's message type, if any.
    #[must_use]
    pub fn transports_for(&self, envelope: &Envelope) -> &[String] {
        self.transports_for_type(envelope.message_type_id())
    }

    #[must_use]
    pub fn transports_for_type(&self, type_id: TypeId) -> &[String] {
        self.routes.get(&type_id).map_or(&[], Vec::as_slice)
    }

    /// Every transport named by some route, sorted and deduplicated.
    #[must_use]
    pub fn used_transports(&self) -> Vec<String> {
        self.routes
            .values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
