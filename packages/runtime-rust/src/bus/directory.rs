//! Named bus lookup, including the message-type to owning-bus mapping used
//! on the consuming side.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use courier_core::Envelope;

use super::MessageBus;

/// All buses of a runtime, keyed by name.
#[derive(Debug)]
pub struct BusDirectory {
    buses: HashMap<String, Arc<MessageBus>>,
    default_bus: Arc<MessageBus>,
    message_buses: HashMap<TypeId, String>,
}

impl BusDirectory {
    /// Returns `None` if `default_bus` is not among `buses`.
    #[must_use]
    pub fn new(
        default_bus: &str,
        buses: HashMap<String, Arc<MessageBus>>,
        message_buses: HashMap<TypeId, String>,
    ) -> Option<Self> {
        let default = Arc::clone(buses.get(default_bus)?);
        Some(Self {
            buses,
            default_bus: default,
            message_buses,
        })
    }

    #[must_use]
    pub fn bus(&self, name: &str) -> Option<&Arc<MessageBus>> {
        self.buses.get(name)
    }

    #[must_use]
    pub fn default_bus(&self) -> &Arc<MessageBus> {
        &self.default_bus
    }

    /// The bus that owns the envelope's message type.
    ///
    /// Types whose handlers are bound to a bus map to that bus; everything
    /// else, and any mapping to a bus that does not exist, falls back to the
    /// default bus.
    #[must_use]
    pub fn bus_for(&self, envelope: &Envelope) -> &Arc<MessageBus> {
        self.message_buses
            .get(&envelope.message_type_id())
            .and_then(|name| self.buses.get(name))
            .unwrap_or(&self.default_bus)
    }

    /// Bus names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.buses.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
