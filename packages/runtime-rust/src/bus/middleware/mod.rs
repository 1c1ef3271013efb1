//! Built-in bus middlewares and the name-based registry used by configuration.
//!
//! Every bus ends with the implicit tail `AddBusName -> SendMessage ->
//! HandleMessage`; configured middlewares run before it, in declaration order.

pub mod bus_name;
pub mod handle;
pub mod message_id;
pub mod send;
pub mod trace;

use std::collections::HashMap;
use std::sync::Arc;

pub use bus_name::{AddBusNameLayer, AddBusNameService};
pub use handle::{HandleMessageLayer, HandleMessageService};
pub use message_id::{AddMessageIdLayer, AddMessageIdService};
pub use send::{SendMessageLayer, SendMessageService};
pub use trace::{TraceLayer, TraceService};

use super::Middleware;

/// Builds a middleware for the bus with the given name.
pub type MiddlewareFactory = Arc<dyn Fn(&str) -> Arc<dyn Middleware> + Send + Sync>;

// ---------------------------------------------------------------------------
// MiddlewareRegistry
// ---------------------------------------------------------------------------

/// Middlewares that bus configuration can reference by name.
///
/// Comes pre-populated with `add_message_id` and `tracing`.
pub struct MiddlewareRegistry {
    factories: HashMap<String, MiddlewareFactory>,
}

impl MiddlewareRegistry {
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("add_message_id", Arc::new(AddMessageIdLayer));
        registry.register_factory("tracing", |bus| {
            Arc::new(TraceLayer::new(bus)) as Arc<dyn Middleware>
        });
        registry
    }

    /// A registry with no entries.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers a middleware instance shared by every bus that names it.
    pub fn register(&mut self, name: impl Into<String>, middleware: Arc<dyn Middleware>) {
        self.factories
            .insert(name.into(), Arc::new(move |_bus: &str| Arc::clone(&middleware)));
    }

    /// Registers a factory invoked once per bus that names it.
    pub fn register_factory<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> Arc<dyn Middleware> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Instantiates the middleware registered as `name` for bus `bus`.
    #[must_use]
    pub fn create(&self, name: &str, bus: &str) -> Option<Arc<dyn Middleware>> {
        self.factories.get(name).map(|factory| factory(bus))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for MiddlewareRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MiddlewareRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{DispatchContext, Message, MessageIdStamp};

    use super::*;
    use crate::bus::MessageBus;

    #[derive(Debug)]
    struct Ping;

    impl Message for Ping {}

    #[test]
    fn builtins_are_registered() {
        let registry = MiddlewareRegistry::new();
        assert_eq!(registry.names(), ["add_message_id", "tracing"]);
        assert!(registry.create("tracing", "default").is_some());
        assert!(registry.create("audit", "default").is_none());
        assert!(MiddlewareRegistry::empty().names().is_empty());
    }

    #[tokio::test]
    async fn registered_middleware_is_usable_in_a_bus() {
        let registry = MiddlewareRegistry::new();
        let layers = vec![
            registry.create("tracing", "default").unwrap(),
            registry.create("add_message_id", "default").unwrap(),
        ];
        let bus = MessageBus::new("default", &layers);

        let out = bus.dispatch(&DispatchContext::new(), Ping).await.unwrap();
        assert!(out.has::<MessageIdStamp>());
    }

    #[test]
    fn factories_see_the_bus_name() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut registry = MiddlewareRegistry::empty();
        let log = Arc::clone(&seen);
        registry.register_factory("named", move |bus| {
            log.lock().push(bus.to_string());
            Arc::new(AddBusNameLayer::new(bus)) as Arc<dyn Middleware>
        });

        assert!(registry.create("named", "commands").is_some());
        assert!(registry.create("named", "events").is_some());
        assert_eq!(*seen.lock(), ["commands", "events"]);
    }
}
