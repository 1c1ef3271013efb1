//! Wires a [`Runtime`] together from a [`RuntimeConfig`] plus code-level
//! registrations (message names, handlers, routes, transports).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use courier_core::{
    ClockSource, DispatchContext, Envelope, JsonSerializer, Message, MessageType, ResolveError,
    Serializer, Stamp, SystemClock, TypeResolver,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::bus::middleware::{
    AddBusNameLayer, HandleMessageLayer, MiddlewareRegistry, SendMessageLayer,
};
use crate::bus::{BusDirectory, MessageBus, Middleware};
use crate::config::{RetryConfig, RuntimeConfig};
use crate::error::{BuildError, BusError};
use crate::event::{EventDispatcher, EventKind, LocalEventDispatcher, LogListener};
use crate::handler::{Handler, HandlerRegistry};
use crate::retry::{MultiplierRetryStrategy, RetryStrategy, SendFailedMessageForRetryListener};
use crate::routing::Router;
use crate::transport::{InMemoryTransportFactory, Transport, TransportFactory, TransportManager};

/// Builds the serializer once the resolver is frozen.
pub type SerializerFactory = Box<dyn FnOnce(Arc<TypeResolver>) -> Arc<dyn Serializer> + Send>;

// ---------------------------------------------------------------------------
// RuntimeBuilder
// ---------------------------------------------------------------------------

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    resolver: TypeResolver,
    handlers: HandlerRegistry,
    routes: Vec<(MessageType, Vec<String>)>,
    factories: Vec<Arc<dyn TransportFactory>>,
    transports: Vec<Arc<dyn Transport>>,
    middleware: MiddlewareRegistry,
    events: Option<Arc<dyn EventDispatcher>>,
    serializer: Option<SerializerFactory>,
    clock: Arc<dyn ClockSource>,
    default_retry: RetryConfig,
}

impl RuntimeBuilder {
    /// Starts from `config` with the in-memory transport factory, the JSON
    /// serializer, and the built-in middlewares available.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            resolver: TypeResolver::new(),
            handlers: HandlerRegistry::new(),
            routes: Vec::new(),
            factories: vec![Arc::new(InMemoryTransportFactory) as Arc<dyn TransportFactory>],
            transports: Vec::new(),
            middleware: MiddlewareRegistry::new(),
            events: None,
            serializer: None,
            clock: Arc::new(SystemClock),
            default_retry: RetryConfig::default(),
        }
    }

    /// Gives message type `M` a stable name for serialization and routing.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` already belongs to another type.
    pub fn register_message<M>(&mut self, name: impl Into<String>) -> Result<&mut Self, ResolveError>
    where
        M: Message + Serialize + DeserializeOwned,
    {
        self.resolver.register_message::<M>(name)?;
        Ok(self)
    }

    /// Makes a custom stamp type survive serialization.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` already belongs to another type.
    pub fn register_stamp<S>(&mut self, name: impl Into<String>) -> Result<&mut Self, ResolveError>
    where
        S: Stamp + Serialize + DeserializeOwned,
    {
        self.resolver.register_stamp::<S>(name)?;
        Ok(self)
    }

    pub fn register_handler<M, H>(&mut self, handler: H) -> &mut Self
    where
        M: Message,
        H: Handler<M>,
    {
        self.handlers.register::<M, H>(handler);
        self
    }

    /// Routes `M` to `transports`, replacing any earlier route for it.
    /// Configured routing is applied after code routes.
    pub fn route<M, I, S>(&mut self, transports: I) -> &mut Self
    where
        M: Message,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let message_type = MessageType::of::<M>();
        let transports: Vec<String> = transports.into_iter().map(Into::into).collect();
        self.routes.retain(|(ty, _)| ty.id != message_type.id);
        self.routes.push((message_type, transports));
        self
    }

    /// Factories are consulted in registration order after the built-in one.
    pub fn add_transport_factory(&mut self, factory: Arc<dyn TransportFactory>) -> &mut Self {
        self.factories.push(factory);
        self
    }

    /// Registers a ready-made transport alongside the configured ones.
    pub fn add_transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transports.push(transport);
        self
    }

    /// Middlewares that `buses.<name>.middleware` entries can refer to.
    pub fn middleware_registry_mut(&mut self) -> &mut MiddlewareRegistry {
        &mut self.middleware
    }

    pub fn register_middleware(
        &mut self,
        name: impl Into<String>,
        middleware: Arc<dyn Middleware>,
    ) -> &mut Self {
        self.middleware.register(name, middleware);
        self
    }

    pub fn with_event_dispatcher(&mut self, events: Arc<dyn EventDispatcher>) -> &mut Self {
        self.events = Some(events);
        self
    }

    /// Replaces the JSON serializer handed to transport factories.
    pub fn with_serializer<F>(&mut self, factory: F) -> &mut Self
    where
        F: FnOnce(Arc<TypeResolver>) -> Arc<dyn Serializer> + Send + 'static,
    {
        self.serializer = Some(Box::new(factory));
        self
    }

    /// Clock used for `ErrorDetailsStamp` timestamps.
    pub fn with_clock(&mut self, clock: Arc<dyn ClockSource>) -> &mut Self {
        self.clock = clock;
        self
    }

    /// Retry parameters for transports without a `retry` section.
    pub fn with_default_retry(&mut self, retry: RetryConfig) -> &mut Self {
        self.default_retry = retry;
        self
    }

    /// Validates the configuration and assembles the runtime.
    ///
    /// # Errors
    ///
    /// Returns the first [`BuildError`] found; each names the configuration
    /// key at fault.
    pub fn build(self) -> Result<Runtime, BuildError> {
        let Self {
            config,
            resolver,
            handlers,
            routes,
            factories,
            transports,
            middleware,
            events,
            serializer,
            clock,
            default_retry,
        } = self;

        if !config.buses.contains_key(&config.default_bus) {
            return Err(BuildError::UnknownDefaultBus {
                key: "default_bus".to_string(),
                name: config.default_bus.clone(),
            });
        }
        for (message_type, handler) in handlers.iter() {
            if let Some(bus) = handler.bus() {
                if !config.buses.contains_key(bus) {
                    return Err(BuildError::UnknownHandlerBus {
                        key: format!("handlers.{}", message_type.name),
                        handler: handler.name().to_string(),
                        bus: bus.to_string(),
                    });
                }
            }
        }

        let resolver = Arc::new(resolver);
        let serializer: Arc<dyn Serializer> = match serializer {
            Some(factory) => factory(Arc::clone(&resolver)),
            None => Arc::new(JsonSerializer::new(Arc::clone(&resolver))),
        };

        // Transports
        let events: Arc<dyn EventDispatcher> =
            events.unwrap_or_else(|| Arc::new(LocalEventDispatcher::new()));
        let manager = TransportManager::new(Arc::clone(&events));
        let mut names = HashSet::new();
        for transport in transports {
            let name = transport.name().to_string();
            if !names.insert(name.clone()) {
                return Err(BuildError::DuplicateTransport {
                    key: format!("transports.{name}"),
                    name,
                });
            }
            manager.add_transport(transport);
        }
        for (name, transport_config) in &config.transports {
            if !names.insert(name.clone()) {
                return Err(BuildError::DuplicateTransport {
                    key: format!("transports.{name}"),
                    name: name.clone(),
                });
            }
            let factory = factories
                .iter()
                .find(|f| f.supports(&transport_config.dsn))
                .ok_or_else(|| BuildError::UnsupportedDsn {
                    key: format!("transports.{name}.dsn"),
                    dsn: transport_config.dsn.clone(),
                })?;
            let transport = factory
                .create(name, transport_config, Arc::clone(&serializer))
                .map_err(|source| BuildError::TransportCreation {
                    key: format!("transports.{name}"),
                    source,
                })?;
            debug!(transport = %name, dsn = %transport_config.dsn, "transport created");
            manager.add_transport(transport);
        }

        // Routing
        let mut router = Router::new();
        for (message_type, targets) in routes {
            check_transports(&names, "routing", &targets)?;
            router.add_route(message_type, targets);
        }
        for (name, target) in &config.routing {
            let key = format!("routing.{name}");
            let message_type = resolver
                .resolve_message_type(name)
                .or_else(|| handlers.resolve_message_type(name))
                .ok_or_else(|| BuildError::UnknownMessageType {
                    key: key.clone(),
                    name: name.clone(),
                })?;
            let targets = target.names();
            check_transports(&names, &key, &targets)?;
            router.add_route(message_type, targets);
        }

        if let Some(failure) = &config.failure_transport {
            if !names.contains(failure) {
                return Err(BuildError::UnknownTransport {
                    key: "failure_transport".to_string(),
                    name: failure.clone(),
                });
            }
        }

        // Events
        let default_strategy: Arc<dyn RetryStrategy> =
            Arc::new(MultiplierRetryStrategy::from_config(&default_retry));
        let mut retry = SendFailedMessageForRetryListener::new(
            manager.locator(),
            default_strategy,
            clock,
        );
        for (name, transport_config) in &config.transports {
            if let Some(retry_config) = &transport_config.retry {
                retry = retry.with_strategy(
                    name.clone(),
                    Arc::new(MultiplierRetryStrategy::from_config(retry_config)),
                );
            }
        }
        if let Some(failure) = &config.failure_transport {
            retry = retry.with_failure_transport(failure.clone());
        }
        events.add_listener(EventKind::SendFailedForRetry, Arc::new(retry));
        for kind in EventKind::ALL {
            events.add_listener(kind, Arc::new(LogListener));
        }

        // Buses
        let handlers = Arc::new(handlers);
        let router = Arc::new(router);
        let locator = manager.locator();
        let mut buses = HashMap::new();
        for (bus_name, bus_config) in &config.buses {
            let mut layers: Vec<Arc<dyn Middleware>> =
                Vec::with_capacity(bus_config.middleware.len() + 3);
            for (i, middleware_name) in bus_config.middleware.iter().enumerate() {
                let layer = middleware.create(middleware_name, bus_name).ok_or_else(|| {
                    BuildError::UnknownMiddleware {
                        key: format!("buses.{bus_name}.middleware[{i}]"),
                        name: middleware_name.clone(),
                    }
                })?;
                layers.push(layer);
            }
            layers.push(Arc::new(AddBusNameLayer::new(bus_name)));
            layers.push(Arc::new(SendMessageLayer::new(
                Arc::clone(&router),
                locator.clone(),
            )));
            layers.push(Arc::new(HandleMessageLayer::new(
                Arc::clone(&handlers),
                bus_name,
                *bus_name == config.default_bus,
            )));
            buses.insert(bus_name.clone(), Arc::new(MessageBus::new(bus_name, &layers)));
        }
        let buses = BusDirectory::new(&config.default_bus, buses, handlers.message_bus_map())
            .ok_or_else(|| BuildError::UnknownDefaultBus {
                key: "default_bus".to_string(),
                name: config.default_bus.clone(),
            })?;

        info!(
            buses = config.buses.len(),
            transports = names.len(),
            message_types = handlers.message_types().len(),
            handlers = handlers.iter().count(),
            "runtime built"
        );

        Ok(Runtime {
            buses: Arc::new(buses),
            manager,
            events,
            router,
            handlers,
            resolver,
            serializer,
            failure_transport: config.failure_transport,
        })
    }
}

fn check_transports(known: &HashSet<String>, key: &str, targets: &[String]) -> Result<(), BuildError> {
    match targets.iter().find(|t| !known.contains(*t)) {
        Some(missing) => Err(BuildError::UnknownTransport {
            key: key.to_string(),
            name: missing.clone(),
        }),
        None => Ok(()),
    }
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// A built runtime: buses ready for dispatch and transports ready to consume.
pub struct Runtime {
    buses: Arc<BusDirectory>,
    manager: TransportManager,
    events: Arc<dyn EventDispatcher>,
    router: Arc<Router>,
    handlers: Arc<HandlerRegistry>,
    resolver: Arc<TypeResolver>,
    serializer: Arc<dyn Serializer>,
    failure_transport: Option<String>,
}

impl Runtime {
    /// # Errors
    ///
    /// Returns [`BusError::UnknownBus`] if no bus has that name.
    pub fn bus(&self, name: &str) -> Result<&Arc<MessageBus>, BusError> {
        self.buses.bus(name).ok_or_else(|| BusError::UnknownBus {
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn default_bus(&self) -> &Arc<MessageBus> {
        self.buses.default_bus()
    }

    #[must_use]
    pub fn buses(&self) -> &Arc<BusDirectory> {
        &self.buses
    }

    /// Dispatches on the bus that owns `M`: the bus its handlers are bound
    /// to, or the default bus.
    ///
    /// # Errors
    ///
    /// Propagates the bus's dispatch error.
    pub async fn dispatch<M: Message>(
        &self,
        ctx: &DispatchContext,
        message: M,
    ) -> Result<Envelope, BusError> {
        let envelope = Envelope::new(message);
        self.buses
            .bus_for(&envelope)
            .dispatch_envelope(ctx, envelope)
            .await
    }

    /// Consumes every transport a route points at, except the failure transport.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(&self, ctx: &DispatchContext) {
        let names: Vec<String> = self
            .router
            .used_transports()
            .into_iter()
            .filter(|name| self.failure_transport.as_deref() != Some(name.as_str()))
            .collect();
        self.start_consuming(ctx, &names);
    }

    /// Consumes only the named transports.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start_consuming(&self, ctx: &DispatchContext, names: &[String]) {
        self.manager.start(ctx, names, Arc::clone(&self.buses));
    }

    /// Stops consumers and waits for in-flight deliveries.
    pub async fn stop(&self) {
        self.manager.stop().await;
    }

    #[must_use]
    pub fn manager(&self) -> &TransportManager {
        &self.manager
    }

    #[must_use]
    pub fn transport(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.manager.transport(name)
    }

    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventDispatcher> {
        &self.events
    }

    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    #[must_use]
    pub fn resolver(&self) -> &Arc<TypeResolver> {
        &self.resolver
    }

    #[must_use]
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("buses", &self.buses.names())
            .field("manager", &self.manager)
            .field("failure_transport", &self.failure_transport)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
