//! Message handlers and the registry that indexes them by message type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{DispatchContext, Envelope, Message, MessageType};

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// Application logic invoked for every message of type `M`.
///
/// `Output` is stored in the [`HandledStamp`](courier_core::HandledStamp) that
/// follows a successful call. Handlers returning `()` record no result value.
#[async_trait]
pub trait Handler<M: Message>: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    /// Handles one message.
    async fn handle(&self, ctx: &DispatchContext, message: &M) -> anyhow::Result<Self::Output>;

    /// Identity recorded in `HandledStamp` and in error messages.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// Bus this handler is bound to. Unbound handlers run on the default bus.
    fn bus(&self) -> Option<&str> {
        None
    }
}

// ---------------------------------------------------------------------------
// ErasedHandler
// ---------------------------------------------------------------------------

/// Type-erased handler as stored in the [`HandlerRegistry`].
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    fn name(&self) -> &str;

    fn bus(&self) -> Option<&str>;

    /// Invokes the handler, returning its result value if it produced one.
    async fn call(
        &self,
        ctx: &DispatchContext,
        message: &dyn Message,
    ) -> anyhow::Result<Option<Arc<dyn Any + Send + Sync>>>;
}

struct TypedHandler<M, H> {
    handler: H,
    name: String,
    bus: Option<String>,
    _message: PhantomData<fn(M)>,
}

#[async_trait]
impl<M, H> ErasedHandler for TypedHandler<M, H>
where
    M: Message,
    H: Handler<M>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn bus(&self) -> Option<&str> {
        self.bus.as_deref()
    }

    async fn call(
        &self,
        ctx: &DispatchContext,
        message: &dyn Message,
    ) -> anyhow::Result<Option<Arc<dyn Any + Send + Sync>>> {
        let Some(typed) = message.as_any().downcast_ref::<M>() else {
            anyhow::bail!(
                "handler {} expects {} but received {}",
                self.name,
                std::any::type_name::<M>(),
                message.type_name()
            );
        };
        let output = self.handler.handle(ctx, typed).await?;
        Ok(erase_output(output))
    }
}

fn erase_output<T: Send + Sync + 'static>(output: T) -> Option<Arc<dyn Any + Send + Sync>> {
    if TypeId::of::<T>() == TypeId::of::<()>() {
        None
    } else {
        Some(Arc::new(output))
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Handlers indexed by exact message type, kept in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeId, Vec<Arc<dyn ErasedHandler>>>,
    types: Vec<MessageType>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for messages of type `M`.
    pub fn register<M, H>(&mut self, handler: H)
    where
        M: Message,
        H: Handler<M>,
    {
        let message_type = MessageType::of::<M>();
        let erased = TypedHandler {
            name: handler.name(),
            bus: handler.bus().map(str::to_string),
            handler,
            _message: PhantomData,
        };
        tracing::debug!(
            message_type = message_type.name,
            handler = %erased.name,
            bus = erased.bus.as_deref().unwrap_or("-"),
            "handler registered"
        );
        if !self.handlers.contains_key(&message_type.id) {
            self.types.push(message_type);
        }
        self.handlers
            .entry(message_type.id)
            .or_default()
            .push(Arc::new(erased));
    }

    /// All handlers for a message type, in registration order.
    #[must_use]
    pub fn get(&self, type_id: TypeId) -> &[Arc<dyn ErasedHandler>] {
        self.handlers.get(&type_id).map_or(&[], Vec::as_slice)
    }

    /// Handlers for the envelope's message type.
    #[must_use]
    pub fn handlers_for(&self, envelope: &Envelope) -> &[Arc<dyn ErasedHandler>] {
        self.get(envelope.message_type_id())
    }

    /// Handlers that run on `bus`: those bound to it, plus unbound handlers
    /// when `bus` is the default bus.
    #[must_use]
    pub fn handlers_on(
        &self,
        type_id: TypeId,
        bus: &str,
        is_default: bool,
    ) -> Vec<Arc<dyn ErasedHandler>> {
        self.get(type_id)
            .iter()
            .filter(|h| match h.bus() {
                Some(bound) => bound == bus,
                None => is_default,
            })
            .cloned()
            .collect()
    }

    /// Finds a registered message type by full Rust path, then by bare name.
    ///
    /// A bare name shared by several registered types resolves to `None`.
    #[must_use]
    pub fn resolve_message_type(&self, name: &str) -> Option<MessageType> {
        if let Some(ty) = self.types.iter().find(|t| t.name == name) {
            return Some(*ty);
        }
        let mut matches = self.types.iter().filter(|t| t.short_name() == name);
        match (matches.next(), matches.next()) {
            (Some(ty), None) => Some(*ty),
            _ => None,
        }
    }

    /// Maps each message type to the bus its handlers are bound to.
    ///
    /// Types whose handlers are all unbound are omitted; the first bound
    /// handler wins when handlers disagree.
    #[must_use]
    pub fn message_bus_map(&self) -> HashMap<TypeId, String> {
        self.handlers
            .iter()
            .filter_map(|(id, handlers)| {
                handlers
                    .iter()
                    .find_map(|h| h.bus())
                    .map(|bus| (*id, bus.to_string()))
            })
            .collect()
    }

    /// Registered message types, in first-registration order.
    #[must_use]
    pub fn message_types(&self) -> &[MessageType] {
        &self.types
    }

    /// Iterates every handler together with its message type.
    pub fn iter(&self) -> impl Iterator<Item = (MessageType, &Arc<dyn ErasedHandler>)> {
        self.types
            .iter()
            .flat_map(move |ty| self.get(ty.id).iter().map(move |h| (*ty, h)))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.types.len())
            .field(
                "handlers",
                &self.handlers.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
