//! Application message trait and runtime type identity.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Upcasting helper so trait objects can be downcast to their concrete type.
///
/// Blanket-implemented for every `'static` type; never implement it by hand.
pub trait AsAny: Any + Send + Sync {
    /// Borrows `self` as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;

    /// Converts an `Arc<Self>` into an `Arc<dyn Any>` for owned downcasting.
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Fully-qualified Rust type path of the concrete type.
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Marker trait for application messages (commands and events).
///
/// Implement it for every type dispatched through a bus:
///
/// ```
/// use courier_core::Message;
///
/// #[derive(Debug)]
/// struct PlaceOrder {
///     order_id: String,
/// }
///
/// impl Message for PlaceOrder {}
/// ```
///
/// `Envelope` deliberately does not implement `Message`, so an envelope can
/// never end up wrapped inside another envelope.
pub trait Message: AsAny + fmt::Debug {}

/// Runtime identity of a concrete message type.
///
/// Lookups in handler and route tables compare `id` only, so matching is by
/// exact type and never polymorphic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    /// `TypeId` of the concrete message type.
    pub id: TypeId,
    /// Fully-qualified Rust path, e.g. `my_app::orders::PlaceOrder`.
    pub name: &'static str,
}

impl MessageType {
    /// Identity of the message type `M`.
    #[must_use]
    pub fn of<M: Message>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    /// Identity of the concrete type behind a message trait object.
    #[must_use]
    pub fn of_val(message: &dyn Message) -> Self {
        Self {
            id: message.as_any().type_id(),
            name: message.type_name(),
        }
    }

    /// The bare type name: the last `::` segment of the path, generics included.
    #[must_use]
    pub fn short_name(&self) -> &'static str {
        short_type_name(self.name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Strips the module path from a type path, keeping generic arguments intact.
///
/// `a::b::Foo` becomes `Foo`; `a::Wrapper<b::Bar>` becomes `Wrapper<b::Bar>`.
#[must_use]
pub fn short_type_name(path: &'static str) -> &'static str {
    let head_end = path.find('<').unwrap_or(path.len());
    match path[..head_end].rfind("::") {
        Some(idx) => &path[idx + 2..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping;

    impl Message for Ping {}

    #[derive(Debug)]
    struct Wrapper<T>(T);

    impl<T: fmt::Debug + Send + Sync + 'static> Message for Wrapper<T> {}

    #[test]
    fn message_type_of_matches_of_val() {
        let ping: Arc<dyn Message> = Arc::new(Ping);
        assert_eq!(MessageType::of::<Ping>(), MessageType::of_val(ping.as_ref()));
    }

    #[test]
    fn short_name_strips_module_path() {
        let ty = MessageType::of::<Ping>();
        assert!(ty.name.ends_with("::Ping"));
        assert_eq!(ty.short_name(), "Ping");
    }

    #[test]
    fn short_name_keeps_generic_arguments() {
        assert_eq!(short_type_name("a::b::Foo"), "Foo");
        assert_eq!(short_type_name("Foo"), "Foo");
        assert_eq!(short_type_name("a::Wrapper<b::Bar>"), "Wrapper<b::Bar>");

        let ty = MessageType::of::<Wrapper<Ping>>();
        assert!(ty.short_name().starts_with("Wrapper<"));
    }

    #[test]
    fn arc_downcast_round_trips() {
        let ping: Arc<dyn Message> = Arc::new(Ping);
        let any = ping.into_any_arc();
        assert!(any.downcast::<Ping>().is_ok());
    }
}
