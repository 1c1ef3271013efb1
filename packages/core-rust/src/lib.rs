//! Courier core: the envelope/stamp data model, the type resolver, and the
//! serializer contract shared by buses and transports.

pub mod clock;
pub mod context;
pub mod envelope;
pub mod message;
pub mod resolver;
pub mod serializer;
pub mod stamp;

pub use clock::{ClockSource, FixedClock, SystemClock};
pub use context::DispatchContext;
pub use envelope::Envelope;
pub use message::{short_type_name, AsAny, Message, MessageType};
pub use resolver::{ResolveError, TypeResolver};
pub use serializer::{Headers, JsonSerializer, MsgPackSerializer, Serializer, SerializerError};
pub use stamp::{
    BusNameStamp, ErrorDetailsStamp, HandledStamp, MessageIdStamp, ReceivedStamp,
    RedeliveryStamp, SentStamp, Stamp, TransportNameStamp,
};
