//! Name-based registry of message and stamp types.
//!
//! Serializers and configuration refer to types by a stable, developer-chosen
//! name (e.g. `"orders.place"`). The resolver maps those names to codecs that
//! convert between concrete Rust values and `serde_json::Value`, which every
//! serializer then renders into its own wire format.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::{Message, MessageType};
use crate::stamp::{
    BusNameStamp, ErrorDetailsStamp, MessageIdStamp, RedeliveryStamp, Stamp, TransportNameStamp,
};

/// Errors raised while registering or resolving types.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("type name {name:?} is already registered for {existing}")]
    DuplicateName { name: String, existing: &'static str },
    #[error("unknown type name: {name}")]
    UnknownName { name: String },
    #[error("type {type_name} is not registered")]
    Unregistered { type_name: &'static str },
    #[error("failed to encode {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

type EncodeFn = fn(&dyn Any) -> Option<serde_json::Result<serde_json::Value>>;
type DecodeMessageFn = fn(serde_json::Value) -> serde_json::Result<Arc<dyn Message>>;
type DecodeStampFn = fn(serde_json::Value) -> serde_json::Result<Arc<dyn Stamp>>;

#[derive(Clone)]
struct MessageCodec {
    name: String,
    message_type: MessageType,
    encode: EncodeFn,
    decode: DecodeMessageFn,
}

#[derive(Clone)]
struct StampCodec {
    name: String,
    type_name: &'static str,
    encode: EncodeFn,
    decode: DecodeStampFn,
}

fn encode_value<T: Serialize + 'static>(value: &dyn Any) -> Option<serde_json::Result<serde_json::Value>> {
    value.downcast_ref::<T>().map(serde_json::to_value)
}

fn decode_message<M: Message + DeserializeOwned>(
    value: serde_json::Value,
) -> serde_json::Result<Arc<dyn Message>> {
    Ok(Arc::new(serde_json::from_value::<M>(value)?))
}

fn decode_stamp<S: Stamp + DeserializeOwned>(
    value: serde_json::Value,
) -> serde_json::Result<Arc<dyn Stamp>> {
    Ok(Arc::new(serde_json::from_value::<S>(value)?))
}

/// Registry mapping stable names to message and stamp codecs.
///
/// Populated once while wiring the application and read-only afterwards.
/// [`TypeResolver::new`] pre-registers the canonical stamps that travel on the
/// wire; stamps that only make sense in-process (`SentStamp`, `ReceivedStamp`,
/// `HandledStamp`) are left out and therefore dropped by serializers.
#[derive(Clone)]
pub struct TypeResolver {
    messages_by_name: HashMap<String, MessageCodec>,
    message_names: HashMap<TypeId, String>,
    stamps_by_name: HashMap<String, StampCodec>,
    stamp_names: HashMap<TypeId, String>,
}

impl TypeResolver {
    /// Creates a resolver that knows the canonical wire stamps.
    #[must_use]
    pub fn new() -> Self {
        let mut resolver = Self::empty();
        resolver.insert_stamp::<BusNameStamp>("bus_name".to_string());
        resolver.insert_stamp::<MessageIdStamp>("message_id".to_string());
        resolver.insert_stamp::<RedeliveryStamp>("redelivery".to_string());
        resolver.insert_stamp::<ErrorDetailsStamp>("error_details".to_string());
        resolver.insert_stamp::<TransportNameStamp>("transport_name".to_string());
        resolver
    }

    /// Creates a resolver with nothing registered.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            messages_by_name: HashMap::new(),
            message_names: HashMap::new(),
            stamps_by_name: HashMap::new(),
            stamp_names: HashMap::new(),
        }
    }

    /// Registers message type `M` under `name`.
    ///
    /// Re-registering the same type under a new name replaces the old name.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::DuplicateName`] if `name` belongs to another type.
    pub fn register_message<M>(&mut self, name: impl Into<String>) -> Result<(), ResolveError>
    where
        M: Message + Serialize + DeserializeOwned,
    {
        let name = name.into();
        let message_type = MessageType::of::<M>();
        if let Some(existing) = self.messages_by_name.get(&name) {
            if existing.message_type != message_type {
                return Err(ResolveError::DuplicateName {
                    name,
                    existing: existing.message_type.name,
                });
            }
        }
        if let Some(old) = self.message_names.insert(message_type.id, name.clone()) {
            self.messages_by_name.remove(&old);
        }
        self.messages_by_name.insert(
            name.clone(),
            MessageCodec {
                name,
                message_type,
                encode: encode_value::<M>,
                decode: decode_message::<M>,
            },
        );
        Ok(())
    }

    /// Registers stamp type `S` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::DuplicateName`] if `name` belongs to another type.
    pub fn register_stamp<S>(&mut self, name: impl Into<String>) -> Result<(), ResolveError>
    where
        S: Stamp + Serialize + DeserializeOwned,
    {
        let name = name.into();
        let type_name = std::any::type_name::<S>();
        if let Some(existing) = self.stamps_by_name.get(&name) {
            if existing.type_name != type_name {
                return Err(ResolveError::DuplicateName {
                    name,
                    existing: existing.type_name,
                });
            }
        }
        self.insert_stamp::<S>(name);
        Ok(())
    }

    /// Binds `name` to `S`, replacing any previous name of `S`. Callers check
    /// that `name` is not taken by another type.
    fn insert_stamp<S>(&mut self, name: String)
    where
        S: Stamp + Serialize + DeserializeOwned,
    {
        let type_name = std::any::type_name::<S>();
        if let Some(old) = self.stamp_names.insert(TypeId::of::<S>(), name.clone()) {
            self.stamps_by_name.remove(&old);
        }
        self.stamps_by_name.insert(
            name.clone(),
            StampCodec {
                name,
                type_name,
                encode: encode_value::<S>,
                decode: decode_stamp::<S>,
            },
        );
    }

    /// Looks up a message type by its registered name.
    #[must_use]
    pub fn resolve_message_type(&self, name: &str) -> Option<MessageType> {
        self.messages_by_name.get(name).map(|c| c.message_type)
    }

    /// Registered name of a message type, if any.
    #[must_use]
    pub fn message_name(&self, type_id: TypeId) -> Option<&str> {
        self.message_names.get(&type_id).map(String::as_str)
    }

    /// Registered name of a stamp type, if any.
    #[must_use]
    pub fn stamp_name(&self, type_id: TypeId) -> Option<&str> {
        self.stamp_names.get(&type_id).map(String::as_str)
    }

    /// Returns `true` if a stamp codec is registered under `name`.
    #[must_use]
    pub fn knows_stamp(&self, name: &str) -> bool {
        self.stamps_by_name.contains_key(name)
    }

    /// Encodes a message into its registered name and JSON value.
    ///
    /// # Errors
    ///
    /// Fails if the message type is unregistered or serialization fails.
    pub fn encode_message(
        &self,
        message: &dyn Message,
    ) -> Result<(String, serde_json::Value), ResolveError> {
        let ty = MessageType::of_val(message);
        let codec = self
            .message_names
            .get(&ty.id)
            .and_then(|name| self.messages_by_name.get(name))
            .ok_or(ResolveError::Unregistered { type_name: ty.name })?;
        let value = (codec.encode)(message.as_any())
            .ok_or(ResolveError::Unregistered { type_name: ty.name })?
            .map_err(|source| ResolveError::Encode {
                name: codec.name.clone(),
                source,
            })?;
        Ok((codec.name.clone(), value))
    }

    /// Decodes a message from its registered name and JSON value.
    ///
    /// # Errors
    ///
    /// Fails if `name` is unknown or the value does not match the type.
    pub fn decode_message(
        &self,
        name: &str,
        value: serde_json::Value,
    ) -> Result<Arc<dyn Message>, ResolveError> {
        let codec = self
            .messages_by_name
            .get(name)
            .ok_or_else(|| ResolveError::UnknownName {
                name: name.to_string(),
            })?;
        (codec.decode)(value).map_err(|source| ResolveError::Decode {
            name: name.to_string(),
            source,
        })
    }

    /// Encodes a stamp, or returns `Ok(None)` if its type is not registered.
    ///
    /// # Errors
    ///
    /// Fails only if serialization of a registered stamp fails.
    pub fn encode_stamp(
        &self,
        stamp: &dyn Stamp,
    ) -> Result<Option<(String, serde_json::Value)>, ResolveError> {
        let Some(codec) = self
            .stamp_names
            .get(&stamp.as_any().type_id())
            .and_then(|name| self.stamps_by_name.get(name))
        else {
            return Ok(None);
        };
        match (codec.encode)(stamp.as_any()) {
            Some(Ok(value)) => Ok(Some((codec.name.clone(), value))),
            Some(Err(source)) => Err(ResolveError::Encode {
                name: codec.name.clone(),
                source,
            }),
            None => Ok(None),
        }
    }

    /// Decodes a stamp from its registered name and JSON value.
    ///
    /// # Errors
    ///
    /// Fails if `name` is unknown or the value does not match the type.
    pub fn decode_stamp(
        &self,
        name: &str,
        value: serde_json::Value,
    ) -> Result<Arc<dyn Stamp>, ResolveError> {
        let codec = self
            .stamps_by_name
            .get(name)
            .ok_or_else(|| ResolveError::UnknownName {
                name: name.to_string(),
            })?;
        (codec.decode)(value).map_err(|source| ResolveError::Decode {
            name: name.to_string(),
            source,
        })
    }
}

impl Default for TypeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut messages: Vec<&String> = self.messages_by_name.keys().collect();
        messages.sort();
        let mut stamps: Vec<&String> = self.stamps_by_name.keys().collect();
        stamps.sort();
        f.debug_struct("TypeResolver")
            .field("messages", &messages)
            .field("stamps", &stamps)
            .finish()
    }
}
