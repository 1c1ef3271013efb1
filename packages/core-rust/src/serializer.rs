//! Envelope serialization contract and the bundled JSON / `MsgPack` codecs.
//!
//! Wire layout shared by both codecs:
//! - body: the message value, rendered in the codec's format
//! - header `type`: the message name registered with the [`TypeResolver`]
//! - header `stamps`: JSON array of `{"type": name, "data": value}` pairs
//! - header `content-type`: the codec's MIME type

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::envelope::Envelope;
use crate::resolver::{ResolveError, TypeResolver};
use crate::stamp::Stamp;

/// Header carrying the registered message name.
pub const TYPE_HEADER: &str = "type";
/// Header carrying the serialized stamp list.
pub const STAMPS_HEADER: &str = "stamps";
/// Header carrying the body's MIME type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Transport headers accompanying a serialized body.
pub type Headers = HashMap<String, String>;

/// Errors produced while marshalling or unmarshalling envelopes.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("missing {0:?} header")]
    MissingHeader(&'static str),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("malformed stamps header: {0}")]
    MalformedStamps(#[source] serde_json::Error),
    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed MsgPack body: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("failed to encode MsgPack body: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
}

/// Converts envelopes to and from transport payloads.
pub trait Serializer: Send + Sync {
    /// Renders an envelope into a body and headers.
    ///
    /// # Errors
    ///
    /// Fails if the message type is unregistered or cannot be encoded.
    fn marshal(&self, envelope: &Envelope) -> Result<(Vec<u8>, Headers), SerializerError>;

    /// Rebuilds an envelope from a body and headers.
    ///
    /// Stamps whose type is unknown to the resolver are skipped.
    ///
    /// # Errors
    ///
    /// Fails if the `type` header is missing or unknown, or the payload is malformed.
    fn unmarshal(&self, body: &[u8], headers: &Headers) -> Result<Envelope, SerializerError>;
}

#[derive(Serialize, Deserialize)]
struct WireStamp {
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
}

/// Shared header handling for the bundled codecs.
fn encode_parts(
    resolver: &TypeResolver,
    envelope: &Envelope,
) -> Result<(serde_json::Value, Headers), SerializerError> {
    let (name, value) = resolver.encode_message(envelope.message())?;

    let mut wire_stamps = Vec::new();
    for stamp in envelope.stamps() {
        let stamp: &dyn Stamp = stamp.as_ref();
        if let Some((kind, data)) = resolver.encode_stamp(stamp)? {
            wire_stamps.push(WireStamp { kind, data });
        }
    }

    let mut headers = Headers::new();
    headers.insert(TYPE_HEADER.to_string(), name);
    if !wire_stamps.is_empty() {
        headers.insert(
            STAMPS_HEADER.to_string(),
            serde_json::to_string(&wire_stamps)?,
        );
    }
    Ok((value, headers))
}

fn decode_parts(
    resolver: &TypeResolver,
    value: serde_json::Value,
    headers: &Headers,
) -> Result<Envelope, SerializerError> {
    let name = headers
        .get(TYPE_HEADER)
        .ok_or(SerializerError::MissingHeader(TYPE_HEADER))?;
    let message = resolver.decode_message(name, value)?;
    let mut envelope = Envelope::from_arc(message);

    if let Some(raw) = headers.get(STAMPS_HEADER) {
        let wire_stamps: Vec<WireStamp> =
            serde_json::from_str(raw).map_err(SerializerError::MalformedStamps)?;
        let mut stamps: Vec<Arc<dyn Stamp>> = Vec::with_capacity(wire_stamps.len());
        for wire in wire_stamps {
            if !resolver.knows_stamp(&wire.kind) {
                debug!(stamp = %wire.kind, "skipping unknown stamp type");
                continue;
            }
            stamps.push(resolver.decode_stamp(&wire.kind, wire.data)?);
        }
        envelope = envelope.with_stamps(stamps);
    }
    Ok(envelope)
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone)]
pub struct JsonSerializer {
    resolver: Arc<TypeResolver>,
}

impl JsonSerializer {
    #[must_use]
    pub fn new(resolver: Arc<TypeResolver>) -> Self {
        Self { resolver }
    }
}

impl Serializer for JsonSerializer {
    fn marshal(&self, envelope: &Envelope) -> Result<(Vec<u8>, Headers), SerializerError> {
        let (value, mut headers) = encode_parts(&self.resolver, envelope)?;
        headers.insert(
            CONTENT_TYPE_HEADER.to_string(),
            "application/json".to_string(),
        );
        Ok((serde_json::to_vec(&value)?, headers))
    }

    fn unmarshal(&self, body: &[u8], headers: &Headers) -> Result<Envelope, SerializerError> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        decode_parts(&self.resolver, value, headers)
    }
}

/// `MsgPack` codec backed by `rmp-serde`; headers remain JSON.
#[derive(Debug, Clone)]
pub struct MsgPackSerializer {
    resolver: Arc<TypeResolver>,
}

impl MsgPackSerializer {
    #[must_use]
    pub fn new(resolver: Arc<TypeResolver>) -> Self {
        Self { resolver }
    }
}

impl Serializer for MsgPackSerializer {
    fn marshal(&self, envelope: &Envelope) -> Result<(Vec<u8>, Headers), SerializerError> {
        let (value, mut headers) = encode_parts(&self.resolver, envelope)?;
        headers.insert(
            CONTENT_TYPE_HEADER.to_string(),
            "application/msgpack".to_string(),
        );
        Ok((rmp_serde::to_vec_named(&value)?, headers))
    }

    fn unmarshal(&self, body: &[u8], headers: &Headers) -> Result<Envelope, SerializerError> {
        let value: serde_json::Value = rmp_serde::from_slice(body)?;
        decode_parts(&self.resolver, value, headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::stamp::{BusNameStamp, ReceivedStamp, RedeliveryStamp};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct PlaceOrder {
        order_id: String,
        quantity: u32,
    }

    impl Message for PlaceOrder {}

    fn resolver() -> Arc<TypeResolver> {
        let mut resolver = TypeResolver::new();
        resolver.register_message::<PlaceOrder>("orders.place").unwrap();
        Arc::new(resolver)
    }

    fn envelope() -> Envelope {
        Envelope::new(PlaceOrder {
            order_id: "o-1".to_string(),
            quantity: 3,
        })
        .with_stamp(BusNameStamp::new("commands"))
        .with_stamp(ReceivedStamp::new("async"))
        .with_stamp(RedeliveryStamp::new(1))
    }

    fn assert_restored(restored: &Envelope) {
        assert_eq!(
            restored.message_as::<PlaceOrder>(),
            Some(&PlaceOrder {
                order_id: "o-1".to_string(),
                quantity: 3,
            })
        );
        assert_eq!(
            restored.first::<BusNameStamp>().map(|s| s.bus_name.as_str()),
            Some("commands")
        );
        assert_eq!(restored.last::<RedeliveryStamp>().map(|s| s.retry_count), Some(1));
        // In-process stamps never reach the wire.
        assert!(!restored.has::<ReceivedStamp>());
    }

    #[test]
    fn json_marshal_sets_headers() {
        let serializer = JsonSerializer::new(resolver());
        let (body, headers) = serializer.marshal(&envelope()).unwrap();

        assert_eq!(headers[TYPE_HEADER], "orders.place");
        assert_eq!(headers[CONTENT_TYPE_HEADER], "application/json");
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["order_id"], "o-1");

        let stamps: serde_json::Value = serde_json::from_str(&headers[STAMPS_HEADER]).unwrap();
        assert_eq!(stamps.as_array().map(Vec::len), Some(2));
        assert_eq!(stamps[0]["type"], "bus_name");
    }

    #[test]
    fn json_unmarshal_restores_message_and_wire_stamps() {
        let serializer = JsonSerializer::new(resolver());
        let (body, headers) = serializer.marshal(&envelope()).unwrap();
        assert_restored(&serializer.unmarshal(&body, &headers).unwrap());
    }

    #[test]
    fn msgpack_unmarshal_restores_message_and_wire_stamps() {
        let serializer = MsgPackSerializer::new(resolver());
        let (body, headers) = serializer.marshal(&envelope()).unwrap();
        assert_eq!(headers[CONTENT_TYPE_HEADER], "application/msgpack");
        assert_restored(&serializer.unmarshal(&body, &headers).unwrap());
    }

    #[test]
    fn unknown_stamp_types_are_skipped() {
        let serializer = JsonSerializer::new(resolver());
        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER.to_string(), "orders.place".to_string());
        headers.insert(
            STAMPS_HEADER.to_string(),
            r#"[{"type":"vendor.trace","data":{"id":1}},{"type":"redelivery","data":{"retry_count":4}}]"#
                .to_string(),
        );
        let body = br#"{"order_id":"o-9","quantity":1}"#;

        let envelope = serializer.unmarshal(body, &headers).unwrap();
        assert_eq!(envelope.stamps().len(), 1);
        assert_eq!(envelope.last::<RedeliveryStamp>().map(|s| s.retry_count), Some(4));
    }

    #[test]
    fn missing_type_header_is_an_error() {
        let serializer = JsonSerializer::new(resolver());
        let err = serializer.unmarshal(b"{}", &Headers::new()).unwrap_err();
        assert!(matches!(err, SerializerError::MissingHeader(TYPE_HEADER)));
    }

    #[test]
    fn unknown_message_type_is_an_error() {
        let serializer = JsonSerializer::new(resolver());
        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER.to_string(), "orders.unknown".to_string());
        let err = serializer.unmarshal(b"{}", &headers).unwrap_err();
        assert!(matches!(
            err,
            SerializerError::Resolve(ResolveError::UnknownName { .. })
        ));
    }

    #[test]
    fn malformed_body_is_an_error() {
        let serializer = JsonSerializer::new(resolver());
        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER.to_string(), "orders.place".to_string());
        assert!(serializer.unmarshal(b"not json", &headers).is_err());
    }
}
