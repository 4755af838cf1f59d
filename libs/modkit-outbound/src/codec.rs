//! Payload encoding and response decoding.

use crate::error::OutboundError;
use crate::saturate::{DecodeTargets, TargetSlot};
use bytes::Bytes;
use http::StatusCode;
use serde::Serialize;
use serde::ser::{self, Impossible};
use std::fmt;
use thiserror::Error;

/// JSON media type used for `Content-Type` and `Accept` by default.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Whether a `Content-Type` value denotes JSON.
///
/// Absent or blank values count as JSON, as do `application/json` with
/// parameters and any `+json` structured syntax suffix.
#[must_use]
pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    let Some(value) = content_type else {
        return true;
    };
    let essence = value.split(';').next().unwrap_or_default().trim();
    if essence.is_empty() {
        return true;
    }
    let essence = essence.to_ascii_lowercase();
    essence == JSON_CONTENT_TYPE || essence.ends_with("+json")
}

/// Encode `payload` for the wire according to `content_type`.
///
/// JSON content types serialize with `serde_json`. Anything else requires the
/// payload to be a string or a non-empty byte sequence, passed through unchanged.
///
/// # Errors
/// - [`OutboundError::Encode`] if JSON serialization fails
/// - [`OutboundError::UnsupportedPayload`] for non-byte payloads with a non-JSON content type
pub fn encode<P>(payload: &P, content_type: Option<&str>) -> Result<Bytes, OutboundError>
where
    P: Serialize + ?Sized,
{
    if is_json_content_type(content_type) {
        return serde_json::to_vec(payload)
            .map(Bytes::from)
            .map_err(OutboundError::Encode);
    }

    payload
        .serialize(RawSerializer)
        .map(Bytes::from)
        .map_err(|NotRaw| OutboundError::UnsupportedPayload {
            content_type: content_type.unwrap_or_default().to_owned(),
        })
}

/// Payload is neither a string nor a non-empty byte sequence.
#[derive(Debug, Error)]
#[error("payload is not a string or byte sequence")]
struct NotRaw;

impl ser::Error for NotRaw {
    fn custom<T: fmt::Display>(_msg: T) -> Self {
        Self
    }
}

macro_rules! reject {
    ($($method:ident($($arg:ty),*) -> $ret:ty;)*) => {
        $(
            fn $method(self, $(_: $arg),*) -> Result<$ret, Self::Error> {
                Err(NotRaw)
            }
        )*
    };
}

/// Accepts `str`, `bytes` (e.g. `bytes::Bytes`) and sequences whose elements
/// are all `u8` (`Vec<u8>`, `&[u8]`, `[u8; N]`).
///
/// An empty sequence carries no element type, so it is rejected; send `""`
/// or an empty `Bytes` for an empty raw body.
struct RawSerializer;

impl ser::Serializer for RawSerializer {
    type Ok = Vec<u8>;
    type Error = NotRaw;
    type SerializeSeq = RawSeq;
    type SerializeTuple = RawSeq;
    type SerializeTupleStruct = Impossible<Vec<u8>, NotRaw>;
    type SerializeTupleVariant = Impossible<Vec<u8>, NotRaw>;
    type SerializeMap = Impossible<Vec<u8>, NotRaw>;
    type SerializeStruct = Impossible<Vec<u8>, NotRaw>;
    type SerializeStructVariant = Impossible<Vec<u8>, NotRaw>;

    fn serialize_str(self, v: &str) -> Result<Vec<u8>, NotRaw> {
        Ok(v.as_bytes().to_vec())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Vec<u8>, NotRaw> {
        Ok(v.to_vec())
    }

    fn serialize_newtype_struct<T>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Vec<u8>, NotRaw>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<RawSeq, NotRaw> {
        Ok(RawSeq(Vec::with_capacity(len.unwrap_or_default())))
    }

    fn serialize_tuple(self, len: usize) -> Result<RawSeq, NotRaw> {
        Ok(RawSeq(Vec::with_capacity(len)))
    }

    fn serialize_some<T>(self, _value: &T) -> Result<Vec<u8>, NotRaw>
    where
        T: ?Sized + Serialize,
    {
        Err(NotRaw)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<Vec<u8>, NotRaw>
    where
        T: ?Sized + Serialize,
    {
        Err(NotRaw)
    }

    reject! {
        serialize_bool(bool) -> Vec<u8>;
        serialize_i8(i8) -> Vec<u8>;
        serialize_i16(i16) -> Vec<u8>;
        serialize_i32(i32) -> Vec<u8>;
        serialize_i64(i64) -> Vec<u8>;
        serialize_u8(u8) -> Vec<u8>;
        serialize_u16(u16) -> Vec<u8>;
        serialize_u32(u32) -> Vec<u8>;
        serialize_u64(u64) -> Vec<u8>;
        serialize_f32(f32) -> Vec<u8>;
        serialize_f64(f64) -> Vec<u8>;
        serialize_char(char) -> Vec<u8>;
        serialize_none() -> Vec<u8>;
        serialize_unit() -> Vec<u8>;
        serialize_unit_struct(&'static str) -> Vec<u8>;
        serialize_unit_variant(&'static str, u32, &'static str) -> Vec<u8>;
        serialize_tuple_struct(&'static str, usize) -> Self::SerializeTupleStruct;
        serialize_tuple_variant(&'static str, u32, &'static str, usize) ->
            Self::SerializeTupleVariant;
        serialize_map(Option<usize>) -> Self::SerializeMap;
        serialize_struct(&'static str, usize) -> Self::SerializeStruct;
        serialize_struct_variant(&'static str, u32, &'static str, usize) ->
            Self::SerializeStructVariant;
    }
}

struct RawSeq(Vec<u8>);

impl RawSeq {
    fn push<T>(&mut self, value: &T) -> Result<(), NotRaw>
    where
        T: ?Sized + Serialize,
    {
        self.0.push(value.serialize(ByteSerializer)?);
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>, NotRaw> {
        if self.0.is_empty() {
            return Err(NotRaw);
        }
        Ok(self.0)
    }
}

impl ser::SerializeSeq for RawSeq {
    type Ok = Vec<u8>;
    type Error = NotRaw;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), NotRaw>
    where
        T: ?Sized + Serialize,
    {
        self.push(value)
    }

    fn end(self) -> Result<Vec<u8>, NotRaw> {
        self.finish()
    }
}

impl ser::SerializeTuple for RawSeq {
    type Ok = Vec<u8>;
    type Error = NotRaw;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), NotRaw>
    where
        T: ?Sized + Serialize,
    {
        self.push(value)
    }

    fn end(self) -> Result<Vec<u8>, NotRaw> {
        self.finish()
    }
}

/// Sequence element serializer: `u8` only.
struct ByteSerializer;

impl ser::Serializer for ByteSerializer {
    type Ok = u8;
    type Error = NotRaw;
    type SerializeSeq = Impossible<u8, NotRaw>;
    type SerializeTuple = Impossible<u8, NotRaw>;
    type SerializeTupleStruct = Impossible<u8, NotRaw>;
    type SerializeTupleVariant = Impossible<u8, NotRaw>;
    type SerializeMap = Impossible<u8, NotRaw>;
    type SerializeStruct = Impossible<u8, NotRaw>;
    type SerializeStructVariant = Impossible<u8, NotRaw>;

    fn serialize_u8(self, v: u8) -> Result<u8, NotRaw> {
        Ok(v)
    }

    fn serialize_some<T>(self, _value: &T) -> Result<u8, NotRaw>
    where
        T: ?Sized + Serialize,
    {
        Err(NotRaw)
    }

    fn serialize_newtype_struct<T>(self, _name: &'static str, _value: &T) -> Result<u8, NotRaw>
    where
        T: ?Sized + Serialize,
    {
        Err(NotRaw)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<u8, NotRaw>
    where
        T: ?Sized + Serialize,
    {
        Err(NotRaw)
    }

    reject! {
        serialize_bool(bool) -> u8;
        serialize_i8(i8) -> u8;
        serialize_i16(i16) -> u8;
        serialize_i32(i32) -> u8;
        serialize_i64(i64) -> u8;
        serialize_u16(u16) -> u8;
        serialize_u32(u32) -> u8;
        serialize_u64(u64) -> u8;
        serialize_f32(f32) -> u8;
        serialize_f64(f64) -> u8;
        serialize_char(char) -> u8;
        serialize_str(&str) -> u8;
        serialize_bytes(&[u8]) -> u8;
        serialize_none() -> u8;
        serialize_unit() -> u8;
        serialize_unit_struct(&'static str) -> u8;
        serialize_unit_variant(&'static str, u32, &'static str) -> u8;
        serialize_seq(Option<usize>) -> Self::SerializeSeq;
        serialize_tuple(usize) -> Self::SerializeTuple;
        serialize_tuple_struct(&'static str, usize) -> Self::SerializeTupleStruct;
        serialize_tuple_variant(&'static str, u32, &'static str, usize) ->
            Self::SerializeTupleVariant;
        serialize_map(Option<usize>) -> Self::SerializeMap;
        serialize_struct(&'static str, usize) -> Self::SerializeStruct;
        serialize_struct_variant(&'static str, u32, &'static str, usize) ->
            Self::SerializeStructVariant;
    }
}

/// Result of matching a response body against the registered targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// No target for this status, or the body was empty
    Skipped,
    /// A target was populated from the given tier
    Saturated(TargetSlot),
    /// A target exists but the response is not JSON
    Mismatch,
}

/// Decode `body` into the target registered for `status`, if any.
///
/// # Errors
/// Returns [`OutboundError::Decode`] when a JSON body does not match the target.
pub fn decode(
    body: &[u8],
    content_type: Option<&str>,
    status: StatusCode,
    targets: &DecodeTargets,
) -> Result<Decoded, OutboundError> {
    let Some((slot, target)) = targets.resolve(status) else {
        return Ok(Decoded::Skipped);
    };
    if body.is_empty() {
        return Ok(Decoded::Skipped);
    }
    if !is_json_content_type(content_type) {
        return Ok(Decoded::Mismatch);
    }

    target
        .saturate(body)
        .map_err(|source| OutboundError::Decode { status, source })?;
    Ok(Decoded::Saturated(slot))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::saturate::Saturation;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Pet {
        name: String,
        color: String,
    }

    fn scruffy() -> Pet {
        Pet {
            name: "Scruffy".to_owned(),
            color: "Orange".to_owned(),
        }
    }

    #[test]
    fn test_json_content_type_detection() {
        assert!(is_json_content_type(None));
        assert!(is_json_content_type(Some("")));
        assert!(is_json_content_type(Some("application/json")));
        assert!(is_json_content_type(Some("Application/JSON; charset=utf-8")));
        assert!(is_json_content_type(Some("application/problem+json")));
        assert!(!is_json_content_type(Some("text/html")));
        assert!(!is_json_content_type(Some("application/octet-stream")));
        assert!(!is_json_content_type(Some("application/jsonp")));
    }

    #[test]
    fn test_encode_json() {
        let bytes = encode(&scruffy(), None).unwrap();
        let decoded: Pet = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, scruffy());
    }

    #[test]
    fn test_encode_raw_string_and_bytes() {
        let bytes = encode("plain text", Some("text/plain")).unwrap();
        assert_eq!(&bytes[..], b"plain text");

        let raw: Vec<u8> = vec![0, 1, 254, 255];
        let bytes = encode(&raw, Some("application/octet-stream")).unwrap();
        assert_eq!(&bytes[..], &[0, 1, 254, 255]);

        let bytes = encode(&Bytes::from_static(b"abc"), Some("application/octet-stream")).unwrap();
        assert_eq!(&bytes[..], b"abc");
    }

    #[test]
    fn test_encode_rejects_structured_payload_for_raw_content_type() {
        let err = encode(&scruffy(), Some("text/plain")).unwrap_err();
        assert!(matches!(
            err,
            OutboundError::UnsupportedPayload { ref content_type } if content_type == "text/plain"
        ));

        let err = encode(&vec![1_u16, 300], Some("application/octet-stream")).unwrap_err();
        assert!(matches!(err, OutboundError::UnsupportedPayload { .. }));
    }

    #[derive(Serialize)]
    enum Colour {
        Orange,
    }

    #[test]
    fn test_encode_rejects_byte_lookalikes_for_raw_content_type() {
        let octets = Some("application/octet-stream");
        let unsupported = |result: Result<Bytes, OutboundError>| {
            matches!(result, Err(OutboundError::UnsupportedPayload { .. }))
        };

        // Small integers of a wider type are not bytes
        assert!(unsupported(encode(&vec![1_u32, 2, 3], octets)));
        assert!(unsupported(encode(&Colour::Orange, Some("text/plain"))));
        assert!(unsupported(encode(&Vec::<Pet>::new(), octets)));
        assert!(unsupported(encode(&Some("text".to_owned()), Some("text/plain"))));
        assert!(unsupported(encode(&'x', Some("text/plain"))));
        assert!(unsupported(encode(&42_u8, octets)));
    }

    #[test]
    fn test_encode_raw_arrays_and_empty_bodies() {
        let bytes = encode(&[7_u8, 8, 9], Some("application/octet-stream")).unwrap();
        assert_eq!(&bytes[..], &[7, 8, 9]);

        let bytes = encode(&b"slice"[..], Some("application/octet-stream")).unwrap();
        assert_eq!(&bytes[..], b"slice");

        assert!(encode("", Some("text/plain")).unwrap().is_empty());
        assert!(encode(&Bytes::new(), Some("application/octet-stream")).unwrap().is_empty());
    }

    #[test]
    fn test_decode_populates_resolved_target() {
        let success = Saturation::<Pet>::new();
        let mut targets = DecodeTargets::default();
        targets.set_success(Arc::new(success.clone()));

        let body = serde_json::to_vec(&scruffy()).unwrap();
        let decoded = decode(&body, Some("application/json"), StatusCode::OK, &targets).unwrap();

        assert_eq!(decoded, Decoded::Saturated(TargetSlot::Success));
        assert_eq!(success.take(), Some(scruffy()));
    }

    #[test]
    fn test_decode_skips_empty_body_and_missing_target() {
        let success = Saturation::<Pet>::new();
        let mut targets = DecodeTargets::default();
        targets.set_success(Arc::new(success.clone()));

        assert_eq!(
            decode(b"", None, StatusCode::OK, &targets).unwrap(),
            Decoded::Skipped
        );
        assert_eq!(
            decode(b"{}", None, StatusCode::NOT_FOUND, &targets).unwrap(),
            Decoded::Skipped
        );
        assert!(!success.is_saturated());
    }

    #[test]
    fn test_decode_reports_mismatch_for_non_json() {
        let mut targets = DecodeTargets::default();
        targets.set_success(Arc::new(Saturation::<Pet>::new()));

        let decoded =
            decode(b"<this is html>", Some("text/html"), StatusCode::OK, &targets).unwrap();
        assert_eq!(decoded, Decoded::Mismatch);
    }

    #[test]
    fn test_decode_error_carries_status() {
        let mut targets = DecodeTargets::default();
        targets.set_error(Arc::new(Saturation::<Pet>::new()));

        let err = decode(b"not json", None, StatusCode::BAD_GATEWAY, &targets).unwrap_err();
        assert!(matches!(
            err,
            OutboundError::Decode { status, .. } if status == StatusCode::BAD_GATEWAY
        ));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
