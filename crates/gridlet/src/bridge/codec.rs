//! Payload codec for proxy traffic.
//!
//! The codec owns only the interior structured payload (JSON). Delimiting is
//! the transport's job: the link layer wraps payloads in a 4-byte
//! length-prefixed frame via [`frame_codec`].

use std::io;

use serde::Serialize;
use serde::ser;
use serde_json::Value;
use tokio_util::bytes::Bytes;
use tokio_util::codec::LengthDelimitedCodec;

use super::protocol::Message;

/// Default cap on a single frame accepted or produced by a link.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Encode a message into its wire payload.
pub fn encode(message: &Message) -> io::Result<Bytes> {
    let json = serde_json::to_vec(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Bytes::from(json))
}

/// Decode a wire payload into a message.
///
/// Unknown `type`/`push` discriminators fail here; the proxy turns that into
/// a defined reject reply when the frame still carries an id.
pub fn decode(payload: &[u8]) -> io::Result<Message> {
    serde_json::from_slice(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Check a value against the wire-representable domain and convert it.
///
/// The domain is the JSON value closure: scalars, ordered sequences, and
/// string-keyed mappings, arbitrarily nested. Non-finite floats and
/// non-string map keys are rejected. The float check is a separate pass
/// through [`FiniteCheck`]: `serde_json::to_value` quietly turns NaN and
/// the infinities into `null` instead of failing.
pub fn wire_value<V: Serialize>(val: V) -> Result<Value, serde_json::Error> {
    val.serialize(FiniteCheck)?;
    serde_json::to_value(val)
}

/// Check an argument list against the wire domain.
///
/// Arguments are positional on the wire, so the value must serialize to a
/// sequence.
pub fn wire_args<A: Serialize>(args: A) -> Result<Vec<Value>, serde_json::Error> {
    use serde::ser::Error as _;

    args.serialize(FiniteCheck)?;
    match serde_json::to_value(args)? {
        Value::Array(items) => Ok(items),
        other => Err(serde_json::Error::custom(format!(
            "argument list must serialize to a sequence, got {}",
            kind_name(&other)
        ))),
    }
}

/// Serializer that walks a value and fails on floats JSON cannot carry.
///
/// Produces nothing; everything except a non-finite float passes. Range and
/// key-type errors stay with the real conversion in `serde_json::to_value`.
#[derive(Clone, Copy)]
struct FiniteCheck;

fn non_finite_error() -> serde_json::Error {
    ser::Error::custom("non-finite number is not representable")
}

impl ser::Serializer for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_f32(self, v: f32) -> Result<(), Self::Error> {
        if v.is_finite() { Ok(()) } else { Err(non_finite_error()) }
    }

    fn serialize_f64(self, v: f64) -> Result<(), Self::Error> {
        if v.is_finite() { Ok(()) } else { Err(non_finite_error()) }
    }

    fn serialize_bool(self, _v: bool) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i8(self, _v: i8) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i16(self, _v: i16) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i32(self, _v: i32) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i64(self, _v: i64) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i128(self, _v: i128) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u8(self, _v: u8) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u16(self, _v: u16) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u32(self, _v: u32) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u64(self, _v: u64) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u128(self, _v: u128) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_char(self, _v: char) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_str(self, _v: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_none(self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_some<T>(self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_newtype_struct<T>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, Self::Error> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_key<T>(&mut self, key: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        key.serialize(*self)
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T>(&mut self, _key: &'static str, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T>(&mut self, _key: &'static str, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

/// Length-delimited framing used on both halves of a link.
pub fn frame_codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_len)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Outcome, PushOp};
    use serde_json::json;
    use tokio_util::bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn payload_roundtrip() {
        let msg = Message::Push {
            op: PushOp::Status {
                module: "mod_111".into(),
                stat: "level".into(),
                val: json!(7),
            },
            id: "1".into(),
        };
        let payload = encode(&msg).unwrap();
        assert_eq!(decode(&payload).unwrap(), msg);
    }

    #[test]
    fn decode_garbage_is_invalid_data() {
        let err = decode(b"not json at all").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn wire_value_accepts_json_closure() {
        let val = wire_value(json!({"a": [1, 2.5, "x", null], "b": {"c": true}})).unwrap();
        assert!(val.is_object());
    }

    #[test]
    fn wire_value_rejects_non_finite_floats() {
        assert!(wire_value(f64::NAN).is_err());
        assert!(wire_value(f64::INFINITY).is_err());
        assert!(wire_value(f32::NEG_INFINITY).is_err());
    }

    #[test]
    fn wire_value_rejects_nested_non_finite_floats() {
        assert!(wire_value(vec![1.0, f64::NAN]).is_err());

        let mut map = std::collections::HashMap::new();
        map.insert("depth", vec![f64::INFINITY]);
        assert!(wire_value(map).is_err());
    }

    #[test]
    fn wire_args_rejects_non_finite_elements() {
        assert!(wire_args(vec![f64::NAN]).is_err());
        assert!(wire_args((1, "ok", f64::INFINITY)).is_err());
    }

    #[test]
    fn wire_args_requires_sequence() {
        assert_eq!(wire_args(vec![1, 2, 3]).unwrap(), vec![json!(1), json!(2), json!(3)]);
        assert!(wire_args(json!({"not": "a list"})).is_err());
        assert!(wire_args("bare string").is_err());
    }

    #[test]
    fn frame_roundtrip() {
        let mut codec = frame_codec(DEFAULT_MAX_FRAME_LEN);
        let mut buf = BytesMut::new();

        let msg = Message::Resp {
            id: "9".into(),
            outcome: Outcome::Resolve(json!("ok")),
        };
        let payload = encode(&msg).unwrap();
        codec.encode(payload, &mut buf).unwrap();

        let framed = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decode(&framed).unwrap(), msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_decode_is_incremental() {
        let mut codec = frame_codec(DEFAULT_MAX_FRAME_LEN);
        let mut buf = BytesMut::new();

        let msg = Message::Expire {
            sys: "sys_9".into(),
            id: "2".into(),
        };
        let mut full = BytesMut::new();
        codec.encode(encode(&msg).unwrap(), &mut full).unwrap();

        // Feed all but the last byte: no frame yet.
        let last = full.split_off(full.len() - 1);
        buf.extend_from_slice(&full);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&last);
        let framed = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decode(&framed).unwrap(), msg);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = frame_codec(16);
        let mut buf = BytesMut::new();
        // 4-byte length prefix claiming a frame past the cap.
        buf.extend_from_slice(&(1024u32).to_be_bytes());
        buf.extend_from_slice(&[0u8; 64]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
