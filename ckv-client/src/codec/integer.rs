//! Integer passthrough.
//!
//! Integers are stored as plain decimal text so server-side INCR/DECR keep
//! working on values written through the codec. [`as_integer`] detects them
//! with a serializer that accepts nothing but integers; [`decode_integer`]
//! reads decimal text back into any type that deserializes from an integer.

use std::fmt;

use serde::de::value::{I64Deserializer, U64Deserializer};
use serde::de::{DeserializeOwned, IntoDeserializer};
use serde::ser::{self, Impossible, Serialize};

/// Decimal text of `value` when it serializes as a plain integer.
pub fn as_integer<T: Serialize + ?Sized>(value: &T) -> Option<Vec<u8>> {
    value.serialize(IntegerProbe).ok()
}

/// Reads ASCII decimal integers. Returns `None` for anything else, or when
/// `T` does not accept an integer.
pub fn decode_integer<T: DeserializeOwned>(data: &[u8]) -> Option<T> {
    if !is_decimal(data) {
        return None;
    }
    let text = std::str::from_utf8(data).ok()?;
    if let Ok(v) = text.parse::<i64>() {
        let de: I64Deserializer<serde::de::value::Error> = v.into_deserializer();
        return T::deserialize(de).ok();
    }
    let v = text.parse::<u64>().ok()?;
    let de: U64Deserializer<serde::de::value::Error> = v.into_deserializer();
    T::deserialize(de).ok()
}

fn is_decimal(data: &[u8]) -> bool {
    let digits = data.strip_prefix(b"-").unwrap_or(data);
    !digits.is_empty() && digits.len() <= 20 && digits.iter().all(u8::is_ascii_digit)
}

#[derive(Debug)]
struct NotInteger;

impl fmt::Display for NotInteger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("not an integer")
    }
}

impl std::error::Error for NotInteger {}

impl ser::Error for NotInteger {
    fn custom<M: fmt::Display>(_msg: M) -> Self {
        NotInteger
    }
}

struct IntegerProbe;

type Reject = Impossible<Vec<u8>, NotInteger>;

impl ser::Serializer for IntegerProbe {
    type Ok = Vec<u8>;
    type Error = NotInteger;
    type SerializeSeq = Reject;
    type SerializeTuple = Reject;
    type SerializeTupleStruct = Reject;
    type SerializeTupleVariant = Reject;
    type SerializeMap = Reject;
    type SerializeStruct = Reject;
    type SerializeStructVariant = Reject;

    fn serialize_i8(self, v: i8) -> Result<Vec<u8>, NotInteger> {
        self.serialize_i64(v as i64)
    }
    fn serialize_i16(self, v: i16) -> Result<Vec<u8>, NotInteger> {
        self.serialize_i64(v as i64)
    }
    fn serialize_i32(self, v: i32) -> Result<Vec<u8>, NotInteger> {
        self.serialize_i64(v as i64)
    }
    fn serialize_i64(self, v: i64) -> Result<Vec<u8>, NotInteger> {
        Ok(v.to_string().into_bytes())
    }
    fn serialize_u8(self, v: u8) -> Result<Vec<u8>, NotInteger> {
        self.serialize_u64(v as u64)
    }
    fn serialize_u16(self, v: u16) -> Result<Vec<u8>, NotInteger> {
        self.serialize_u64(v as u64)
    }
    fn serialize_u32(self, v: u32) -> Result<Vec<u8>, NotInteger> {
        self.serialize_u64(v as u64)
    }
    fn serialize_u64(self, v: u64) -> Result<Vec<u8>, NotInteger> {
        Ok(v.to_string().into_bytes())
    }
    // Transparent wrappers around an integer still count.
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Vec<u8>, NotInteger> {
        value.serialize(self)
    }

    fn serialize_bool(self, _v: bool) -> Result<Vec<u8>, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_f32(self, _v: f32) -> Result<Vec<u8>, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_f64(self, _v: f64) -> Result<Vec<u8>, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_char(self, _v: char) -> Result<Vec<u8>, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_str(self, _v: &str) -> Result<Vec<u8>, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_bytes(self, _v: &[u8]) -> Result<Vec<u8>, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_none(self) -> Result<Vec<u8>, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> Result<Vec<u8>, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_unit(self) -> Result<Vec<u8>, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_unit_struct(self, _name: &'static str) -> Result<Vec<u8>, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<Vec<u8>, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<Vec<u8>, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_seq(self, _len: Option<usize>) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_tuple(self, _len: usize) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_map(self, _len: Option<usize>) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }
    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Reject, NotInteger> {
        Err(NotInteger)
    }
}
