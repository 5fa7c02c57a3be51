//! The binary array codec.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{CodecError, TypeCodec, TypeRegistry};
use crate::{
    postgres::{Oid, PgFormat, oid},
    value::Value,
};

pub(super) fn register(registry: &mut TypeRegistry) {
    // binary only; a missing text capability falls back to binary transfer
    let codec = TypeCodec {
        decode_text: None,
        encode_text: None,
        decode_binary: Some(array_from_binary),
        encode_binary: Some(array_to_binary),
    };
    for array_oid in [
        oid::BOOL_ARRAY,
        oid::BYTEA_ARRAY,
        oid::INT2_ARRAY,
        oid::INT4_ARRAY,
        oid::INT8_ARRAY,
        oid::TEXT_ARRAY,
        oid::DATE_ARRAY,
        oid::TIME_ARRAY,
        oid::TIMESTAMP_ARRAY,
        oid::TIMESTAMPTZ_ARRAY,
        oid::NUMERIC_ARRAY,
    ] {
        registry.register(array_oid, codec);
    }
}

/// One array dimension: element count plus lower bound index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgArrayDim {
    pub len: i32,
    pub lower_bound: i32,
}

/// A decoded postgres array of any dimensionality.
///
/// The header flag and dimension bounds are kept as received so that
/// re-encoding reproduces the wire bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct PgArray {
    /// Oid of the element type.
    pub element_oid: Oid,
    /// The `hasnull` header flag.
    pub has_null: bool,
    pub dims: Vec<PgArrayDim>,
    /// Elements in row-major order.
    pub elements: Vec<Value>,
}

impl PgArray {
    /// A one dimensional array with the server's default lower bound of 1.
    pub fn from_values(element_oid: Oid, elements: Vec<Value>) -> Self {
        Self {
            element_oid,
            has_null: elements.iter().any(Value::is_null),
            dims: vec![PgArrayDim { len: elements.len() as i32, lower_bound: 1 }],
            elements,
        }
    }

    /// Total number of elements across all dimensions.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Header `(ndim, hasnull, element oid)`, then `(size, lower bound)` per
/// dimension, then length-prefixed element payloads.
fn array_from_binary(registry: &TypeRegistry, _: Oid, mut bytes: Bytes) -> Result<Value, CodecError> {
    if bytes.remaining() < 12 {
        return Err(CodecError::length("array header", 12, bytes.remaining()));
    }
    let ndim = bytes.get_i32();
    let has_null = bytes.get_i32() != 0;
    let element_oid = bytes.get_u32();

    if !(0..=6).contains(&ndim) {
        return Err(CodecError::invalid("array dimension count out of range"));
    }
    if bytes.remaining() < ndim as usize * 8 {
        return Err(CodecError::length("array dims", ndim as usize * 8, bytes.remaining()));
    }

    let mut dims = Vec::with_capacity(ndim as usize);
    let mut total = if ndim == 0 { 0usize } else { 1usize };
    for _ in 0..ndim {
        let dim = PgArrayDim { len: bytes.get_i32(), lower_bound: bytes.get_i32() };
        if dim.len < 0 {
            return Err(CodecError::invalid("negative array dimension"));
        }
        total = total.saturating_mul(dim.len as usize);
        dims.push(dim);
    }

    let mut elements = Vec::with_capacity(total.min(4096));
    for _ in 0..total {
        if bytes.remaining() < 4 {
            return Err(CodecError::length("array element", 4, bytes.remaining()));
        }
        let len = bytes.get_i32();
        let value = match len {
            -1 => None,
            len if len < 0 => return Err(CodecError::invalid("negative array element length")),
            len => {
                if bytes.remaining() < len as usize {
                    return Err(CodecError::length("array element", len as usize, bytes.remaining()));
                }
                Some(bytes.split_to(len as usize))
            }
        };
        elements.push(registry.decode(element_oid, PgFormat::Binary, value)?);
    }

    Ok(Value::Array(PgArray { element_oid, has_null, dims, elements }))
}

fn array_to_binary(registry: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    let Value::Array(array) = value else {
        return Err(CodecError::invalid("array codec got a non-array value"));
    };

    buf.put_i32(array.dims.len() as i32);
    buf.put_i32(array.has_null as i32);
    buf.put_u32(array.element_oid);
    for dim in &array.dims {
        buf.put_i32(dim.len);
        buf.put_i32(dim.lower_bound);
    }

    let mut payload = BytesMut::new();
    for element in &array.elements {
        if element.is_null() {
            buf.put_i32(-1);
            continue;
        }
        payload.clear();
        registry.encode(element, PgFormat::Binary, &mut payload)?;
        buf.put_i32(payload.len() as i32);
        buf.put_slice(&payload);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn int4_array_round_trip() {
        let registry = TypeRegistry::new();
        let array = PgArray::from_values(
            oid::INT4,
            vec![Value::Int4(1), Value::Null, Value::Int4(-3)],
        );
        assert!(array.has_null);

        let mut buf = BytesMut::new();
        registry
            .encode(&Value::Array(array.clone()), PgFormat::Binary, &mut buf)
            .unwrap();

        let decoded = registry
            .decode(oid::INT4_ARRAY, PgFormat::Binary, Some(buf.freeze()))
            .unwrap();
        assert_eq!(decoded, Value::Array(array));
    }

    #[test]
    fn empty_array() {
        let registry = TypeRegistry::new();
        // ndim 0, hasnull 0, element oid
        let mut wire = BytesMut::new();
        wire.put_i32(0);
        wire.put_i32(0);
        wire.put_u32(oid::TEXT);
        let decoded = registry
            .decode(oid::TEXT_ARRAY, PgFormat::Binary, Some(wire.freeze()))
            .unwrap();
        let Value::Array(array) = decoded else { panic!("expected array") };
        assert!(array.is_empty());
        assert_eq!(array.element_oid, oid::TEXT);
    }

    #[test]
    fn nested_element_decoding_goes_through_the_registry() {
        let registry = TypeRegistry::new();
        let array = PgArray::from_values(
            oid::TEXT,
            vec![Value::Text("a".into()), Value::Text("bc".into())],
        );
        let mut buf = BytesMut::new();
        registry
            .encode(&Value::Array(array.clone()), PgFormat::Binary, &mut buf)
            .unwrap();
        let decoded = registry
            .decode(oid::TEXT_ARRAY, PgFormat::Binary, Some(buf.freeze()))
            .unwrap();
        assert_eq!(decoded, Value::Array(array));
    }

    #[test]
    fn truncated_array_refuses() {
        let registry = TypeRegistry::new();
        let mut wire = BytesMut::new();
        wire.put_i32(1);
        wire.put_i32(0);
        wire.put_u32(oid::INT4);
        wire.put_i32(2); // len 2
        wire.put_i32(1); // lower bound
        wire.put_i32(4);
        wire.put_i32(42);
        // second element missing
        let r = registry.decode(oid::INT4_ARRAY, PgFormat::Binary, Some(wire.freeze()));
        assert!(r.is_err());
    }
}
