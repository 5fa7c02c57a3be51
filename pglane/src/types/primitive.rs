//! Codecs for booleans, integers, text and bytea.
use bytes::{BufMut, Bytes, BytesMut};

use super::{CodecError, TypeCodec, TypeRegistry, fixed, utf8};
use crate::{
    common::ByteStr,
    postgres::{Oid, oid},
    value::Value,
};

pub(super) fn register(registry: &mut TypeRegistry) {
    registry.register(oid::BOOL, TypeCodec {
        decode_text: Some(bool_from_text),
        encode_text: Some(bool_to_text),
        decode_binary: Some(bool_from_binary),
        encode_binary: Some(bool_to_binary),
    });

    macro_rules! int {
        ($oid:expr, $from_text:ident, $to_text:ident, $from_bin:ident, $to_bin:ident) => {
            registry.register($oid, TypeCodec {
                decode_text: Some($from_text),
                encode_text: Some($to_text),
                decode_binary: Some($from_bin),
                encode_binary: Some($to_bin),
            });
        };
    }

    int!(oid::INT2, int2_from_text, int_to_text, int2_from_binary, int2_to_binary);
    int!(oid::INT4, int4_from_text, int_to_text, int4_from_binary, int4_to_binary);
    int!(oid::INT8, int8_from_text, int_to_text, int8_from_binary, int8_to_binary);

    let text = TypeCodec {
        decode_text: Some(text_from_wire),
        encode_text: Some(text_to_wire),
        decode_binary: Some(text_from_wire),
        encode_binary: Some(text_to_wire),
    };
    registry.register(oid::TEXT, text);
    registry.register(oid::VARCHAR, text);
    registry.register(oid::BPCHAR, text);

    registry.register(oid::BYTEA, TypeCodec {
        decode_text: Some(bytea_from_text),
        encode_text: Some(bytea_to_text),
        decode_binary: Some(bytea_from_binary),
        encode_binary: Some(bytea_to_binary),
    });
}

// ===== bool =====

fn bool_from_text(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    match utf8(&bytes)? {
        "t" | "true" => Ok(Value::Bool(true)),
        "f" | "false" => Ok(Value::Bool(false)),
        other => Err(CodecError::parse("bool", other)),
    }
}

fn bool_to_text(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    match value {
        Value::Bool(true) => buf.put_u8(b't'),
        Value::Bool(false) => buf.put_u8(b'f'),
        _ => return Err(CodecError::invalid("bool codec got a non-bool value")),
    }
    Ok(())
}

fn bool_from_binary(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    match fixed::<1>("bool", &bytes)? {
        [0] => Ok(Value::Bool(false)),
        [1] => Ok(Value::Bool(true)),
        _ => Err(CodecError::invalid("bool byte out of range")),
    }
}

fn bool_to_binary(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    match value {
        Value::Bool(v) => buf.put_u8(*v as u8),
        _ => return Err(CodecError::invalid("bool codec got a non-bool value")),
    }
    Ok(())
}

// ===== integers =====

macro_rules! int_impl {
    ($from_text:ident, $from_bin:ident, $to_bin:ident, $ty:ty, $variant:ident, $what:literal) => {
        fn $from_text(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
            let text = utf8(&bytes)?;
            text.parse::<$ty>()
                .map(Value::$variant)
                .map_err(|_| CodecError::parse($what, text))
        }

        fn $from_bin(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
            Ok(Value::$variant(<$ty>::from_be_bytes(fixed($what, &bytes)?)))
        }

        fn $to_bin(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
            match value {
                Value::$variant(v) => buf.put_slice(&v.to_be_bytes()),
                _ => return Err(CodecError::invalid(concat!($what, " codec got a mismatched value"))),
            }
            Ok(())
        }
    };
}

int_impl!(int2_from_text, int2_from_binary, int2_to_binary, i16, Int2, "int2");
int_impl!(int4_from_text, int4_from_binary, int4_to_binary, i32, Int4, "int4");
int_impl!(int8_from_text, int8_from_binary, int8_to_binary, i64, Int8, "int8");

fn int_to_text(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    let mut itoa = itoa::Buffer::new();
    let text = match value {
        Value::Int2(v) => itoa.format(*v),
        Value::Int4(v) => itoa.format(*v),
        Value::Int8(v) => itoa.format(*v),
        _ => return Err(CodecError::invalid("integer codec got a mismatched value")),
    };
    buf.put_slice(text.as_bytes());
    Ok(())
}

// ===== text =====

fn text_from_wire(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    ByteStr::from_utf8(bytes).map(Value::Text).map_err(|_| CodecError::Utf8)
}

fn text_to_wire(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    match value {
        Value::Text(v) => buf.put_slice(v.as_bytes()),
        _ => return Err(CodecError::invalid("text codec got a non-text value")),
    }
    Ok(())
}

// ===== bytea =====

fn bytea_from_binary(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    Ok(Value::Bytea(bytes))
}

fn bytea_to_binary(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    match value {
        Value::Bytea(v) => buf.put_slice(v),
        _ => return Err(CodecError::invalid("bytea codec got a non-bytea value")),
    }
    Ok(())
}

/// The decoder accepts both output forms, hex (`\x...`) and escape
/// (`\\` and `\nnn` octal); the encoder always emits hex.
fn bytea_from_text(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let text = utf8(&bytes)?;

    if let Some(hex_digits) = text.strip_prefix("\\x") {
        return hex::decode(hex_digits)
            .map(|v| Value::Bytea(v.into()))
            .map_err(|_| CodecError::parse("bytea", text));
    }

    let mut out = Vec::with_capacity(text.len());
    let mut rest = text.as_bytes();
    while let Some((byte, tail)) = rest.split_first() {
        if *byte != b'\\' {
            out.push(*byte);
            rest = tail;
            continue;
        }
        match tail {
            [b'\\', tail @ ..] => {
                out.push(b'\\');
                rest = tail;
            }
            [a @ b'0'..=b'3', b @ b'0'..=b'7', c @ b'0'..=b'7', tail @ ..] => {
                out.push((*a - b'0') * 64 + (*b - b'0') * 8 + (*c - b'0'));
                rest = tail;
            }
            _ => return Err(CodecError::parse("bytea", text)),
        }
    }
    Ok(Value::Bytea(out.into()))
}

fn bytea_to_text(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    match value {
        Value::Bytea(v) => {
            buf.put_slice(b"\\x");
            buf.put_slice(hex::encode(v).as_bytes());
        }
        _ => return Err(CodecError::invalid("bytea codec got a non-bytea value")),
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::PgFormat;

    fn registry() -> TypeRegistry {
        TypeRegistry::new()
    }

    fn decode(oid: Oid, format: PgFormat, bytes: &'static [u8]) -> Value {
        registry()
            .decode(oid, format, Some(Bytes::from_static(bytes)))
            .unwrap()
    }

    fn encode(value: &Value, format: PgFormat) -> Vec<u8> {
        let mut buf = BytesMut::new();
        registry().encode(value, format, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn bool_wire_forms() {
        assert_eq!(decode(oid::BOOL, PgFormat::Binary, &[1]), Value::Bool(true));
        assert_eq!(decode(oid::BOOL, PgFormat::Text, b"f"), Value::Bool(false));
        assert_eq!(encode(&Value::Bool(true), PgFormat::Text), b"t");
        assert_eq!(encode(&Value::Bool(false), PgFormat::Binary), [0]);
    }

    #[test]
    fn integer_wire_forms() {
        assert_eq!(decode(oid::INT2, PgFormat::Binary, &[0xff, 0xfe]), Value::Int2(-2));
        assert_eq!(decode(oid::INT4, PgFormat::Binary, &[0, 0, 0, 42]), Value::Int4(42));
        assert_eq!(
            decode(oid::INT8, PgFormat::Binary, &[0, 0, 0, 0, 0, 0, 1, 0]),
            Value::Int8(256)
        );
        assert_eq!(decode(oid::INT4, PgFormat::Text, b"-17"), Value::Int4(-17));
        assert_eq!(encode(&Value::Int8(-1), PgFormat::Text), b"-1");
        assert_eq!(encode(&Value::Int4(1), PgFormat::Binary), [0, 0, 0, 1]);

        // truncated payloads refuse
        let r = registry().decode(oid::INT4, PgFormat::Binary, Some(Bytes::from_static(&[0, 1])));
        assert!(r.is_err());
    }

    #[test]
    fn bytea_accepts_both_text_forms() {
        assert_eq!(
            decode(oid::BYTEA, PgFormat::Text, b"\\x01ff"),
            Value::Bytea(Bytes::from_static(&[0x01, 0xff]))
        );
        assert_eq!(
            decode(oid::BYTEA, PgFormat::Text, b"a\\\\b\\001"),
            Value::Bytea(Bytes::from_static(&[b'a', b'\\', b'b', 1]))
        );
        // the encoder always emits hex
        assert_eq!(
            encode(&Value::Bytea(Bytes::from_static(&[0x01, 0xff])), PgFormat::Text),
            b"\\x01ff"
        );
    }

    #[test]
    fn text_is_utf8_only() {
        assert_eq!(decode(oid::TEXT, PgFormat::Text, b"foo"), Value::Text("foo".into()));
        let r = registry().decode(
            oid::TEXT,
            PgFormat::Text,
            Some(Bytes::from_static(&[0xff, 0xfe])),
        );
        assert!(matches!(r, Err(CodecError::Utf8)));
    }
}
