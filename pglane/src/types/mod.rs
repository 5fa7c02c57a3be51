//! Type registry and value codecs.
//!
//! Every wire field is `(oid, format code, bytes)`. The registry maps an
//! oid to up to four codec capabilities, text and binary in each direction,
//! as a table rather than dynamic dispatch chains. A field whose oid or
//! format has no registered codec is surfaced as [`Value::Raw`] with its
//! metadata; higher layers may refuse it.
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet};

use crate::{
    postgres::{Oid, PgFormat},
    temporal::TemporalError,
    value::Value,
};

mod primitive;
mod numeric;
mod temporal;
mod array;

pub use numeric::{PgNumeric, PgNumericSign};
pub use array::PgArray;

/// An error when a registered codec refuses bytes.
///
/// A codec error fails the row (or the bind), the connection is undamaged.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{what} payload must be {expect} bytes, got {got}")]
    Length {
        what: &'static str,
        expect: usize,
        got: usize,
    },
    #[error("invalid {what} text: {text:?}")]
    Parse { what: &'static str, text: String },
    #[error(transparent)]
    Temporal(#[from] TemporalError),
    #[error("no {direction} codec registered for oid {oid}")]
    Unsupported { oid: Oid, direction: &'static str },
    #[error("field is not valid utf8")]
    Utf8,
    #[error("unexpected NULL value")]
    Null,
    #[error("{what}")]
    Invalid { what: &'static str },
}

impl CodecError {
    pub(crate) fn length(what: &'static str, expect: usize, got: usize) -> Self {
        Self::Length { what, expect, got }
    }

    pub(crate) fn parse(what: &'static str, text: &str) -> Self {
        Self::Parse { what, text: text.into() }
    }

    pub(crate) fn invalid(what: &'static str) -> Self {
        Self::Invalid { what }
    }
}

/// Decode wire bytes into a [`Value`].
///
/// The registry is passed through for composite codecs (arrays) which
/// decode their elements recursively.
pub type DecodeFn = fn(&TypeRegistry, Oid, Bytes) -> Result<Value, CodecError>;

/// Encode a [`Value`] into wire bytes.
pub type EncodeFn = fn(&TypeRegistry, &Value, &mut BytesMut) -> Result<(), CodecError>;

/// Codec capability set for one oid.
///
/// Any capability may be absent; transfer then falls back to the text
/// format, and decoding an absent direction surfaces [`Value::Raw`].
#[derive(Default, Clone, Copy)]
pub struct TypeCodec {
    pub decode_text: Option<DecodeFn>,
    pub encode_text: Option<EncodeFn>,
    pub decode_binary: Option<DecodeFn>,
    pub encode_binary: Option<EncodeFn>,
}

/// The per-connection oid to codec table.
///
/// Immutable after the connection handshake; the adapter may share one
/// registry across connections behind [`Arc`][std::sync::Arc].
pub struct TypeRegistry {
    codecs: HashMap<Oid, TypeCodec>,
    /// Oids whose parameters are transferred binary.
    binary_params: HashSet<Oid>,
}

impl TypeRegistry {
    /// Registry with every builtin codec and text-by-default parameters.
    pub fn new() -> Self {
        let mut me = Self {
            codecs: HashMap::new(),
            binary_params: HashSet::new(),
        };

        primitive::register(&mut me);
        numeric::register(&mut me);
        temporal::register(&mut me);
        array::register(&mut me);

        me
    }

    /// Register or replace the codec for an oid.
    pub fn register(&mut self, oid: Oid, codec: TypeCodec) {
        self.codecs.insert(oid, codec);
    }

    /// Apply the binary transfer policy sets.
    ///
    /// `disable` overrides `enable`. Oids outside `enable` keep the text
    /// default.
    pub fn configure_binary(&mut self, enable: &[Oid], disable: &[Oid]) {
        self.binary_params.extend(enable);
        for oid in disable {
            self.binary_params.remove(oid);
        }
    }

    fn codec(&self, oid: Oid) -> Option<&TypeCodec> {
        self.codecs.get(&oid)
    }

    /// Decode one field.
    ///
    /// `None` bytes is the wire's length -1, SQL `NULL`. Unknown oids and
    /// missing capabilities fall back to [`Value::Raw`].
    pub fn decode(
        &self,
        oid: Oid,
        format: PgFormat,
        bytes: Option<Bytes>,
    ) -> Result<Value, CodecError> {
        let Some(bytes) = bytes else {
            return Ok(Value::Null);
        };
        let decode = self.codec(oid).and_then(|c| match format {
            PgFormat::Text => c.decode_text,
            PgFormat::Binary => c.decode_binary,
        });
        match decode {
            Some(decode) => decode(self, oid, bytes),
            None => Ok(Value::Raw { oid, format, bytes }),
        }
    }

    /// Encode one parameter value in the requested format.
    ///
    /// `Null` never reaches a codec; the caller writes length -1 instead.
    /// [`Value::Raw`] passes through unchanged when the format matches.
    pub fn encode(
        &self,
        value: &Value,
        format: PgFormat,
        buf: &mut BytesMut,
    ) -> Result<(), CodecError> {
        if let Value::Raw { format: raw_format, bytes, oid } = value {
            if *raw_format != format {
                return Err(CodecError::Unsupported {
                    oid: *oid,
                    direction: "re-encode",
                });
            }
            buf.extend_from_slice(bytes);
            return Ok(());
        }

        let oid = value.oid();
        let encode = self.codec(oid).and_then(|c| match format {
            PgFormat::Text => c.encode_text,
            PgFormat::Binary => c.encode_binary,
        });
        match encode {
            Some(encode) => encode(self, value, buf),
            None => Err(CodecError::Unsupported {
                oid,
                direction: match format {
                    PgFormat::Text => "text encode",
                    PgFormat::Binary => "binary encode",
                },
            }),
        }
    }

    /// The transfer format for a parameter of the given oid.
    ///
    /// Text unless the binary policy enables the oid, or the type has no
    /// text encoder at all (arrays).
    pub fn param_format(&self, oid: Oid) -> PgFormat {
        let Some(codec) = self.codec(oid) else {
            return PgFormat::Text;
        };
        if self.binary_params.contains(&oid) && codec.encode_binary.is_some() {
            return PgFormat::Binary;
        }
        if codec.encode_text.is_none() && codec.encode_binary.is_some() {
            return PgFormat::Binary;
        }
        PgFormat::Text
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("codecs", &self.codecs.len())
            .field("binary_params", &self.binary_params)
            .finish()
    }
}

// reading fixed width payloads

pub(crate) fn fixed<const N: usize>(
    what: &'static str,
    bytes: &Bytes,
) -> Result<[u8; N], CodecError> {
    match <[u8; N]>::try_from(&bytes[..]) {
        Ok(arr) => Ok(arr),
        Err(_) => Err(CodecError::length(what, N, bytes.len())),
    }
}

pub(crate) fn utf8(bytes: &Bytes) -> Result<&str, CodecError> {
    std::str::from_utf8(bytes).map_err(|_| CodecError::Utf8)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::oid;

    #[test]
    fn unknown_oid_surfaces_raw() {
        let registry = TypeRegistry::new();
        let bytes = Bytes::from_static(b"\x01\x02");
        let value = registry
            .decode(999_999, PgFormat::Binary, Some(bytes.clone()))
            .unwrap();
        assert_eq!(
            value,
            Value::Raw { oid: 999_999, format: PgFormat::Binary, bytes }
        );
    }

    #[test]
    fn null_is_never_a_codec_call() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.decode(oid::INT4, PgFormat::Binary, None).unwrap(), Value::Null);
    }

    #[test]
    fn param_format_policy() {
        let mut registry = TypeRegistry::new();
        // text by default
        assert_eq!(registry.param_format(oid::INT4), PgFormat::Text);
        // binary only when explicitly enabled
        registry.configure_binary(&[oid::INT4, oid::INT8], &[oid::INT8]);
        assert_eq!(registry.param_format(oid::INT4), PgFormat::Binary);
        assert_eq!(registry.param_format(oid::INT8), PgFormat::Text);
        // binary-only codecs transfer binary regardless
        assert_eq!(registry.param_format(oid::INT4_ARRAY), PgFormat::Binary);
    }

    #[test]
    fn raw_value_passes_through_encode() {
        let registry = TypeRegistry::new();
        let raw = Value::Raw {
            oid: 999_999,
            format: PgFormat::Binary,
            bytes: Bytes::from_static(b"\x00\x2a"),
        };
        let mut buf = BytesMut::new();
        registry.encode(&raw, PgFormat::Binary, &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x00\x2a");
        assert!(registry.encode(&raw, PgFormat::Text, &mut BytesMut::new()).is_err());
    }
}
