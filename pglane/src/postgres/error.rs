//! Protocol level errors.
use bytes::{Buf, Bytes};

/// An error when translating buffer from postgres.
///
/// A protocol error is fatal: the connection that produced it
/// is poisoned and no further traffic is possible.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected message {found:?} (expect {expect:?}, phase {phase:?})")]
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    #[error("unknown authentication method: {auth}")]
    UnknownAuth {
        auth: u32,
    },
    #[error("message length {len} exceeds maximum {max}")]
    MessageTooLarge {
        len: usize,
        max: usize,
    },
    #[error("message length {len} is shorter than the length field")]
    MessageTooShort {
        len: i32,
    },
    #[error("postgres string did not nul terminated")]
    MissingNul,
    #[error("postgres sent non utf8 string")]
    NonUtf8,
    #[error("malformed {what} message")]
    Malformed {
        what: &'static str,
    },
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: None }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected { expect: Some(expect), found, phase: None }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: Some(phase) }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn missing_nul() -> ProtocolError {
        Self::MissingNul
    }

    pub(crate) fn non_utf8() -> ProtocolError {
        Self::NonUtf8
    }

    pub(crate) fn malformed(what: &'static str) -> ProtocolError {
        Self::Malformed { what }
    }
}

/// A decoded `ErrorResponse`.
///
/// The message body consists of one or more identified fields,
/// followed by a zero byte as a terminator. Fields can appear in any order.
///
/// A server error is recoverable at the statement level; the connection
/// remains usable after the matching `ReadyForQuery`.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Clone)]
pub struct ServerError {
    body: Bytes,
}

// field type bytes from the protocol error fields table
const FIELD_SEVERITY: u8 = b'S';
const FIELD_CODE: u8 = b'C';
const FIELD_MESSAGE: u8 = b'M';
const FIELD_DETAIL: u8 = b'D';
const FIELD_HINT: u8 = b'H';
const FIELD_POSITION: u8 = b'P';
const FIELD_INTERNAL_POSITION: u8 = b'p';
const FIELD_INTERNAL_QUERY: u8 = b'q';
const FIELD_WHERE: u8 = b'W';

impl ServerError {
    pub(crate) fn new(body: Bytes) -> Self {
        Self { body }
    }

    fn fields(&self) -> Fields<'_> {
        Fields { rest: &self.body }
    }

    /// Lookup a field value by its identifying type byte.
    pub fn get(&self, ty: u8) -> Option<&str> {
        self.fields().find(|(f, _)| *f == ty).map(|(_, v)| v)
    }

    /// The severity: `ERROR`, `FATAL`, or `PANIC`, or a localized translation.
    pub fn severity(&self) -> &str {
        self.get(FIELD_SEVERITY).unwrap_or("ERROR")
    }

    /// The SQLSTATE code for the error, always present.
    pub fn code(&self) -> &str {
        self.get(FIELD_CODE).unwrap_or("XX000")
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        self.get(FIELD_MESSAGE).unwrap_or_default()
    }

    /// Optional secondary error message carrying more detail.
    pub fn detail(&self) -> Option<&str> {
        self.get(FIELD_DETAIL)
    }

    /// Optional suggestion what to do about the problem.
    pub fn hint(&self) -> Option<&str> {
        self.get(FIELD_HINT)
    }

    /// Error cursor position as an index into the original query string.
    pub fn position(&self) -> Option<usize> {
        self.get(FIELD_POSITION).and_then(|p| p.parse().ok())
    }

    /// Error cursor position within an internally generated command.
    pub fn internal_position(&self) -> Option<usize> {
        self.get(FIELD_INTERNAL_POSITION).and_then(|p| p.parse().ok())
    }

    /// The text of a failed internally-generated command.
    pub fn internal_query(&self) -> Option<&str> {
        self.get(FIELD_INTERNAL_QUERY)
    }

    /// Call stack context in which the error occurred.
    pub fn where_(&self) -> Option<&str> {
        self.get(FIELD_WHERE)
    }

    /// Returns `true` if the connection itself is reported broken.
    ///
    /// SQLSTATE class `08` covers connection exceptions,
    /// e.g. `08006` connection failure, `08003` connection does not exist.
    pub fn is_connection_exception(&self) -> bool {
        self.code().starts_with("08")
    }
}

/// Walks `(type byte, nul terminated string)` pairs until the zero terminator.
struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Fields<'a> {
    type Item = (u8, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut rest = self.rest;
            if !rest.has_remaining() {
                return None;
            }
            let ty = rest.get_u8();
            if ty == 0 {
                return None;
            }
            let nul = rest.iter().position(|e| matches!(e, b'\0'))?;
            let value = &rest[..nul];
            self.rest = &rest[nul + 1..];
            match std::str::from_utf8(value) {
                Ok(value) => return Some((ty, value)),
                // skip fields the server sent in a non utf8 encoding
                Err(_) => continue,
            }
        }
    }
}

impl std::error::Error for ServerError { }

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.severity(), self.code(), self.message())?;
        if let Some(detail) = self.detail() {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = self.hint() {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn body(fields: &[(u8, &str)]) -> Bytes {
        let mut buf = Vec::new();
        for (ty, value) in fields {
            buf.push(*ty);
            buf.extend_from_slice(value.as_bytes());
            buf.push(0);
        }
        buf.push(0);
        Bytes::from(buf)
    }

    #[test]
    fn decode_error_fields() {
        let err = ServerError::new(body(&[
            (b'S', "ERROR"),
            (b'C', "42601"),
            (b'M', "syntax error at or near \"xxx\""),
            (b'P', "31"),
        ]));
        assert_eq!(err.severity(), "ERROR");
        assert_eq!(err.code(), "42601");
        assert_eq!(err.message(), "syntax error at or near \"xxx\"");
        assert_eq!(err.position(), Some(31));
        assert_eq!(err.detail(), None);
        assert!(!err.is_connection_exception());
    }

    #[test]
    fn connection_exception_class() {
        let err = ServerError::new(body(&[(b'C', "08006"), (b'M', "connection failure")]));
        assert!(err.is_connection_exception());
        let err = ServerError::new(body(&[(b'C', "08003"), (b'M', "no connection")]));
        assert!(err.is_connection_exception());
    }
}
