//! `pglane` error types.
use std::{backtrace::Backtrace, borrow::Cow, fmt, io};

use crate::{
    common::unit_error,
    connection::ParseError,
    phase::{UnsupportedAuth, UnsupportedEncoding},
    postgres::{ProtocolError, ServerError},
    row::DecodeError,
    types::CodecError,
};

/// A specialized [`Result`] type for `pglane` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pglane` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Returns `true` when the connection that produced this error is
    /// permanently poisoned.
    ///
    /// Transport and protocol faults are fatal; a server error, a codec
    /// refusal or a state misuse leave the connection usable once it is
    /// drained to the next `ReadyForQuery`.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Io(_) | ErrorKind::Protocol(_))
    }

    /// The decoded server error, when this is one.
    pub fn as_server(&self) -> Option<&ServerError> {
        match &self.kind {
            ErrorKind::Server(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn state(what: impl Into<Cow<'static, str>>) -> Error {
        StateError { what: what.into() }.into()
    }
}

/// All possible error kind from `pglane` library.
pub enum ErrorKind {
    /// Malformed configuration url.
    Config(ParseError),
    /// The server sent an illegal sequence or malformed message. Fatal.
    Protocol(ProtocolError),
    /// Any I/O fault. Fatal.
    Io(io::Error),
    /// Decoded `ErrorResponse`; recoverable at the statement level.
    Server(ServerError),
    /// A registered codec refused bytes; the row fails, the connection is fine.
    Codec(CodecError),
    /// Row indexing or decoding failure.
    Decode(DecodeError),
    /// An API call was issued in the wrong phase.
    State(StateError),
    /// Unsupported or failed authentication mechanism.
    UnsupportedAuth(UnsupportedAuth),
    /// `client_encoding` is not `UTF8` at startup.
    UnsupportedEncoding(UnsupportedEncoding),
    /// The query string was empty.
    EmptyQuery(EmptyQueryError),
    /// A single row was required and none came back.
    RowNotFound(RowNotFound),
}

/// An API call was issued in a phase that does not permit it,
/// e.g. writing copy data after the copy already ended.
pub struct StateError {
    what: Cow<'static, str>,
}

impl std::error::Error for StateError { }

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object not in required state: {}", self.what)
    }
}

impl fmt::Debug for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

unit_error! {
    /// An error when the backend answered with `EmptyQueryResponse`.
    pub struct EmptyQueryError("empty query");
}

unit_error! {
    /// An error when a single row was required and none came back.
    pub struct RowNotFound("row not found");
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ServerError>e => ErrorKind::Server(e));
from!(<CodecError>e => ErrorKind::Codec(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<StateError>e => ErrorKind::State(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<UnsupportedEncoding>e => ErrorKind::UnsupportedEncoding(e));
from!(<EmptyQueryError>e => ErrorKind::EmptyQuery(e));
from!(<RowNotFound>e => ErrorKind::RowNotFound(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Server(e) => e.fmt(f),
            Self::Codec(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::State(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::UnsupportedEncoding(e) => e.fmt(f),
            Self::EmptyQuery(e) => e.fmt(f),
            Self::RowNotFound(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
