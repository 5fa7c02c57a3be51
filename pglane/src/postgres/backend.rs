//! Postgres Backend Messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{Buf, Bytes};

use super::{PgFormat, ProtocolError, ServerError};
use crate::common::ByteStr;

/// A type that can be decoded into postgres backend message.
pub trait BackendProtocol: Sized + std::fmt::Debug {
    /// Try decode given bytes into message.
    ///
    /// Note that `body` is only the main body, **excluding** message type and length.
    ///
    /// Decoding is total: either the whole message is understood, or a
    /// [`ProtocolError`] is returned. There is no partial success.
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Postgres backend messages.
pub enum BackendMessage {
    /// Identifies the message as an authentication request.
    Authentication(Authentication),
    /// Identifies the message as cancellation key data.
    BackendKeyData(BackendKeyData),
    /// Identifies the message as a Bind-complete indicator.
    BindComplete(BindComplete),
    /// Identifies the message as a Close-complete indicator.
    CloseComplete(CloseComplete),
    /// Identifies the message as a command-completed response.
    CommandComplete(CommandComplete),
    /// Identifies the message as COPY data.
    CopyData(CopyData),
    /// Identifies the message as a COPY-complete indicator.
    CopyDone(CopyDone),
    /// Identifies the message as a Start Copy In response.
    CopyInResponse(CopyInResponse),
    /// Identifies the message as a Start Copy Out response.
    CopyOutResponse(CopyOutResponse),
    /// Identifies the message as a data row.
    DataRow(DataRow),
    /// Identifies the message as an error.
    ErrorResponse(ErrorResponse),
    /// Identifies the message as a response to an empty query string.
    EmptyQueryResponse(EmptyQueryResponse),
    /// Identifies the message as a protocol version negotiation message.
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    /// Identifies the message as a no-data indicator.
    NoData(NoData),
    /// Identifies the message as a notice.
    NoticeResponse(NoticeResponse),
    /// Identifies the message as a parameter description.
    ParameterDescription(ParameterDescription),
    /// Identifies the message as a run-time parameter status report
    ParameterStatus(ParameterStatus),
    /// Identifies the message as a Parse-complete indicator.
    ParseComplete(ParseComplete),
    /// Identifies the message as a portal-suspended indicator.
    PortalSuspended(PortalSuspended),
    /// Identifies the message type. ReadyForQuery is sent whenever the backend is ready for a new query cycle.
    ReadyForQuery(ReadyForQuery),
    /// Identifies the message as a row description
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            /// Returns the message type.
            pub const fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }

            /// Get message name from message type.
            ///
            /// Returns `"Unknown"` for unknown message type.
            pub const fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }
        }
        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }
        impl std::fmt::Debug for BackendMessage {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                match self {
                    $(Self::$name(e) => std::fmt::Debug::fmt(e, f),)*
                }
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyData,
    CopyDone,
    CopyInResponse,
    CopyOutResponse,
    DataRow,
    ErrorResponse,
    EmptyQueryResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

impl BackendMessage {
    /// Create a [`ProtocolError`] for a message which is illegal in the current phase.
    pub fn unexpected(&self, phase: &'static str) -> ProtocolError {
        ProtocolError::unexpected_phase(self.msgtype(), phase)
    }
}

macro_rules! assert_msgtype {
    ($typ:ident) => {
        if Self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(Self::MSGTYPE,$typ))
        }
    };
}

macro_rules! msgtype {
    ($me:ident,$ty:literal) => {
        impl $me {
            #[doc = concat!("`",stringify!($ty),"`")]
            pub const MSGTYPE: u8 = $ty;
        }
    };
}

macro_rules! need {
    ($body:ident, $len:expr, $what:literal) => {
        if $body.remaining() < $len {
            return Err(ProtocolError::malformed($what));
        }
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Specifies that the authentication was successful.
    Ok,
    /// Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Specifies that a clear-text password is required.
    CleartextPassword,
    /// Specifies that an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8; 4],
    },
    /// Specifies that GSSAPI authentication is required.
    GSS,
    /// GSSAPI or SSPI authentication data.
    GSSContinue {
        data: Bytes,
    },
    /// Specifies that SSPI authentication is required.
    SSPI,
    /// Specifies that SASL authentication is required.
    SASL {
        /// The message body is a list of SASL authentication mechanisms, in the server's order of preference.
        ///
        /// A zero byte is required as terminator after the last authentication mechanism name.
        name: Bytes,
    },
    /// Specifies that this message contains a SASL challenge.
    SASLContinue {
        /// SASL data, specific to the SASL mechanism being used.
        data: Bytes,
    },
    /// Specifies that SASL authentication has completed.
    SASLFinal {
        /// SASL outcome "additional data", specific to the SASL mechanism being used.
        data: Bytes,
    },
}

msgtype!(Authentication, b'R');

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        need!(body, 4, "Authentication");
        let auth = match body.get_u32() {
            0 => Self::Ok,
            2 => Self::KerberosV5,
            3 => Self::CleartextPassword,
            5 => {
                need!(body, 4, "AuthenticationMD5Password");
                Self::MD5Password { salt: body.get_u32().to_be_bytes() }
            },
            7 => Self::GSS,
            8 => Self::GSSContinue { data: body },
            9 => Self::SSPI,
            10 => Self::SASL { name: body },
            11 => Self::SASLContinue { data: body },
            12 => Self::SASLFinal { data: body },
            auth => return Err(ProtocolError::unknown_auth(auth)),
        };
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue CancelRequest messages later.
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: u32,
    /// The secret key of this backend.
    pub secret_key: u32,
}

msgtype!(BackendKeyData, b'K');

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        need!(body, 8, "BackendKeyData");
        Ok(Self {
            process_id: body.get_u32(),
            secret_key: body.get_u32(),
        })
    }
}

/// Identifies the message as a run-time parameter status report.
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported.
    pub name: ByteStr,
    /// The current value of the parameter.
    pub value: ByteStr,
}

msgtype!(ParameterStatus, b'S');

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            name: ByteStr::read_nul(&mut body)?,
            value: ByteStr::read_nul(&mut body)?,
        })
    }
}

/// Identifies the message as a notice.
///
/// A notice is never an error; it is delivered to an optional observer.
pub struct NoticeResponse {
    /// Raw message body, in the same field layout as [`ErrorResponse`].
    pub body: Bytes,
}

msgtype!(NoticeResponse, b'N');

impl NoticeResponse {
    pub fn new(body: Bytes) -> Self {
        Self { body }
    }

    /// Decode the notice fields.
    pub fn fields(&self) -> ServerError {
        ServerError::new(self.body.clone())
    }
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { body })
    }
}

impl std::fmt::Display for NoticeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.fields(), f)
    }
}

/// Identifies the message as an error.
///
/// The message body consists of one or more identified fields, followed by
/// a zero byte as a terminator; see [`ServerError`] for the field layout.
pub struct ErrorResponse {
    /// Raw message body.
    pub body: Bytes,
}

msgtype!(ErrorResponse, b'E');

impl ErrorResponse {
    pub fn new(body: Bytes) -> Self {
        Self { body }
    }

    /// Decode into the structured [`ServerError`].
    pub fn into_fields(self) -> ServerError {
        ServerError::new(self.body)
    }
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { body })
    }
}

/// Identifies the message as a row description
pub struct RowDescription {
    /// Raw message body.
    ///
    /// - `Int16` Specifies the number of fields in a row (can be zero).
    ///
    /// For each field, there is the following:
    ///
    /// - `String` The field name.
    /// - `Int32` If the field can be identified as a column of a specific table,
    ///   the object ID of the table; otherwise zero.
    /// - `Int16` If the field can be identified as a column of a specific table,
    ///   the attribute number of the column; otherwise zero.
    /// - `Int32` The object ID of the field's data type.
    /// - `Int16` The data type size (see pg_type.typlen). Note that negative values denote variable-width types.
    /// - `Int32` The type modifier (see pg_attribute.atttypmod). The meaning of the modifier is type-specific.
    /// - `Int16` The format code being used for the field. Currently will be zero (text) or one (binary).
    ///   In a RowDescription returned from the statement variant of Describe,
    ///   the format code is not yet known and will always be zero.
    pub body: Bytes,
}

msgtype!(RowDescription, b'T');

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { body })
    }
}

/// Identifies the message as a data row.
pub struct DataRow {
    /// Raw row buffer.
    ///
    /// - `Int16` The number of column values that follow (possibly zero).
    ///
    /// Next, the following pair of fields appear for each column:
    ///
    /// - `Int32` The length of the column value, in bytes (this count does not include itself).
    ///
    /// Can be zero. As a special case, -1 indicates a NULL column value. No value bytes follow in the NULL case.
    ///
    /// - `Byte[n]` The value of the column, in the format indicated by the associated format code.
    pub body: Bytes,
}

msgtype!(DataRow, b'D');

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { body })
    }
}

/// Identifies the message as a command-completed response.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag. This is usually a single word that identifies which SQL command was completed,
    /// followed by the affected row count, e.g. `INSERT 0 rows`, `SELECT rows`, `COPY rows`.
    pub tag: ByteStr,
}

msgtype!(CommandComplete, b'C');

impl CommandComplete {
    /// Decode the affected row count from the command tag.
    ///
    /// Commands which report no count yield `0`.
    pub fn rows_affected(&self) -> u64 {
        let mut whs = self.tag.split_whitespace();
        let Some(tag) = whs.next() else {
            return 0;
        };
        let Some(rows) = whs.next() else {
            return 0;
        };
        match tag {
            // INSERT oid rows
            "INSERT" => whs.next().unwrap_or_default(),
            "SELECT" => rows,
            "UPDATE" => rows,
            "DELETE" => rows,
            "MERGE" => rows,
            "FETCH" => rows,
            "MOVE" => rows,
            "COPY" => rows,
            _ => return 0,
        }
        .parse()
        .unwrap_or_default()
    }
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            tag: ByteStr::read_nul(&mut body)?,
        })
    }
}

/// Identifies the message as a protocol version negotiation message.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported by the server for the major protocol version requested by the client.
    pub minor: u32,
    /// Number of protocol options not recognized by the server.
    pub len: u32,
    /// Raw buffer for option not recognized by the server.
    ///
    /// There is the following:
    ///
    /// - `String` The option name.
    pub opt_names: Bytes,
}

msgtype!(NegotiateProtocolVersion, b'v');

impl BackendProtocol for NegotiateProtocolVersion {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        need!(body, 8, "NegotiateProtocolVersion");
        Ok(Self {
            minor: body.get_u32(),
            len: body.get_u32(),
            opt_names: body,
        })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug)]
pub struct ParameterDescription {
    /// The number of parameters used by the statement (can be zero).
    pub param_len: u16,
    /// Raw buffer for message body.
    ///
    /// For each parameter, there is the following:
    ///
    /// - `Int32` Specifies the object ID of the parameter data type.
    pub oids: Bytes,
}

msgtype!(ParameterDescription, b't');

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        need!(body, 2, "ParameterDescription");
        Ok(Self {
            param_len: body.get_u16(),
            oids: body,
        })
    }
}

/// Identifies the message type. ReadyForQuery is sent whenever the backend is ready for a new query cycle.
pub struct ReadyForQuery {
    /// Current backend transaction status indicator.
    ///
    /// Possible values are 'I' if idle (not in a transaction block);
    /// 'T' if in a transaction block;
    /// or 'E' if in a failed transaction block (queries will be rejected until block is ended).
    pub tx_status: u8,
}

msgtype!(ReadyForQuery, b'Z');

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        need!(body, 1, "ReadyForQuery");
        Ok(Self { tx_status: body.get_u8() })
    }
}

/// Identifies the message as COPY data from the backend.
///
/// Data messages sent by the backend always correspond to single data rows,
/// but messages may divide the stream arbitrarily.
pub struct CopyData {
    /// A chunk of the copy stream.
    pub data: Bytes,
}

msgtype!(CopyData, b'd');

impl BackendProtocol for CopyData {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { data: body })
    }
}

/// Layout shared by `CopyInResponse` and `CopyOutResponse`.
///
/// - `Int8` 0 indicates the overall COPY format is textual. 1 indicates the
///   overall copy format is binary.
/// - `Int16` The number of columns in the data to be copied.
/// - `Int16[]` The format codes to be used for each column.
///   All must be zero if the overall copy format is textual.
fn decode_copy_response(mut body: Bytes, what: &'static str) -> Result<(PgFormat, Vec<u16>), ProtocolError> {
    if body.remaining() < 3 {
        return Err(ProtocolError::malformed(what));
    }
    let format = match body.get_u8() {
        0 => PgFormat::Text,
        1 => PgFormat::Binary,
        _ => return Err(ProtocolError::malformed(what)),
    };
    let len = body.get_u16();
    if body.remaining() < len as usize * 2 {
        return Err(ProtocolError::malformed(what));
    }
    let formats = (0..len).map(|_| body.get_u16()).collect();
    Ok((format, formats))
}

/// Identifies the message as a Start Copy In response.
///
/// The frontend must now send copy-in data (it is also allowed
/// to send CopyFail, if it is not prepared to do so).
#[derive(Debug)]
pub struct CopyInResponse {
    /// The overall COPY format.
    pub format: PgFormat,
    /// The format codes to be used for each column.
    pub column_formats: Vec<u16>,
}

msgtype!(CopyInResponse, b'G');

impl BackendProtocol for CopyInResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let (format, column_formats) = decode_copy_response(body, "CopyInResponse")?;
        Ok(Self { format, column_formats })
    }
}

/// Identifies the message as a Start Copy Out response.
///
/// This message will be followed by copy-out data.
#[derive(Debug)]
pub struct CopyOutResponse {
    /// The overall COPY format.
    pub format: PgFormat,
    /// The format codes to be used for each column.
    pub column_formats: Vec<u16>,
}

msgtype!(CopyOutResponse, b'H');

impl BackendProtocol for CopyOutResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let (format, column_formats) = decode_copy_response(body, "CopyOutResponse")?;
        Ok(Self { format, column_formats })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
            $(#[$doc])*
            #[derive(Debug)]
            pub struct $name;

            msgtype!($name, $ty);

            impl BackendProtocol for $name {
                fn decode(msgtype: u8, _: Bytes) -> Result<Self,ProtocolError> {
                    if $name::MSGTYPE != msgtype {
                        return Err(ProtocolError::unexpected(Self::MSGTYPE,msgtype))
                    }
                    Ok(Self)
                }
            }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// Identifies the message as a COPY-complete indicator.
    struct CopyDone, b'c';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    ///
    /// Note this only appears if an Execute message's row-count limit was reached.
    struct PortalSuspended, b's';
}

// CUSTOM DEBUG

impl std::fmt::Debug for BackendKeyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendKeyData")
            .field("process_id", &self.process_id)
            .field("secret_key", &"<REDACTED>")
            .finish()
    }
}

impl std::fmt::Debug for ReadyForQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyForQuery")
            .field("tx_status", &match self.tx_status {
                b'I' => "Idle(I)",
                b'T' => "Transaction(T)",
                b'E' => "FailedTx(E)",
                _ => "unknown",
            })
            .finish()
    }
}

impl std::fmt::Debug for RowDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowDescription")
            .field("body", &"<BINARY>")
            .finish()
    }
}

impl std::fmt::Debug for DataRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRow")
            .field("body", &"<BINARY>")
            .finish()
    }
}

impl std::fmt::Debug for CopyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyData")
            .field("data", &"<BINARY>")
            .finish()
    }
}

impl std::fmt::Debug for NoticeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoticeResponse")
            .field("message", &self.fields().message())
            .finish()
    }
}

impl std::fmt::Debug for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&ServerError::new(self.body.clone()), f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ready_for_query_status() {
        let msg = ReadyForQuery::decode(b'Z', Bytes::from_static(b"T")).unwrap();
        assert_eq!(msg.tx_status, b'T');
        assert!(ReadyForQuery::decode(b'Z', Bytes::new()).is_err());
        assert!(ReadyForQuery::decode(b'D', Bytes::from_static(b"I")).is_err());
    }

    #[test]
    fn authentication_variants() {
        let ok = Authentication::decode(b'R', Bytes::from_static(&[0, 0, 0, 0])).unwrap();
        assert!(matches!(ok, Authentication::Ok));

        let md5 = Authentication::decode(b'R', Bytes::from_static(&[0, 0, 0, 5, 1, 2, 3, 4])).unwrap();
        assert!(matches!(md5, Authentication::MD5Password { salt: [1, 2, 3, 4] }));

        let unknown = Authentication::decode(b'R', Bytes::from_static(&[0, 0, 0, 99]));
        assert!(matches!(unknown, Err(ProtocolError::UnknownAuth { auth: 99 })));
    }

    #[test]
    fn copy_in_response_formats() {
        // text format, 3 columns, all text
        let body = Bytes::from_static(&[0, 0, 3, 0, 0, 0, 0, 0, 0]);
        let msg = CopyInResponse::decode(b'G', body).unwrap();
        assert_eq!(msg.format, PgFormat::Text);
        assert_eq!(msg.column_formats, [0, 0, 0]);

        // truncated body
        assert!(CopyInResponse::decode(b'G', Bytes::from_static(&[0, 0, 3, 0])).is_err());
    }

    #[test]
    fn command_tag_row_counts() {
        let tag = |s: &'static str| CommandComplete { tag: ByteStr::from_static(s) };
        assert_eq!(tag("INSERT 0 3").rows_affected(), 3);
        assert_eq!(tag("SELECT 42").rows_affected(), 42);
        assert_eq!(tag("COPY 4").rows_affected(), 4);
        assert_eq!(tag("BEGIN").rows_affected(), 0);
        assert_eq!(tag("CREATE TABLE").rows_affected(), 0);
    }

    #[test]
    fn backend_message_dispatch() {
        let msg = BackendMessage::decode(b'Z', Bytes::from_static(b"I")).unwrap();
        assert_eq!(msg.msgtype(), b'Z');
        assert_eq!(BackendMessage::message_name(b'Z'), "ReadyForQuery");
        assert_eq!(BackendMessage::message_name(b'G'), "CopyInResponse");
        assert_eq!(BackendMessage::message_name(1), "Unknown");
        assert!(BackendMessage::decode(1, Bytes::new()).is_err());
    }
}
