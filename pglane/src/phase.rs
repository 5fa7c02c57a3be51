//! Connection lifecycle phases and the startup flow.
use std::borrow::Cow;

use crate::{
    Result,
    common::unit_error,
    postgres::{
        BackendMessage, ProtocolError,
        backend::{self, Authentication},
        frontend::{self, FrontendProtocol},
    },
    transport::{PgTransport, PgTransportExt},
};

/// The connection lifecycle as tagged variants.
///
/// ```text
/// Disconnected → Startup → Authenticating → ReadyIdle ⇄ SimpleQuery
///                                                      ⇄ ExtendedQuery
///                                                      ⇄ CopyIn ⇄ CopyOut
///                                                      → Closing → Closed
/// ```
///
/// All inbound message handling dispatches on the current phase through
/// [`accept`][Phase::accept]; an illegal transition is a protocol
/// violation, which poisons the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Startup,
    Authenticating,
    ReadyIdle,
    SimpleQuery,
    ExtendedQuery,
    CopyIn,
    CopyOut,
    Closing,
    Closed,
}

impl Phase {
    /// Advance on a received message, the single transition function.
    pub(crate) fn accept(&mut self, msgtype: u8) -> Result<(), ProtocolError> {
        use Phase::*;

        const NOTICE: u8 = backend::NoticeResponse::MSGTYPE;
        const PARAM_STATUS: u8 = backend::ParameterStatus::MSGTYPE;
        const NEGOTIATE: u8 = backend::NegotiateProtocolVersion::MSGTYPE;
        const ERROR: u8 = backend::ErrorResponse::MSGTYPE;
        const READY: u8 = backend::ReadyForQuery::MSGTYPE;
        const AUTH: u8 = Authentication::MSGTYPE;
        const KEY_DATA: u8 = backend::BackendKeyData::MSGTYPE;
        const COPY_IN: u8 = backend::CopyInResponse::MSGTYPE;
        const COPY_OUT: u8 = backend::CopyOutResponse::MSGTYPE;
        const COPY_DATA: u8 = backend::CopyData::MSGTYPE;
        const COPY_DONE: u8 = backend::CopyDone::MSGTYPE;
        const COMPLETE: u8 = backend::CommandComplete::MSGTYPE;

        let next = match (*self, msgtype) {
            (Disconnected | Closed, found) => {
                return Err(ProtocolError::unexpected_phase(found, "closed connection"));
            }

            // asynchronous messages are tolerated at any point; a
            // ParameterStatus received mid-COPY is simply applied to the
            // parameter map, which covers post-COPY delivery
            (_, NOTICE | PARAM_STATUS | NEGOTIATE | ERROR) => return Ok(()),

            // the universal synchronization barrier
            (_, READY) => ReadyIdle,

            (Startup | Authenticating, AUTH) => Authenticating,
            (Startup | Authenticating, KEY_DATA) => Authenticating,
            (Startup | Authenticating, _) => *self,

            (ReadyIdle | SimpleQuery | ExtendedQuery, COPY_IN) => CopyIn,
            (ReadyIdle | SimpleQuery | ExtendedQuery, COPY_OUT) => CopyOut,

            // during copy-in the server is silent until completion or error
            (CopyIn, COMPLETE) => CopyIn,
            (CopyIn, found) => {
                return Err(ProtocolError::unexpected_phase(found, "copy-in"));
            }

            (CopyOut, COPY_DATA | COPY_DONE | COMPLETE) => CopyOut,
            (CopyOut, found) => {
                return Err(ProtocolError::unexpected_phase(found, "copy-out"));
            }

            (SimpleQuery, _) => SimpleQuery,
            // responses to a pipelined extended sequence may trail a
            // ReadyForQuery consumed by the drain
            (ReadyIdle | ExtendedQuery, _) => ExtendedQuery,

            (Closing, _) => Closing,
        };
        *self = next;
        Ok(())
    }

    /// Advance on a sent message.
    ///
    /// Outbound misuse is rejected at the operation entry points, so this
    /// only records the direction the conversation is taking.
    pub(crate) fn sent(&mut self, msgtype: u8) {
        use Phase::*;
        *self = match (*self, msgtype) {
            (ReadyIdle, t) if t == frontend::Query::MSGTYPE => SimpleQuery,
            (ReadyIdle, b'P' | b'B') => ExtendedQuery,
            (_, t) if t == frontend::Terminate::MSGTYPE => Closing,
            (phase, _) => phase,
        };
    }

    /// Returns `true` once the connection is permanently unusable.
    pub(crate) fn is_closed(&self) -> bool {
        matches!(self, Phase::Closed | Phase::Disconnected)
    }
}

/// Backend transaction status, as carried by every `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Not in a transaction block.
    Idle,
    /// In a transaction block.
    InBlock,
    /// In a failed transaction block; queries are rejected until the block ends.
    InFailedBlock,
}

impl TxStatus {
    pub(crate) fn from_code(code: u8) -> Result<TxStatus, ProtocolError> {
        match code {
            b'I' => Ok(TxStatus::Idle),
            b'T' => Ok(TxStatus::InBlock),
            b'E' => Ok(TxStatus::InFailedBlock),
            _ => Err(ProtocolError::malformed("ReadyForQuery")),
        }
    }
}

// ===== Startup =====

/// Config for postgres startup phase.
///
/// <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
pub struct StartupConfig<'a> {
    pub(crate) user: Cow<'a, str>,
    pub(crate) database: Option<Cow<'a, str>>,
    pub(crate) password: Option<Cow<'a, str>>,
    pub(crate) auth: Option<&'a mut dyn AuthHandler>,
}

/// Startup phase successful response.
pub struct StartupResponse {
    /// This message provides secret-key data that the frontend must
    /// save if it wants to be able to issue cancel requests later.
    pub backend_key_data: Option<backend::BackendKeyData>,
}

unit_error! {
    /// An error when postgres request an authentication method that is
    /// not handled natively and no authentication plugin is configured.
    pub struct UnsupportedAuth("auth method is not supported");
}

unit_error! {
    /// An error when the session `client_encoding` is not `UTF8`.
    pub struct UnsupportedEncoding("client_encoding must be UTF8");
}

/// An authentication mechanism plugin.
///
/// Given an authentication request payload, produce the payload bytes for
/// the next client authentication message, or refuse. Cleartext and MD5
/// password exchanges are handled natively; anything else (SCRAM, GSSAPI)
/// goes through this trait.
pub trait AuthHandler {
    fn respond(&mut self, request: &Authentication) -> Result<Vec<u8>, UnsupportedAuth>;
}

/// Compute the MD5 password response: `md5` + hex(md5(hex(md5(password ‖ user)) ‖ salt)).
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

/// Perform a startup message.
///
/// `client_encoding` is pinned to `UTF8` in the startup parameters; the
/// caller must still verify the reported [`ParameterStatus`][1] value,
/// since a server may refuse to honor it.
///
/// <https://www.postgresql.org/docs/17/protocol-flow.html#PROTOCOL-FLOW-START-UP>
///
/// [1]: backend::ParameterStatus
pub async fn startup<'a, IO: PgTransport>(
    opt: impl Into<StartupConfig<'a>>,
    mut io: IO,
) -> Result<StartupResponse> {
    let mut opt: StartupConfig = opt.into();

    // To begin a session, a frontend opens a connection to the server and sends a startup message.

    io.send_startup(frontend::Startup {
        user: opt.user(),
        database: opt.database(),
        replication: None,
        params: &[("client_encoding", "UTF8")],
    });
    io.flush().await?;

    // The server then sends an appropriate authentication request message,
    // to which the frontend must reply with an appropriate authentication response message.
    //
    // For all authentication methods except GSSAPI, SSPI and SASL, there is at most one request
    // and one response. For GSSAPI, SSPI and SASL, multiple exchanges of packets may be needed.

    loop {
        use Authentication::*;
        match io.recv().await? {
            // we gucci
            Ok => break,
            // The frontend must now send a PasswordMessage containing the password in clear-text form.
            CleartextPassword => {
                io.send(frontend::PasswordMessage {
                    password: opt.password().unwrap_or_default(),
                });
                io.flush().await?;
            },
            MD5Password { salt } => {
                let hashed = md5_password(opt.user(), opt.password().unwrap_or_default(), salt);
                io.send(frontend::PasswordMessage { password: &hashed });
                io.flush().await?;
            },
            request => match opt.auth.as_mut() {
                Some(handler) => {
                    let data = handler.respond(&request)?;
                    io.send(frontend::AuthResponse { data: &data });
                    io.flush().await?;
                },
                None => return Err(UnsupportedAuth.into()),
            },
        }
    }

    // After having received AuthenticationOk, the frontend must wait for further messages
    // from the server. In the normal case the backend will send some ParameterStatus
    // messages, BackendKeyData, and finally ReadyForQuery.

    let mut key_data = None;

    loop {
        use BackendMessage::*;
        match io.recv().await? {
            ReadyForQuery(_) => break,
            BackendKeyData(new_key_data) => key_data = Some(new_key_data),
            // NOTE: ParameterStatus will get eaten by the IO
            f => Err(f.unexpected("startup phase"))?,
        }
    }

    Ok(StartupResponse { backend_key_data: key_data })
}

impl<'a> StartupConfig<'a> {
    /// Create new config, the database user name is required.
    pub fn new(user: impl Into<Cow<'a, str>>) -> Self {
        Self { user: user.into(), database: None, password: None, auth: None }
    }

    /// The database user name to connect as.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The database to connect to. Defaults to the user name.
    pub fn database(&self) -> Option<&str> {
        self.database.as_ref().map(<_>::as_ref)
    }

    /// The database to connect to. Defaults to the user name.
    pub fn set_database(&mut self, database: impl Into<Cow<'a, str>>) {
        self.database = Some(database.into());
    }

    /// Authentication password, the default is empty string.
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(<_>::as_ref)
    }

    /// Authentication password, the default is empty string.
    pub fn set_password(&mut self, password: impl Into<Cow<'a, str>>) {
        self.password = Some(password.into());
    }

    /// Authentication plugin for mechanisms not handled natively.
    pub fn set_auth_handler(&mut self, auth: &'a mut dyn AuthHandler) {
        self.auth = Some(auth);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let mut phase = Phase::Startup;
        phase.accept(Authentication::MSGTYPE).unwrap();
        assert_eq!(phase, Phase::Authenticating);
        phase.accept(backend::ParameterStatus::MSGTYPE).unwrap();
        assert_eq!(phase, Phase::Authenticating);
        phase.accept(backend::ReadyForQuery::MSGTYPE).unwrap();
        assert_eq!(phase, Phase::ReadyIdle);

        phase.sent(frontend::Query::MSGTYPE);
        assert_eq!(phase, Phase::SimpleQuery);
        phase.accept(backend::CopyInResponse::MSGTYPE).unwrap();
        assert_eq!(phase, Phase::CopyIn);
        phase.accept(backend::CommandComplete::MSGTYPE).unwrap();
        phase.accept(backend::ReadyForQuery::MSGTYPE).unwrap();
        assert_eq!(phase, Phase::ReadyIdle);

        phase.sent(frontend::Terminate::MSGTYPE);
        assert_eq!(phase, Phase::Closing);
    }

    #[test]
    fn copy_phases_reject_row_traffic() {
        let mut phase = Phase::CopyIn;
        assert!(phase.accept(backend::DataRow::MSGTYPE).is_err());

        let mut phase = Phase::CopyOut;
        phase.accept(backend::CopyData::MSGTYPE).unwrap();
        phase.accept(backend::CopyDone::MSGTYPE).unwrap();
        assert!(phase.accept(backend::RowDescription::MSGTYPE).is_err());
    }

    #[test]
    fn closed_is_terminal() {
        let mut phase = Phase::Closed;
        assert!(phase.accept(backend::ReadyForQuery::MSGTYPE).is_err());
        assert!(phase.is_closed());
    }

    #[test]
    fn tx_status_codes() {
        assert_eq!(TxStatus::from_code(b'I').unwrap(), TxStatus::Idle);
        assert_eq!(TxStatus::from_code(b'T').unwrap(), TxStatus::InBlock);
        assert_eq!(TxStatus::from_code(b'E').unwrap(), TxStatus::InFailedBlock);
        assert!(TxStatus::from_code(b'x').is_err());
    }

    #[test]
    fn md5_response_shape() {
        let a = md5_password("postgres", "secret", [1, 2, 3, 4]);
        assert!(a.starts_with("md5"));
        assert_eq!(a.len(), 35);
        // deterministic, and sensitive to the salt
        assert_eq!(a, md5_password("postgres", "secret", [1, 2, 3, 4]));
        assert_ne!(a, md5_password("postgres", "secret", [4, 3, 2, 1]));
    }
}
