//! Postgres Connection
use bytes::{Buf, BytesMut};
use std::{
    collections::HashMap,
    io,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Instant,
};

use crate::{
    Result,
    common::{ByteStr, trace, warning},
    error::Error,
    net::Socket,
    phase::{self, Phase, StartupResponse, TxStatus, UnsupportedEncoding},
    postgres::{
        BackendProtocol, ErrorResponse, FrontendProtocol, NoticeResponse, ProtocolError,
        ServerError, backend, frontend,
    },
    statement::{StatementCache, StatementName, StmtPlan},
    transport::PgTransport,
    types::TypeRegistry,
};

mod config;
mod cancel;

pub use cancel::CancelHandle;
pub use config::{Config, ParseError, QueryMode, DEFAULT_MAX_MESSAGE_SIZE};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Observer for `NoticeResponse` messages; a notice is never an error.
pub type NoticeHook = Box<dyn FnMut(ServerError) + Send>;

/// Postgres Connection.
///
/// A connection is a single-threaded serial resource; all operations on it
/// are serialized through `&mut` access, and responses correspond to
/// requests in strict FIFO order.
///
/// # Features
///
/// Connection cache prepared statements with a use-count based promotion
/// threshold, see [`Config::set_prepare_threshold`].
///
/// Connection handle `NoticeResponse` message. With a [notice hook][1] set,
/// notices are delivered there, otherwise logged when the `log` feature is
/// enabled, or ignored.
///
/// Connection handle `Sync` after receive an `ErrorResponse` message
/// during an extended query sequence. This is postgres specific and
/// happens transparently. During the simple protocol, the backend emits
/// `ReadyForQuery` on its own and no `Sync` is sent.
///
/// # Runtime
///
/// All constructor will panic if `tokio` features is not enabled.
///
/// [1]: Connection::set_notice_hook
pub struct Connection {
    // io
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,

    // codecs, shared with rows
    registry: Arc<TypeRegistry>,

    // feature
    stmts: StatementCache,
    notice_hook: Option<NoticeHook>,

    // protocol state
    phase: Phase,
    tx_status: TxStatus,
    sync_pending: usize,
    /// Syncs sent whose ReadyForQuery has not yet arrived.
    sync_outstanding: usize,
    params: HashMap<String, ByteStr>,
    key_data: Option<backend::BackendKeyData>,

    // diagnostic
    config: Config,
    connected_at: Instant,
}

impl Connection {
    /// Connect to postgres server via environment variables.
    ///
    /// See [`Config::from_env`] for more details.
    ///
    /// # Panics
    ///
    /// Panics if `tokio` feature is not enabled.
    pub fn connect_env() -> impl Future<Output = Result<Connection>> {
        Self::connect_with(Config::from_env())
    }

    /// Connect to postgres server via url.
    ///
    /// # Panics
    ///
    /// Panics if `tokio` feature is not enabled.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect to postgres server with provided config.
    ///
    /// # Panics
    ///
    /// Panics if `tokio` feature is not enabled.
    pub async fn connect_with(config: Config) -> Result<Self> {
        let socket = if config.host == "localhost" {
            let path = format!("/run/postgresql/.s.PGSQL.{}", config.port);
            match Socket::connect_socket(&path).await {
                Ok(ok) => ok,
                Err(_) => Socket::connect_tcp(&config.host, config.port).await?,
            }
        } else {
            Socket::connect_tcp(&config.host, config.port).await?
        };

        let mut registry = TypeRegistry::new();
        registry.configure_binary(&config.binary_transfer_enable, &config.binary_transfer_disable);

        let threshold = match config.query_mode {
            QueryMode::ExtendedCacheEverything => 1,
            _ => config.prepare_threshold,
        };

        let mut me = Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            registry: Arc::new(registry),
            stmts: StatementCache::new(config.stmt_cache_capacity, threshold),
            notice_hook: None,
            phase: Phase::Startup,
            tx_status: TxStatus::Idle,
            sync_pending: 0,
            sync_outstanding: 0,
            params: HashMap::new(),
            key_data: None,
            connected_at: Instant::now(),
            config,
        };

        let startup_config = me.config.clone();
        let StartupResponse { backend_key_data } = phase::startup(&startup_config, &mut me).await?;
        me.key_data = backend_key_data;

        // the core does not convert encodings
        match me.parameter("client_encoding") {
            Some("UTF8") => {}
            _ => return Err(UnsupportedEncoding.into()),
        }

        Ok(me)
    }
}

impl Connection {
    /// Get the [`Instant`] value of when the socket is connected to postgres server.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// The last reported value of a run-time parameter, e.g. `TimeZone`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|v| v.as_str())
    }

    /// Transaction status as of the last `ReadyForQuery`.
    pub fn transaction_status(&self) -> TxStatus {
        self.tx_status
    }

    /// The current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The shared value codec table.
    pub fn type_registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Deliver `NoticeResponse` messages to an observer.
    pub fn set_notice_hook(&mut self, hook: NoticeHook) {
        self.notice_hook = Some(hook);
    }

    /// A side-channel cancellation handle for this connection.
    ///
    /// Returns [`None`] until the backend reported its key data.
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        let key_data = self.key_data.as_ref()?;
        Some(CancelHandle {
            host: self.config.host.clone(),
            port: self.config.port,
            socket: self.config.socket.clone(),
            process_id: key_data.process_id,
            secret_key: key_data.secret_key,
        })
    }
}

impl Connection {
    /// Initiates or attempts to shut down socket, returning success when
    /// the I/O connection has completely shut down.
    pub fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        self.phase = Phase::Closed;
        self.socket.poll_shutdown(cx)
    }

    /// Close connection cleanly.
    pub async fn close(mut self) -> io::Result<()> {
        self.send(frontend::Terminate);
        std::future::poll_fn(|cx| self.poll_flush(cx)).await?;
        std::future::poll_fn(|cx| self.poll_shutdown(cx)).await
    }
}

macro_rules! poll_message {
    (
        poll($io:ident, $cx:ident);
        let $msgtype:ident;
        let $body:ident;
    ) => {
        let Some(mut header) = $io.read_buf.get(..5) else {
            $io.read_buf.reserve(1024);
            let read = ready!($io.socket.poll_read_buf(&mut $io.read_buf, $cx)?);
            if read == 0 {
                // peer termination surfaces as an I/O fault
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
            }
            continue;
        };

        let $msgtype = header.get_u8();
        let len = header.get_i32();

        if len < 4 {
            return Poll::Ready(Err(ProtocolError::MessageTooShort { len }.into()));
        }
        let len = len as usize;
        if len > $io.config.max_message_size {
            return Poll::Ready(Err(ProtocolError::MessageTooLarge {
                len,
                max: $io.config.max_message_size,
            }
            .into()));
        }

        if $io.read_buf.len() - 1/*msgtype*/ < len {
            $io.read_buf.reserve(1 + len);
            let read = ready!($io.socket.poll_read_buf(&mut $io.read_buf, $cx)?);
            if read == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
            }
            continue;
        }

        $io.read_buf.advance(5);
        let $body = $io.read_buf.split_to(len - 4).freeze();

        // Message fully acquired
        trace!("(B){:?}", backend::BackendMessage::message_name($msgtype));
    };
}

impl Connection {
    /// Execute all queued action, draining any pending synchronization.
    pub fn ready(&mut self) -> impl Future<Output = Result<()>> {
        std::future::poll_fn(|cx| self.poll_ready(cx))
    }

    /// Attempt to drain buffered writes and pending `ReadyForQuery`s.
    pub(crate) fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        if !self.write_buf.is_empty() {
            ready!(self.poll_flush(cx)?)
        }

        while self.sync_pending != 0 {
            trace!("drain: {{sync_pending: {}}}", self.sync_pending);

            poll_message! {
                poll(self, cx);
                let msgtype;
                let body;
            }

            match msgtype {
                ErrorResponse::MSGTYPE => {
                    // in extended mode the server skips messages until a
                    // Sync; during the simple protocol and COPY it emits
                    // ReadyForQuery on its own
                    if self.phase == Phase::ExtendedQuery && self.sync_outstanding == 0 {
                        self.send(frontend::Sync);
                        self.sync_pending += 1;
                    }
                    warning!("{}", ServerError::new(body));
                }
                NoticeResponse::MSGTYPE => self.notice(body),
                backend::ParameterStatus::MSGTYPE => self.parameter_status(body)?,
                backend::ReadyForQuery::MSGTYPE => {
                    self.ready_for_query(&body)?;
                    self.sync_pending -= 1;
                }
                _ => {} // ignore all messages until `ReadyForQuery` received
            }
        }

        Poll::Ready(Ok(()))
    }

    fn notice(&mut self, body: bytes::Bytes) {
        let notice = NoticeResponse::new(body);
        match &mut self.notice_hook {
            Some(hook) => hook(notice.fields()),
            None => {
                warning!("{notice}");
            }
        }
    }

    fn parameter_status(&mut self, body: bytes::Bytes) -> Result<(), ProtocolError> {
        let status = backend::ParameterStatus::decode(backend::ParameterStatus::MSGTYPE, body)?;
        trace!("parameter status: {} = {}", status.name, status.value);
        self.params.insert(String::from(status.name.as_str()), status.value);
        Ok(())
    }

    fn ready_for_query(&mut self, body: &bytes::Bytes) -> Result<(), ProtocolError> {
        let code = *body.first().ok_or(ProtocolError::malformed("ReadyForQuery"))?;
        self.tx_status = TxStatus::from_code(code)?;
        self.sync_outstanding = self.sync_outstanding.saturating_sub(1);
        self.phase.accept(backend::ReadyForQuery::MSGTYPE)
    }

    fn poll_recv_inner<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        ready!(self.poll_ready(cx)?);

        loop {
            poll_message! {
                poll(self, cx);
                let msgtype;
                let body;
            }

            match msgtype {
                ErrorResponse::MSGTYPE => {
                    // a Sync is only injected when none is already in
                    // flight, every Sync is answered by exactly one
                    // ReadyForQuery
                    if self.phase == Phase::ExtendedQuery && self.sync_outstanding == 0 {
                        self.send(frontend::Sync);
                    }
                    self.ready_request();
                    Err(ErrorResponse::new(body).into_fields())?
                }
                NoticeResponse::MSGTYPE => {
                    self.notice(body);
                    continue;
                }
                backend::ParameterStatus::MSGTYPE => {
                    self.parameter_status(body)?;
                    continue;
                }
                _ => {
                    self.phase.accept(msgtype)?;
                    if msgtype == backend::ReadyForQuery::MSGTYPE {
                        let code = *body.first().ok_or(ProtocolError::malformed("ReadyForQuery"))?;
                        self.tx_status = TxStatus::from_code(code)?;
                        self.sync_outstanding = self.sync_outstanding.saturating_sub(1);
                    }
                    if msgtype == backend::CopyInResponse::MSGTYPE {
                        // copy-in mode discards in-flight Sync messages
                        self.sync_outstanding = 0;
                    }
                    return Poll::Ready(Ok(B::decode(msgtype, body)?));
                }
            }
        }
    }
}

impl PgTransport for Connection {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        self.socket.poll_write_buf(&mut self.write_buf, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        if self.phase.is_closed() {
            return Poll::Ready(Err(Error::state("connection is closed")));
        }

        let result = self.poll_recv_inner(cx);
        if let Poll::Ready(Err(err)) = &result {
            // transport and protocol faults poison the connection
            if err.is_fatal() {
                self.phase = Phase::Closed;
            }
        }
        result
    }

    fn ready_request(&mut self) {
        self.sync_pending += 1;
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        trace!("(F){}", F::MSGTYPE as char);
        if F::MSGTYPE == frontend::Sync::MSGTYPE {
            self.sync_outstanding += 1;
        }
        self.phase.sent(F::MSGTYPE);
        frontend::write(message, &mut self.write_buf);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        trace!("(F){startup:?}");
        self.phase = Phase::Startup;
        startup.write(&mut self.write_buf);
    }

    fn registry(&self) -> Arc<TypeRegistry> {
        Arc::clone(&self.registry)
    }

    fn plan_stmt(&mut self, sqlid: u64) -> StmtPlan {
        // statements are never persisted when only explicitly prepared
        // statements may occupy server-side names
        if self.config.query_mode == QueryMode::ExtendedForPrepared {
            return StmtPlan::Unnamed;
        }

        let (plan, evicted) = self.stmts.plan(sqlid);
        if let Some(name) = evicted {
            trace!("statement evicted: {name}");
            // closing is best-effort, batched with the next Sync
            self.send(frontend::Close { variant: b'S', name: name.as_str() });
            self.send(frontend::Sync);
            self.ready_request();
        }
        plan
    }

    fn stmt_prepared(&mut self, sqlid: u64, name: StatementName) {
        trace!("statement added: {name}");
        self.stmts.prepared(sqlid, name);
    }

    fn query_mode(&self) -> QueryMode {
        self.config.query_mode
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("phase", &self.phase)
            .field("tx_status", &self.tx_status)
            .field("sync_pending", &self.sync_pending)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}
