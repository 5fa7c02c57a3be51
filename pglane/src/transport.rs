//! The [`PgTransport`] trait.
use std::{
    io,
    sync::Arc,
    task::{Context, Poll},
};

use crate::{
    Result,
    connection::QueryMode,
    postgres::{BackendProtocol, FrontendProtocol, frontend},
    statement::{StatementName, StmtPlan},
    types::TypeRegistry,
};

/// A buffered stream which can send and receive postgres message.
pub trait PgTransport: Unpin {
    /// Poll to flush the underlying io.
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Poll to receive a message.
    ///
    /// Calling `poll_recv` will also try to [`poll_flush`][1] if there is buffered message.
    ///
    /// Implementor should handle `NoticeResponse` and `ParameterStatus`
    /// and should not return them.
    ///
    /// Implementor also should handle `ErrorResponse` and return it as [`Err`].
    ///
    /// [1]: PgTransport::poll_flush
    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>>;

    /// Request implementor to ignore all backend messages until `ReadyForQuery` is received.
    fn ready_request(&mut self);

    /// Send message to the backend.
    ///
    /// Note that this send is buffered, caller must also call
    /// [`poll_flush`][1] or [`flush`][2] afterwards.
    ///
    /// [1]: PgTransport::poll_flush
    /// [2]: PgTransportExt::flush
    fn send<F: FrontendProtocol>(&mut self, message: F);

    /// Send [`Startup`][1] message to the backend.
    ///
    /// For historical reasons, the very first message sent by the client (the startup message)
    /// has no initial message-type byte.
    ///
    /// Thus, [`Startup`][1] does not implement [`FrontendProtocol`]
    ///
    /// [1]: frontend::Startup
    fn send_startup(&mut self, startup: frontend::Startup);

    /// The value codec table for this connection.
    fn registry(&self) -> Arc<TypeRegistry>;

    /// Consult the statement cache for one more use of a statement.
    ///
    /// Bumps the use count and decides between reusing a cached server
    /// name, promoting to a freshly named statement, or staying unnamed.
    fn plan_stmt(&mut self, sqlid: u64) -> StmtPlan;

    /// Record that the server acknowledged a named Parse.
    fn stmt_prepared(&mut self, sqlid: u64, name: StatementName);

    /// The configured statement routing mode.
    fn query_mode(&self) -> QueryMode {
        QueryMode::Extended
    }
}

impl<P> PgTransport for &mut P where P: PgTransport {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_flush(self, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        P::poll_recv(self, cx)
    }

    fn ready_request(&mut self) {
        P::ready_request(self);
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        P::send(self, message);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        P::send_startup(self, startup);
    }

    fn registry(&self) -> Arc<TypeRegistry> {
        P::registry(self)
    }

    fn plan_stmt(&mut self, sqlid: u64) -> StmtPlan {
        P::plan_stmt(self, sqlid)
    }

    fn stmt_prepared(&mut self, sqlid: u64, name: StatementName) {
        P::stmt_prepared(self, sqlid, name);
    }

    fn query_mode(&self) -> QueryMode {
        P::query_mode(self)
    }
}

/// An extension trait to provide `Future` API for [`PgTransport`].
pub trait PgTransportExt: PgTransport {
    /// Flush the underlying io.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx| self.poll_flush(cx))
    }

    /// Receive a backend message.
    fn recv<B: BackendProtocol>(&mut self) -> impl Future<Output = Result<B>> {
        std::future::poll_fn(|cx| self.poll_recv(cx))
    }
}

impl<T> PgTransportExt for T where T: PgTransport { }
