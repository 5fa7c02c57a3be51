//! In-memory scripted transport for protocol tests.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{
    collections::VecDeque,
    io,
    num::NonZeroUsize,
    pin::pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use crate::{
    Result,
    connection::QueryMode,
    postgres::{BackendProtocol, FrontendProtocol, Oid, ServerError, backend, frontend},
    statement::{StatementCache, StatementName, StmtPlan},
    transport::PgTransport,
    types::TypeRegistry,
};

/// Drive a future to completion against the scripted transport.
///
/// The mock never returns `Pending`, so a stuck future is a test bug.
pub(crate) fn block_on<F: Future>(fut: F) -> F::Output {
    let waker = Waker::noop();
    let mut cx = Context::from_waker(waker);
    let mut fut = pin!(fut);
    for _ in 0..1_000_000 {
        if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
            return out;
        }
    }
    panic!("mock transport future did not complete");
}

/// A [`PgTransport`] serving a scripted sequence of backend messages and
/// recording every outbound frame.
pub(crate) struct MockTransport {
    script: VecDeque<(u8, Bytes)>,
    pub wire: BytesMut,
    registry: Arc<TypeRegistry>,
    cache: StatementCache,
    sync_pending: usize,
    pub mode: QueryMode,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_threshold(5)
    }

    pub fn with_threshold(threshold: u16) -> Self {
        Self {
            script: VecDeque::new(),
            wire: BytesMut::new(),
            registry: Arc::new(TypeRegistry::new()),
            cache: StatementCache::new(NonZeroUsize::new(24).unwrap(), threshold),
            sync_pending: 0,
            mode: QueryMode::Extended,
        }
    }

    /// Queue one backend message for the client to receive.
    pub fn serve(&mut self, msgtype: u8, body: impl Into<Bytes>) {
        self.script.push_back((msgtype, body.into()));
    }

    pub fn serve_ready(&mut self, tx_status: u8) {
        self.serve(backend::ReadyForQuery::MSGTYPE, Bytes::copy_from_slice(&[tx_status]));
    }

    pub fn serve_parse_complete(&mut self) {
        self.serve(backend::ParseComplete::MSGTYPE, Bytes::new());
    }

    pub fn serve_bind_complete(&mut self) {
        self.serve(backend::BindComplete::MSGTYPE, Bytes::new());
    }

    pub fn serve_no_data(&mut self) {
        self.serve(backend::NoData::MSGTYPE, Bytes::new());
    }

    pub fn serve_command_complete(&mut self, tag: &str) {
        let mut body = BytesMut::new();
        body.put_slice(tag.as_bytes());
        body.put_u8(0);
        self.serve(backend::CommandComplete::MSGTYPE, body.freeze());
    }

    pub fn serve_error(&mut self, code: &str, message: &str) {
        let mut body = BytesMut::new();
        for (ty, value) in [(b'S', "ERROR"), (b'C', code), (b'M', message)] {
            body.put_u8(ty);
            body.put_slice(value.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0);
        self.serve(backend::ErrorResponse::MSGTYPE, body.freeze());
    }

    pub fn serve_row_description(&mut self, columns: &[(&str, Oid, u16)]) {
        self.serve(backend::RowDescription::MSGTYPE, row_description(columns));
    }

    pub fn serve_data_row(&mut self, fields: &[Option<&[u8]>]) {
        self.serve(backend::DataRow::MSGTYPE, data_row(fields));
    }

    pub fn serve_copy_in_response(&mut self, columns: u16) {
        self.serve(backend::CopyInResponse::MSGTYPE, copy_response(columns));
    }

    pub fn serve_copy_out_response(&mut self, columns: u16) {
        self.serve(backend::CopyOutResponse::MSGTYPE, copy_response(columns));
    }

    pub fn serve_copy_data(&mut self, data: &[u8]) {
        self.serve(backend::CopyData::MSGTYPE, Bytes::copy_from_slice(data));
    }

    pub fn serve_copy_done(&mut self) {
        self.serve(backend::CopyDone::MSGTYPE, Bytes::new());
    }

    /// Parse the recorded outbound bytes into `(msgtype, body)` frames.
    pub fn sent_frames(&self) -> Vec<(u8, Bytes)> {
        frames(&self.wire)
    }

    /// Outbound frames of one message type.
    pub fn sent(&self, msgtype: u8) -> Vec<Bytes> {
        self.sent_frames()
            .into_iter()
            .filter(|(t, _)| *t == msgtype)
            .map(|(_, body)| body)
            .collect()
    }

    pub fn script_exhausted(&self) -> bool {
        self.script.is_empty()
    }
}

impl PgTransport for MockTransport {
    fn poll_flush(&mut self, _: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_recv<B: BackendProtocol>(&mut self, _: &mut Context) -> Poll<Result<B>> {
        while self.sync_pending != 0 {
            let (msgtype, _) = self.script.pop_front().expect("script exhausted during drain");
            if msgtype == backend::ReadyForQuery::MSGTYPE {
                self.sync_pending -= 1;
            }
        }

        loop {
            let (msgtype, body) = self.script.pop_front().expect("script exhausted");
            match msgtype {
                t if t == backend::ErrorResponse::MSGTYPE => {
                    self.ready_request();
                    return Poll::Ready(Err(ServerError::new(body).into()));
                }
                t if t == backend::NoticeResponse::MSGTYPE => continue,
                t if t == backend::ParameterStatus::MSGTYPE => continue,
                _ => return Poll::Ready(Ok(B::decode(msgtype, body)?)),
            }
        }
    }

    fn ready_request(&mut self) {
        self.sync_pending += 1;
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.wire);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        startup.write(&mut self.wire);
    }

    fn registry(&self) -> Arc<TypeRegistry> {
        Arc::clone(&self.registry)
    }

    fn plan_stmt(&mut self, sqlid: u64) -> StmtPlan {
        let (plan, evicted) = self.cache.plan(sqlid);
        if let Some(name) = evicted {
            self.send(frontend::Close { variant: b'S', name: name.as_str() });
            self.send(frontend::Sync);
            self.ready_request();
        }
        plan
    }

    fn stmt_prepared(&mut self, sqlid: u64, name: StatementName) {
        self.cache.prepared(sqlid, name);
    }

    fn query_mode(&self) -> QueryMode {
        self.mode
    }
}

/// Build a `RowDescription` body.
pub(crate) fn row_description(columns: &[(&str, Oid, u16)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(columns.len() as u16);
    for (name, oid, format) in columns {
        buf.put_slice(name.as_bytes());
        buf.put_u8(0);
        buf.put_u32(0);
        buf.put_i16(0);
        buf.put_u32(*oid);
        buf.put_i16(-1);
        buf.put_i32(-1);
        buf.put_u16(*format);
    }
    buf.freeze()
}

/// Build a `DataRow` body.
pub(crate) fn data_row(fields: &[Option<&[u8]>]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(fields.len() as u16);
    for field in fields {
        match field {
            None => buf.put_i32(-1),
            Some(bytes) => {
                buf.put_i32(bytes.len() as i32);
                buf.put_slice(bytes);
            }
        }
    }
    buf.freeze()
}

/// `CopyInResponse`/`CopyOutResponse` body, textual format.
fn copy_response(columns: u16) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(0);
    buf.put_u16(columns);
    for _ in 0..columns {
        buf.put_u16(0);
    }
    buf.freeze()
}

/// Split typed frontend frames out of a wire capture.
pub(crate) fn frames(wire: &[u8]) -> Vec<(u8, Bytes)> {
    let mut rest = Bytes::copy_from_slice(wire);
    let mut out = Vec::new();
    while rest.has_remaining() {
        let msgtype = rest.get_u8();
        let len = rest.get_u32() as usize;
        out.push((msgtype, rest.split_to(len - 4)));
    }
    out
}
