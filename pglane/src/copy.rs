//! The COPY sub-protocol engine.
//!
//! Bulk load (`COPY ... FROM STDIN`) and bulk unload (`COPY ... TO
//! STDOUT`), entered through the simple protocol. While a copy session is
//! active no other traffic is permitted on the connection; the facades
//! hold the transport exclusively until the session ends, fails, or is
//! cancelled.
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use crate::{
    Error, Result,
    common::trace,
    postgres::{BackendMessage, PgFormat, backend, frontend},
    transport::{PgTransport, PgTransportExt},
};

/// Default number of buffered bytes that triggers a `CopyData` flush in
/// the byte-sink facade.
pub const DEFAULT_COPY_CHUNK: usize = 1000;

/// Read chunk size of the pull facade.
#[cfg(feature = "tokio")]
const PULL_CHUNK: usize = 8192;

/// Lifecycle of one copy session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyState {
    /// Data may flow.
    Active,
    /// Ended normally; the server reported a row count.
    EndedOk,
    /// Aborted by the client via `CopyFail`.
    Cancelled,
    /// Torn down by a server or transport error.
    Failed,
}

/// Begin a client-to-server copy.
///
/// `sql` must be a `COPY ... FROM STDIN` statement; anything else is
/// refused with a state error and the connection stays usable.
pub async fn copy_in<IO: PgTransport>(sql: &str, mut io: IO) -> Result<CopyIn<IO>> {
    io.send(frontend::Query { sql });

    use BackendMessage::*;
    match io.recv().await? {
        CopyInResponse(resp) => Ok(CopyIn {
            io,
            state: CopyState::Active,
            format: resp.format,
            column_formats: resp.column_formats,
            handled_rows: None,
        }),
        CopyOutResponse(_) => {
            io.ready_request();
            Err(Error::state("COPY TO STDOUT through the copy-in facade"))
        }
        RowDescription(_) | DataRow(_) | CommandComplete(_) | EmptyQueryResponse(_) => {
            // an ordinary statement reached the copy facade; let the
            // remaining responses drain and refuse
            io.ready_request();
            Err(Error::state("non-COPY statement through the copy facade"))
        }
        f => Err(f.unexpected("copy-in start").into()),
    }
}

/// A connection streaming `COPY ... FROM STDIN` data to the server.
///
/// [`end`][CopyIn::end] or [`cancel`][CopyIn::cancel] must be called;
/// dropping an active session queues a `CopyFail` which is delivered on
/// the next operation of the underlying connection.
#[must_use = "an unfinished copy leaves the connection in the copy phase"]
pub struct CopyIn<IO: PgTransport> {
    io: IO,
    state: CopyState,
    format: PgFormat,
    column_formats: Vec<u16>,
    handled_rows: Option<u64>,
}

impl<IO: PgTransport> CopyIn<IO> {
    /// Returns `true` until the copy ended, failed, or was cancelled.
    pub fn is_active(&self) -> bool {
        self.state == CopyState::Active
    }

    pub fn state(&self) -> CopyState {
        self.state
    }

    /// The overall copy format announced by the server.
    pub fn format(&self) -> PgFormat {
        self.format
    }

    /// The number of columns in the data to be copied.
    pub fn num_columns(&self) -> usize {
        self.column_formats.len()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            CopyState::Active => Ok(()),
            CopyState::EndedOk => Err(Error::state("copy already ended")),
            CopyState::Cancelled => Err(Error::state("copy already cancelled")),
            CopyState::Failed => Err(Error::state("copy already failed")),
        }
    }

    /// Send one chunk of copy data.
    ///
    /// Chunk boundaries carry no meaning; the stream may be divided
    /// arbitrarily.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.io.send(frontend::CopyData { data });
        self.io.flush().await.map_err(|e| self.fail(e.into()))
    }

    /// The byte-sink facade: buffered writes chunked into `CopyData`
    /// messages of `chunk_size` bytes (see [`DEFAULT_COPY_CHUNK`]).
    pub fn writer(&mut self, chunk_size: usize) -> CopyWriter<'_, IO> {
        CopyWriter {
            copy: self,
            buf: BytesMut::new(),
            threshold: chunk_size.max(1),
        }
    }

    /// The pull facade: drain `source` to the server in fixed chunks.
    ///
    /// Returns the number of bytes copied. [`end`][CopyIn::end] must
    /// still be called.
    #[cfg(feature = "tokio")]
    pub async fn read_from<R>(&mut self, mut source: R) -> Result<u64>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        use tokio::io::{AsyncRead, ReadBuf};

        self.ensure_active()?;

        let mut total = 0u64;
        let mut chunk = vec![0u8; PULL_CHUNK];
        loop {
            let read = std::future::poll_fn(|cx| {
                let mut buf = ReadBuf::new(&mut chunk);
                Pin::new(&mut source)
                    .poll_read(cx, &mut buf)
                    .map_ok(|()| buf.filled().len())
            })
            .await
            .map_err(|e| self.fail(e.into()))?;
            if read == 0 {
                break;
            }
            total += read as u64;
            self.io.send(frontend::CopyData { data: &chunk[..read] });
            self.io.flush().await.map_err(|e| self.fail(e.into()))?;
        }
        Ok(total)
    }

    /// End the copy normally.
    ///
    /// Returns the handled row count the server reported in its
    /// `CommandComplete`.
    pub async fn end(&mut self) -> Result<u64> {
        self.ensure_active()?;
        self.io.send(frontend::CopyDone);

        let cmd = match self.io.recv::<backend::CommandComplete>().await {
            Ok(cmd) => cmd,
            Err(err) => return Err(self.fail(err)),
        };
        if let Err(err) = self.io.recv::<backend::ReadyForQuery>().await {
            return Err(self.fail(err));
        }

        let rows = cmd.rows_affected();
        trace!("copy-in complete: {rows} rows");
        self.state = CopyState::EndedOk;
        self.handled_rows = Some(rows);
        Ok(rows)
    }

    /// Abort the copy.
    ///
    /// The server is expected to respond with an error; that error is the
    /// successful outcome here. Fails with a state error once the copy
    /// already ended.
    pub async fn cancel(&mut self, message: &str) -> Result<()> {
        self.ensure_active()?;
        self.io.send(frontend::CopyFail { message });

        // the transport surfaces the provoked ErrorResponse as Err and
        // schedules the drain to the next ReadyForQuery
        match self.io.recv::<backend::CommandComplete>().await {
            Err(err) if err.as_server().is_some() => {
                self.state = CopyState::Cancelled;
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
            Ok(_) => Err(self.fail(
                crate::postgres::ProtocolError::unexpected_phase(
                    backend::CommandComplete::MSGTYPE,
                    "copy-fail",
                )
                .into(),
            )),
        }
    }

    /// The row count reported at the end of a successful copy.
    pub fn handled_rows(&self) -> Option<u64> {
        self.handled_rows
    }

    fn fail(&mut self, err: Error) -> Error {
        self.state = CopyState::Failed;
        err
    }
}

impl<IO: PgTransport> Drop for CopyIn<IO> {
    fn drop(&mut self) {
        if self.is_active() {
            self.io.send(frontend::CopyFail {
                message: "copy dropped without end or cancel",
            });
            self.io.ready_request();
        }
    }
}

impl<IO: PgTransport> std::fmt::Debug for CopyIn<IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyIn")
            .field("state", &self.state)
            .field("format", &self.format)
            .field("columns", &self.column_formats.len())
            .finish()
    }
}

/// Write-only byte sink over an active [`CopyIn`].
///
/// Bytes accumulate until the chunk threshold and are then sent as one
/// `CopyData`. [`close`][CopyWriter::close] ends the whole copy.
pub struct CopyWriter<'c, IO: PgTransport> {
    copy: &'c mut CopyIn<IO>,
    buf: BytesMut,
    threshold: usize,
}

impl<IO: PgTransport> CopyWriter<'_, IO> {
    /// Buffer bytes, flushing whole chunks as they fill up.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.copy.ensure_active()?;
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.threshold {
            let chunk = self.buf.split_to(self.threshold);
            self.copy.write(&chunk).await?;
        }
        Ok(())
    }

    /// Send any buffered remainder now.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            let rest = self.buf.split();
            self.copy.write(&rest).await?;
        }
        Ok(())
    }

    /// Flush and end the copy, returning the server row count.
    pub async fn close(mut self) -> Result<u64> {
        self.flush().await?;
        self.copy.end().await
    }
}

// ===== COPY TO STDOUT =====

/// Begin a server-to-client copy.
///
/// `sql` must be a `COPY ... TO STDOUT` statement; `COPY (SELECT ...) TO
/// STDOUT` is a valid bulk-unload path. Anything else is refused with a
/// state error and the connection stays usable.
pub async fn copy_out<IO: PgTransport>(sql: &str, mut io: IO) -> Result<CopyOut<IO>> {
    io.send(frontend::Query { sql });

    use BackendMessage::*;
    match io.recv().await? {
        CopyOutResponse(resp) => Ok(CopyOut {
            io,
            state: CopyState::Active,
            format: resp.format,
            column_formats: resp.column_formats,
            handled_rows: None,
            phase: OutPhase::Data,
        }),
        CopyInResponse(_) => {
            io.send(frontend::CopyFail { message: "COPY FROM STDIN through the copy-out facade" });
            io.ready_request();
            Err(Error::state("COPY FROM STDIN through the copy-out facade"))
        }
        RowDescription(_) | DataRow(_) | CommandComplete(_) | EmptyQueryResponse(_) => {
            io.ready_request();
            Err(Error::state("non-COPY statement through the copy facade"))
        }
        f => Err(f.unexpected("copy-out start").into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutPhase {
    Data,
    ReadyForQuery,
    Complete,
}

/// A connection streaming `COPY ... TO STDOUT` data from the server.
///
/// Yields raw `CopyData` payloads as a [`Stream`]; once the stream is
/// exhausted the final row count is available from
/// [`handled_rows`][CopyOut::handled_rows].
#[must_use = "an unread copy leaves the connection in the copy phase"]
pub struct CopyOut<IO: PgTransport> {
    io: IO,
    state: CopyState,
    format: PgFormat,
    column_formats: Vec<u16>,
    handled_rows: Option<u64>,
    phase: OutPhase,
}

impl<IO: PgTransport> CopyOut<IO> {
    /// Returns `true` while copy data may still arrive.
    pub fn is_active(&self) -> bool {
        self.state == CopyState::Active
    }

    pub fn state(&self) -> CopyState {
        self.state
    }

    /// The overall copy format announced by the server.
    pub fn format(&self) -> PgFormat {
        self.format
    }

    /// The number of columns in the copied data.
    pub fn num_columns(&self) -> usize {
        self.column_formats.len()
    }

    /// The row count from the final `CommandComplete`, once finished.
    pub fn handled_rows(&self) -> Option<u64> {
        self.handled_rows
    }

    /// Pull the next chunk, `None` once the copy completed.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        let mut me = Pin::new(self);
        std::future::poll_fn(|cx| me.as_mut().poll_next(cx)).await.transpose()
    }

    /// The push facade: forward every chunk into `sink` until completion,
    /// returning the server-reported row count.
    #[cfg(feature = "tokio")]
    pub async fn drain_to<W>(&mut self, mut sink: W) -> Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        use tokio::io::AsyncWrite;

        while let Some(chunk) = self.read().await? {
            let mut rest = &chunk[..];
            while !rest.is_empty() {
                let n = std::future::poll_fn(|cx| Pin::new(&mut sink).poll_write(cx, rest))
                    .await
                    .map_err(Error::from)?;
                if n == 0 {
                    return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
                }
                rest = &rest[n..];
            }
        }
        Ok(self.handled_rows.unwrap_or_default())
    }
}

impl<IO: PgTransport> Stream for CopyOut<IO> {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();

        loop {
            match me.phase {
                OutPhase::Data => {
                    use BackendMessage::*;
                    let msg = match ready!(me.io.poll_recv(cx)) {
                        Ok(msg) => msg,
                        Err(err) => {
                            me.state = CopyState::Failed;
                            me.phase = OutPhase::Complete;
                            return Poll::Ready(Some(Err(err)));
                        }
                    };
                    match msg {
                        CopyData(data) => return Poll::Ready(Some(Ok(data.data))),
                        CopyDone(_) => {}
                        CommandComplete(cmd) => {
                            me.handled_rows = Some(cmd.rows_affected());
                            me.phase = OutPhase::ReadyForQuery;
                        }
                        f => {
                            me.state = CopyState::Failed;
                            me.phase = OutPhase::Complete;
                            return Poll::Ready(Some(Err(f.unexpected("copy-out").into())));
                        }
                    }
                }
                OutPhase::ReadyForQuery => {
                    if let Err(err) = ready!(me.io.poll_recv::<backend::ReadyForQuery>(cx)) {
                        me.state = CopyState::Failed;
                        me.phase = OutPhase::Complete;
                        return Poll::Ready(Some(Err(err)));
                    }
                    me.state = CopyState::EndedOk;
                    me.phase = OutPhase::Complete;
                }
                OutPhase::Complete => return Poll::Ready(None),
            }
        }
    }
}

impl<IO: PgTransport> Drop for CopyOut<IO> {
    fn drop(&mut self) {
        if self.is_active() {
            // leftover copy data is skipped on the next operation
            self.io.ready_request();
        }
    }
}

impl<IO: PgTransport> std::fmt::Debug for CopyOut<IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyOut")
            .field("state", &self.state)
            .field("format", &self.format)
            .field("handled_rows", &self.handled_rows)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ErrorKind,
        postgres::frontend::FrontendProtocol,
        query::simple_query,
        testing::{MockTransport, block_on},
    };

    const LINES: [&[u8]; 4] = [
        b"First Row\t1\t1.10\n",
        b"Second Row\t2\t-22.20\n",
        b"\\N\t\\N\t\\N\n",
        b"\t4\t444.40\n",
    ];

    #[test]
    fn copy_in_row_at_a_time() {
        let mut mock = MockTransport::new();
        mock.serve_copy_in_response(3);
        mock.serve_command_complete("COPY 4");
        mock.serve_ready(b'I');

        let rows = block_on(async {
            let mut copy = copy_in("COPY copytest FROM STDIN", &mut mock).await?;
            assert!(copy.is_active());
            assert_eq!(copy.num_columns(), 3);
            for line in LINES {
                copy.write(line).await?;
            }
            copy.end().await
        })
        .unwrap();

        assert_eq!(rows, 4);

        // every line went out as its own CopyData, then CopyDone
        let sent = mock.sent(frontend::CopyData::MSGTYPE);
        assert_eq!(sent.len(), 4);
        for (frame, line) in sent.iter().zip(LINES) {
            assert_eq!(&frame[..], line);
        }
        assert_eq!(mock.sent(frontend::CopyDone::MSGTYPE).len(), 1);
        assert!(mock.script_exhausted());
    }

    #[test]
    fn cancel_after_end_is_a_state_error() {
        let mut mock = MockTransport::new();
        mock.serve_copy_in_response(1);
        mock.serve_command_complete("COPY 0");
        mock.serve_ready(b'I');

        block_on(async {
            let mut copy = copy_in("COPY copytest FROM STDIN", &mut mock).await?;
            copy.end().await?;
            assert_eq!(copy.state(), CopyState::EndedOk);
            assert!(!copy.is_active());

            let err = copy.cancel("too late").await.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::State(_)));
            // writes after the end are refused the same way
            let err = copy.write(b"x").await.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::State(_)));
            Ok::<_, crate::Error>(())
        })
        .unwrap();
    }

    #[test]
    fn cancel_accepts_the_provoked_error() {
        let mut mock = MockTransport::new();
        mock.serve_copy_in_response(1);
        mock.serve_error("57014", "COPY from stdin failed: abort");
        mock.serve_ready(b'I');

        block_on(async {
            let mut copy = copy_in("COPY copytest FROM STDIN", &mut mock).await?;
            copy.write(b"partial").await?;
            copy.cancel("abort").await?;
            assert_eq!(copy.state(), CopyState::Cancelled);
            Ok::<_, crate::Error>(())
        })
        .unwrap();

        assert_eq!(mock.sent(frontend::CopyFail::MSGTYPE).len(), 1);
    }

    #[test]
    fn writer_chunks_at_the_threshold() {
        let mut mock = MockTransport::new();
        mock.serve_copy_in_response(1);
        mock.serve_command_complete("COPY 1");
        mock.serve_ready(b'I');

        let rows = block_on(async {
            let mut copy = copy_in("COPY copytest FROM STDIN", &mut mock).await?;
            let mut writer = copy.writer(5);
            writer.write(b"0123").await?;
            writer.write(b"456789ab").await?;
            writer.close().await
        })
        .unwrap();
        assert_eq!(rows, 1);

        let sent = mock.sent(frontend::CopyData::MSGTYPE);
        assert_eq!(sent.len(), 3);
        assert_eq!(&sent[0][..], b"01234");
        assert_eq!(&sent[1][..], b"56789");
        assert_eq!(&sent[2][..], b"ab");
    }

    #[cfg(feature = "tokio")]
    #[test]
    fn pull_facade_drains_a_reader() {
        let mut mock = MockTransport::new();
        mock.serve_copy_in_response(1);
        mock.serve_command_complete("COPY 1");
        mock.serve_ready(b'I');

        let (bytes, rows) = block_on(async {
            let mut copy = copy_in("COPY copytest FROM STDIN", &mut mock).await?;
            let bytes = copy.read_from(&b"hello\tworld\n"[..]).await?;
            let rows = copy.end().await?;
            Ok::<_, crate::Error>((bytes, rows))
        })
        .unwrap();

        assert_eq!(bytes, 12);
        assert_eq!(rows, 1);
        let sent = mock.sent(frontend::CopyData::MSGTYPE);
        assert_eq!(&sent[0][..], b"hello\tworld\n");
    }

    #[test]
    fn non_copy_statement_through_the_copy_facade() {
        let mut mock = MockTransport::new();
        mock.serve_row_description(&[("a", crate::postgres::oid::INT4, 1)]);
        // remainder of the refused statement, consumed by the drain
        mock.serve_data_row(&[Some(&1i32.to_be_bytes())]);
        mock.serve_command_complete("SELECT 1");
        mock.serve_ready(b'I');
        mock.serve_command_complete("SELECT 0");
        mock.serve_ready(b'I');

        let err = block_on(copy_in("SELECT 1", &mut mock)).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::State(_)));

        // the connection stays usable after the drain
        block_on(simple_query("SELECT 0", &mut mock)).unwrap();
        assert!(mock.script_exhausted());
    }

    #[test]
    fn copy_out_streams_chunks_and_reports_rows() {
        let mut mock = MockTransport::new();
        mock.serve_copy_out_response(3);
        mock.serve_copy_data(LINES[0]);
        mock.serve_copy_data(LINES[1]);
        mock.serve_copy_done();
        mock.serve_command_complete("COPY 2");
        mock.serve_ready(b'I');

        block_on(async {
            let mut copy = copy_out("COPY copytest TO STDOUT", &mut mock).await?;
            assert_eq!(copy.read().await?.as_deref(), Some(&LINES[0][..]));
            assert_eq!(copy.read().await?.as_deref(), Some(&LINES[1][..]));
            assert_eq!(copy.read().await?, None);
            assert_eq!(copy.handled_rows(), Some(2));
            assert_eq!(copy.state(), CopyState::EndedOk);
            Ok::<_, crate::Error>(())
        })
        .unwrap();
        assert!(mock.script_exhausted());
    }

    /// `COPY (SELECT ...) TO STDOUT` is a plain copy-out; the row count
    /// comes from the final CommandComplete.
    #[cfg(feature = "tokio")]
    #[test]
    fn copy_out_drains_into_a_sink() {
        let mut mock = MockTransport::new();
        mock.serve_copy_out_response(1);
        mock.serve_copy_data(b"1\n");
        mock.serve_copy_data(b"2\n");
        mock.serve_copy_done();
        mock.serve_command_complete("COPY 2");
        mock.serve_ready(b'I');

        let mut sink = std::io::Cursor::new(Vec::new());
        let rows = block_on(async {
            let mut copy = copy_out("COPY (SELECT n FROM t) TO STDOUT", &mut mock).await?;
            copy.drain_to(&mut sink).await
        })
        .unwrap();

        assert_eq!(rows, 2);
        assert_eq!(sink.into_inner(), b"1\n2\n");
    }

    #[test]
    fn dropping_an_active_copy_queues_a_copy_fail() {
        let mut mock = MockTransport::new();
        mock.serve_copy_in_response(1);

        block_on(async {
            let copy = copy_in("COPY copytest FROM STDIN", &mut mock).await?;
            drop(copy);
            Ok::<_, crate::Error>(())
        })
        .unwrap();

        assert_eq!(mock.sent(frontend::CopyFail::MSGTYPE).len(), 1);
    }
}
