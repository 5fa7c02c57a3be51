//! The extended query pipeline.
//!
//! `Parse` (skipped on a statement cache hit), `Bind`, `Describe`,
//! `Execute`, then `Sync`, or `Flush` when a row limit is in play so a
//! suspended portal can be continued or closed before synchronizing.
use futures_core::Stream;
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    Error, Result,
    connection::QueryMode,
    error::EmptyQueryError,
    ext::{BindParams, UsizeExt},
    postgres::{
        Oid, PgFormat,
        backend::{self, CommandComplete},
        frontend,
    },
    row::{ColumnDescriptor, Row, parse_row_description},
    sql::Sql,
    statement::{PortalName, StatementName, StmtPlan},
    transport::PgTransport,
    types::TypeRegistry,
    value::Value,
};

/// A parameter encoded through the type registry, ready for `Bind`.
#[derive(Debug)]
pub(crate) struct Encoded {
    bytes: Bytes,
    is_null: bool,
    oid: Oid,
    format: PgFormat,
}

impl Encoded {
    /// Encode a parameter with the format chosen by the registry policy.
    pub(crate) fn new(registry: &TypeRegistry, value: &Value) -> Result<Encoded> {
        let oid = value.oid();
        if value.is_null() {
            return Ok(Encoded { bytes: Bytes::new(), is_null: true, oid, format: PgFormat::Text });
        }
        let format = registry.param_format(oid);
        let mut buf = BytesMut::new();
        registry.encode(value, format, &mut buf)?;
        Ok(Encoded { bytes: buf.freeze(), is_null: false, oid, format })
    }

    pub(crate) fn oid(&self) -> Oid {
        self.oid
    }

    pub(crate) fn format(&self) -> PgFormat {
        self.format
    }
}

impl Buf for Encoded {
    fn remaining(&self) -> usize {
        self.bytes.remaining()
    }

    fn chunk(&self) -> &[u8] {
        self.bytes.chunk()
    }

    fn advance(&mut self, cnt: usize) {
        self.bytes.advance(cnt);
    }
}

impl BindParams for Encoded {
    fn size(&self) -> i32 {
        match self.is_null {
            true => -1,
            false => self.bytes.len() as i32,
        }
    }
}

/// Fingerprint of a sql text for the statement cache.
pub(crate) fn fingerprint(sql: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    sql.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug)]
struct PrepareData {
    sqlid: u64,
    stmt: StatementName,
    /// `Some` while a named Parse awaits its ParseComplete.
    pending_name: Option<StatementName>,
    cache_hit: bool,
}

/// Write the Parse round of the sequence, consulting the statement cache.
fn prepare(sql: &impl Sql, params: &[Encoded], mut io: impl PgTransport) -> PrepareData {
    let persist = sql.persistent();
    let sql = sql.sql().trim();
    let sqlid = fingerprint(sql);

    let plan = match persist {
        true => io.plan_stmt(sqlid),
        false => StmtPlan::Unnamed,
    };

    let (stmt, pending_name) = match plan {
        StmtPlan::Cached(stmt) => {
            return PrepareData { sqlid, stmt, pending_name: None, cache_hit: true };
        }
        StmtPlan::Prepare(stmt) => (stmt.clone(), Some(stmt)),
        StmtPlan::Unnamed => (StatementName::unnamed(), None),
    };

    io.send(frontend::Parse {
        prepare_name: stmt.as_str(),
        sql,
        oids_len: params.len() as _,
        oids: params.iter().map(Encoded::oid),
    });
    io.send(frontend::Flush);

    PrepareData { sqlid, stmt, pending_name, cache_hit: false }
}

/// Write the Bind/Describe/Execute round of the sequence.
///
/// With no row limit the round is closed by `Sync`; with a limit, by
/// `Flush`, so the portal survives a `PortalSuspended`.
fn portal(data: &PrepareData, params: &mut Vec<Encoded>, max_row: u32, mut io: impl PgTransport) {
    let portal = PortalName::unnamed();

    let param_formats = params.iter().map(Encoded::format).collect::<Vec<_>>();
    let params_size_hint = params.iter().fold(0, |acc, p| acc + 4 + p.remaining().to_u32());

    io.send(frontend::Bind {
        portal_name: portal.as_str(),
        stmt_name: data.stmt.as_str(),
        param_formats_len: param_formats.len().to_u16(),
        param_formats,
        params_len: params.len().to_u16(),
        params_size_hint,
        params: std::mem::take(params).into_iter(),
        result_formats_len: 1,
        result_formats: [PgFormat::Binary],
    });
    io.send(frontend::Describe { kind: b'P', name: portal.as_str() });
    io.send(frontend::Execute { portal_name: portal.as_str(), max_row });
    match max_row {
        0 => io.send(frontend::Sync),
        _ => io.send(frontend::Flush),
    }
}

/// Streaming result of one statement.
///
/// The stream must be polled until completion, otherwise it will disturb
/// subsequent queries on the same transport.
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct FetchStream<SQL, IO> {
    sql: SQL,
    io: IO,
    params: Vec<Value>,
    encoded: Vec<Encoded>,
    data: Option<PrepareData>,
    phase: Phase,
    /// Execute row limit; zero means all rows in one round.
    max_row: u32,
    /// Re-execute a suspended portal instead of closing it.
    page: bool,
    cmd: Option<CommandComplete>,
    empty: bool,
}

#[derive(Debug)]
enum Phase {
    Prepare,
    PrepareComplete,
    Portal,
    BindComplete,
    RowDescription,
    DataRow(Arc<[ColumnDescriptor]>),
    ClosePortal,
    ReadyForQuery,
    Complete,
}

impl<SQL, IO> FetchStream<SQL, IO> {
    pub(crate) fn new(sql: SQL, io: IO, params: Vec<Value>, max_row: u32, page: bool) -> Self {
        Self {
            sql,
            io,
            params,
            encoded: Vec::new(),
            data: None,
            phase: Phase::Prepare,
            max_row,
            page,
            cmd: None,
            empty: false,
        }
    }

    pub(crate) fn command_complete(&mut self) -> Option<CommandComplete> {
        self.cmd.take()
    }

    fn limited(&self) -> bool {
        self.max_row != 0
    }
}

impl<SQL, IO> Stream for FetchStream<SQL, IO>
where
    SQL: Sql + Unpin,
    IO: PgTransport + Unpin,
{
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();

        loop {
            match &mut me.phase {
                Phase::Prepare => {
                    // a parameterless statement in simple mode takes the
                    // simple protocol; responses converge below
                    if me.io.query_mode() == QueryMode::Simple
                        && me.params.is_empty()
                        && !me.limited()
                    {
                        me.io.send(frontend::Query { sql: me.sql.sql().trim() });
                        me.phase = Phase::RowDescription;
                        continue;
                    }

                    let registry = me.io.registry();
                    let mut encoded = Vec::with_capacity(me.params.len());
                    for value in &me.params {
                        match Encoded::new(&registry, value) {
                            Ok(e) => encoded.push(e),
                            Err(err) => {
                                me.phase = Phase::Complete;
                                return Poll::Ready(Some(Err(err)));
                            }
                        }
                    }
                    me.encoded = encoded;

                    me.data = Some(prepare(&me.sql, &me.encoded, &mut me.io));
                    me.phase = match me.data.as_ref().unwrap().cache_hit {
                        true => Phase::Portal,
                        false => Phase::PrepareComplete,
                    };
                }
                Phase::PrepareComplete => {
                    ready!(me.io.poll_recv::<backend::ParseComplete>(cx)?);
                    let data = me.data.as_mut().unwrap();
                    if let Some(name) = data.pending_name.take() {
                        me.io.stmt_prepared(data.sqlid, name);
                    }
                    me.phase = Phase::Portal;
                }
                Phase::Portal => {
                    let data = me.data.as_ref().unwrap();
                    portal(data, &mut me.encoded, me.max_row, &mut me.io);
                    me.phase = Phase::BindComplete;
                }
                Phase::BindComplete => {
                    ready!(me.io.poll_recv::<backend::BindComplete>(cx)?);
                    me.phase = Phase::RowDescription;
                }
                Phase::RowDescription => {
                    use backend::BackendMessage::*;
                    match ready!(me.io.poll_recv(cx)?) {
                        NoData(_) => {}
                        // received after `NoData`
                        CommandComplete(cmd) => {
                            me.cmd = Some(cmd);
                            if me.limited() {
                                me.io.send(frontend::Sync);
                            }
                            me.phase = Phase::ReadyForQuery;
                        }
                        EmptyQueryResponse(_) => {
                            me.empty = true;
                            if me.limited() {
                                me.io.send(frontend::Sync);
                            }
                            me.phase = Phase::ReadyForQuery;
                        }
                        RowDescription(rd) => match parse_row_description(rd.body) {
                            Ok(columns) => me.phase = Phase::DataRow(columns),
                            Err(err) => {
                                me.phase = Phase::Complete;
                                return Poll::Ready(Some(Err(err.into())));
                            }
                        },
                        CopyInResponse(_) => {
                            return Poll::Ready(Some(Err(me.refuse_copy_in())));
                        }
                        CopyOutResponse(_) => {
                            return Poll::Ready(Some(Err(me.refuse_copy_out())));
                        }
                        f => {
                            let err = f.unexpected("description recv");
                            me.phase = Phase::Complete;
                            return Poll::Ready(Some(Err(err.into())));
                        }
                    }
                }
                Phase::DataRow(columns) => {
                    use backend::BackendMessage::*;
                    match ready!(me.io.poll_recv(cx)?) {
                        DataRow(dr) => {
                            let row = Row::new(Arc::clone(columns), me.io.registry(), dr.body);
                            return match row {
                                Ok(row) => Poll::Ready(Some(Ok(row))),
                                Err(err) => {
                                    me.phase = Phase::Complete;
                                    Poll::Ready(Some(Err(err.into())))
                                }
                            };
                        }

                        // `Execute` phase terminations:
                        CommandComplete(cmd) => {
                            me.cmd = Some(cmd);
                            if me.limited() {
                                me.io.send(frontend::Sync);
                            }
                            me.phase = Phase::ReadyForQuery;
                        }
                        PortalSuspended(_) => {
                            if me.page {
                                // the row limit was reached; re-execute the
                                // surviving portal for the next chunk
                                me.io.send(frontend::Execute {
                                    portal_name: "",
                                    max_row: me.max_row,
                                });
                                me.io.send(frontend::Flush);
                            } else {
                                me.io.send(frontend::Close { variant: b'P', name: "" });
                                me.io.send(frontend::Sync);
                                me.phase = Phase::ClosePortal;
                            }
                        }
                        EmptyQueryResponse(_) => {
                            me.empty = true;
                            if me.limited() {
                                me.io.send(frontend::Sync);
                            }
                            me.phase = Phase::ReadyForQuery;
                        }
                        CopyInResponse(_) => {
                            return Poll::Ready(Some(Err(me.refuse_copy_in())));
                        }
                        CopyOutResponse(_) => {
                            return Poll::Ready(Some(Err(me.refuse_copy_out())));
                        }
                        f => {
                            let err = f.unexpected("fetching data rows");
                            me.phase = Phase::Complete;
                            return Poll::Ready(Some(Err(err.into())));
                        }
                    }
                }
                Phase::ClosePortal => {
                    ready!(me.io.poll_recv::<backend::CloseComplete>(cx)?);
                    me.phase = Phase::ReadyForQuery;
                }
                Phase::ReadyForQuery => {
                    use backend::BackendMessage::*;
                    // tolerate trailing blocks of a multi-statement simple
                    // script until the synchronization barrier
                    match ready!(me.io.poll_recv(cx)?) {
                        ReadyForQuery(_) => {
                            me.phase = Phase::Complete;
                            if me.empty {
                                return Poll::Ready(Some(Err(EmptyQueryError.into())));
                            }
                        }
                        _ => continue,
                    }
                }
                Phase::Complete => return Poll::Ready(None),
            }
        }
    }
}

impl<SQL, IO> FetchStream<SQL, IO>
where
    IO: PgTransport,
{
    /// A COPY command reached the statement pipeline; refuse it and leave
    /// the connection recoverable.
    ///
    /// The Sync that closed the round was ignored by the backend while it
    /// was in copy mode, so the abort needs a Sync of its own.
    fn refuse_copy_in(&mut self) -> Error {
        self.io.send(frontend::CopyFail {
            message: "COPY commands must go through the copy API",
        });
        self.io.send(frontend::Sync);
        self.io.ready_request();
        self.phase = Phase::Complete;
        Error::state("COPY FROM STDIN through the statement pipeline")
    }

    fn refuse_copy_out(&mut self) -> Error {
        self.io.ready_request();
        self.phase = Phase::Complete;
        Error::state("COPY TO STDOUT through the statement pipeline")
    }
}

// ===== Collector futures =====

macro_rules! collector {
    ($(#[$doc:meta])* struct $name:ident) => {
        $(#[$doc])*
        #[derive(Debug)]
        #[must_use = "futures do nothing unless you `.await` or poll them"]
        pub struct $name<SQL, IO> {
            stream: FetchStream<SQL, IO>,
            rows: Vec<Row>,
        }

        impl<SQL, IO> $name<SQL, IO> {
            pub(crate) fn new(stream: FetchStream<SQL, IO>) -> Self {
                Self { stream, rows: Vec::new() }
            }
        }
    };
}

collector! {
    /// Future collecting every row into a [`Vec`].
    struct FetchAll
}

impl<SQL, IO> Future for FetchAll<SQL, IO>
where
    SQL: Sql + Unpin,
    IO: PgTransport + Unpin,
{
    type Output = Result<Vec<Row>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        while let Some(row) = ready!(Pin::new(&mut me.stream).poll_next(cx)?) {
            me.rows.push(row);
        }

        Poll::Ready(Ok(std::mem::take(&mut me.rows)))
    }
}

collector! {
    /// Future resolving to the first row, or an error when there is none.
    struct FetchOne
}

impl<SQL, IO> Future for FetchOne<SQL, IO>
where
    SQL: Sql + Unpin,
    IO: PgTransport + Unpin,
{
    type Output = Result<Row>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        while let Some(row) = ready!(Pin::new(&mut me.stream).poll_next(cx)?) {
            if me.rows.is_empty() {
                me.rows.push(row);
            }
        }

        match me.rows.pop() {
            Some(row) => Poll::Ready(Ok(row)),
            None => Poll::Ready(Err(crate::error::RowNotFound.into())),
        }
    }
}

collector! {
    /// Future resolving to the first row, if any.
    struct FetchOptional
}

impl<SQL, IO> Future for FetchOptional<SQL, IO>
where
    SQL: Sql + Unpin,
    IO: PgTransport + Unpin,
{
    type Output = Result<Option<Row>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        while let Some(row) = ready!(Pin::new(&mut me.stream).poll_next(cx)?) {
            if me.rows.is_empty() {
                me.rows.push(row);
            }
        }

        Poll::Ready(Ok(me.rows.pop()))
    }
}

/// Future resolving to the server-reported affected row count.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct ExecuteFut<SQL, IO> {
    stream: FetchStream<SQL, IO>,
}

impl<SQL, IO> ExecuteFut<SQL, IO> {
    pub(crate) fn new(stream: FetchStream<SQL, IO>) -> Self {
        Self { stream }
    }
}

impl<SQL, IO> Future for ExecuteFut<SQL, IO>
where
    SQL: Sql + Unpin,
    IO: PgTransport + Unpin,
{
    type Output = Result<crate::query::ExecuteResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        while ready!(Pin::new(&mut me.stream).poll_next(cx)?).is_some() { }

        let rows_affected = me
            .stream
            .command_complete()
            .map(|cmd| cmd.rows_affected())
            .unwrap_or_default();
        Poll::Ready(Ok(crate::query::ExecuteResult { rows_affected }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ErrorKind,
        postgres::oid,
        postgres::frontend::FrontendProtocol,
        query::query,
        testing::{MockTransport, block_on},
    };

    fn serve_execute_round(mock: &mut MockTransport, parse: bool) {
        if parse {
            mock.serve_parse_complete();
        }
        mock.serve_bind_complete();
        mock.serve_no_data();
        mock.serve_command_complete("INSERT 0 1");
        mock.serve_ready(b'I');
    }

    /// With prepare-threshold 2 and three executions, exactly one named
    /// Parse goes over the wire: unnamed on the first use, named on the
    /// second, none on the third.
    #[test]
    fn statement_promotion_at_threshold() {
        let mut mock = MockTransport::with_threshold(2);

        serve_execute_round(&mut mock, true);
        serve_execute_round(&mut mock, true);
        serve_execute_round(&mut mock, false);

        for _ in 0..3 {
            block_on(query("INSERT INTO foo VALUES (1)", &mut mock).execute()).unwrap();
        }

        let parses = mock.sent(b'P');
        assert_eq!(parses.len(), 2);
        let named = parses.iter().filter(|body| body[0] != 0).count();
        assert_eq!(named, 1);
        assert!(mock.script_exhausted());
    }

    #[test]
    fn bind_uses_declared_oids_and_text_params() {
        let mut mock = MockTransport::new();
        mock.serve_parse_complete();
        mock.serve_bind_complete();
        mock.serve_row_description(&[("a", oid::INT4, 1)]);
        mock.serve_data_row(&[Some(&42i32.to_be_bytes())]);
        mock.serve_command_complete("SELECT 1");
        mock.serve_ready(b'I');

        let rows = block_on(query("SELECT $1", &mut mock).bind("Foo").fetch_all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0).unwrap(), crate::value::Value::Int4(42));

        // the Parse message declares the parameter oid
        let parse = &mock.sent(b'P')[0];
        assert!(parse.ends_with(&[0, 1, 0, 0, 0, 25]), "oids_len 1, oid TEXT");

        // the Bind message carries the text-encoded parameter and asks for
        // binary results with a single format code
        let bind = &mock.sent(b'B')[0];
        let param = b"Foo";
        assert!(bind.windows(param.len()).any(|w| w == param));
        assert!(bind.ends_with(&[0, 1, 0, 1]), "result_formats_len 1, binary");
    }

    /// A statement error surfaces as a server error and the pipeline
    /// recovers within one Sync/ReadyForQuery round-trip.
    #[test]
    fn error_recovery_within_one_sync() {
        let mut mock = MockTransport::new();

        mock.serve_parse_complete();
        mock.serve_bind_complete();
        mock.serve_error("42601", "syntax error at or near \"xxx\"");
        mock.serve_ready(b'E');

        serve_execute_round(&mut mock, true);

        let err = block_on(query("SELEC 1", &mut mock).execute()).unwrap_err();
        assert_eq!(err.as_server().unwrap().code(), "42601");

        block_on(query("INSERT INTO foo VALUES (1)", &mut mock).execute()).unwrap();
        assert!(mock.script_exhausted());
    }

    /// A COPY statement reaching the statement pipeline is refused with a
    /// state error, a CopyFail is sent, and the connection stays usable.
    #[test]
    fn copy_through_statement_pipeline_is_refused() {
        let mut mock = MockTransport::new();

        mock.serve_parse_complete();
        mock.serve_bind_complete();
        mock.serve_no_data();
        mock.serve_copy_in_response(3);
        // the refused copy drains to the next ready-for-query
        mock.serve_error("57014", "COPY from stdin failed");
        mock.serve_ready(b'I');

        serve_execute_round(&mut mock, true);

        let err = block_on(query("COPY copytest FROM STDIN", &mut mock).execute()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::State(_)));
        assert_eq!(mock.sent(b'f').len(), 1);

        block_on(query("INSERT INTO foo VALUES (1)", &mut mock).execute()).unwrap();
        assert!(mock.script_exhausted());
    }

    /// A row limit switches the round to Flush so the suspended portal
    /// can be closed before synchronizing.
    #[test]
    fn row_limit_closes_a_suspended_portal() {
        let mut mock = MockTransport::new();
        mock.serve_parse_complete();
        mock.serve_bind_complete();
        mock.serve_row_description(&[("a", oid::INT4, 1)]);
        mock.serve_data_row(&[Some(&1i32.to_be_bytes())]);
        mock.serve(backend::PortalSuspended::MSGTYPE, Bytes::new());
        mock.serve(backend::CloseComplete::MSGTYPE, Bytes::new());
        mock.serve_ready(b'I');

        let row = block_on(query("SELECT a FROM big", &mut mock).fetch_one()).unwrap();
        assert_eq!(row.get(0).unwrap(), crate::value::Value::Int4(1));

        // Execute carried max_row 1, and the portal was closed
        let execute = &mock.sent(b'E')[0];
        assert_eq!(&execute[..], &[0, 0, 0, 0, 1]);
        let close = mock.sent(b'C');
        assert_eq!(close.len(), 1);
        assert_eq!(close[0][0], b'P');
        assert!(mock.script_exhausted());
    }

    /// Chunked fetching re-executes the portal on every suspension.
    #[test]
    fn chunked_fetch_reexecutes_on_suspension() {
        let mut mock = MockTransport::new();
        mock.serve_parse_complete();
        mock.serve_bind_complete();
        mock.serve_row_description(&[("a", oid::INT4, 1)]);
        mock.serve_data_row(&[Some(&1i32.to_be_bytes())]);
        mock.serve(backend::PortalSuspended::MSGTYPE, Bytes::new());
        mock.serve_data_row(&[Some(&2i32.to_be_bytes())]);
        mock.serve_command_complete("SELECT 2");
        mock.serve_ready(b'I');

        let rows = block_on(async {
            let mut stream = query("SELECT a FROM big", &mut mock).fetch_chunked(1);
            let mut rows = Vec::new();
            loop {
                let next =
                    std::future::poll_fn(|cx| Pin::new(&mut stream).poll_next(cx)).await;
                match next {
                    Some(row) => rows.push(row?),
                    None => break,
                }
            }
            Ok::<_, crate::Error>(rows)
        })
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(mock.sent(b'E').len(), 2, "one Execute per chunk");
        assert!(mock.script_exhausted());
    }

    /// Simple query mode routes parameterless statements through the
    /// simple protocol.
    #[test]
    fn simple_mode_uses_the_simple_protocol() {
        let mut mock = MockTransport::new();
        mock.mode = QueryMode::Simple;
        mock.serve_row_description(&[("a", oid::INT4, 1)]);
        mock.serve_data_row(&[Some(&7i32.to_be_bytes())]);
        mock.serve_command_complete("SELECT 1");
        mock.serve_ready(b'I');

        let rows = block_on(query("SELECT 7", &mut mock).fetch_all()).unwrap();
        assert_eq!(rows.len(), 1);

        assert_eq!(mock.sent(frontend::Query::MSGTYPE).len(), 1);
        assert!(mock.sent(b'P').is_empty());
        assert!(mock.sent(b'B').is_empty());
    }

    /// An empty query string surfaces as its own error after the
    /// synchronization point is consumed.
    #[test]
    fn empty_query_response() {
        let mut mock = MockTransport::new();
        mock.serve_parse_complete();
        mock.serve_bind_complete();
        mock.serve(backend::EmptyQueryResponse::MSGTYPE, Bytes::new());
        mock.serve_ready(b'I');

        let err = block_on(query("", &mut mock).execute()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::EmptyQuery(_)));
        assert!(mock.script_exhausted());
    }
}
