//! Query API types.
use std::sync::Arc;

use crate::{
    Result,
    common::ByteStr,
    error::Error,
    fetch::{ExecuteFut, FetchAll, FetchOne, FetchOptional, FetchStream},
    postgres::{BackendMessage, frontend},
    row::{ColumnDescriptor, Row, parse_row_description},
    sql::Sql,
    transport::{PgTransport, PgTransportExt},
    value::Value,
};

/// Entrypoint of the query API.
#[inline]
pub fn query<SQL, IO>(sql: SQL, io: IO) -> Query<SQL, IO>
where
    SQL: Sql,
    IO: PgTransport,
{
    Query { sql, io, params: Vec::new() }
}

/// Entrypoint of the query API for statements without result rows.
#[inline]
pub fn execute<SQL, IO>(sql: SQL, io: IO) -> Query<SQL, IO>
where
    SQL: Sql,
    IO: PgTransport,
{
    query(sql, io)
}

/// Result of a statement execution.
#[derive(Debug)]
pub struct ExecuteResult {
    pub rows_affected: u64,
}

/// The query API.
///
/// Parameter values are encoded through the connection's type registry at
/// execution time, with the format chosen by the binary transfer policy.
#[derive(Debug)]
#[must_use = "queries do nothing unless executed"]
pub struct Query<SQL, IO> {
    sql: SQL,
    io: IO,
    params: Vec<Value>,
}

impl<SQL, IO> Query<SQL, IO>
where
    SQL: Sql + Unpin,
    IO: PgTransport + Unpin,
{
    /// Bind query parameter.
    #[inline]
    pub fn bind<V: Into<Value>>(mut self, value: V) -> Self {
        self.params.push(value.into());
        self
    }

    /// Fetch rows using [`Stream`][futures_core::Stream] api.
    ///
    /// The returned `Stream` must be polled/awaited until completion,
    /// otherwise it will disturb subsequent query.
    #[inline]
    pub fn fetch(self) -> FetchStream<SQL, IO> {
        FetchStream::new(self.sql, self.io, self.params, 0, false)
    }

    /// Fetch rows in chunks of `fetch_size`, re-executing the portal each
    /// time the server suspends it.
    #[inline]
    pub fn fetch_chunked(self, fetch_size: u32) -> FetchStream<SQL, IO> {
        FetchStream::new(self.sql, self.io, self.params, fetch_size.max(1), true)
    }

    /// Fetch all rows into [`Vec`].
    #[inline]
    pub fn fetch_all(self) -> FetchAll<SQL, IO> {
        FetchAll::new(self.fetch())
    }

    /// Fetch one row.
    #[inline]
    pub fn fetch_one(self) -> FetchOne<SQL, IO> {
        let Self { sql, io, params } = self;
        FetchOne::new(FetchStream::new(sql, io, params, 1, false))
    }

    /// Optionally fetch one row.
    #[inline]
    pub fn fetch_optional(self) -> FetchOptional<SQL, IO> {
        let Self { sql, io, params } = self;
        FetchOptional::new(FetchStream::new(sql, io, params, 1, false))
    }

    /// Execute statement and return number of rows affected.
    #[inline]
    pub fn execute(self) -> ExecuteFut<SQL, IO> {
        ExecuteFut::new(self.fetch())
    }
}

impl<SQL, IO> IntoFuture for Query<SQL, IO>
where
    SQL: Sql + Unpin,
    IO: PgTransport + Unpin,
{
    type Output = Result<ExecuteResult>;

    type IntoFuture = ExecuteFut<SQL, IO>;

    #[inline]
    fn into_future(self) -> Self::IntoFuture {
        self.execute()
    }
}

// ===== Simple query protocol =====

/// Result of one statement of a simple query script.
#[derive(Debug)]
pub struct SimpleOutcome {
    /// Column descriptors, empty for statements without result rows.
    pub columns: Arc<[ColumnDescriptor]>,
    pub rows: Vec<Row>,
    /// The command tag, e.g. `SELECT 2`.
    pub tag: ByteStr,
    pub rows_affected: u64,
}

/// Run a script through the simple query protocol.
///
/// Multiple statements in one string are legal; each yields its own
/// [`SimpleOutcome`]. The backend emits `ReadyForQuery` on its own at the
/// end, including after an error, so no `Sync` is involved.
pub async fn simple_query<IO: PgTransport>(sql: &str, mut io: IO) -> Result<Vec<SimpleOutcome>> {
    io.send(frontend::Query { sql });

    let empty: Arc<[ColumnDescriptor]> = Vec::new().into();
    let mut outcomes = Vec::new();
    let mut columns = Arc::clone(&empty);
    let mut rows = Vec::new();

    loop {
        use BackendMessage::*;
        match io.recv().await? {
            RowDescription(rd) => {
                columns = parse_row_description(rd.body)?;
            }
            DataRow(dr) => {
                rows.push(Row::new(Arc::clone(&columns), io.registry(), dr.body)?);
            }
            CommandComplete(cmd) => {
                outcomes.push(SimpleOutcome {
                    columns: std::mem::replace(&mut columns, Arc::clone(&empty)),
                    rows: std::mem::take(&mut rows),
                    rows_affected: cmd.rows_affected(),
                    tag: cmd.tag,
                });
            }
            EmptyQueryResponse(_) => {}
            CopyInResponse(_) => {
                // bulk load must go through the copy API; refuse and recover
                io.send(frontend::CopyFail {
                    message: "COPY commands must go through the copy API",
                });
                io.ready_request();
                return Err(Error::state("COPY FROM STDIN through the statement facade"));
            }
            CopyOutResponse(_) => {
                io.ready_request();
                return Err(Error::state("COPY TO STDOUT through the statement facade"));
            }
            ReadyForQuery(_) => break,
            f => return Err(f.unexpected("simple query").into()),
        }
    }

    Ok(outcomes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ErrorKind,
        postgres::oid,
        testing::{MockTransport, block_on},
        value::Value,
    };

    #[test]
    fn multi_statement_script() {
        let mut mock = MockTransport::new();
        mock.serve_command_complete("CREATE TABLE");
        mock.serve_row_description(&[("a", oid::INT4, 1), ("b", oid::TEXT, 0)]);
        mock.serve_data_row(&[Some(&1i32.to_be_bytes()), Some(b"x")]);
        mock.serve_data_row(&[None, Some(b"y")]);
        mock.serve_command_complete("SELECT 2");
        mock.serve_ready(b'I');

        let outcomes =
            block_on(simple_query("CREATE TABLE t(a int); SELECT * FROM t", &mut mock)).unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].tag, "CREATE TABLE");
        assert!(outcomes[0].rows.is_empty());

        assert_eq!(outcomes[1].rows_affected, 2);
        assert_eq!(outcomes[1].rows.len(), 2);
        assert_eq!(outcomes[1].rows[0].get("a").unwrap(), Value::Int4(1));
        assert_eq!(outcomes[1].rows[1].get("a").unwrap(), Value::Null);
        assert_eq!(outcomes[1].rows[1].get("b").unwrap(), Value::Text("y".into()));
    }

    #[test]
    fn copy_through_simple_facade_is_refused() {
        let mut mock = MockTransport::new();
        mock.serve_copy_in_response(1);
        // drained on the next operation
        mock.serve_error("57014", "COPY from stdin failed");
        mock.serve_ready(b'I');
        mock.serve_command_complete("SELECT 0");
        mock.serve_ready(b'I');

        let err = block_on(simple_query("COPY t FROM STDIN", &mut mock)).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::State(_)));
        assert_eq!(mock.sent(b'f').len(), 1);

        // the connection stays usable
        block_on(simple_query("SELECT 0", &mut mock)).unwrap();
        assert!(mock.script_exhausted());
    }
}
