//! Postgres Wire Protocol Core
//!
//! A client-side implementation of the postgres frontend/backend protocol
//! version 3.0: message framing, typed value transfer in both text and
//! binary formats, the extended query pipeline with prepared statement
//! caching, and the COPY sub-protocol.
//!
//! # Examples
//!
//! Single connection:
//!
//! ```no_run
//! use pglane::{Connection, Value};
//!
//! # async fn app() -> pglane::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//!
//! let row = pglane::query("SELECT 420, $1", &mut conn)
//!     .bind("Foo")
//!     .fetch_one()
//!     .await?;
//!
//! assert_eq!(row.get(0)?, Value::Int4(420));
//! assert_eq!(row.get(1)?, Value::Text("Foo".into()));
//! # Ok(())
//! # }
//! ```
//!
//! Bulk load:
//!
//! ```no_run
//! # async fn app() -> pglane::Result<()> {
//! let mut conn = pglane::Connection::connect_env().await?;
//!
//! let mut copy = pglane::copy_in("COPY foo FROM STDIN", &mut conn).await?;
//! copy.write(b"First Row\t1\n").await?;
//! copy.write(b"Second Row\t2\n").await?;
//! let rows = copy.end().await?;
//!
//! assert_eq!(rows, 2);
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;
mod net;

// Protocol
pub mod postgres;

// Values
mod value;
pub mod types;
pub mod temporal;

// Component
mod statement;
pub mod sql;
pub mod row;
pub mod phase;

// Operation
pub mod transport;
pub mod fetch;
pub mod query;
pub mod copy;
pub mod transaction;

// Connection
pub mod connection;

mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{CancelHandle, Config, Connection, QueryMode};
pub use copy::{CopyIn, CopyOut, CopyState, copy_in, copy_out};
pub use error::{EmptyQueryError, Error, ErrorKind, Result, RowNotFound, StateError};
pub use phase::{Phase, TxStatus};
#[doc(inline)]
pub use query::{ExecuteResult, execute, query, simple_query};
pub use row::Row;
pub use sql::SqlExt;
pub use statement::{Id, PortalName, StatementName, StmtPlan};
pub use transaction::begin;
pub use transport::PgTransport;
pub use types::{PgArray, PgNumeric, TypeRegistry};
pub use value::{PgInterval, PgTimeTz, Value};
