//! Transaction guard over a transport.
use crate::{
    Result,
    postgres::{BackendMessage, frontend},
    transport::{PgTransport, PgTransportExt},
};

/// Begin a transaction block on the given transport.
pub async fn begin<IO: PgTransport>(mut io: IO) -> Result<Transaction<IO>> {
    run(&mut io, "BEGIN").await?;
    Ok(Transaction { io: Some(io) })
}

/// RAII transaction guard.
///
/// [`commit`][Transaction::commit] or [`rollback`][Transaction::rollback]
/// consume the guard; dropping it queues a `ROLLBACK` which is delivered
/// with the next operation on the transport, so an abandoned block can be
/// cleaned up without an extra round-trip of its own.
#[must_use = "a transaction left alone rolls back on drop"]
pub struct Transaction<IO: PgTransport> {
    io: Option<IO>,
}

impl<IO: PgTransport> Transaction<IO> {
    /// Commit the block.
    pub async fn commit(mut self) -> Result<()> {
        let mut io = self.io.take().expect("transaction already finished");
        run(&mut io, "COMMIT").await
    }

    /// Roll the block back.
    ///
    /// On a broken transport this surfaces the I/O fault instead of
    /// hanging; there is nothing to wait for from a dead peer.
    pub async fn rollback(mut self) -> Result<()> {
        let mut io = self.io.take().expect("transaction already finished");
        run(&mut io, "ROLLBACK").await
    }

    /// The underlying transport, for issuing statements inside the block.
    pub fn transport(&mut self) -> &mut IO {
        self.io.as_mut().expect("transaction already finished")
    }
}

/// One simple-protocol command, drained to its `ReadyForQuery`.
async fn run<IO: PgTransport>(io: &mut IO, sql: &str) -> Result<()> {
    io.send(frontend::Query { sql });
    loop {
        use BackendMessage::*;
        match io.recv().await? {
            ReadyForQuery(_) => return Ok(()),
            CommandComplete(_) | EmptyQueryResponse(_) => {}
            f => return Err(f.unexpected("transaction control").into()),
        }
    }
}

impl<IO: PgTransport> Drop for Transaction<IO> {
    fn drop(&mut self) {
        if let Some(io) = &mut self.io {
            io.send(frontend::Query { sql: "ROLLBACK" });
            io.ready_request();
        }
    }
}

impl<IO: PgTransport> std::ops::Deref for Transaction<IO> {
    type Target = IO;

    fn deref(&self) -> &Self::Target {
        self.io.as_ref().expect("transaction already finished")
    }
}

impl<IO: PgTransport> std::ops::DerefMut for Transaction<IO> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.io.as_mut().expect("transaction already finished")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{MockTransport, block_on};

    #[test]
    fn begin_commit_round_trip() {
        let mut mock = MockTransport::new();
        mock.serve_command_complete("BEGIN");
        mock.serve_ready(b'T');
        mock.serve_command_complete("COMMIT");
        mock.serve_ready(b'I');

        block_on(async {
            let tx = begin(&mut mock).await?;
            tx.commit().await
        })
        .unwrap();

        let queries = mock.sent(b'Q');
        assert_eq!(queries.len(), 2);
        assert_eq!(&queries[0][..], b"BEGIN\0");
        assert_eq!(&queries[1][..], b"COMMIT\0");
        assert!(mock.script_exhausted());
    }

    #[test]
    fn dropping_queues_a_rollback() {
        let mut mock = MockTransport::new();
        mock.serve_command_complete("BEGIN");
        mock.serve_ready(b'T');

        block_on(async {
            let tx = begin(&mut mock).await?;
            drop(tx);
            Ok::<_, crate::Error>(())
        })
        .unwrap();

        let queries = mock.sent(b'Q');
        assert_eq!(&queries[1][..], b"ROLLBACK\0");
    }
}
