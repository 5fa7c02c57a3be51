//! Side-channel query cancellation.
use bytes::BytesMut;
use std::io;

use crate::{common::ByteStr, net::Socket, postgres::frontend::CancelRequest};

/// A handle that can cancel the in-flight query of its connection.
///
/// The cancel request does not traverse the main connection: it travels
/// over a separately opened transient transport whose sole job is to
/// deliver 16 bytes and disconnect. It is fire-and-forget; the server
/// makes no reply, and the main connection must still drain the resulting
/// error response.
#[derive(Clone)]
pub struct CancelHandle {
    pub(crate) host: ByteStr,
    pub(crate) port: u16,
    pub(crate) socket: Option<ByteStr>,
    pub(crate) process_id: u32,
    pub(crate) secret_key: u32,
}

impl CancelHandle {
    /// Deliver the cancel request.
    ///
    /// There is no guarantee the request arrives in time or that the
    /// server honors it; success only means the bytes were written.
    pub async fn cancel(&self) -> io::Result<()> {
        let mut socket = match &self.socket {
            Some(path) => Socket::connect_socket(path).await?,
            None => Socket::connect_tcp(&self.host, self.port).await?,
        };

        let mut buf = BytesMut::with_capacity(16);
        CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        }
        .write(&mut buf);

        std::future::poll_fn(|cx| socket.poll_write_buf(&mut buf, cx)).await?;
        socket.shutdown().await
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("process_id", &self.process_id)
            .field("secret_key", &"<REDACTED>")
            .finish()
    }
}
