use std::io;

/// an either `TcpStream` or `UnixStream`, which implement
/// `AsyncRead` and `AsyncWrite` transparently
///
/// require `tokio` feature, otherwise panic at runtime
pub struct Socket {
    kind: Kind,
}

enum Kind {
    #[cfg(feature = "tokio")]
    TokioTcp(tokio::net::TcpStream),
    #[cfg(all(feature = "tokio", unix))]
    TokioUnixSocket(tokio::net::UnixStream),
}

impl Socket {
    pub async fn connect_tcp(host: &str, port: u16) -> io::Result<Socket> {
        #[cfg(feature = "tokio")]
        {
            let socket = tokio::net::TcpStream::connect((host, port)).await?;
            socket.set_nodelay(true)?;
            crate::common::trace!("connected via TCP stream: {:?}", socket.local_addr());
            Ok(Socket { kind: Kind::TokioTcp(socket) })
        }

        #[cfg(not(feature = "tokio"))]
        {
            let _ = (host, port);
            panic!("runtime disabled")
        }
    }

    pub async fn connect_socket(path: &str) -> io::Result<Socket> {
        #[cfg(all(feature = "tokio", unix))]
        {
            let socket = tokio::net::UnixStream::connect(path).await?;
            crate::common::trace!(
                "connected via unix socket: {:?}",
                socket.peer_addr()?.as_pathname()
            );
            Ok(Socket { kind: Kind::TokioUnixSocket(socket) })
        }

        #[cfg(not(all(feature = "tokio", unix)))]
        {
            let _ = path;
            panic!("runtime disabled")
        }
    }

    /// Read once from the peer into the spare capacity of `buf`.
    ///
    /// Callers reserve ahead of the frame they expect, so a single read
    /// suffices per wakeup. Zero bytes means the peer closed the
    /// connection.
    pub(crate) fn poll_read_buf(
        &mut self,
        buf: &mut bytes::BytesMut,
        cx: &mut std::task::Context,
    ) -> std::task::Poll<io::Result<usize>> {
        #[cfg(feature = "tokio")]
        {
            use bytes::BufMut;
            use std::{
                pin::Pin,
                task::{Poll, ready},
            };
            use tokio::io::{AsyncRead, ReadBuf};

            debug_assert!(buf.has_remaining_mut(), "receive buffer not reserved");

            // SAFETY: `ReadBuf` only counts initialized bytes as filled,
            // and exactly those are advanced below.
            let spare = unsafe { buf.chunk_mut().as_uninit_slice_mut() };
            let mut read_buf = ReadBuf::uninit(spare);
            ready!(Pin::new(&mut *self).poll_read(cx, &mut read_buf)?);
            let n = read_buf.filled().len();
            unsafe { buf.advance_mut(n) };

            Poll::Ready(Ok(n))
        }

        #[cfg(not(feature = "tokio"))]
        {
            let _ = (buf, cx);
            panic!("runtime disabled")
        }
    }

    /// Write the whole send buffer out.
    ///
    /// The send buffer is one contiguous region, so plain writes are
    /// enough; a zero-length write surfaces as `WriteZero`.
    pub(crate) fn poll_write_buf(
        &mut self,
        buf: &mut bytes::BytesMut,
        cx: &mut std::task::Context,
    ) -> std::task::Poll<io::Result<()>> {
        #[cfg(feature = "tokio")]
        {
            use bytes::Buf;
            use std::{
                pin::Pin,
                task::{Poll, ready},
            };
            use tokio::io::AsyncWrite;

            while buf.has_remaining() {
                let n = ready!(Pin::new(&mut *self).poll_write(cx, buf.chunk())?);
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                buf.advance(n);
            }

            Poll::Ready(Ok(()))
        }

        #[cfg(not(feature = "tokio"))]
        {
            let _ = (buf, cx);
            panic!("runtime disabled")
        }
    }

    pub fn poll_shutdown(&mut self, _cx: &mut std::task::Context) -> std::task::Poll<io::Result<()>> {
        #[cfg(feature = "tokio")]
        {
            tokio::io::AsyncWrite::poll_shutdown(std::pin::Pin::new(self), _cx)
        }

        #[cfg(not(feature = "tokio"))]
        {
            panic!("runtime disabled")
        }
    }

    pub fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx| self.poll_shutdown(cx))
    }
}

#[cfg(feature = "tokio")]
impl tokio::io::AsyncRead for Socket {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::TokioTcp(t) => Pin::new(t).poll_read(cx, buf),
            #[cfg(unix)]
            Kind::TokioUnixSocket(u) => Pin::new(u).poll_read(cx, buf),
        }
    }
}

#[cfg(feature = "tokio")]
impl tokio::io::AsyncWrite for Socket {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::TokioTcp(t) => Pin::new(t).poll_write(cx, buf),
            #[cfg(unix)]
            Kind::TokioUnixSocket(u) => Pin::new(u).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> std::task::Poll<io::Result<usize>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::TokioTcp(t) => Pin::new(t).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            Kind::TokioUnixSocket(u) => Pin::new(u).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match &self.kind {
            Kind::TokioTcp(t) => t.is_write_vectored(),
            #[cfg(unix)]
            Kind::TokioUnixSocket(u) => u.is_write_vectored(),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::TokioTcp(t) => Pin::new(t).poll_flush(cx),
            #[cfg(unix)]
            Kind::TokioUnixSocket(u) => Pin::new(u).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::TokioTcp(t) => Pin::new(t).poll_shutdown(cx),
            #[cfg(unix)]
            Kind::TokioUnixSocket(u) => Pin::new(u).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[cfg(feature = "tokio")]
        {
            match &self.kind {
                Kind::TokioTcp(_) => f.write_str("Socket::Tcp"),
                #[cfg(unix)]
                Kind::TokioUnixSocket(_) => f.write_str("Socket::Unix"),
            }
        }

        #[cfg(not(feature = "tokio"))]
        {
            f.write_str("Socket")
        }
    }
}
