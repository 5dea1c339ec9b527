use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_util::codec::{Framed, LinesCodec};

// A client connection repurposed as a raw byte pipe for one public connection.
// Bytes already buffered by the line codec are replayed before reading from the socket again.
#[derive(Debug)]
pub(crate) struct ProxyStream {
    buffered: Bytes,
    stream: TcpStream,
}

impl ProxyStream {
    pub(crate) fn new(stream: TcpStream, buffered: Bytes) -> Self {
        ProxyStream { buffered, stream }
    }

    pub(crate) fn from_framed(framed: Framed<TcpStream, LinesCodec>) -> Self {
        let parts = framed.into_parts();
        ProxyStream::new(parts.io, parts.read_buf.freeze())
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.buffered.has_remaining() {
            let len = self.buffered.remaining().min(buf.remaining());
            buf.put_slice(&self.buffered[..len]);
            self.buffered.advance(len);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

// Create a connected pair of a proxy stream and the socket on its other end.
#[cfg(test)]
pub(crate) async fn test_pair() -> (ProxyStream, TcpStream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let (connect, accept) = tokio::join!(TcpStream::connect(address), listener.accept());
    (
        ProxyStream::new(accept.unwrap().0, Bytes::new()),
        connect.unwrap(),
    )
}
