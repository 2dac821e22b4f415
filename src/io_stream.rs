//! A stream that is either plain TCP or one side of a TLS session. The
//! session engine reads and writes through this enum so the pump and
//! pipeline code is identical across transports.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

pub(crate) enum IoStream {
    Tcp(TcpStream),
    ServerTls(Box<server::TlsStream<TcpStream>>),
    ClientTls(Box<client::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::ServerTls(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::ClientTls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::ServerTls(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::ClientTls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::ServerTls(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::ClientTls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::ServerTls(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::ClientTls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl From<TcpStream> for IoStream {
    fn from(stream: TcpStream) -> Self {
        IoStream::Tcp(stream)
    }
}

impl From<server::TlsStream<TcpStream>> for IoStream {
    fn from(stream: server::TlsStream<TcpStream>) -> Self {
        IoStream::ServerTls(Box::new(stream))
    }
}

impl From<client::TlsStream<TcpStream>> for IoStream {
    fn from(stream: client::TlsStream<TcpStream>) -> Self {
        IoStream::ClientTls(Box::new(stream))
    }
}
