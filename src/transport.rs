//! The connect/close seam between the engine and the network.
//!
//! The engine never frames bytes itself; it hands the two halves of a
//! connected stream to the per-operation callbacks and only asks the
//! transport to open and close streams.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// A trait for types that can be used as a connection stream.
pub trait ConnectionStream: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types that implement `AsyncRead + AsyncWrite + Unpin + Send`.
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnectionStream for T {}

/// An open duplex byte channel to the remote host.
pub type NetStream = Box<dyn ConnectionStream>;

/// The read half of a [`NetStream`], owned by a connection's receiver.
pub type NetReader = ReadHalf<NetStream>;

/// The write half of a [`NetStream`], owned by a connection's sender.
pub type NetWriter = WriteHalf<NetStream>;

/// Opens and closes streams on behalf of the engine.
///
/// A transport is shared by every portal of a context, so implementations
/// must be cheap to call concurrently. Dialing, TLS, proxies, and any other
/// connection dressing all live behind this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a duplex stream to `host:port`, giving up after `timeout`.
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<NetStream>;

    /// Dispose of a stream once its connection winds down.
    ///
    /// The default shuts the write side down and drops the stream; override
    /// when the protocol wants a goodbye exchange.
    async fn close(&self, stream: NetStream) {
        let (_, mut wr) = tokio::io::split(stream);
        if let Err(err) = wr.shutdown().await {
            debug!(%err, "error shutting stream down");
        }
    }
}

/// The stock TCP transport.
#[derive(Debug, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<NetStream> {
        let addr = format!("{host}:{port}");
        // The address is passed directly to `TcpStream::connect`, which
        // performs any asynchronous DNS lookup before dialing.
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(socket)) => {
                socket.set_nodelay(true)?;
                debug!(%addr, "connected");
                Ok(Box::new(socket))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out connecting to {addr}"),
            )),
        }
    }
}
