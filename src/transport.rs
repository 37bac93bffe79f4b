//! The framed transport contract and its default implementation.
//!
//! The framework treats message framing as an external collaborator: it
//! only needs something that hands back complete messages and signals a
//! dead peer exactly once. [`LengthDelimitedTransport`] is the default,
//! built on `tokio_util`'s length-delimited codec; applications with their
//! own wire format implement [`MessageTransport`] directly.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Delivers complete inbound messages and accepts complete outbound ones.
///
/// `recv` returning `Ok(None)` (peer closed cleanly) or `Err` (unrecoverable
/// transport error) are both treated by [`crate::session`] as the terminal
/// "dead peer" signal — the framework does not distinguish them.
#[async_trait]
pub trait MessageTransport: Send + 'static {
    /// Await the next complete inbound message.
    async fn recv(&mut self) -> std::io::Result<Option<Bytes>>;

    /// Send one complete outbound message.
    async fn send(&mut self, msg: &[u8]) -> std::io::Result<()>;
}

/// Default transport: length-prefixed frames over a Unix stream socket.
pub struct LengthDelimitedTransport {
    inner: Framed<UnixStream, LengthDelimitedCodec>,
}

impl LengthDelimitedTransport {
    /// Wrap an already-connected stream. Construction cannot fail.
    pub fn new(stream: UnixStream) -> Self {
        Self { inner: Framed::new(stream, LengthDelimitedCodec::new()) }
    }
}

#[async_trait]
impl MessageTransport for LengthDelimitedTransport {
    async fn recv(&mut self) -> std::io::Result<Option<Bytes>> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn send(&mut self, msg: &[u8]) -> std::io::Result<()> {
        self.inner.send(Bytes::copy_from_slice(msg)).await
    }
}
