//! The transport contract and the two adapters shipped with the crate.
//!
//! A transport carries whole byte frames, in order, exactly once, and
//! reports disconnection by ending its stream. The multiplexer never
//! fragments or reassembles; framing is the transport's job.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use wiremux_codec::FrameCodec;

#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one whole frame. Atomic: the peer either observes all of it
    /// or none.
    async fn send(&mut self, frame: Bytes) -> io::Result<()>;

    /// Next whole frame, `None` on disconnect. Single consumer.
    async fn recv(&mut self) -> Option<io::Result<BytesMut>>;

    /// Resolves when the send buffer is empty. Optional; the default is
    /// a no-op for transports without buffering.
    async fn drain(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) {}
}

/// In-process transport pair over two crossed channels.
pub mod memory {
    use super::*;
    use tokio::sync::mpsc;

    const DEPTH: usize = 64;

    pub struct MemoryTransport {
        tx: mpsc::Sender<Bytes>,
        rx: mpsc::Receiver<Bytes>,
    }

    /// Two connected ends; frames sent on one arrive on the other.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (left_tx, left_rx) = mpsc::channel(DEPTH);
        let (right_tx, right_rx) = mpsc::channel(DEPTH);

        (
            MemoryTransport {
                tx: left_tx,
                rx: right_rx,
            },
            MemoryTransport {
                tx: right_tx,
                rx: left_rx,
            },
        )
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&mut self, frame: Bytes) -> io::Result<()> {
            self.tx
                .send(frame)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer disconnected"))
        }

        async fn recv(&mut self) -> Option<io::Result<BytesMut>> {
            self.rx.recv().await.map(|frame| Ok(BytesMut::from(&frame[..])))
        }

        async fn disconnect(&mut self) {
            self.rx.close();
        }
    }
}

/// Any `AsyncRead + AsyncWrite` byte stream, length-prefixed by
/// [`FrameCodec`]. This is how a TCP or unix socket becomes a transport.
pub struct StreamTransport<S> {
    framed: Framed<S, FrameCodec>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S) -> StreamTransport<S> {
        StreamTransport {
            framed: Framed::new(stream, FrameCodec::new()),
        }
    }

    pub fn with_ceiling(stream: S, ceiling: usize) -> StreamTransport<S> {
        StreamTransport {
            framed: Framed::new(stream, FrameCodec::with_ceiling(ceiling)),
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.framed.send(frame).await.map_err(io::Error::from)
    }

    async fn recv(&mut self) -> Option<io::Result<BytesMut>> {
        self.framed
            .next()
            .await
            .map(|result| result.map_err(io::Error::from))
    }

    async fn drain(&mut self) -> io::Result<()> {
        self.framed.flush().await.map_err(io::Error::from)
    }

    async fn disconnect(&mut self) {
        let _ = self.framed.close().await;
    }
}
