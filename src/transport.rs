//! Client channel abstraction between the admission boundary and the core.
//!
//! A room never sees a socket. It sees a bidirectional binary channel split
//! into a read half (driven inline by the client's read loop) and a shared
//! write half (hit concurrently by fan-out). Production hands rooms a
//! WebSocket-backed channel; tests hand them in-memory pairs.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Channel errors.
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// The peer closed the channel
    Closed,
    /// A write exceeded its deadline
    WriteTimeout,
    /// Underlying transport failure
    Io(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Channel closed"),
            Self::WriteTimeout => write!(f, "Write deadline exceeded"),
            Self::Io(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Read half of a client channel.
#[async_trait]
pub trait FrameStream: Send {
    /// Next binary frame from the client; `None` on clean close.
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, ChannelError>>;
}

/// Write half of a client channel.
///
/// Shared by fan-out paths; implementations serialize concurrent sends.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, data: &[u8]) -> Result<(), ChannelError>;

    /// Close the channel. Safe to call more than once.
    async fn close(&self);
}

/// A connected bidirectional binary channel, ready for admission.
pub trait ClientChannel: Send + 'static {
    /// Split into independently usable read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameStream>, Arc<dyn FrameSink>);
}

/// WebSocket-backed client channel.
pub struct WsChannel<S> {
    inner: WebSocketStream<S>,
}

impl<S> WsChannel<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }
}

impl<S> ClientChannel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn FrameStream>, Arc<dyn FrameSink>) {
        let (sink, stream) = self.inner.split();
        (
            Box::new(WsFrameStream { inner: stream }),
            Arc::new(WsFrameSink {
                inner: Mutex::new(sink),
            }),
        )
    }
}

struct WsFrameStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameStream for WsFrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, ChannelError>> {
        while let Some(msg) = self.inner.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    return Some(Ok(bytes));
                }
                Ok(Message::Text(text)) => return Some(Ok(text.as_bytes().to_vec())),
                Ok(Message::Close(_)) => return None,
                // Ping/pong are handled at the protocol layer
                Ok(_) => continue,
                Err(e) => return Some(Err(ChannelError::Io(e.to_string()))),
            }
        }
        None
    }
}

struct WsFrameSink<S> {
    inner: Mutex<SplitSink<WebSocketStream<S>, Message>>,
}

#[async_trait]
impl<S> FrameSink for WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&self, data: &[u8]) -> Result<(), ChannelError> {
        let mut sink = self.inner.lock().await;
        sink.send(Message::Binary(data.to_vec().into()))
            .await
            .map_err(|e| ChannelError::Io(e.to_string()))
    }

    async fn close(&self) {
        let mut sink = self.inner.lock().await;
        let _ = sink.close().await;
    }
}

/// Create an in-memory channel pair.
///
/// The [`MemoryChannel`] half goes to `RoomManager::join`; the [`MemoryPeer`]
/// half plays the remote client. `capacity` bounds each direction, so a peer
/// that stops reading eventually stalls server writes into the deadline.
pub fn memory_channel(capacity: usize) -> (MemoryChannel, MemoryPeer) {
    let (peer_tx, server_rx) = mpsc::channel(capacity);
    let (server_tx, peer_rx) = mpsc::channel(capacity);
    (
        MemoryChannel {
            incoming: server_rx,
            outgoing: server_tx,
        },
        MemoryPeer {
            tx: peer_tx,
            rx: peer_rx,
        },
    )
}

/// In-memory client channel (tests, embedding).
pub struct MemoryChannel {
    incoming: mpsc::Receiver<Vec<u8>>,
    outgoing: mpsc::Sender<Vec<u8>>,
}

impl ClientChannel for MemoryChannel {
    fn split(self: Box<Self>) -> (Box<dyn FrameStream>, Arc<dyn FrameSink>) {
        (
            Box::new(MemoryFrameStream { rx: self.incoming }),
            Arc::new(MemoryFrameSink {
                tx: Mutex::new(Some(self.outgoing)),
            }),
        )
    }
}

struct MemoryFrameStream {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl FrameStream for MemoryFrameStream {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, ChannelError>> {
        self.rx.recv().await.map(Ok)
    }
}

struct MemoryFrameSink {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

#[async_trait]
impl FrameSink for MemoryFrameSink {
    async fn send_frame(&self, data: &[u8]) -> Result<(), ChannelError> {
        let tx = {
            let guard = self.tx.lock().await;
            guard.clone()
        };
        match tx {
            Some(tx) => tx
                .send(data.to_vec())
                .await
                .map_err(|_| ChannelError::Closed),
            None => Err(ChannelError::Closed),
        }
    }

    async fn close(&self) {
        self.tx.lock().await.take();
    }
}

/// Remote end of an in-memory channel pair.
pub struct MemoryPeer {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl MemoryPeer {
    /// Send a frame as the client.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        self.tx.send(frame).await.map_err(|_| ChannelError::Closed)
    }

    /// Next frame the server wrote to this client; `None` once the server
    /// side closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Hang up. The server's read loop observes a clean close.
    pub fn disconnect(self) {}
}
