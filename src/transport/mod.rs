use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::Endpoint;
use crate::wire::Frames;

pub mod memory;
pub mod tcp;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

/// Process-unique identifier of one opened socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A message received on `socket`.
#[derive(Debug)]
pub struct Inbound {
    pub socket: SocketId,
    pub frames: Frames,
}

/// Where a transport delivers the messages it reads from one socket.
#[derive(Debug, Clone)]
pub struct Inbox {
    socket: SocketId,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl Inbox {
    pub(crate) fn new(socket: SocketId, tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { socket, tx }
    }

    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// Queues `frames`; returns false once the multiplexer is gone.
    pub fn deliver(&self, frames: Frames) -> bool {
        self.tx
            .send(Inbound {
                socket: self.socket,
                frames,
            })
            .is_ok()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("socket closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

/// Opens sockets to advertised endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts connecting to `endpoint` and returns without waiting for the
    /// peer.  Messages written before the connection is up are queued.
    /// Messages read from the socket are handed to `inbox` in arrival order.
    async fn open(&self, endpoint: &Endpoint, inbox: Inbox) -> Result<Box<dyn Link>, TransportError>;
}

/// The write side of an open socket.
#[async_trait]
pub trait Link: Send {
    /// Writes one multi-part message.
    async fn send(&mut self, frames: Frames) -> Result<(), TransportError>;

    /// Closes the socket; nothing is delivered to its inbox afterwards.
    fn close(&mut self);

    /// True once the connection failed, was dropped by the peer or closed.
    fn is_closed(&self) -> bool;
}
