//! Framed multi-part messages over TCP.
//!
//! Each message is written as a big-endian `u32` frame count followed by
//! every frame as a `u32` length and its bytes.  The whole message goes out
//! in one `write_all`, so a command batch is never interleaved with another
//! write on the same socket.
//!
//! Opening a link never waits for the peer.  A background task connects,
//! then forwards queued writes and delivers what it reads.  The link reports
//! itself closed once that task is gone.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;

use super::{Inbox, Link, Transport, TransportError};
use crate::types::Endpoint;
use crate::wire::Frames;

/// Upper bound for a single frame; larger frames indicate a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const MAX_FRAMES: usize = 1024;

pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, endpoint: &Endpoint, inbox: Inbox) -> Result<Box<dyn Link>, TransportError> {
        let target = format!("{}:{}", endpoint.address, endpoint.port);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(target, self.connect_timeout, inbox, outgoing_rx));
        Ok(Box::new(TcpLink {
            outgoing: outgoing_tx,
            task,
            closed: false,
        }))
    }
}

async fn connect(target: &str, connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = match timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(TransportError::Connect {
                endpoint: target.to_string(),
                source,
            })
        }
        Err(_) => return Err(TransportError::ConnectTimeout(target.to_string())),
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn run_socket(
    target: String,
    connect_timeout: Duration,
    inbox: Inbox,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let socket = inbox.socket();
    let stream = match connect(&target, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Socket {}: {}", socket, e);
            return;
        }
    };
    debug!("Socket {} connected to {}", socket, target);
    let (reader, mut writer) = stream.into_split();

    // Dropped together with this task, which stops the reader as well.
    let mut reader_task = JoinSet::new();
    reader_task.spawn(read_loop(reader, inbox));

    loop {
        tokio::select! {
            _ = reader_task.join_next() => break,
            message = outgoing.recv() => match message {
                Some(buf) => {
                    if let Err(e) = writer.write_all(&buf).await {
                        warn!("Socket {} write failed: {}", socket, e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, inbox: Inbox) {
    let socket = inbox.socket();
    loop {
        match read_message(&mut reader).await {
            Ok(Some(frames)) => {
                if !inbox.deliver(frames) {
                    break;
                }
            }
            Ok(None) => {
                debug!("Socket {} closed by peer", socket);
                break;
            }
            Err(e) => {
                warn!("Socket {} read failed: {}", socket, e);
                break;
            }
        }
    }
}

struct TcpLink {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl Link for TcpLink {
    async fn send(&mut self, frames: Frames) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let buf = encode_message(&frames)?;
        self.outgoing.send(buf).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.task.abort();
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed || self.outgoing.is_closed()
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Encodes one multi-part message into its wire form.
pub fn encode_message(frames: &[Vec<u8>]) -> Result<Vec<u8>, TransportError> {
    let total: usize = frames.iter().map(|f| f.len() + 4).sum();
    let mut buf = Vec::with_capacity(total + 4);
    buf.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        if frame.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }
    Ok(buf)
}

/// Reads one multi-part message; `None` on a clean end of stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Frames>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32().await {
        Ok(count) => count as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if count > MAX_FRAMES {
        return Err(TransportError::FrameTooLarge(count));
    }
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(len));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(Some(frames))
}
