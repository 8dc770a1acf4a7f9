//! Shared socket multiplexer.
//!
//! All sockets of all instances feed one queue.  A reverse index maps each
//! registered socket to the service that owns it; messages from sockets that
//! are not registered (never attached, or already torn down) are dropped when
//! polled, so a discarded service can never see another message.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::transport::{Inbound, Inbox, SocketId};
use crate::types::{Category, InstanceId};
use crate::wire::Frames;

/// The service a socket belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner {
    pub instance: InstanceId,
    pub category: Category,
}

/// A message ready for dispatch.
#[derive(Debug)]
pub struct Ready {
    pub socket: SocketId,
    pub owner: Owner,
    pub frames: Frames,
}

pub struct Multiplexer {
    next_socket: u64,
    owners: HashMap<SocketId, Owner>,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiplexer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            next_socket: 1,
            owners: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Reserves a socket id and the inbox its transport delivers to.
    pub fn allocate(&mut self) -> Inbox {
        let socket = SocketId(self.next_socket);
        self.next_socket += 1;
        Inbox::new(socket, self.tx.clone())
    }

    pub fn register(&mut self, socket: SocketId, owner: Owner) {
        self.owners.insert(socket, owner);
    }

    pub fn unregister(&mut self, socket: SocketId) -> Option<Owner> {
        self.owners.remove(&socket)
    }

    pub fn owner(&self, socket: SocketId) -> Option<&Owner> {
        self.owners.get(&socket)
    }

    /// Number of sockets currently registered.
    pub fn registered(&self) -> usize {
        self.owners.len()
    }

    /// Returns every message queued for a registered socket.
    ///
    /// With a zero `wait` this never blocks; otherwise it waits at most `wait`
    /// for the first message when nothing is queued.
    pub async fn poll(&mut self, wait: Duration) -> Vec<Ready> {
        let mut ready = Vec::new();
        if !wait.is_zero() {
            match timeout(wait, self.rx.recv()).await {
                Ok(Some(inbound)) => self.accept(inbound, &mut ready),
                Ok(None) | Err(_) => return ready,
            }
        }
        while let Ok(inbound) = self.rx.try_recv() {
            self.accept(inbound, &mut ready);
        }
        ready
    }

    fn accept(&self, inbound: Inbound, ready: &mut Vec<Ready>) {
        match self.owners.get(&inbound.socket) {
            Some(owner) => ready.push(Ready {
                socket: inbound.socket,
                owner: owner.clone(),
                frames: inbound.frames,
            }),
            None => debug!("Dropping message from unconnected socket {}", inbound.socket),
        }
    }
}
