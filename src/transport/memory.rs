//! In-process loopback transport.
//!
//! Sockets are keyed by endpoint signature.  Whatever a link sends is
//! recorded, and [`MemoryTransport::inject`] delivers a message as if the
//! remote side had published it.  Used to embed the bridge against a
//! simulated controller and throughout the test suite.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Inbox, Link, Transport, TransportError};
use crate::types::Endpoint;
use crate::wire::Frames;

#[derive(Default)]
struct Shared {
    inboxes: HashMap<String, Inbox>,
    sent: Vec<(String, Frames)>,
    failing: HashSet<String>,
    refused: HashSet<String>,
    hung_up: HashSet<String>,
    opened: usize,
    closed: usize,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers `frames` on the socket currently open to `signature`.
    pub fn inject(&self, signature: &str, frames: Frames) -> bool {
        match self.shared().inboxes.get(signature) {
            Some(inbox) => inbox.deliver(frames),
            None => false,
        }
    }

    /// Every message written to `signature`, oldest first.
    pub fn sent_to(&self, signature: &str) -> Vec<Frames> {
        self.shared()
            .sent
            .iter()
            .filter(|(sig, _)| sig == signature)
            .map(|(_, frames)| frames.clone())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.shared().sent.clear();
    }

    /// Makes every later write to `signature` fail.
    pub fn fail_sends_to(&self, signature: &str) {
        self.shared().failing.insert(signature.to_string());
    }

    /// Makes every later connect to `signature` fail.
    pub fn refuse(&self, signature: &str) {
        self.shared().refused.insert(signature.to_string());
    }

    /// Drops the connection to `signature` as if the peer went away.  The
    /// next connect to it succeeds again.
    pub fn hang_up(&self, signature: &str) {
        let mut shared = self.shared();
        shared.inboxes.remove(signature);
        shared.hung_up.insert(signature.to_string());
    }

    pub fn is_open(&self, signature: &str) -> bool {
        self.shared().inboxes.contains_key(signature)
    }

    pub fn opened(&self) -> usize {
        self.shared().opened
    }

    pub fn closed(&self) -> usize {
        self.shared().closed
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, endpoint: &Endpoint, inbox: Inbox) -> Result<Box<dyn Link>, TransportError> {
        let mut shared = self.shared();
        if shared.refused.contains(&endpoint.signature) {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                source: std::io::ErrorKind::ConnectionRefused.into(),
            });
        }
        shared.opened += 1;
        shared.hung_up.remove(&endpoint.signature);
        shared
            .inboxes
            .insert(endpoint.signature.clone(), inbox.clone());
        Ok(Box::new(MemoryLink {
            signature: endpoint.signature.clone(),
            socket: inbox,
            shared: Arc::clone(&self.shared),
            open: true,
        }))
    }
}

struct MemoryLink {
    signature: String,
    socket: Inbox,
    shared: Arc<Mutex<Shared>>,
    open: bool,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&mut self, frames: Frames) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.failing.contains(&self.signature) {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
        }
        shared.sent.push((self.signature.clone(), frames));
        Ok(())
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.closed += 1;
        // A replacement socket may already own the signature.
        let ours = shared
            .inboxes
            .get(&self.signature)
            .map(|inbox| inbox.socket() == self.socket.socket())
            .unwrap_or(false);
        if ours {
            shared.inboxes.remove(&self.signature);
        }
    }

    fn is_closed(&self) -> bool {
        !self.open
            || self
                .shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .hung_up
                .contains(&self.signature)
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.close();
    }
}
