use std::time::Instant;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::json;

use super::{Binding, Change, Service};
use crate::command::CommandBatch;
use crate::sequencer::CommandSink;
use crate::transport::{Link, SocketId, TransportError};
use crate::types::{Category, InstanceId};
use crate::wire::{Container, MessageType};

/// Pass-through for the command and HAL command services.  Holds no state
/// beyond its socket.
pub struct SinkService {
    category: Category,
    signature: String,
    socket: SocketId,
    link: Box<dyn Link>,
    healthy: bool,
}

impl SinkService {
    pub fn new(category: Category, binding: Binding) -> Self {
        Self {
            category,
            signature: binding.endpoint.signature,
            socket: binding.socket,
            link: binding.link,
            healthy: true,
        }
    }
}

#[async_trait]
impl CommandSink for SinkService {
    async fn submit(&mut self, batch: &CommandBatch) -> Result<(), TransportError> {
        let frames = batch.encode()?;
        debug!("{}: sending {} command(s)", self.category, batch.len());
        match self.link.send(frames).await {
            Ok(()) => {
                self.healthy = true;
                Ok(())
            }
            Err(e) => {
                self.healthy = false;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Service for SinkService {
    fn category(&self) -> Category {
        self.category
    }

    fn signature(&self) -> &str {
        &self.signature
    }

    fn socket(&self) -> SocketId {
        self.socket
    }

    fn is_connected(&self) -> bool {
        !self.link.is_closed()
    }

    fn attach(&mut self, instance: &InstanceId) {
        debug!("{} attached to {}", self.category, instance);
    }

    fn detach(&mut self) -> Vec<Change> {
        self.link.close();
        Vec::new()
    }

    fn update(&mut self, container: Container) -> Vec<Change> {
        let kind = match container.kind {
            MessageType::Executed => "executed",
            MessageType::Completed => "completed",
            MessageType::Error => "error",
            MessageType::Text | MessageType::Display => "text",
            _ => return Vec::new(),
        };
        vec![Change::updated(
            self.category.name(),
            json!({"kind": kind, "notes": container.note}),
        )]
    }

    async fn ping(&mut self, _now: Instant) {
        let frames = match Container::ping().to_frames() {
            Ok(frames) => frames,
            Err(e) => {
                warn!("{}: failed to encode ping: {}", self.category, e);
                return;
            }
        };
        match self.link.send(frames).await {
            Ok(()) => self.healthy = true,
            Err(e) => {
                if self.healthy {
                    warn!("{}: keep-alive failed: {}", self.category, e);
                }
                self.healthy = false;
            }
        }
    }

    fn is_valid(&self) -> bool {
        self.healthy
    }

    fn as_sink(&mut self) -> Option<&mut dyn CommandSink> {
        Some(self)
    }
}
