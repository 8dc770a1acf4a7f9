use std::time::Instant;

use async_trait::async_trait;
use log::{debug, error, info};
use serde_json::json;

use super::{Binding, Change, Liveness, Service};
use crate::transport::{Link, SocketId};
use crate::types::{Category, InstanceId};
use crate::wire::{Container, MessageType};

/// Operator messages from the machine.  Nothing is retained: once a message
/// has been reported it is gone.
pub struct ErrorService {
    signature: String,
    socket: SocketId,
    link: Box<dyn Link>,
    instance: Option<InstanceId>,
    liveness: Liveness,
}

impl ErrorService {
    pub fn new(binding: Binding) -> Self {
        Self {
            signature: binding.endpoint.signature,
            socket: binding.socket,
            link: binding.link,
            instance: None,
            liveness: Liveness::new(binding.stale_after),
        }
    }
}

#[async_trait]
impl Service for ErrorService {
    fn category(&self) -> Category {
        Category::Error
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
        self.instance = Some(instance.clone());
    }

    fn detach(&mut self) -> Vec<Change> {
        self.link.close();
        Vec::new()
    }

    fn update(&mut self, container: Container) -> Vec<Change> {
        let kind = match container.kind {
            MessageType::Error => "error",
            MessageType::Text => "text",
            MessageType::Display => "display",
            other => {
                debug!("error service: ignoring {:?}", other);
                return Vec::new();
            }
        };
        let source = self
            .instance
            .as_ref()
            .map(InstanceId::as_str)
            .unwrap_or("?");
        for note in &container.note {
            match container.kind {
                MessageType::Error => error!("{}: {}", source, note),
                _ => info!("{}: {}", source, note),
            }
        }
        vec![Change::updated(
            "error",
            json!({"kind": kind, "notes": container.note}),
        )]
    }

    fn seen(&mut self, now: Instant) {
        self.liveness.seen(now, "error");
    }

    async fn ping(&mut self, now: Instant) {
        self.liveness.check(now, "error");
    }

    fn is_valid(&self) -> bool {
        !self.liveness.is_stale()
    }
}
