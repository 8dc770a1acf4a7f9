use std::time::Instant;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use super::{Binding, Change, Liveness, Service};
use crate::transport::{Link, SocketId};
use crate::tree::AttributeTree;
use crate::types::{Category, InstanceId};
use crate::wire::{Container, MessageType};

/// Pin values of the remote HAL components, one topic per component.
pub struct HalStatusService {
    signature: String,
    socket: SocketId,
    link: Box<dyn Link>,
    components: AttributeTree,
    liveness: Liveness,
}

impl HalStatusService {
    pub fn new(binding: Binding) -> Self {
        Self {
            signature: binding.endpoint.signature,
            socket: binding.socket,
            link: binding.link,
            components: AttributeTree::new(),
            liveness: Liveness::new(binding.stale_after),
        }
    }
}

#[async_trait]
impl Service for HalStatusService {
    fn category(&self) -> Category {
        Category::HalStatus
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
        debug!("halrcomp attached to {}", instance);
    }

    fn detach(&mut self) -> Vec<Change> {
        self.link.close();
        let gone = self
            .components
            .topics()
            .map(|c| Change::gone(format!("halrcomp.{}", c)))
            .collect();
        self.components.clear();
        gone
    }

    fn update(&mut self, container: Container) -> Vec<Change> {
        let Some(component) = container.topic else {
            return Vec::new();
        };
        match container.kind {
            MessageType::FullUpdate => self.components.replace(&component, container.body),
            MessageType::IncrementalUpdate => self.components.merge(&component, container.body),
            _ => return Vec::new(),
        }
        let pins = self
            .components
            .topic(&component)
            .cloned()
            .unwrap_or(Value::Null);
        vec![Change::updated(format!("halrcomp.{}", component), pins)]
    }

    fn seen(&mut self, now: Instant) {
        self.liveness.seen(now, "halrcomp");
    }

    async fn ping(&mut self, now: Instant) {
        self.liveness.check(now, "halrcomp");
    }

    fn lookup(&self, segments: &[String]) -> Option<&Value> {
        self.components.get(segments)
    }

    fn topics(&self) -> Vec<String> {
        self.components.topics().map(str::to_string).collect()
    }

    fn is_valid(&self) -> bool {
        !self.liveness.is_stale()
    }
}
