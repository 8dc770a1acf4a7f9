use std::collections::BTreeSet;
use std::time::Instant;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use super::{Binding, Change, Liveness, Service};
use crate::transport::{Link, SocketId};
use crate::tree::AttributeTree;
use crate::types::{Category, InstanceId};
use crate::wire::{Container, MessageType};

/// Topics the status service publishes; all must arrive before it is valid.
pub const STATUS_TOPICS: [&str; 5] = ["config", "motion", "io", "task", "interp"];

/// Mirror of the machine state broadcast.
pub struct StatusService {
    signature: String,
    socket: SocketId,
    link: Box<dyn Link>,
    tree: AttributeTree,
    complete: BTreeSet<String>,
    liveness: Liveness,
}

impl StatusService {
    pub fn new(binding: Binding) -> Self {
        Self {
            signature: binding.endpoint.signature,
            socket: binding.socket,
            link: binding.link,
            tree: AttributeTree::new(),
            complete: BTreeSet::new(),
            liveness: Liveness::new(binding.stale_after),
        }
    }

    /// Whether `topic` has received its full update.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.complete.contains(topic)
    }
}

#[async_trait]
impl Service for StatusService {
    fn category(&self) -> Category {
        Category::Status
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
        debug!("status attached to {}", instance);
    }

    fn detach(&mut self) -> Vec<Change> {
        self.link.close();
        let gone = self
            .tree
            .topics()
            .map(|topic| Change::gone(format!("status.{}", topic)))
            .collect();
        self.tree.clear();
        self.complete.clear();
        gone
    }

    fn update(&mut self, container: Container) -> Vec<Change> {
        let Some(topic) = container.topic else {
            debug!("status message {:?} without topic ignored", container.kind);
            return Vec::new();
        };
        match container.kind {
            MessageType::FullUpdate => {
                self.tree.replace(&topic, container.body);
                self.complete.insert(topic.clone());
            }
            MessageType::IncrementalUpdate => self.tree.merge(&topic, container.body),
            other => {
                debug!("status.{}: ignoring {:?}", topic, other);
                return Vec::new();
            }
        }
        let value = self.tree.topic(&topic).cloned().unwrap_or(Value::Null);
        vec![Change::updated(format!("status.{}", topic), value)]
    }

    fn seen(&mut self, now: Instant) {
        self.liveness.seen(now, "status");
    }

    async fn ping(&mut self, now: Instant) {
        self.liveness.check(now, "status");
    }

    fn lookup(&self, segments: &[String]) -> Option<&Value> {
        self.tree.get(segments)
    }

    fn topics(&self) -> Vec<String> {
        self.tree.topics().map(str::to_string).collect()
    }

    fn is_valid(&self) -> bool {
        !self.liveness.is_stale() && STATUS_TOPICS.iter().all(|t| self.complete.contains(*t))
    }
}
