//! Connected services, one implementation per category.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{info, warn};
use serde_json::Value;

use crate::sequencer::CommandSink;
use crate::transport::{Link, SocketId};
use crate::types::{Category, Endpoint, InstanceId};
use crate::wire::Container;

pub mod error;
pub mod hal;
pub mod sink;
pub mod status;

pub use error::ErrorService;
pub use hal::HalStatusService;
pub use sink::SinkService;
pub use status::StatusService;

/// A topic whose value changed.  `value` is `None` when the service went away.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Full topic name, e.g. `status.motion`.
    pub topic: String,
    pub value: Option<Value>,
}

impl Change {
    pub fn updated(topic: impl Into<String>, value: Value) -> Self {
        Self {
            topic: topic.into(),
            value: Some(value),
        }
    }

    pub fn gone(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            value: None,
        }
    }
}

/// Common capability interface of every connected service.
#[async_trait]
pub trait Service: Send {
    fn category(&self) -> Category;

    /// Connection signature of the endpoint this service is bound to.
    fn signature(&self) -> &str;

    fn socket(&self) -> SocketId;

    /// False once the underlying link is gone and the service needs a new one.
    fn is_connected(&self) -> bool;

    fn attach(&mut self, instance: &InstanceId);

    /// Closes the socket.  Broadcast services report every tracked topic as gone.
    fn detach(&mut self) -> Vec<Change>;

    /// Applies a decoded message and reports which topics changed.
    fn update(&mut self, container: Container) -> Vec<Change>;

    /// Records that the socket delivered something at `now`.
    fn seen(&mut self, _now: Instant) {}

    /// Heartbeat work: keep-alives for sinks, stale checks for broadcasts.
    async fn ping(&mut self, now: Instant);

    fn lookup(&self, _segments: &[String]) -> Option<&Value> {
        None
    }

    fn topics(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_valid(&self) -> bool;

    fn as_sink(&mut self) -> Option<&mut dyn CommandSink> {
        None
    }
}

/// What every service is built from.
pub struct Binding {
    pub endpoint: Endpoint,
    pub socket: SocketId,
    pub link: Box<dyn Link>,
    pub stale_after: Duration,
}

/// Builds the service implementation for `category`, or `None` when the
/// category has no handler.
pub fn create(category: Category, binding: Binding) -> Option<Box<dyn Service>> {
    let service: Box<dyn Service> = match category {
        Category::Status => Box::new(StatusService::new(binding)),
        Category::HalStatus => Box::new(HalStatusService::new(binding)),
        Category::Error => Box::new(ErrorService::new(binding)),
        Category::Command | Category::HalCommand => Box::new(SinkService::new(category, binding)),
        Category::File => return None,
    };
    Some(service)
}

/// Silence tracking for broadcast services.
pub(crate) struct Liveness {
    last_seen: Option<Instant>,
    stale_after: Duration,
    stale: bool,
}

impl Liveness {
    pub(crate) fn new(stale_after: Duration) -> Self {
        Self {
            last_seen: None,
            stale_after,
            stale: false,
        }
    }

    pub(crate) fn seen(&mut self, now: Instant, name: &str) {
        if self.stale {
            info!("{} is alive again", name);
        }
        self.stale = false;
        self.last_seen = Some(now);
    }

    /// Marks the service stale once it has been silent for too long.  A
    /// service that never spoke is not stale, just not valid yet.
    pub(crate) fn check(&mut self, now: Instant, name: &str) {
        let Some(last) = self.last_seen else {
            return;
        };
        if !self.stale && now.saturating_duration_since(last) > self.stale_after {
            warn!(
                "{} silent for {:?}, marking stale",
                name,
                now.saturating_duration_since(last)
            );
            self.stale = true;
        }
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.stale
    }
}
