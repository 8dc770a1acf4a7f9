//! Data structures shared across the bridge.
//!
//! Discovery reports machine instances as a set of named service endpoints.
//! These types carry that information from the discovery boundary into the
//! connection manager.  [`Update`] is the delta message sent by a
//! [`Discovery`](crate::discovery::Discovery) monitor; the service name is kept
//! as a raw string there so that categories without a handler can be reported
//! rather than silently lost.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable identifier of one machine controller (its UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The fixed set of service categories a machine can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Machine state broadcast.
    Status,
    /// Command sink for task and motion commands.
    Command,
    /// Hardware (HAL) component status broadcast.
    #[serde(rename = "halrcomp")]
    HalStatus,
    /// Hardware (HAL) command sink.
    #[serde(rename = "halrcmd")]
    HalCommand,
    /// Error and operator message broadcast.
    Error,
    /// Remote file access.
    File,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Status,
        Category::Command,
        Category::HalStatus,
        Category::HalCommand,
        Category::Error,
        Category::File,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Category::Status => "status",
            Category::Command => "command",
            Category::HalStatus => "halrcomp",
            Category::HalCommand => "halrcmd",
            Category::Error => "error",
            Category::File => "file",
        }
    }

    /// Whether a [`Service`](crate::service::Service) implementation exists for
    /// this category.  File access is consumed by the job synchronizer and is
    /// never connected as a service.
    pub fn has_handler(self) -> bool {
        !matches!(self, Category::File)
    }

    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            Category::Status | Category::HalStatus | Category::Error
        )
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown service category '{0}'")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Network location of one advertised service.
///
/// `signature` distinguishes two bindings of the same category: when a
/// service restarts under a new process the address may stay the same but
/// the signature changes, and the existing connection must be replaced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    pub signature: String,
}

impl Endpoint {
    /// Endpoint whose signature is derived from its address and port.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        let signature = format!("{}:{}", address, port);
        Self {
            address,
            port,
            signature,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} [{}]", self.address, self.port, self.signature)
    }
}

/// A change in what discovery currently advertises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Update {
    /// `service` is (now) reachable at `endpoint` on `instance`.
    Advertise {
        instance: InstanceId,
        service: String,
        endpoint: Endpoint,
    },
    /// `service` is no longer advertised by `instance`.
    Withdraw { instance: InstanceId, service: String },
    /// The whole instance disappeared from the network.
    Vanish { instance: InstanceId },
}
