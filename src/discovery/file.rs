use super::Discovery;
use crate::types::{Endpoint, InstanceId, Update};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Raw service name to endpoint, per instance.
pub type Listing = BTreeMap<InstanceId, BTreeMap<String, Endpoint>>;

#[derive(Debug, Deserialize)]
struct EndpointEntry {
    address: String,
    port: u16,
    #[serde(default)]
    signature: Option<String>,
}

/// Watches a JSON file of the form
///
/// ```json
/// { "<uuid>": { "status": { "address": "10.0.0.5", "port": 6001 } } }
/// ```
///
/// and reports what changed between two reads.
pub struct FileDiscovery {
    path: PathBuf,
    refresh: Duration,
}

impl FileDiscovery {
    pub fn new(path: impl Into<PathBuf>, refresh: Duration) -> Self {
        Self {
            path: path.into(),
            refresh,
        }
    }

    async fn read(path: &Path) -> Result<Listing> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        parse(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

pub fn parse(text: &str) -> Result<Listing> {
    let raw: BTreeMap<String, BTreeMap<String, EndpointEntry>> = serde_json::from_str(text)?;
    Ok(raw
        .into_iter()
        .map(|(uuid, services)| {
            let services = services
                .into_iter()
                .map(|(name, entry)| {
                    let endpoint = Endpoint::new(entry.address, entry.port);
                    let endpoint = match entry.signature {
                        Some(signature) => endpoint.with_signature(signature),
                        None => endpoint,
                    };
                    (name, endpoint)
                })
                .collect();
            (InstanceId::new(uuid), services)
        })
        .collect())
}

/// Updates turning `prev` into `next`.
pub fn diff(prev: &Listing, next: &Listing) -> Vec<Update> {
    let mut updates = Vec::new();
    for instance in prev.keys().filter(|i| !next.contains_key(*i)) {
        updates.push(Update::Vanish {
            instance: instance.clone(),
        });
    }
    for (instance, services) in next {
        let old = prev.get(instance);
        for (service, endpoint) in services {
            if old.and_then(|o| o.get(service)) != Some(endpoint) {
                updates.push(Update::Advertise {
                    instance: instance.clone(),
                    service: service.clone(),
                    endpoint: endpoint.clone(),
                });
            }
        }
        for service in old.into_iter().flat_map(|o| o.keys()) {
            if !services.contains_key(service) {
                updates.push(Update::Withdraw {
                    instance: instance.clone(),
                    service: service.clone(),
                });
            }
        }
    }
    updates
}

#[async_trait]
impl Discovery for FileDiscovery {
    async fn monitor(&self, update_tx: mpsc::Sender<Update>) -> Result<()> {
        info!("Watching {} for instances", self.path.display());
        let mut known = Listing::new();
        let mut failing = false;
        loop {
            match Self::read(&self.path).await {
                Ok(next) => {
                    if failing {
                        info!("{} readable again", self.path.display());
                        failing = false;
                    }
                    for update in diff(&known, &next) {
                        debug!("Discovery update: {:?}", update);
                        if update_tx.send(update).await.is_err() {
                            return Err(anyhow!("Channel closed"));
                        }
                    }
                    known = next;
                }
                Err(e) => {
                    if !failing {
                        warn!("Discovery file unavailable: {:#}. Retrying...", e);
                        failing = true;
                    }
                }
            }
            sleep(self.refresh).await;
        }
    }
}
