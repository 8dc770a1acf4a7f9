//! Instance discovery.
//!
//! A [`Discovery`] monitor streams [`Update`]s into a channel; the
//! [`Directory`] folds them into the current view of which instance offers
//! which service where.  The registry only ever reads snapshots.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, RwLock};

use crate::types::{Category, Endpoint, InstanceId, Update};

pub mod file;
pub use file::FileDiscovery;

#[async_trait]
pub trait Discovery {
    /// Start monitoring for instance changes.
    /// Updates should be sent to the provided channel.
    async fn monitor(&self, update_tx: mpsc::Sender<Update>) -> Result<()>;
}

/// Endpoints per instance and category.
pub type Snapshot = BTreeMap<InstanceId, BTreeMap<Category, Endpoint>>;

#[derive(Default)]
struct State {
    instances: Snapshot,
    unknown: HashSet<(InstanceId, String)>,
}

/// Shared view of everything discovery currently advertises.
#[derive(Clone, Default)]
pub struct Directory {
    state: Arc<RwLock<State>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply(&self, update: Update) {
        let mut state = self.state.write().await;
        match update {
            Update::Advertise {
                instance,
                service,
                endpoint,
            } => {
                let category = match service.parse::<Category>() {
                    Ok(category) => category,
                    Err(e) => {
                        if state.unknown.insert((instance.clone(), service)) {
                            warn!("{}: {}, ignored", instance, e);
                        }
                        return;
                    }
                };
                debug!("{}: {} at {}", instance, category, endpoint);
                let services = state.instances.entry(instance.clone()).or_default();
                if services.is_empty() {
                    info!("Discovered instance {}", instance);
                }
                services.insert(category, endpoint);
            }
            Update::Withdraw { instance, service } => {
                let Ok(category) = service.parse::<Category>() else {
                    return;
                };
                if let Some(services) = state.instances.get_mut(&instance) {
                    if services.remove(&category).is_some() {
                        debug!("{}: {} withdrawn", instance, category);
                    }
                }
            }
            Update::Vanish { instance } => {
                if state.instances.remove(&instance).is_some() {
                    info!("Instance {} vanished", instance);
                }
                state.unknown.retain(|(i, _)| *i != instance);
            }
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.state.read().await.instances.clone()
    }

    pub async fn endpoint(&self, instance: &InstanceId, category: Category) -> Option<Endpoint> {
        self.state
            .read()
            .await
            .instances
            .get(instance)
            .and_then(|services| services.get(&category))
            .cloned()
    }

    /// Applies updates until every sender is gone.
    pub async fn run(self, mut update_rx: mpsc::Receiver<Update>) {
        while let Some(update) = update_rx.recv().await {
            self.apply(update).await;
        }
        debug!("Discovery channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertise(instance: &str, service: &str, port: u16) -> Update {
        Update::Advertise {
            instance: InstanceId::new(instance),
            service: service.to_string(),
            endpoint: Endpoint::new("10.0.0.5", port),
        }
    }

    #[tokio::test]
    async fn applies_updates() {
        let directory = Directory::new();
        directory.apply(advertise("mk-1", "status", 6001)).await;
        directory.apply(advertise("mk-1", "command", 6002)).await;
        directory.apply(advertise("mk-2", "status", 7001)).await;

        let snapshot = directory.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&InstanceId::new("mk-1")].len(), 2);

        directory
            .apply(Update::Withdraw {
                instance: InstanceId::new("mk-1"),
                service: "command".into(),
            })
            .await;
        assert_eq!(
            directory
                .endpoint(&InstanceId::new("mk-1"), Category::Command)
                .await,
            None
        );

        directory
            .apply(Update::Vanish {
                instance: InstanceId::new("mk-2"),
            })
            .await;
        assert_eq!(directory.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_services_are_ignored() {
        let directory = Directory::new();
        directory.apply(advertise("mk-1", "preview", 6010)).await;
        directory.apply(advertise("mk-1", "preview", 6010)).await;
        assert!(directory.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn run_drains_the_channel() {
        let directory = Directory::new();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(directory.clone().run(rx));
        tx.send(advertise("mk-1", "status", 6001)).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(directory.snapshot().await.len(), 1);
    }
}
