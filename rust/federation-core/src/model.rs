// rust/federation-core/src/model.rs

//! Global model versions and the publication feed.
//!
//! Published versions form an append-only log. Subscribers read it as a
//! stream starting at any version; the stream waits for new commits once it
//! has caught up and never ends while the log is alive.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{FederationError, Result};

/// Snapshot of round statistics stored with each version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub participants: usize,
    pub cohort_size: usize,
    pub compliance_rate: f64,
    pub epsilon: f64,
    pub delta: f64,
    pub noise_scale: f64,
    pub update_norm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalModel {
    /// Equals the round number that committed it; 0 for the initial model.
    pub version: u64,
    pub parameters: Vec<f64>,
    pub metrics: ModelMetrics,
    pub committed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_digest: Option<String>,
}

impl GlobalModel {
    pub fn genesis(parameters: Vec<f64>) -> Self {
        Self {
            version: 0,
            parameters,
            metrics: ModelMetrics::default(),
            committed_at: Utc::now(),
            aggregate_digest: None,
        }
    }
}

struct LogInner {
    entries: RwLock<Vec<Arc<GlobalModel>>>,
    latest: watch::Sender<u64>,
}

impl LogInner {
    fn first_at_or_after(&self, version: u64) -> Option<Arc<GlobalModel>> {
        let entries = self.entries.read();
        let idx = entries.partition_point(|m| m.version < version);
        entries.get(idx).cloned()
    }
}

/// Append-only log of published models.
#[derive(Clone)]
pub struct ModelLog {
    inner: Arc<LogInner>,
}

impl ModelLog {
    pub fn new(genesis: GlobalModel) -> Self {
        let (latest, _) = watch::channel(genesis.version);
        Self {
            inner: Arc::new(LogInner {
                entries: RwLock::new(vec![Arc::new(genesis)]),
                latest,
            }),
        }
    }

    pub fn current(&self) -> Arc<GlobalModel> {
        let entries = self.inner.entries.read();
        // The log is created with a genesis entry and never shrinks.
        entries[entries.len() - 1].clone()
    }

    /// Append a model. Its version must exceed the current one.
    pub fn publish(&self, model: GlobalModel) -> Result<Arc<GlobalModel>> {
        let model = Arc::new(model);
        {
            let mut entries = self.inner.entries.write();
            let current = entries[entries.len() - 1].version;
            if model.version <= current {
                return Err(FederationError::invalid_transition(
                    model.version,
                    format!("published version {}", current),
                    format!("version {}", model.version),
                ));
            }
            if model.parameters.len() != entries[0].parameters.len() {
                return Err(FederationError::serialization(format!(
                    "model has {} parameters, expected {}",
                    model.parameters.len(),
                    entries[0].parameters.len()
                )));
            }
            entries.push(model.clone());
        }
        self.inner.latest.send_replace(model.version);
        tracing::info!(version = model.version, "Published global model");
        Ok(model)
    }

    pub fn get(&self, version: u64) -> Option<Arc<GlobalModel>> {
        self.inner
            .first_at_or_after(version)
            .filter(|m| m.version == version)
    }

    pub fn history(&self) -> Vec<Arc<GlobalModel>> {
        self.inner.entries.read().clone()
    }

    /// Feed of versions published after the current one.
    pub fn subscribe(&self) -> BoxStream<'static, Arc<GlobalModel>> {
        self.subscribe_from(self.current().version + 1)
    }

    /// Feed starting at the first version `>= from_version`, in strictly
    /// increasing order.
    pub fn subscribe_from(&self, from_version: u64) -> BoxStream<'static, Arc<GlobalModel>> {
        let inner = self.inner.clone();
        let rx = inner.latest.subscribe();
        stream::unfold((inner, rx, from_version), |(inner, mut rx, next)| async move {
            loop {
                if let Some(model) = inner.first_at_or_after(next) {
                    let after = model.version + 1;
                    return Some((model, (inner, rx, after)));
                }
                // The sender lives in `inner`, so this only fails if the
                // runtime is tearing down.
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn model(version: u64) -> GlobalModel {
        GlobalModel {
            version,
            parameters: vec![version as f64; 3],
            metrics: ModelMetrics::default(),
            committed_at: Utc::now(),
            aggregate_digest: None,
        }
    }

    #[test]
    fn test_publish_requires_increasing_version() {
        let log = ModelLog::new(GlobalModel::genesis(vec![0.0; 3]));
        log.publish(model(2)).unwrap();
        assert!(log.publish(model(2)).is_err());
        assert!(log.publish(model(1)).is_err());
        log.publish(model(5)).unwrap();

        assert_eq!(log.current().version, 5);
        let versions: Vec<u64> = log.history().iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![0, 2, 5]);
        assert!(log.get(3).is_none());
        assert_eq!(log.get(2).unwrap().parameters, vec![2.0; 3]);
    }

    #[test]
    fn test_publish_rejects_wrong_dimension() {
        let log = ModelLog::new(GlobalModel::genesis(vec![0.0; 3]));
        let mut bad = model(1);
        bad.parameters.push(1.0);
        assert!(log.publish(bad).is_err());
    }

    #[tokio::test]
    async fn test_subscribe_from_replays_history() {
        let log = ModelLog::new(GlobalModel::genesis(vec![0.0; 3]));
        for v in [1, 3, 4] {
            log.publish(model(v)).unwrap();
        }

        let replay: Vec<u64> = log
            .subscribe_from(2)
            .take(2)
            .map(|m| m.version)
            .collect()
            .await;
        assert_eq!(replay, vec![3, 4]);

        let from_start: Vec<u64> = log
            .subscribe_from(0)
            .take(4)
            .map(|m| m.version)
            .collect()
            .await;
        assert_eq!(from_start, vec![0, 1, 3, 4]);
    }

    #[tokio::test]
    async fn test_subscriber_waits_for_new_versions() {
        let log = ModelLog::new(GlobalModel::genesis(vec![0.0; 3]));
        let mut feed = log.subscribe();

        let publisher = {
            let log = log.clone();
            tokio::spawn(async move {
                for v in 1..=5 {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    log.publish(model(v)).unwrap();
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 5 {
            let next = tokio::time::timeout(Duration::from_secs(5), feed.next())
                .await
                .expect("feed stalled")
                .expect("feed ended");
            seen.push(next.version);
        }
        publisher.await.unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_burst_publication_skips_nothing() {
        let log = ModelLog::new(GlobalModel::genesis(vec![0.0; 3]));
        let feed = log.subscribe();
        for v in 1..=50 {
            log.publish(model(v)).unwrap();
        }
        let seen: Vec<u64> = feed.take(50).map(|m| m.version).collect().await;
        assert_eq!(seen, (1..=50).collect::<Vec<_>>());
    }
}
