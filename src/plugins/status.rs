//! Status reporter plugin.
//!
//! Periodically POSTs a snapshot (labels, plugin states, active bundle
//! revision, runtime metrics) to the configured service. Failed uploads
//! are buffered in memory up to a bounded queue length and retried;
//! the oldest snapshots drop on overflow.

use super::{
    backoff_delay, log_plugin_error, set_state, Plugin, PluginError, ServiceClient, State,
    StatusMap,
};
use crate::config::StatusConfig;
use crate::PolicyEngine;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub const PLUGIN_NAME: &str = "status";

/// One status upload payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub labels: BTreeMap<String, String>,

    /// Per-bundle record: currently the active revision.
    pub bundle: BTreeMap<String, serde_json::Value>,

    /// Plugin name → state record.
    pub plugins: BTreeMap<String, super::PluginStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,

    pub timestamp: String,
}

pub struct StatusPlugin {
    client: ServiceClient,
    config: StatusConfig,
    labels: BTreeMap<String, String>,
    engine: Arc<PolicyEngine>,
    status: StatusMap,
    shutdown: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatusPlugin {
    pub fn new(
        client: ServiceClient,
        config: StatusConfig,
        labels: BTreeMap<String, String>,
        engine: Arc<PolicyEngine>,
        status: StatusMap,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        StatusPlugin {
            client,
            config,
            labels,
            engine,
            status,
            shutdown,
            task: Mutex::new(None),
        }
    }

    fn snapshot(
        labels: &BTreeMap<String, String>,
        engine: &PolicyEngine,
        status: &StatusMap,
    ) -> StatusSnapshot {
        let mut bundle = BTreeMap::new();
        if let Some(revision) = engine.active_revision() {
            bundle.insert(
                "active_revision".to_string(),
                serde_json::Value::String(revision),
            );
        }
        StatusSnapshot {
            labels: labels.clone(),
            bundle,
            plugins: status.lock().clone(),
            metrics: None,
            timestamp: crate::rfc3339_ns(Utc::now()),
        }
    }

    async fn report_loop(
        client: ServiceClient,
        config: StatusConfig,
        labels: BTreeMap<String, String>,
        engine: Arc<PolicyEngine>,
        status: StatusMap,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut queue: VecDeque<StatusSnapshot> = VecDeque::new();
        let mut retries: u32 = 0;

        loop {
            push_bounded(&mut queue, Self::snapshot(&labels, &engine, &status), config.buffer_size);

            // Drain the queue oldest-first; stop on the first failure.
            while let Some(snapshot) = queue.front() {
                let body = match serde_json::to_value(snapshot) {
                    Ok(body) => body,
                    Err(e) => {
                        debug!(error = %e, "unserializable status snapshot dropped");
                        queue.pop_front();
                        continue;
                    }
                };
                match client.post_json("status", &body).await {
                    Ok(()) => {
                        queue.pop_front();
                        retries = 0;
                        set_state(&status, PLUGIN_NAME, State::Running, None);
                    }
                    Err(error) => {
                        retries = retries.saturating_add(1);
                        log_plugin_error(PLUGIN_NAME, &status, &error);
                        break;
                    }
                }
            }

            let delay = if retries == 0 {
                std::time::Duration::from_secs(config.interval_seconds.max(1))
            } else {
                backoff_delay(config.interval_seconds.max(1), 300, retries)
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Append with a bound; the oldest entry drops on overflow.
fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, bound: usize) {
    while queue.len() >= bound.max(1) {
        queue.pop_front();
    }
    queue.push_back(item);
}

#[async_trait]
impl Plugin for StatusPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn start(&self) -> Result<(), PluginError> {
        let handle = tokio::spawn(Self::report_loop(
            self.client.clone(),
            self.config.clone(),
            self.labels.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.status),
            self.shutdown.clone(),
        ));
        *self.task.lock() = Some(handle);
        set_state(&self.status, PLUGIN_NAME, State::Running, None);
        Ok(())
    }

    async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_push_bounded_drops_oldest() {
        let mut queue = VecDeque::new();
        for i in 0..5 {
            push_bounded(&mut queue, i, 3);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.front(), Some(&2));
        assert_eq!(queue.back(), Some(&4));
    }

    #[test]
    fn test_snapshot_shape() {
        let engine = Arc::new(PolicyEngine::new(Config::default()));
        let status: StatusMap = Arc::new(Mutex::new(BTreeMap::new()));
        set_state(&status, "bundle/main", State::Running, None);

        let mut labels = BTreeMap::new();
        labels.insert("env".to_string(), "test".to_string());

        let snapshot = StatusPlugin::snapshot(&labels, &engine, &status);
        assert_eq!(snapshot.labels["env"], "test");
        assert!(snapshot.plugins.contains_key("bundle/main"));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("plugins").is_some());
        assert!(json.get("labels").is_some());
    }
}
