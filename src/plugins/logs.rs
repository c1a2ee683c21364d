//! Decision logger plugin.
//!
//! Consumes the engine's decision event stream, buffers events in a
//! bounded queue (dropping from the head on overflow, with a counter),
//! masks configured fields, and periodically uploads gzipped JSON
//! arrays to `/logs[/<partition>]`. Failed uploads retry with back-off;
//! events from a failed upload go back to the front of the queue.

use super::{
    backoff_delay, log_plugin_error, set_state, Plugin, PluginError, ServiceClient, State,
    StatusMap,
};
use crate::config::DecisionLogConfig;
use crate::{Decision, PolicyEngine};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const PLUGIN_NAME: &str = "decision_logs";

pub struct DecisionLogPlugin {
    client: ServiceClient,
    config: DecisionLogConfig,
    labels: BTreeMap<String, String>,
    engine: Arc<PolicyEngine>,
    status: StatusMap,
    shutdown: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DecisionLogPlugin {
    pub fn new(
        client: ServiceClient,
        config: DecisionLogConfig,
        labels: BTreeMap<String, String>,
        engine: Arc<PolicyEngine>,
        status: StatusMap,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        DecisionLogPlugin {
            client,
            config,
            labels,
            engine,
            status,
            shutdown,
            task: Mutex::new(None),
        }
    }

    async fn ship_loop(
        client: ServiceClient,
        config: DecisionLogConfig,
        labels: BTreeMap<String, String>,
        receiver: crossbeam_channel::Receiver<Decision>,
        status: StatusMap,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut queue: VecDeque<serde_json::Value> = VecDeque::new();
        let mut dropped: u64 = 0;
        let mut retries: u32 = 0;
        let resource = match &config.partition {
            Some(partition) => format!("logs/{partition}"),
            None => "logs".to_string(),
        };

        loop {
            // Drain new decision events into the bounded queue.
            while let Ok(decision) = receiver.try_recv() {
                match decision_event(&decision, &labels, &config.mask_paths) {
                    Ok(event) => {
                        if queue.len() >= config.buffer_size.max(1) {
                            queue.pop_front();
                            dropped += 1;
                        }
                        queue.push_back(event);
                    }
                    Err(e) => {
                        debug!(error = %e, "unserializable decision dropped");
                        dropped += 1;
                    }
                }
            }

            if !queue.is_empty() {
                let batch: Vec<serde_json::Value> = queue.drain(..).collect();
                match upload_batch(&client, &resource, &batch).await {
                    Ok(()) => {
                        retries = 0;
                        let message = (dropped > 0)
                            .then(|| format!("{dropped} event(s) dropped on overflow"));
                        set_state(&status, PLUGIN_NAME, State::Running, message);
                    }
                    Err(error) => {
                        retries = retries.saturating_add(1);
                        log_plugin_error(PLUGIN_NAME, &status, &error);
                        // Put the batch back, newest events trimmed if
                        // the buffer shrank in the meantime.
                        for event in batch.into_iter().rev() {
                            if queue.len() >= config.buffer_size.max(1) {
                                dropped += 1;
                                warn!("decision log buffer overflow while retrying");
                                break;
                            }
                            queue.push_front(event);
                        }
                    }
                }
            }

            let delay = if retries == 0 {
                std::time::Duration::from_secs(config.upload_interval_seconds.max(1))
            } else {
                backoff_delay(config.upload_interval_seconds.max(1), 300, retries)
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

/// Serialize a decision into its upload form, applying the configured
/// masks.
pub(crate) fn decision_event(
    decision: &Decision,
    labels: &BTreeMap<String, String>,
    mask_paths: &[String],
) -> Result<serde_json::Value, serde_json::Error> {
    let mut event = serde_json::to_value(decision)?;
    if let serde_json::Value::Object(map) = &mut event {
        map.insert("labels".to_string(), serde_json::to_value(labels)?);
    }
    let mut erased = Vec::new();
    for path in mask_paths {
        if mask_pointer(&mut event, path) {
            erased.push(serde_json::Value::String(path.clone()));
        }
    }
    if !erased.is_empty() {
        if let serde_json::Value::Object(map) = &mut event {
            map.insert("erased".to_string(), serde_json::Value::Array(erased));
        }
    }
    Ok(event)
}

/// Remove the value at a JSON-pointer path. Returns whether anything
/// was removed.
fn mask_pointer(event: &mut serde_json::Value, pointer: &str) -> bool {
    let Some((parent_path, leaf)) = pointer.rsplit_once('/') else {
        return false;
    };
    let parent = if parent_path.is_empty() {
        Some(event)
    } else {
        event.pointer_mut(parent_path)
    };
    match parent {
        Some(serde_json::Value::Object(map)) => map.remove(leaf).is_some(),
        _ => false,
    }
}

/// Gzip a JSON array of events and POST it.
async fn upload_batch(
    client: &ServiceClient,
    resource: &str,
    batch: &[serde_json::Value],
) -> Result<(), PluginError> {
    let body = serde_json::to_vec(&batch)
        .map_err(|e| PluginError::Transport(format!("encoding decision batch: {e}")))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&body)
        .map_err(|e| PluginError::Transport(format!("compressing decision batch: {e}")))?;
    let gzipped = encoder
        .finish()
        .map_err(|e| PluginError::Transport(format!("compressing decision batch: {e}")))?;
    client.post_json_gzip(resource, gzipped).await
}

#[async_trait]
impl Plugin for DecisionLogPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn start(&self) -> Result<(), PluginError> {
        let receiver = self.engine.subscribe_decisions(self.config.buffer_size);
        let handle = tokio::spawn(Self::ship_loop(
            self.client.clone(),
            self.config.clone(),
            self.labels.clone(),
            receiver,
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
