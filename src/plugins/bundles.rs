//! Bundle downloader plugin.
//!
//! Polls a configured service for a bundle archive, verifies and
//! compiles it, and activates it atomically through the engine. A 304
//! response (via `If-None-Match`) skips the download; a failed
//! download, parse, or compile keeps the previous activation and backs
//! off exponentially with jitter.

use super::{
    backoff_delay, log_plugin_error, poll_delay, set_state, Fetched, Plugin, PluginError,
    ServiceClient, State, StatusMap,
};
use crate::bundle::Bundle;
use crate::config::BundleSourceConfig;
use crate::PolicyEngine;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Per-bundle activation status, included in status uploads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleStatus {
    /// Revision of the currently active bundle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_revision: Option<String>,

    /// RFC 3339 time of the last successful activation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_activation: Option<String>,

    /// RFC 3339 time of the last failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failed_activation: Option<String>,

    /// Message from the last failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct BundlePlugin {
    name: String,
    plugin_name: String,
    client: ServiceClient,
    source: BundleSourceConfig,
    engine: Arc<PolicyEngine>,
    status: StatusMap,
    bundle_status: Arc<Mutex<BundleStatus>>,
    shutdown: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BundlePlugin {
    pub fn new(
        name: String,
        client: ServiceClient,
        source: BundleSourceConfig,
        engine: Arc<PolicyEngine>,
        status: StatusMap,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let plugin_name = format!("bundle/{name}");
        BundlePlugin {
            name,
            plugin_name,
            client,
            source,
            engine,
            status,
            bundle_status: Arc::new(Mutex::new(BundleStatus::default())),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Handle for status reporting.
    pub fn bundle_status(&self) -> Arc<Mutex<BundleStatus>> {
        Arc::clone(&self.bundle_status)
    }

    async fn poll_loop(
        name: String,
        plugin_name: String,
        client: ServiceClient,
        source: BundleSourceConfig,
        engine: Arc<PolicyEngine>,
        status: StatusMap,
        bundle_status: Arc<Mutex<BundleStatus>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut etag: Option<String> = None;
        let mut retries: u32 = 0;

        loop {
            let outcome = Self::poll_once(&name, &client, &source, &engine, &mut etag).await;
            match outcome {
                Ok(activated) => {
                    retries = 0;
                    set_state(&status, &plugin_name, State::Running, None);
                    if activated {
                        let mut bs = bundle_status.lock();
                        bs.active_revision = engine.active_revision();
                        bs.last_successful_activation = Some(crate::rfc3339_ns(Utc::now()));
                        bs.last_error = None;
                    }
                }
                Err(error) => {
                    retries = retries.saturating_add(1);
                    log_plugin_error(&plugin_name, &status, &error);
                    let mut bs = bundle_status.lock();
                    bs.last_failed_activation = Some(crate::rfc3339_ns(Utc::now()));
                    bs.last_error = Some(error.to_string());
                }
            }

            let delay = if retries == 0 {
                poll_delay(
                    source.polling.min_delay_seconds,
                    source.polling.max_delay_seconds,
                )
            } else {
                backoff_delay(
                    source.polling.min_delay_seconds,
                    source.polling.max_delay_seconds,
                    retries,
                )
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
        debug!(bundle = name, "bundle poll loop exited");
    }

    /// One poll: fetch (conditionally), unpack, activate. Returns true
    /// when a new bundle was activated.
    async fn poll_once(
        name: &str,
        client: &ServiceClient,
        source: &BundleSourceConfig,
        engine: &PolicyEngine,
        etag: &mut Option<String>,
    ) -> Result<bool, PluginError> {
        match client.get(&source.resource, etag.as_deref()).await? {
            Fetched::NotModified => {
                debug!(bundle = name, "bundle unchanged (304)");
                Ok(false)
            }
            Fetched::Body(bytes, new_etag) => {
                let bundle = Bundle::read(bytes.as_slice())
                    .map_err(|e| PluginError::Transport(format!("bundle unpack: {e}")))?;
                engine
                    .activate_bundle(&bundle)
                    .map_err(|e| PluginError::Transport(format!("bundle activation: {e}")))?;
                *etag = new_etag;
                info!(
                    bundle = name,
                    revision = bundle.manifest.revision.as_deref().unwrap_or(""),
                    "bundle activated"
                );
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl Plugin for BundlePlugin {
    fn name(&self) -> &str {
        &self.plugin_name
    }

    async fn start(&self) -> Result<(), PluginError> {
        let handle = tokio::spawn(Self::poll_loop(
            self.name.clone(),
            self.plugin_name.clone(),
            self.client.clone(),
            self.source.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.status),
            Arc::clone(&self.bundle_status),
            self.shutdown.clone(),
        ));
        *self.task.lock() = Some(handle);
        set_state(&self.status, &self.plugin_name, State::Running, None);
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
    use crate::config::{Config, PollingConfig, ServiceConfig};

    fn plugin() -> BundlePlugin {
        let engine = Arc::new(PolicyEngine::new(Config::default()));
        let service = ServiceConfig {
            name: "cp".to_string(),
            // Unroutable; poll_once must fail with a transport error.
            url: "http://127.0.0.1:1".to_string(),
            headers: Default::default(),
            bearer_token: None,
        };
        let (_, rx) = watch::channel(false);
        BundlePlugin::new(
            "main".to_string(),
            ServiceClient::new(&service),
            BundleSourceConfig {
                service: "cp".to_string(),
                resource: "bundles/main.tar.gz".to_string(),
                polling: PollingConfig {
                    min_delay_seconds: 1,
                    max_delay_seconds: 2,
                },
            },
            engine,
            Arc::new(Mutex::new(Default::default())),
            rx,
        )
    }

    #[tokio::test]
    async fn test_poll_once_transport_failure() {
        let p = plugin();
        let mut etag = None;
        let err = BundlePlugin::poll_once(&p.name, &p.client, &p.source, &p.engine, &mut etag)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Transport(_)));
        assert!(etag.is_none());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let p = plugin();
        p.start().await.unwrap();
        assert_eq!(p.status.lock()[p.name()].state, State::Running);
        p.stop().await;
    }
}
