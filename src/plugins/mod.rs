//! # Plugin Runtime
//!
//! Long-running tasks that keep policies and data fresh from remote
//! control-plane services: the bundle downloader, status reporter,
//! decision-log shipper, and discovery loader.
//!
//! ## Lifecycle
//!
//! Each plugin moves through `created → starting → running` and flips
//! between `running` and `failing` as its upstream comes and goes;
//! `stop` lands it in `stopped`. Plugin errors are logged, counted, and
//! exposed through the status map; they never terminate the process.
//!
//! Each plugin runs as one cooperative tokio task; network I/O
//! suspends. Shared mutable state is limited to the engine's
//! policy/data snapshot (swapped through the storage commit protocol)
//! and the status map behind a single lock.

pub mod bundles;
pub mod discovery;
pub mod logs;
pub mod status;

use crate::config::{Config, ServiceConfig};
use crate::PolicyEngine;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum PluginError {
    /// Network, auth, or upstream error during plugin work.
    #[error("plugin/transport: {0}")]
    Transport(String),

    #[error("plugin configuration error: {0}")]
    Config(String),
}

/// Plugin lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Created,
    Starting,
    Running,
    Failing,
    Stopped,
}

/// Status of one plugin, exposed through [`Manager::status`] and the
/// status reporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginStatus {
    pub state: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub error_count: u64,
}

impl PluginStatus {
    fn new() -> Self {
        PluginStatus {
            state: State::Created,
            message: None,
            error_count: 0,
        }
    }
}

/// The mutex-protected plugin status map.
pub type StatusMap = Arc<Mutex<BTreeMap<String, PluginStatus>>>;

pub(crate) fn set_state(map: &StatusMap, name: &str, state: State, message: Option<String>) {
    let mut map = map.lock();
    let entry = map.entry(name.to_string()).or_insert_with(PluginStatus::new);
    if state == State::Failing {
        entry.error_count += 1;
    }
    entry.state = state;
    entry.message = message;
}

/// A long-running plugin task.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Spawn the plugin's task. Must not block.
    async fn start(&self) -> Result<(), PluginError>;

    /// Signal the task to stop and wait for it to finish.
    async fn stop(&self);
}

/// Registry and lifecycle driver for the configured plugins.
pub struct Manager {
    engine: Arc<PolicyEngine>,
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
    status: StatusMap,
    shutdown: watch::Sender<bool>,
}

impl Manager {
    /// Build a manager with the plugins the configuration asks for.
    pub fn new(engine: Arc<PolicyEngine>, config: &Config) -> Result<Manager, PluginError> {
        let status: StatusMap = Arc::new(Mutex::new(BTreeMap::new()));
        let (shutdown, _) = watch::channel(false);
        let manager = Manager {
            engine,
            plugins: Mutex::new(Vec::new()),
            status,
            shutdown,
        };
        manager.build_plugins(config)?;
        Ok(manager)
    }

    fn build_plugins(&self, config: &Config) -> Result<(), PluginError> {
        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();

        for (name, source) in &config.bundles {
            let service = lookup_service(config, &source.service)?;
            plugins.push(Arc::new(bundles::BundlePlugin::new(
                name.clone(),
                ServiceClient::new(service),
                source.clone(),
                Arc::clone(&self.engine),
                Arc::clone(&self.status),
                self.shutdown.subscribe(),
            )));
        }

        if let Some(log_config) = &config.decision_logs {
            let service = lookup_service(config, &log_config.service)?;
            plugins.push(Arc::new(logs::DecisionLogPlugin::new(
                ServiceClient::new(service),
                log_config.clone(),
                config.labels.clone(),
                Arc::clone(&self.engine),
                Arc::clone(&self.status),
                self.shutdown.subscribe(),
            )));
        }

        if let Some(status_config) = &config.status {
            let service = lookup_service(config, &status_config.service)?;
            plugins.push(Arc::new(status::StatusPlugin::new(
                ServiceClient::new(service),
                status_config.clone(),
                config.labels.clone(),
                Arc::clone(&self.engine),
                Arc::clone(&self.status),
                self.shutdown.subscribe(),
            )));
        }

        {
            let mut status = self.status.lock();
            for plugin in &plugins {
                status.insert(plugin.name().to_string(), PluginStatus::new());
            }
        }
        *self.plugins.lock() = plugins;
        Ok(())
    }

    /// Start every plugin.
    pub async fn start(&self) -> Result<(), PluginError> {
        let plugins: Vec<Arc<dyn Plugin>> = self.plugins.lock().clone();
        for plugin in plugins {
            info!(plugin = plugin.name(), "starting plugin");
            set_state(&self.status, plugin.name(), State::Starting, None);
            plugin.start().await?;
        }
        Ok(())
    }

    /// Signal shutdown and wait for every plugin to stop.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let plugins: Vec<Arc<dyn Plugin>> = self.plugins.lock().clone();
        for plugin in plugins {
            plugin.stop().await;
            set_state(&self.status, plugin.name(), State::Stopped, None);
            info!(plugin = plugin.name(), "plugin stopped");
        }
    }

    /// Current plugin states.
    pub fn status(&self) -> BTreeMap<String, PluginStatus> {
        self.status.lock().clone()
    }

    /// Atomically swap to a new configuration: stop the current plugin
    /// set, rebuild from `config`, and start again.
    pub async fn reconfigure(&self, config: &Config) -> Result<(), PluginError> {
        info!("reconfiguring plugin manager");
        self.stop().await;
        let _ = self.shutdown.send(false);
        self.build_plugins(config)?;
        self.start().await
    }

    pub fn engine(&self) -> Arc<PolicyEngine> {
        Arc::clone(&self.engine)
    }
}

fn lookup_service<'a>(config: &'a Config, name: &str) -> Result<&'a ServiceConfig, PluginError> {
    config
        .service(name)
        .ok_or_else(|| PluginError::Config(format!("unknown service '{name}'")))
}

// ----------------------------------------------------------------------
// Service client
// ----------------------------------------------------------------------

/// What a conditional GET produced.
pub enum Fetched {
    /// New content plus its ETag, if the server sent one.
    Body(Vec<u8>, Option<String>),
    /// HTTP 304: the cached copy is still current.
    NotModified,
}

/// HTTP client for one configured control-plane service.
#[derive(Clone)]
pub struct ServiceClient {
    base_url: String,
    headers: BTreeMap<String, String>,
    bearer_token: Option<String>,
    http: reqwest::Client,
}

impl ServiceClient {
    pub fn new(service: &ServiceConfig) -> ServiceClient {
        ServiceClient {
            base_url: service.url.trim_end_matches('/').to_string(),
            headers: service.headers.clone(),
            bearer_token: service.bearer_token.clone(),
            http: reqwest::Client::new(),
        }
    }

    fn apply_auth(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        request
    }

    /// Conditional GET with `If-None-Match`.
    pub async fn get(&self, resource: &str, etag: Option<&str>) -> Result<Fetched, PluginError> {
        let url = format!("{}/{}", self.base_url, resource.trim_start_matches('/'));
        let mut request = self.apply_auth(self.http.get(&url));
        if let Some(etag) = etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PluginError::Transport(format!("GET {url}: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }
        if !response.status().is_success() {
            return Err(PluginError::Transport(format!(
                "GET {url}: unexpected status {}",
                response.status()
            )));
        }
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response
            .bytes()
            .await
            .map_err(|e| PluginError::Transport(format!("GET {url}: {e}")))?;
        Ok(Fetched::Body(body.to_vec(), etag))
    }

    /// POST a JSON document.
    pub async fn post_json(
        &self,
        resource: &str,
        body: &serde_json::Value,
    ) -> Result<(), PluginError> {
        let url = format!("{}/{}", self.base_url, resource.trim_start_matches('/'));
        let response = self
            .apply_auth(self.http.post(&url))
            .json(body)
            .send()
            .await
            .map_err(|e| PluginError::Transport(format!("POST {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(PluginError::Transport(format!(
                "POST {url}: unexpected status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// POST a gzipped JSON body (`Content-Encoding: gzip`).
    pub async fn post_json_gzip(&self, resource: &str, gzipped: Vec<u8>) -> Result<(), PluginError> {
        let url = format!("{}/{}", self.base_url, resource.trim_start_matches('/'));
        let response = self
            .apply_auth(self.http.post(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::CONTENT_ENCODING, "gzip")
            .body(gzipped)
            .send()
            .await
            .map_err(|e| PluginError::Transport(format!("POST {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(PluginError::Transport(format!(
                "POST {url}: unexpected status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Back-off
// ----------------------------------------------------------------------

/// Exponential back-off with jitter, clamped to `[min, max]`. Retry 0
/// lands near `min`; each retry doubles the window.
pub(crate) fn backoff_delay(min_seconds: u64, max_seconds: u64, retries: u32) -> Duration {
    let min = min_seconds.max(1);
    let max = max_seconds.max(min);
    let ceiling = min
        .saturating_mul(1u64.checked_shl(retries).unwrap_or(u64::MAX))
        .clamp(min, max);
    let jittered = rand::thread_rng().gen_range(min..=ceiling);
    Duration::from_secs(jittered)
}

/// Uniformly random poll delay within `[min, max]`.
pub(crate) fn poll_delay(min_seconds: u64, max_seconds: u64) -> Duration {
    let min = min_seconds.max(1);
    let max = max_seconds.max(min);
    Duration::from_secs(rand::thread_rng().gen_range(min..=max))
}

pub(crate) fn log_plugin_error(name: &str, status: &StatusMap, error: &PluginError) {
    warn!(plugin = name, error = %error, "plugin operation failed");
    set_state(status, name, State::Failing, Some(error.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_within_bounds() {
        for retries in 0..12 {
            let d = backoff_delay(2, 60, retries);
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_secs(60));
        }
    }

    #[test]
    fn test_backoff_grows() {
        // The ceiling doubles with retries until the max clamps it.
        let mut seen_large = false;
        for _ in 0..50 {
            if backoff_delay(2, 60, 8) > Duration::from_secs(10) {
                seen_large = true;
                break;
            }
        }
        assert!(seen_large, "high retry counts should widen the window");
    }

    #[test]
    fn test_poll_delay_bounds() {
        for _ in 0..20 {
            let d = poll_delay(5, 10);
            assert!(d >= Duration::from_secs(5) && d <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_state_map_counts_failures() {
        let map: StatusMap = Arc::new(Mutex::new(BTreeMap::new()));
        set_state(&map, "p", State::Starting, None);
        set_state(&map, "p", State::Failing, Some("boom".to_string()));
        set_state(&map, "p", State::Running, None);
        set_state(&map, "p", State::Failing, Some("boom again".to_string()));
        let status = map.lock();
        assert_eq!(status["p"].error_count, 2);
        assert_eq!(status["p"].state, State::Failing);
    }

    #[tokio::test]
    async fn test_manager_with_no_plugins() {
        let engine = Arc::new(PolicyEngine::new(Config::default()));
        let manager = Manager::new(engine, &Config::default()).unwrap();
        manager.start().await.unwrap();
        assert!(manager.status().is_empty());
        manager.stop().await;
    }

    #[test]
    fn test_unknown_service_rejected() {
        let engine = Arc::new(PolicyEngine::new(Config::default()));
        let mut config = Config::default();
        config.bundles.insert(
            "main".to_string(),
            crate::config::BundleSourceConfig {
                service: "nope".to_string(),
                resource: "bundles/main.tar.gz".to_string(),
                polling: crate::config::PollingConfig::default(),
            },
        );
        assert!(Manager::new(engine, &config).is_err());
    }
}
