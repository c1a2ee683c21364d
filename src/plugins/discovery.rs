//! Discovery plugin.
//!
//! Bootstraps the runtime's configuration from a remote "discovery"
//! bundle: fetch the bundle, evaluate a designated rule path against
//! it, and use the result as the configuration for the other plugins.
//! Re-discovery periodically repeats the process and atomically
//! reconfigures the manager; `services`, `labels`, and `discovery`
//! itself are immutable after boot.

use super::{
    backoff_delay, log_plugin_error, set_state, Fetched, Manager, Plugin, PluginError,
    ServiceClient, State, StatusMap,
};
use crate::builtins::Registry;
use crate::bundle::Bundle;
use crate::compiler::Compiler;
use crate::config::{Config, DiscoveryConfig};
use crate::eval::{Evaluator, QueryOptions};
use crate::parser::parse_module;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const PLUGIN_NAME: &str = "discovery";

/// Fetch the discovery bundle once and produce the effective
/// configuration (discovered config merged over the boot config with
/// the immutable fields pinned).
pub async fn discover_config(
    client: &ServiceClient,
    discovery: &DiscoveryConfig,
    boot: &Config,
) -> Result<Config, PluginError> {
    let bytes = match client.get(&discovery.resource, None).await? {
        Fetched::Body(bytes, _) => bytes,
        Fetched::NotModified => {
            return Err(PluginError::Transport(
                "unexpected 304 for unconditional discovery fetch".to_string(),
            ))
        }
    };
    let bundle = Bundle::read(bytes.as_slice())
        .map_err(|e| PluginError::Transport(format!("discovery bundle unpack: {e}")))?;
    let discovered = evaluate_discovery(&bundle, &discovery.decision)?;
    Ok(boot.merge_discovered(discovered))
}

/// Compile the discovery bundle and evaluate its decision path; the
/// result document deserializes into a [`Config`].
pub fn evaluate_discovery(bundle: &Bundle, decision: &str) -> Result<Config, PluginError> {
    let registry = Registry::standard();
    let mut modules = Vec::new();
    for (name, source) in &bundle.modules {
        let module = parse_module(source)
            .map_err(|e| PluginError::Config(format!("discovery module {name}: {e:?}")))?;
        modules.push(module);
    }
    let policy = Compiler::new(&registry)
        .compile(modules)
        .map_err(|e| PluginError::Config(format!("discovery compile: {e:?}")))?;

    let segments: Vec<String> = decision
        .split(['/', '.'])
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    let mut evaluator = Evaluator::new(
        Arc::new(policy),
        Arc::new(registry),
        Arc::new(bundle.data.clone()),
        None,
        QueryOptions::default(),
    );
    let result = evaluator
        .eval_path(&segments)
        .map_err(|e| PluginError::Config(format!("discovery evaluation: {e}")))?
        .ok_or_else(|| {
            PluginError::Config(format!("discovery decision '{decision}' is undefined"))
        })?;

    let json = result
        .to_json()
        .ok_or_else(|| PluginError::Config("discovery decision is not ground".to_string()))?;
    serde_json::from_value::<Config>(json)
        .map_err(|e| PluginError::Config(format!("discovery decision is not a configuration: {e}")))
}

/// The re-discovery loop. Holds the manager so a changed configuration
/// can be swapped in atomically.
pub struct DiscoveryPlugin {
    client: ServiceClient,
    config: DiscoveryConfig,
    boot: Config,
    manager: Arc<Manager>,
    status: StatusMap,
    shutdown: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryPlugin {
    pub fn new(
        client: ServiceClient,
        config: DiscoveryConfig,
        boot: Config,
        manager: Arc<Manager>,
        status: StatusMap,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        DiscoveryPlugin {
            client,
            config,
            boot,
            manager,
            status,
            shutdown,
            task: Mutex::new(None),
        }
    }

    async fn rediscover_loop(
        client: ServiceClient,
        config: DiscoveryConfig,
        boot: Config,
        manager: Arc<Manager>,
        status: StatusMap,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut retries: u32 = 0;
        let mut last: Option<String> = None;

        loop {
            let delay = if retries == 0 {
                super::poll_delay(
                    config.polling.min_delay_seconds,
                    config.polling.max_delay_seconds,
                )
            } else {
                backoff_delay(
                    config.polling.min_delay_seconds,
                    config.polling.max_delay_seconds,
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

            match discover_config(&client, &config, &boot).await {
                Ok(effective) => {
                    retries = 0;
                    // Only reconfigure when the effective config changed.
                    let fingerprint = serde_json::to_string(&effective).unwrap_or_default();
                    if last.as_deref() != Some(fingerprint.as_str()) {
                        info!("discovery produced a new configuration");
                        if let Err(error) = manager.reconfigure(&effective).await {
                            warn!(error = %error, "reconfiguration failed");
                            log_plugin_error(PLUGIN_NAME, &status, &error);
                            continue;
                        }
                        last = Some(fingerprint);
                    }
                    set_state(&status, PLUGIN_NAME, State::Running, None);
                }
                Err(error) => {
                    retries = retries.saturating_add(1);
                    log_plugin_error(PLUGIN_NAME, &status, &error);
                }
            }
        }
    }
}

#[async_trait]
impl Plugin for DiscoveryPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn start(&self) -> Result<(), PluginError> {
        let handle = tokio::spawn(Self::rediscover_loop(
            self.client.clone(),
            self.config.clone(),
            self.boot.clone(),
            Arc::clone(&self.manager),
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
