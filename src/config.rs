//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - verdict.toml (default configuration)
//! - verdict.local.toml (git-ignored local overrides)
//! - Environment variables (VERDICT_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # verdict.toml
//! labels = { app = "payments", env = "prod" }
//!
//! [[services]]
//! name = "control-plane"
//! url = "https://control.example.com/v1"
//! bearer_token = "secret"
//!
//! [bundles.payments]
//! service = "control-plane"
//! resource = "bundles/payments.tar.gz"
//!
//! [decision_logs]
//! service = "control-plane"
//! mask_paths = ["/input/password"]
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! VERDICT_EVAL__STRICT_BUILTIN_ERRORS=true
//! VERDICT_LOGGING__LEVEL=debug
//! ```
//!
//! After discovery runs, its output is merged over this bootstrap
//! configuration; `services`, `labels`, and `discovery` itself are
//! immutable after boot.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Instance labels attached to status and decision-log uploads
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Remote services plugins talk to
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Bundle download configuration, keyed by bundle name
    #[serde(default)]
    pub bundles: BTreeMap<String, BundleSourceConfig>,

    /// Status reporter configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusConfig>,

    /// Decision logger configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_logs: Option<DecisionLogConfig>,

    /// Discovery bootstrap configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryConfig>,

    /// Evaluation settings
    #[serde(default)]
    pub eval: EvalConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A remote control-plane service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Base URL; resource paths are appended to it
    pub url: String,

    /// Extra headers sent on every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Bearer token for the Authorization header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

/// One bundle's polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSourceConfig {
    /// Which service to download from
    pub service: String,

    /// Resource path on the service
    pub resource: String,

    #[serde(default)]
    pub polling: PollingConfig,
}

/// Exponential back-off bounds for polling loops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_min_delay")]
    pub min_delay_seconds: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            min_delay_seconds: default_min_delay(),
            max_delay_seconds: default_max_delay(),
        }
    }
}

/// Status reporter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    pub service: String,

    #[serde(default = "default_status_interval")]
    pub interval_seconds: u64,

    /// Bounded in-memory buffer; oldest snapshots drop on overflow
    #[serde(default = "default_status_buffer")]
    pub buffer_size: usize,
}

/// Decision logger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLogConfig {
    pub service: String,

    /// Optional upload partition, appended to /logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,

    #[serde(default = "default_log_buffer")]
    pub buffer_size: usize,

    #[serde(default = "default_upload_interval")]
    pub upload_interval_seconds: u64,

    /// JSON-pointer paths erased from events before upload
    #[serde(default)]
    pub mask_paths: Vec<String>,
}

/// Discovery bootstrap settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub service: String,

    /// Resource path of the discovery bundle
    pub resource: String,

    /// Rule path evaluated against the discovery bundle, e.g.
    /// `discovery/config`
    pub decision: String,

    #[serde(default)]
    pub polling: PollingConfig,
}

/// Evaluation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Surface built-in errors instead of treating them as undefined
    #[serde(default)]
    pub strict_builtin_errors: bool,

    /// Cap on collected compile errors
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,

    /// Per-query deadline (0 = no deadline)
    #[serde(default)]
    pub timeout_ms: u64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig {
            strict_builtin_errors: false,
            max_errors: default_max_errors(),
            timeout_ms: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_min_delay() -> u64 {
    60
}
fn default_max_delay() -> u64 {
    120
}
fn default_status_interval() -> u64 {
    30
}
fn default_status_buffer() -> usize {
    64
}
fn default_log_buffer() -> usize {
    10000
}
fn default_upload_interval() -> u64 {
    15
}
fn default_max_errors() -> usize {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. verdict.toml (base configuration)
    /// 2. verdict.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (VERDICT_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("verdict.toml"))
            .merge(Toml::file("verdict.local.toml"))
            .merge(Env::prefixed("VERDICT_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VERDICT_").split("__"))
            .extract()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Merge a discovered configuration over this one. `services`,
    /// `labels`, and `discovery` are pinned at boot and never
    /// overwritten.
    pub fn merge_discovered(&self, discovered: Config) -> Config {
        Config {
            labels: self.labels.clone(),
            services: self.services.clone(),
            discovery: self.discovery.clone(),
            bundles: if discovered.bundles.is_empty() {
                self.bundles.clone()
            } else {
                discovered.bundles
            },
            status: discovered.status.or_else(|| self.status.clone()),
            decision_logs: discovered.decision_logs.or_else(|| self.decision_logs.clone()),
            eval: discovered.eval,
            logging: discovered.logging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.services.is_empty());
        assert!(config.bundles.is_empty());
        assert_eq!(config.eval.max_errors, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.labels.insert("app".to_string(), "payments".to_string());
        config.services.push(ServiceConfig {
            name: "cp".to_string(),
            url: "https://example.com".to_string(),
            headers: BTreeMap::new(),
            bearer_token: None,
        });
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[labels]"));
        assert!(toml_str.contains("[[services]]"));
    }

    #[test]
    fn test_config_parse() {
        let text = r#"
            labels = { env = "prod" }

            [[services]]
            name = "cp"
            url = "https://control.example.com"

            [bundles.main]
            service = "cp"
            resource = "bundles/main.tar.gz"

            [bundles.main.polling]
            min_delay_seconds = 5
            max_delay_seconds = 30

            [decision_logs]
            service = "cp"
            mask_paths = ["/input/password"]
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(config.bundles["main"].polling.min_delay_seconds, 5);
        assert_eq!(
            config.decision_logs.as_ref().unwrap().mask_paths,
            vec!["/input/password".to_string()]
        );
        assert_eq!(config.decision_logs.as_ref().unwrap().buffer_size, 10000);
    }

    #[test]
    fn test_merge_discovered_pins_boot_fields() {
        let mut boot = Config::default();
        boot.labels.insert("app".to_string(), "x".to_string());
        boot.services.push(ServiceConfig {
            name: "cp".to_string(),
            url: "https://a".to_string(),
            headers: BTreeMap::new(),
            bearer_token: None,
        });

        let mut discovered = Config::default();
        discovered.labels.insert("app".to_string(), "evil".to_string());
        discovered.services.push(ServiceConfig {
            name: "rogue".to_string(),
            url: "https://b".to_string(),
            headers: BTreeMap::new(),
            bearer_token: None,
        });
        discovered.bundles.insert(
            "main".to_string(),
            BundleSourceConfig {
                service: "cp".to_string(),
                resource: "bundles/main.tar.gz".to_string(),
                polling: PollingConfig::default(),
            },
        );

        let merged = boot.merge_discovered(discovered);
        assert_eq!(merged.labels.get("app").map(String::as_str), Some("x"));
        assert_eq!(merged.services.len(), 1);
        assert_eq!(merged.services[0].name, "cp");
        assert!(merged.bundles.contains_key("main"));
    }
}
