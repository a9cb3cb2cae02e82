//! Exporter configuration file (JSON).

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

pub const DEFAULT_CONFIG_FILENAME: &str = "config.json";

fn default_env_name() -> String {
    "local".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    #[serde(default = "default_env_name")]
    pub env_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Adapter instances keyed by instance name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderEntry>,
}

fn default_listen_address() -> String {
    "0.0.0.0".into()
}
fn default_listen_port() -> u16 {
    19001
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
        }
    }
}

impl MetricsConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen_address, self.listen_port)
            .parse()
            .with_context(|| {
                format!(
                    "Invalid metrics listen address {}:{}",
                    self.listen_address, self.listen_port
                )
            })
    }
}

/// One adapter instance. `provider` defaults to the instance name; the
/// remaining keys are handed to the provider's factory untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl ProviderEntry {
    pub fn provider_id<'a>(&'a self, instance: &'a str) -> &'a str {
        self.provider.as_deref().unwrap_or(instance)
    }
}

impl ExporterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}
