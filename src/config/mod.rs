//! Static configuration consumed once at startup.
//!
//! The static tree names the entry points, enables providers and sets the
//! global throttle; everything routable lives in the dynamic model instead.

pub mod dynamic;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

/// Protocol served by an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryPointProtocol {
    #[default]
    Tcp,
    Udp,
}

/// A listening socket with a protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPointConfig {
    pub address: String,
    #[serde(default)]
    pub protocol: EntryPointProtocol,
}

/// File provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProviderConfig {
    pub path: String,
    /// Poll interval in seconds for change detection.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    2
}

/// Gateway-API provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayProviderConfig {
    /// Enables watching of the experimental-channel kinds (TCPRoute, TLSRoute).
    #[serde(default)]
    pub experimental_channel: bool,
    /// Label selector applied to GatewayClasses.
    #[serde(default)]
    pub label_selector: Option<String>,
    /// Watched namespaces; empty means all.
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Per-provider throttle override in milliseconds.
    #[serde(default)]
    pub throttle_ms: Option<u64>,
}

/// Enabled providers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub file: Option<FileProviderConfig>,
    #[serde(default)]
    pub gateway: Option<GatewayProviderConfig>,
    /// Global default throttle in milliseconds, applied to providers
    /// without their own override.
    #[serde(default)]
    pub throttle_ms: u64,
}

/// Root of the static configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticConfig {
    pub entry_points: HashMap<String, EntryPointConfig>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Entry points assigned to routers that declare none.
    #[serde(default)]
    pub default_entry_points: Vec<String>,
    /// Enables the api@internal service.
    #[serde(default)]
    pub api: bool,
}

impl StaticConfig {
    /// Effective default entry points: the configured list, or every
    /// TCP entry point sorted by name.
    pub fn effective_default_entry_points(&self) -> Vec<String> {
        if !self.default_entry_points.is_empty() {
            return self.default_entry_points.clone();
        }
        let mut names: Vec<String> = self
            .entry_points
            .iter()
            .filter(|(_, ep)| ep.protocol == EntryPointProtocol::Tcp)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Global provider throttle as a duration.
    pub fn throttle_duration(&self) -> Duration {
        Duration::from_millis(self.providers.throttle_ms)
    }
}

pub fn load_config(path: &str) -> Result<StaticConfig> {
    let content = fs::read_to_string(path)?;
    let config: StaticConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
