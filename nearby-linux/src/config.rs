//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use nearby_core::SessionConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/nearby/config.toml or /etc/nearby/config.toml.
/// Env overrides: NEARBY_DISCOVERY_PORT, NEARBY_TRANSPORT_PORT, NEARBY_SERVICE_TYPE,
/// NEARBY_DISPLAY_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Session TCP port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Where the local identity is kept. Defaults to ~/.local/share/nearby.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Used when RUST_LOG is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Coordinator tick period in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_session")]
    pub session: SessionConfig,
}

fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_log_filter() -> String {
    "info".into()
}
fn default_tick_ms() -> u64 {
    100
}
fn default_session() -> SessionConfig {
    SessionConfig::new("nearby", default_display_name())
}

fn default_display_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "nearby".into())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            data_dir: None,
            log_filter: default_log_filter(),
            tick_ms: default_tick_ms(),
            session: default_session(),
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> anyhow::Result<Config> {
        let mut c: Config = toml::from_str(s)?;
        if c.session.service_type.is_empty() {
            c.session.service_type = "nearby".into();
        }
        if c.session.display_name.is_empty() {
            c.session.display_name = default_display_name();
        }
        Ok(c)
    }

    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".local/share/nearby"),
            None => PathBuf::from("/var/lib/nearby"),
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("NEARBY_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
            self.discovery_port = p;
        }
        if let Some(p) = var("NEARBY_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
            self.transport_port = p;
        }
        if let Some(s) = var("NEARBY_SERVICE_TYPE") {
            self.session.service_type = s;
        }
        if let Some(s) = var("NEARBY_DISPLAY_NAME") {
            self.session.display_name = s;
        }
    }
}

/// Load config: default, then the explicit or first existing config file, then env vars.
/// An explicit path must exist and parse; the default locations are optional.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn read(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Config::from_toml(&s).with_context(|| format!("parsing {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearby/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearby/config.toml"));
    out
}
