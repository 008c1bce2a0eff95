//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (default `~/.hiveot/hub.json`, or `HIVEOT_CONFIG_PATH`).
//! A missing file yields defaults. The data directory can be moved with `HIVEOT_DATA_DIR`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::authn::DEFAULT_PASSWORD_FILE;
use crate::authz::DEFAULT_ACL_FILE;

pub const CONFIG_PATH_ENV: &str = "HIVEOT_CONFIG_PATH";
pub const DATA_DIR_ENV: &str = "HIVEOT_DATA_DIR";

/// Top-level hub config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Listener and protocol settings.
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub authn: AuthnConfig,

    #[serde(default)]
    pub authz: AuthzConfig,

    /// Defaults for the library's own clients.
    #[serde(default)]
    pub client: ClientConfig,

    /// Store directory (default ~/.hiveot/stores). Overridden by HIVEOT_DATA_DIR.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Listener bind/port and which sub-protocols the HTTP server hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port for HTTP, SSE and websockets (default 8444). 0 binds an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub enable_sse: bool,

    #[serde(default = "default_true")]
    pub enable_hiveot_wss: bool,

    #[serde(default = "default_true")]
    pub enable_wot_wss: bool,

    #[serde(default = "default_sse_path")]
    pub sse_path: String,

    #[serde(default = "default_hiveot_wss_path")]
    pub hiveot_wss_path: String,

    #[serde(default = "default_wot_wss_path")]
    pub wot_wss_path: String,

    /// Name published in the discovery record.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8444
}

fn default_true() -> bool {
    true
}

fn default_sse_path() -> String {
    crate::servers::DEFAULT_SSE_PATH.to_string()
}

fn default_hiveot_wss_path() -> String {
    crate::servers::DEFAULT_HIVEOT_WSS_PATH.to_string()
}

fn default_wot_wss_path() -> String {
    crate::servers::DEFAULT_WOT_WSS_PATH.to_string()
}

fn default_instance_name() -> String {
    "hiveot".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            enable_sse: true,
            enable_hiveot_wss: true,
            enable_wot_wss: true,
            sse_path: default_sse_path(),
            hiveot_wss_path: default_hiveot_wss_path(),
            wot_wss_path: default_wot_wss_path(),
            instance_name: default_instance_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthnConfig {
    /// Lifetime of issued tokens (default 14 days).
    #[serde(default = "default_token_validity")]
    pub token_validity_sec: u64,

    /// Password file; relative paths resolve against the data directory.
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

fn default_token_validity() -> u64 {
    14 * 24 * 3600
}

impl Default for AuthnConfig {
    fn default() -> Self {
        Self {
            token_validity_sec: default_token_validity(),
            password_file: None,
        }
    }
}

impl AuthnConfig {
    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_validity_sec)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthzConfig {
    /// Group file; relative paths resolve against the data directory.
    #[serde(default)]
    pub acl_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Reconnect after the connection drops.
    #[serde(default = "default_true")]
    pub reconnect: bool,
}

fn default_rpc_timeout_ms() -> u64 {
    60_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout_ms(),
            reconnect: true,
        }
    }
}

impl ClientConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn hiveot_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".hiveot"))
        .unwrap_or_else(|| PathBuf::from(".hiveot"))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    env_path(CONFIG_PATH_ENV).unwrap_or_else(|| hiveot_home().join("hub.json"))
}

/// Data directory: HIVEOT_DATA_DIR, then `dataDir` from config, then ~/.hiveot/stores.
pub fn resolve_data_dir(config: &HubConfig) -> PathBuf {
    env_path(DATA_DIR_ENV)
        .or_else(|| config.data_dir.clone())
        .unwrap_or_else(|| hiveot_home().join("stores"))
}

fn in_data_dir(data_dir: &Path, file: Option<&PathBuf>, default_name: &str) -> PathBuf {
    match file {
        Some(f) if f.is_absolute() => f.clone(),
        Some(f) if !f.as_os_str().is_empty() => data_dir.join(f),
        _ => data_dir.join(default_name),
    }
}

pub fn resolve_password_file(config: &HubConfig, data_dir: &Path) -> PathBuf {
    in_data_dir(data_dir, config.authn.password_file.as_ref(), DEFAULT_PASSWORD_FILE)
}

pub fn resolve_acl_file(config: &HubConfig, data_dir: &Path) -> PathBuf {
    in_data_dir(data_dir, config.authz.acl_file.as_ref(), DEFAULT_ACL_FILE)
}

/// Load config from the given path, HIVEOT_CONFIG_PATH, or the default. Missing file =>
/// default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(HubConfig, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        HubConfig::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
