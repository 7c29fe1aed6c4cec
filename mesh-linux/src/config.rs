//! Load config from file and environment.

use std::path::{Path, PathBuf};

use mesh_core::{LocalIdentity, MeshConfig, PeerId};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/mesh/config.toml or /etc/mesh/config.toml.
/// Env overrides: MESH_PEER_ID, MESH_DISPLAY_NAME, MESH_DISCOVERY_PORT,
/// MESH_TRANSPORT_PORT, MESH_LOG_LEVEL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Identity advertised to peers. Generated per run when unset.
    #[serde(default)]
    pub peer_id: Option<String>,
    /// Name sent in announcements (default: $USER, else "mesh").
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Link TCP port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub mesh: MeshConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{var}: invalid port {value:?}")]
    Port { var: &'static str, value: String },
}

fn default_display_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "mesh".to_owned())
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: None,
            display_name: default_display_name(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            log_level: default_log_level(),
            mesh: MeshConfig::default(),
        }
    }
}

impl Config {
    /// Identity to run as; a fresh peer id when none is configured.
    pub fn identity(&self) -> LocalIdentity {
        let peer_id = match &self.peer_id {
            Some(id) => PeerId::new(id.clone()),
            None => PeerId::generate(),
        };
        LocalIdentity::new(peer_id, self.display_name.clone())
    }
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/mesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/mesh/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(s) = var("MESH_PEER_ID") {
        c.peer_id = Some(s);
    }
    if let Some(s) = var("MESH_DISPLAY_NAME") {
        c.display_name = s;
    }
    if let Some(s) = var("MESH_DISCOVERY_PORT") {
        c.discovery_port = parse_port("MESH_DISCOVERY_PORT", s)?;
    }
    if let Some(s) = var("MESH_TRANSPORT_PORT") {
        c.transport_port = parse_port("MESH_TRANSPORT_PORT", s)?;
    }
    if let Some(s) = var("MESH_LOG_LEVEL") {
        c.log_level = s;
    }
    Ok(())
}

fn parse_port(var: &'static str, value: String) -> Result<u16, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Port { var, value })
}
