//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use mesh_core::CoreConfig;
use serde::Deserialize;

/// Chunk size used when the config does not set one. The default SCTP
/// message size of the WebRTC stack is far below the core's 16 MiB.
pub const HOST_CHUNK_SIZE: u64 = 64 * 1024;

/// Host configuration. File: ~/.config/easymesh/config.toml or /etc/easymesh/config.toml.
/// Env overrides: EASYMESH_SIGNALING_URL, EASYMESH_DOWNLOAD_DIR, EASYMESH_CHUNK_SIZE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Relay base URL (default ws://127.0.0.1:8001).
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,
    /// Where received files are saved (default ~/Downloads/easymesh).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
    #[serde(default = "default_transfer")]
    pub transfer: CoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:8001".into()
}
fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Downloads/easymesh")
}
fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec!["stun:stun.l.google.com:19302".into()],
        username: String::new(),
        credential: String::new(),
    }]
}
fn default_transfer() -> CoreConfig {
    CoreConfig {
        chunk_size: HOST_CHUNK_SIZE,
        ..CoreConfig::default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: default_signaling_url(),
            download_dir: default_download_dir(),
            ice_servers: default_ice_servers(),
            transfer: default_transfer(),
        }
    }
}

impl Config {
    /// Parse a config file body. A `[transfer]` table without `chunk_size`
    /// keeps the host chunk size rather than the core's.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let raw: toml::Table = toml::from_str(s)?;
        let mut config: Config = toml::from_str(s)?;
        let chunk_set = raw
            .get("transfer")
            .and_then(|t| t.get("chunk_size"))
            .is_some();
        if !chunk_set {
            config.transfer.chunk_size = HOST_CHUNK_SIZE;
        }
        Ok(config)
    }

    /// `{signaling_url}/api/ws/session/{session_id}`.
    pub fn session_url(&self, session_id: &str) -> String {
        format!(
            "{}/api/ws/session/{}",
            self.signaling_url.trim_end_matches('/'),
            session_id
        )
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("EASYMESH_SIGNALING_URL") {
            self.signaling_url = s;
        }
        if let Some(s) = var("EASYMESH_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(s);
        }
        if let Some(s) = var("EASYMESH_CHUNK_SIZE") {
            match s.parse::<u64>() {
                Ok(n) if n > 0 => self.transfer.chunk_size = n,
                _ => tracing::warn!(value = %s, "ignoring invalid EASYMESH_CHUNK_SIZE"),
            }
        }
    }
}

/// Load config: merge default, then config file (explicit path or first found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    };
    let mut c = match path {
        Some(p) => {
            let s = std::fs::read_to_string(&p)
                .with_context(|| format!("reading {}", p.display()))?;
            let c = Config::from_toml_str(&s).with_context(|| format!("parsing {}", p.display()))?;
            tracing::info!(path = %p.display(), "loaded config");
            c
        }
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/easymesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/easymesh/config.toml"));
    out
}
