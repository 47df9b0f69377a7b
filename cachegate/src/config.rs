//! Static startup configuration (§3.1 ADDED) and `SIGHUP`-driven reload.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProto {
    Http1,
    Http2,
    Auto,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub addr: SocketAddr,
    #[serde(default = "default_proto")]
    pub proto: ListenerProto,
    /// Accept a PROXY v1/v2 preamble before the HTTP traffic on this listener.
    #[serde(default)]
    pub proxy_protocol: bool,
}

fn default_proto() -> ListenerProto {
    ListenerProto::Auto
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub endpoint: SocketAddr,
    #[serde(default)]
    pub host_header: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_first_byte_timeout_ms")]
    pub first_byte_timeout_ms: u64,
    #[serde(default = "default_between_bytes_timeout_ms")]
    pub between_bytes_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub backend_wait_limit: u32,
    #[serde(default)]
    pub backend_wait_timeout_ms: u64,
    #[serde(default)]
    pub proxy_header: Option<ProxyHeaderVersion>,
    #[serde(default = "default_local_holddown_ms")]
    pub local_error_holddown_ms: u64,
    #[serde(default = "default_remote_holddown_ms")]
    pub remote_error_holddown_ms: u64,
    /// `via` (§4.2): the name of another configured backend to chain this one through. The pool
    /// dials that backend's endpoint instead of this one's; this backend's own `endpoint` is
    /// wrapped into a PROXY v2 preamble so the via-backend can still route to it.
    #[serde(default)]
    pub via: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyHeaderVersion {
    V1,
    V2,
}

fn default_connect_timeout_ms() -> u64 {
    3_500
}
fn default_first_byte_timeout_ms() -> u64 {
    60_000
}
fn default_between_bytes_timeout_ms() -> u64 {
    60_000
}
fn default_max_connections() -> u32 {
    50
}
fn default_local_holddown_ms() -> u64 {
    10_000
}
fn default_remote_holddown_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct FilterDefaults {
    #[serde(default)]
    pub do_gzip: bool,
    #[serde(default)]
    pub do_gunzip: bool,
    #[serde(default)]
    pub do_esi: bool,
    #[serde(default)]
    pub http_gzip_support: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Limits {
    #[serde(default = "default_workspace_size")]
    pub workspace_size: usize,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "default_max_esi_depth")]
    pub max_esi_depth: u32,
    /// Total stored-object bytes (headers + body) the in-process `Stevedore` will hold before
    /// `allocobj` starts nuking (§7 error kind 6).
    #[serde(default = "default_storage_capacity_bytes")]
    pub storage_capacity_bytes: u64,
    /// Eviction attempts `allocobj` makes before giving up with `StoreError::NoSpace` (§7 error
    /// kind 6's `nuke_limit`).
    #[serde(default = "default_nuke_limit")]
    pub nuke_limit: u32,
}

fn default_workspace_size() -> usize {
    64 * 1024
}
fn default_max_header_bytes() -> usize {
    8 * 1024
}
fn default_max_esi_depth() -> u32 {
    5
}
fn default_storage_capacity_bytes() -> u64 {
    256 * 1024 * 1024
}
fn default_nuke_limit() -> u32 {
    50
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            workspace_size: default_workspace_size(),
            max_header_bytes: default_max_header_bytes(),
            max_esi_depth: default_max_esi_depth(),
            storage_capacity_bytes: default_storage_capacity_bytes(),
            nuke_limit: default_nuke_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub defaults: FilterDefaults,
    #[serde(default)]
    pub limits: Limits,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        Ok(cfg)
    }
}

/// A reloadable configuration handle: the ambient substitute for VCL warm/cold swap (§1.1).
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<Config>>,
    path: PathBuf,
}

impl ConfigHandle {
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let cfg = Config::load(&path)?;
        Ok(Self {
            inner: Arc::new(ArcSwap::from_pointee(cfg)),
            path,
        })
    }

    /// Load `path`, then overwrite listener addresses positionally with `listen_overrides`
    /// (the CLI's repeatable `-a`/`--listen` flag, §1.1). Extra overrides past the configured
    /// listener count are ignored; a shorter override list leaves the trailing listeners as-is.
    pub fn load_with_overrides(path: PathBuf, listen_overrides: &[SocketAddr]) -> anyhow::Result<Self> {
        let mut cfg = Config::load(&path)?;
        for (listener, addr) in cfg.listeners.iter_mut().zip(listen_overrides) {
            listener.addr = *addr;
        }
        Ok(Self {
            inner: Arc::new(ArcSwap::from_pointee(cfg)),
            path,
        })
    }

    #[must_use]
    pub fn current(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    fn reload(&self) {
        match Config::load(&self.path) {
            Ok(cfg) => {
                self.inner.store(Arc::new(cfg));
                info!(path = %self.path.display(), "configuration reloaded");
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "configuration reload failed, keeping previous snapshot");
            }
        }
    }

    /// Spawn the task that watches `SIGHUP` and swaps the snapshot in place.
    pub fn spawn_reload_task(self) {
        tokio::spawn(async move {
            let Ok(mut sighup) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) else {
                error!("failed to install SIGHUP handler, reload-on-signal disabled");
                return;
            };
            loop {
                sighup.recv().await;
                self.reload();
            }
        });
    }
}

/// Binary CLI flags (`-f`/`-a`/`-p`-style surface, §1.1).
#[derive(Debug, clap::Parser)]
#[command(name = "cachegated", about = "HTTP reverse-cache accelerator")]
pub struct Cli {
    /// Path to the YAML configuration document.
    #[arg(short = 'f', long = "config")]
    pub config: PathBuf,

    /// Override a listener address (may be repeated), format `addr:port`.
    #[arg(short = 'a', long = "listen")]
    pub listen: Vec<SocketAddr>,

    /// Log level filter, e.g. `info`, `cachegate=debug`.
    #[arg(short = 'p', long = "log-level", default_value = "info")]
    pub log_level: String,
}
