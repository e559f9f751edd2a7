//! Configuration loading and XDG path helpers.

use std::env;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use lumen_server::{GatewayConfig, ServerConfig, SessionConfig};
use serde::Deserialize;
use thiserror::Error;

use crate::services::DurableWrite;

const CONFIG_FILE: &str = "config/settings";
const CONFIG_FILE_ENV: &str = "LUMEN_CONFIG_FILE";
const ENV_PREFIX: &str = "LUMEN";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error("storage backend `remote` requires `storage.remote_url`")]
    MissingRemoteUrl,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Filesystem staging plus LMDB catalog in this process.
    #[default]
    Local,
    /// The `/sets` API of another lumen instance.
    Remote,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    pub path: PathBuf,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub durability: DurableWrite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    /// Model service base URL; inference is disabled when unset.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "InferenceConfig::default_probe_interval_ms")]
    pub probe_interval_ms: NonZeroU64,
    #[serde(default = "InferenceConfig::default_timeout_ms")]
    pub timeout_ms: NonZeroU64,
}

impl InferenceConfig {
    fn default_probe_interval_ms() -> NonZeroU64 {
        NonZeroU64::new(15_000).expect("probe interval defaults to 15s")
    }

    fn default_timeout_ms() -> NonZeroU64 {
        NonZeroU64::new(30_000).expect("inference timeout defaults to 30s")
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.get())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.get())
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: None,
            probe_interval_ms: Self::default_probe_interval_ms(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

impl AppConfig {
    /// Upstream the retrieval gateway reads from when none is configured:
    /// this server's own raw file routes, or the remote store.
    pub fn gateway_upstream(&self) -> Option<String> {
        if let Some(url) = &self.gateway.upstream_url {
            return Some(url.clone());
        }
        match self.storage.backend {
            StorageBackend::Local => {
                Some(format!("http://{}", loopback_for(&self.server.listen_addr)))
            }
            StorageBackend::Remote => self.storage.remote_url.clone(),
        }
    }
}

/// A wildcard listen address is reachable through loopback of the same family.
fn loopback_for(listen_addr: &str) -> String {
    match listen_addr.parse::<SocketAddr>() {
        Ok(mut addr) if addr.ip().is_unspecified() => {
            let loopback = match addr {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            addr.set_ip(loopback);
            addr.to_string()
        }
        _ => listen_addr.to_string(),
    }
}

/// Loads configuration: defaults, then `config/settings.*`, then the file named
/// by `LUMEN_CONFIG_FILE`, then `LUMEN__*` environment variables.
pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_storage = default_storage_path()?;
    let mut builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default("storage.path", default_storage.to_string_lossy().to_string())?
        .add_source(File::with_name(CONFIG_FILE).required(false));

    if let Some(path) = env::var_os(CONFIG_FILE_ENV).filter(|value| !value.is_empty()) {
        builder = builder.add_source(File::from(PathBuf::from(path)).required(false));
    }

    let cfg: AppConfig = builder
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?
        .try_deserialize()?;

    if cfg.storage.backend == StorageBackend::Remote && cfg.storage.remote_url.is_none() {
        return Err(AppConfigError::MissingRemoteUrl);
    }
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "lumen", "lumen").ok_or(AppConfigError::MissingProjectDirs)
}

fn default_storage_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> AppConfig {
        Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .expect("build")
            .try_deserialize()
            .expect("deserialize")
    }

    #[test]
    fn omitted_sections_fall_back_to_defaults() {
        let cfg = parse(
            r#"
            [server]
            listen_addr = "0.0.0.0:9000"
            [storage]
            path = "/var/lib/lumen"
            "#,
        );

        assert_eq!(cfg.storage.backend, StorageBackend::Local);
        assert_eq!(cfg.storage.durability, DurableWrite::None);
        assert!(cfg.inference.url.is_none());
        assert_eq!(cfg.gateway.head_timeout_ms.get(), 20_000);
        assert_eq!(cfg.session.upload_timeout_ms.get(), 30_000);
        assert_eq!(cfg.gateway_upstream().as_deref(), Some("http://127.0.0.1:9000"));
    }

    #[test]
    fn remote_backend_reads_through_remote_url() {
        let cfg = parse(
            r#"
            [server]
            listen_addr = "127.0.0.1:9000"
            [storage]
            backend = "remote"
            path = "/tmp/lumen"
            remote_url = "http://storage:8001"
            durability = "file_and_dir"
            "#,
        );

        assert_eq!(cfg.storage.durability, DurableWrite::FileAndDir);
        assert_eq!(cfg.gateway_upstream().as_deref(), Some("http://storage:8001"));
    }

    #[test]
    fn wildcard_listen_addresses_map_to_loopback() {
        assert_eq!(loopback_for("0.0.0.0:9000"), "127.0.0.1:9000");
        assert_eq!(loopback_for("[::]:9000"), "[::1]:9000");
        assert_eq!(loopback_for("[::1]:9000"), "[::1]:9000");
        assert_eq!(loopback_for("localhost:9000"), "localhost:9000");

        let cfg = parse(
            r#"
            [server]
            listen_addr = "[::]:9100"
            [storage]
            path = "/var/lib/lumen"
            "#,
        );
        assert_eq!(cfg.gateway_upstream().as_deref(), Some("http://[::1]:9100"));
    }
}
