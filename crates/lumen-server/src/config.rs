use std::num::{NonZeroU64, NonZeroUsize};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "ServerConfig::default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl ServerConfig {
    fn default_max_upload_bytes() -> usize {
        64 * 1024 * 1024
    }

    pub fn with_listen_addr(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            max_upload_bytes: Self::default_max_upload_bytes(),
        }
    }
}

/// Upstream negotiation knobs for the retrieval gateway.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Base URL of the byte source. When unset the application derives one.
    #[serde(default)]
    pub upstream_url: Option<String>,
    #[serde(default = "GatewayConfig::default_head_timeout_ms")]
    pub head_timeout_ms: NonZeroU64,
    #[serde(default = "GatewayConfig::default_get_timeout_ms")]
    pub get_timeout_ms: NonZeroU64,
    #[serde(default = "GatewayConfig::default_chunk_size_bytes")]
    pub chunk_size_bytes: NonZeroUsize,
    #[serde(default = "GatewayConfig::default_error_body_limit_bytes")]
    pub error_body_limit_bytes: usize,
}

impl GatewayConfig {
    fn default_head_timeout_ms() -> NonZeroU64 {
        NonZeroU64::new(20_000).expect("head timeout defaults to 20s")
    }

    fn default_get_timeout_ms() -> NonZeroU64 {
        NonZeroU64::new(60_000).expect("get timeout defaults to 60s")
    }

    fn default_chunk_size_bytes() -> NonZeroUsize {
        NonZeroUsize::new(32 * 1024).expect("chunk size defaults to 32 KiB")
    }

    fn default_error_body_limit_bytes() -> usize {
        8 * 1024
    }

    pub fn head_timeout(&self) -> Duration {
        Duration::from_millis(self.head_timeout_ms.get())
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms.get())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream_url: None,
            head_timeout_ms: Self::default_head_timeout_ms(),
            get_timeout_ms: Self::default_get_timeout_ms(),
            chunk_size_bytes: Self::default_chunk_size_bytes(),
            error_body_limit_bytes: Self::default_error_body_limit_bytes(),
        }
    }
}

/// Per-step deadlines of an upload session.
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "SessionConfig::default_create_timeout_ms")]
    pub create_timeout_ms: NonZeroU64,
    #[serde(default = "SessionConfig::default_upload_timeout_ms")]
    pub upload_timeout_ms: NonZeroU64,
    #[serde(default = "SessionConfig::default_inference_timeout_ms")]
    pub inference_timeout_ms: NonZeroU64,
}

impl SessionConfig {
    fn default_create_timeout_ms() -> NonZeroU64 {
        NonZeroU64::new(10_000).expect("create timeout defaults to 10s")
    }

    fn default_upload_timeout_ms() -> NonZeroU64 {
        NonZeroU64::new(30_000).expect("upload timeout defaults to 30s")
    }

    fn default_inference_timeout_ms() -> NonZeroU64 {
        NonZeroU64::new(30_000).expect("inference timeout defaults to 30s")
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms.get())
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms.get())
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms.get())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            create_timeout_ms: Self::default_create_timeout_ms(),
            upload_timeout_ms: Self::default_upload_timeout_ms(),
            inference_timeout_ms: Self::default_inference_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_gateway_section_keeps_defaults() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"head_timeout_ms": 500}"#).expect("valid gateway config");
        assert_eq!(config.head_timeout(), Duration::from_millis(500));
        assert_eq!(config.get_timeout(), Duration::from_secs(60));
        assert_eq!(config.chunk_size_bytes.get(), 32 * 1024);
        assert!(config.upstream_url.is_none());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let result = serde_json::from_str::<SessionConfig>(r#"{"create_timeout_ms": 0}"#);
        assert!(result.is_err(), "zero timeout must not deserialize");
    }
}
