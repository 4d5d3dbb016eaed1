use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use thiserror::Error;

/// Name of the shared ephemeral volume the mutator adds to opted-in pods.
pub const AGENT_VOLUME_NAME: &str = "kubedb-monitor-agent";

/// Name of the init container that stages the agent jar onto the volume.
pub const AGENT_INIT_CONTAINER_NAME: &str = "kubedb-monitor-agent-init";

/// Annotation prefix recognized by the injection controller.
pub const ANNOTATION_PREFIX: &str = "kubedb.monitor/";

/// Namespaces that are never mutated. Defaults to the control namespaces.
pub static SKIP_NAMESPACES: Lazy<Vec<String>> = Lazy::new(|| {
    std::env::var("SKIP_NAMESPACES")
        .unwrap_or_else(|_| "kube-system,kube-public".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address in {var}: {value}")]
    InvalidListenAddr { var: &'static str, value: String },
    #[error("invalid numeric value in {var}: {value}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Runtime configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub control_plane_listen: SocketAddr,
    pub admission_listen: SocketAddr,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    pub agent_image: String,
    pub agent_jar_source_path: String,
    pub agent_mount_path: String,
    pub skip_image_markers: Vec<String>,
    pub rolling_window_seconds: u64,
    pub long_tx_threshold: Duration,
    pub ingest_buffer_size: usize,
    pub subscriber_queue_size: usize,
    pub admission_timeout: Duration,
    pub static_asset_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            control_plane_listen: parse_addr("CONTROL_PLANE_LISTEN", "0.0.0.0:8080")?,
            admission_listen: parse_addr("ADMISSION_LISTEN", "0.0.0.0:8443")?,
            tls_cert_path: std::env::var("TLS_CERT_PATH")
                .unwrap_or_else(|_| "/etc/kubedb-monitor/tls/tls.crt".to_string())
                .into(),
            tls_key_path: std::env::var("TLS_KEY_PATH")
                .unwrap_or_else(|_| "/etc/kubedb-monitor/tls/tls.key".to_string())
                .into(),
            agent_image: std::env::var("AGENT_IMAGE")
                .unwrap_or_else(|_| "ghcr.io/kubedb-monitor/agent:latest".to_string()),
            agent_jar_source_path: std::env::var("AGENT_JAR_SOURCE_PATH")
                .unwrap_or_else(|_| "/opt/kubedb/agent.jar".to_string()),
            agent_mount_path: std::env::var("AGENT_MOUNT_PATH")
                .unwrap_or_else(|_| "/opt/kubedb/agent".to_string()),
            skip_image_markers: std::env::var("SKIP_IMAGE_MARKERS")
                .unwrap_or_else(|_| "istio/proxyv2,envoyproxy/envoy,linkerd/proxy".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            rolling_window_seconds: parse_number("ROLLING_WINDOW_SECONDS", 60)?,
            long_tx_threshold: Duration::from_millis(parse_number("LONG_TX_THRESHOLD_MS", 5_000)?),
            ingest_buffer_size: parse_number("INGEST_BUFFER_SIZE", 16_384)? as usize,
            subscriber_queue_size: parse_number("SUBSCRIBER_QUEUE_SIZE", 256)? as usize,
            admission_timeout: Duration::from_secs(parse_number("ADMISSION_TIMEOUT_SECONDS", 10)?),
            static_asset_dir: std::env::var("STATIC_ASSET_DIR").ok().map(Into::into),
        })
    }
}

fn parse_addr(var: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let value = std::env::var(var).unwrap_or_else(|_| default.to_string());
    value
        .parse()
        .map_err(|_| ConfigError::InvalidListenAddr { var, value })
}

fn parse_number(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_without_environment() {
        let config = Config::from_env().expect("defaults should parse");
        assert_eq!(config.rolling_window_seconds, 60);
        assert_eq!(config.long_tx_threshold, Duration::from_secs(5));
        assert_eq!(config.ingest_buffer_size, 16_384);
        assert_eq!(config.subscriber_queue_size, 256);
        assert!(config
            .skip_image_markers
            .iter()
            .any(|m| m.contains("istio")));
    }
}
