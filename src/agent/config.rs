use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::domain::BucketId;

/// Environment surface of the agent process. `S3_BUCKET_ID` is the one
/// hard requirement; everything else has a workable default.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub workspace: PathBuf,
    pub backend_api_url: String,
    pub bucket: BucketId,
    pub container_id: String,
    pub service_token: String,
    pub short_debounce: Duration,
    pub long_debounce: Duration,
    pub significant_gap: Duration,
    pub significant_len: usize,
    pub quiet_window: Duration,
    pub resubscribe_interval: Duration,
    pub initial_sync_timeout: Duration,
    pub reconnect_max_backoff: Duration,
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let workspace =
            PathBuf::from(env::var("WORKSPACE_PATH").unwrap_or_else(|_| "/workspace".into()));
        let raw_url =
            env::var("BACKEND_API_URL").unwrap_or_else(|_| "http://localhost:8787".into());
        let backend_api_url = rewrite_loopback(&raw_url, runs_in_sandbox());
        let bucket: BucketId = env::var("S3_BUCKET_ID")
            .context("S3_BUCKET_ID is required")?
            .parse()
            .context("S3_BUCKET_ID is not a valid bucket id")?;
        let container_id = env::var("CONTAINER_ID").unwrap_or_default();
        let service_token = env::var("CONTAINER_SERVICE_TOKEN").unwrap_or_default();

        Ok(Self {
            workspace,
            backend_api_url,
            bucket,
            container_id,
            service_token,
            short_debounce: Duration::from_millis(75),
            long_debounce: Duration::from_millis(500),
            significant_gap: Duration::from_secs(2),
            significant_len: 1024,
            quiet_window: Duration::from_millis(300),
            resubscribe_interval: Duration::from_secs(60),
            initial_sync_timeout: Duration::from_secs(30),
            reconnect_max_backoff: Duration::from_secs(30),
        })
    }

    /// WebSocket endpoint of the session stream, token attached.
    pub fn ws_url(&self) -> String {
        let base = self.backend_api_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/api/sync?token={}", self.service_token)
    }

    pub fn files_url(&self) -> String {
        format!(
            "{}/api/buckets/{}/files",
            self.backend_api_url.trim_end_matches('/'),
            self.bucket
        )
    }
}

/// True when the agent runs inside a containerized sandbox, where loopback
/// points at the container itself rather than the host.
fn runs_in_sandbox() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }
    std::fs::read_to_string("/proc/1/cgroup")
        .map(|body| {
            body.contains("docker") || body.contains("containerd") || body.contains("kubepods")
        })
        .unwrap_or(false)
}

/// Inside a sandbox, a loopback backend URL must target the host alias
/// instead of the container's own loopback interface.
fn rewrite_loopback(url: &str, sandboxed: bool) -> String {
    if !sandboxed {
        return url.to_string();
    }
    url.replacen("://localhost", "://host.docker.internal", 1)
        .replacen("://127.0.0.1", "://host.docker.internal", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_rewritten_only_inside_a_sandbox() {
        assert_eq!(
            rewrite_loopback("http://localhost:8787", true),
            "http://host.docker.internal:8787"
        );
        assert_eq!(
            rewrite_loopback("http://127.0.0.1:8787", true),
            "http://host.docker.internal:8787"
        );
        assert_eq!(
            rewrite_loopback("http://localhost:8787", false),
            "http://localhost:8787"
        );
        assert_eq!(
            rewrite_loopback("https://sync.example.com", true),
            "https://sync.example.com"
        );
    }

    #[test]
    fn ws_url_maps_scheme_and_appends_token() {
        let cfg = AgentConfig {
            workspace: PathBuf::from("/workspace"),
            backend_api_url: "http://sync.example.com".into(),
            bucket: BucketId::new(),
            container_id: String::new(),
            service_token: "tok".into(),
            short_debounce: Duration::from_millis(75),
            long_debounce: Duration::from_millis(500),
            significant_gap: Duration::from_secs(2),
            significant_len: 1024,
            quiet_window: Duration::from_millis(300),
            resubscribe_interval: Duration::from_secs(60),
            initial_sync_timeout: Duration::from_secs(30),
            reconnect_max_backoff: Duration::from_secs(30),
        };
        assert_eq!(cfg.ws_url(), "ws://sync.example.com/api/sync?token=tok");

        let mut secure = cfg.clone();
        secure.backend_api_url = "https://sync.example.com".into();
        assert_eq!(secure.ws_url(), "wss://sync.example.com/api/sync?token=tok");
    }
}
