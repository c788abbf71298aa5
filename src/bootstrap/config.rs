use std::env;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotBackend {
    Filesystem,
    S3,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_port: u16,
    pub frontend_url: Option<String>,
    pub auth_secret: String,
    pub snapshot_backend: SnapshotBackend,
    pub snapshot_root: String,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_use_path_style: bool,
    pub access_api_url: Option<String>,
    pub flush_interval_secs: u64,
    pub flush_debounce_ms: u64,
    pub idle_evict_secs: u64,
    pub sweep_interval_secs: u64,
    pub flush_parallelism: usize,
    pub shutdown_deadline_secs: u64,
    pub outbound_queue: usize,
    pub handler_budget_ms: u64,
    pub heartbeat_secs: u64,
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: f64,
    pub malformed_strike_limit: u32,
    pub is_production: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_port = env::var("API_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8787);
        let frontend_url = env::var("FRONTEND_URL").ok();
        let auth_secret =
            env::var("AUTH_SECRET").unwrap_or_else(|_| "development-secret-change-me".into());
        let snapshot_backend = match env::var("SNAPSHOT_BACKEND").ok().as_deref() {
            Some("s3") => SnapshotBackend::S3,
            _ => SnapshotBackend::Filesystem,
        };
        let snapshot_root = env::var("SNAPSHOT_ROOT").unwrap_or_else(|_| "./snapshots".into());
        let s3_bucket = env::var("S3_BUCKET").ok();
        let s3_region = env::var("S3_REGION").ok();
        let s3_endpoint = env::var("S3_ENDPOINT").ok();
        let s3_access_key = env::var("S3_ACCESS_KEY").ok();
        let s3_secret_key = env::var("S3_SECRET_KEY").ok();
        let s3_use_path_style = matches!(
            env::var("S3_USE_PATH_STYLE").ok().as_deref(),
            Some("1") | Some("true")
        );
        let access_api_url = env::var("ACCESS_API_URL").ok().and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.trim_end_matches('/').to_string())
            }
        });
        let flush_interval_secs = env::var("FLUSH_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);
        let flush_debounce_ms = env::var("FLUSH_DEBOUNCE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(600);
        let idle_evict_secs = env::var("IDLE_EVICT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);
        let sweep_interval_secs = env::var("SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);
        let flush_parallelism = env::var("FLUSH_PARALLELISM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8);
        let shutdown_deadline_secs = env::var("SHUTDOWN_DEADLINE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        let outbound_queue = env::var("OUTBOUND_QUEUE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256);
        let handler_budget_ms = env::var("HANDLER_BUDGET_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        let heartbeat_secs = env::var("HEARTBEAT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);
        let rate_limit_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(120.0);
        let rate_limit_burst = env::var("RATE_LIMIT_BURST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(240.0);
        let malformed_strike_limit = env::var("MALFORMED_STRIKE_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(16);
        let is_production = matches!(
            env::var("RUST_ENV").ok().as_deref(),
            Some("production") | Some("prod")
        );

        if is_production {
            if auth_secret == "development-secret-change-me" || auth_secret.len() < 16 {
                anyhow::bail!("AUTH_SECRET must be set to a strong secret in production");
            }
            if snapshot_backend == SnapshotBackend::S3 && s3_bucket.is_none() {
                anyhow::bail!("S3_BUCKET must be set when SNAPSHOT_BACKEND=s3");
            }
        }

        Ok(Self {
            api_port,
            frontend_url,
            auth_secret,
            snapshot_backend,
            snapshot_root,
            s3_bucket,
            s3_region,
            s3_endpoint,
            s3_access_key,
            s3_secret_key,
            s3_use_path_style,
            access_api_url,
            flush_interval_secs,
            flush_debounce_ms,
            idle_evict_secs,
            sweep_interval_secs,
            flush_parallelism,
            shutdown_deadline_secs,
            outbound_queue,
            handler_budget_ms,
            heartbeat_secs,
            rate_limit_per_sec,
            rate_limit_burst,
            malformed_strike_limit,
            is_production,
        })
    }

    /// Defaults suitable for in-process use (tests, embedding).
    pub fn for_tests() -> Self {
        Self {
            api_port: 0,
            frontend_url: None,
            auth_secret: "test-secret".into(),
            snapshot_backend: SnapshotBackend::Filesystem,
            snapshot_root: "./snapshots".into(),
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
            s3_access_key: None,
            s3_secret_key: None,
            s3_use_path_style: false,
            access_api_url: None,
            flush_interval_secs: 30,
            flush_debounce_ms: 10,
            idle_evict_secs: 0,
            sweep_interval_secs: 60,
            flush_parallelism: 4,
            shutdown_deadline_secs: 5,
            outbound_queue: 64,
            handler_budget_ms: 1000,
            heartbeat_secs: 30,
            rate_limit_per_sec: 10_000.0,
            rate_limit_burst: 10_000.0,
            malformed_strike_limit: 16,
            is_production: false,
        }
    }
}
