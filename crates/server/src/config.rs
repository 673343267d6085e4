use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub storage_path: String,
    pub jwt_secret: String,
    pub upload_url_ttl_secs: i64,
    pub max_upload_bytes: usize,
    pub ingest: IngestConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./data/bimtrack.db?mode=rwc".to_string()),
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            storage_path: env::var("STORAGE_PATH").unwrap_or_else(|_| "./data/blobs".to_string()),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "development-secret-change-in-production".to_string()),
            upload_url_ttl_secs: env::var("UPLOAD_URL_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            max_upload_bytes: env::var("MAX_UPLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(512 * 1024 * 1024),
            ingest: IngestConfig::from_env(),
        }
    }
}

/// Settings for the background model ingestion worker.
#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
    /// Attempts per job before it is marked failed.
    pub max_attempts: i64,
    /// Deadline for a single attempt.
    pub timeout_secs: u64,
    /// Delay before the first retry, doubled for each later one.
    pub retry_backoff_ms: u64,
    /// Artificial latency of the placeholder parser.
    pub simulated_delay_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 500,
            max_concurrent: 2,
            max_attempts: 3,
            timeout_secs: 120,
            retry_backoff_ms: 5000,
            simulated_delay_ms: 2000,
        }
    }
}

impl IngestConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `INGEST_WORKER_ENABLED` | `true` |
    /// | `INGEST_POLL_INTERVAL_MS` | `500` |
    /// | `INGEST_MAX_CONCURRENT` | `2` |
    /// | `INGEST_MAX_ATTEMPTS` | `3` |
    /// | `INGEST_TIMEOUT_SECS` | `120` |
    /// | `INGEST_RETRY_BACKOFF_MS` | `5000` |
    /// | `INGEST_SIMULATED_DELAY_MS` | `2000` |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            enabled: env::var("INGEST_WORKER_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.enabled),
            poll_interval_ms: env::var("INGEST_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.poll_interval_ms),
            max_concurrent: env::var("INGEST_MAX_CONCURRENT")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults.max_concurrent)
                .max(1),
            max_attempts: env::var("INGEST_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(defaults.max_attempts)
                .max(1),
            timeout_secs: env::var("INGEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            retry_backoff_ms: env::var("INGEST_RETRY_BACKOFF_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retry_backoff_ms),
            simulated_delay_ms: env::var("INGEST_SIMULATED_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.simulated_delay_ms),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_attempts(mut self, attempts: i64) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_retry_backoff(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    pub fn with_simulated_delay(mut self, ms: u64) -> Self {
        self.simulated_delay_ms = ms;
        self
    }
}
