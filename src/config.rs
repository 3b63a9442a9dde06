use std::path::PathBuf;
use std::time::Duration;

/// application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// public storage tree (what browsers see)
    pub files_dir: PathBuf,
    /// scratch root for chunk fragments, keyed by upload id
    pub chunks_dir: PathBuf,
    /// public server address (file downloads)
    pub public_host: String,
    /// public server port
    pub public_port: u16,
    /// api server address (uploads, status, live updates)
    pub api_host: String,
    /// api server port
    pub api_port: u16,
    /// largest accepted chunk in bytes
    pub max_chunk_size: usize,
    /// number of tokio worker threads
    pub worker_threads: usize,
    /// number of assembly workers draining the queue
    pub assembly_workers: usize,
    /// bounded assembly queue size
    pub assembly_queue_capacity: usize,
    /// idle age after which an unfinished upload is considered abandoned
    pub stale_upload_after: Duration,
    /// how long finished uploads stay visible to status polling
    pub result_retention: Duration,
    /// scheduled janitor sweep period
    pub janitor_interval: Duration,
    /// timer-driven snapshot refresh period
    pub snapshot_interval: Duration,
    /// debounce window for filesystem watcher bursts
    pub watch_debounce: Duration,
    /// keep-alive ping period on push streams
    pub keepalive_interval: Duration,
    /// bounded retries when deleting chunk fragments
    pub delete_retry_attempts: u32,
    /// cors allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
    /// rate limit for admin routes: requests per second
    pub admin_rate_limit_per_second: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            files_dir: PathBuf::from("./files"),
            chunks_dir: PathBuf::from("./data/chunks"),
            public_host: "127.0.0.1".to_string(),
            public_port: 4848,
            api_host: "127.0.0.1".to_string(),
            api_port: 4849,
            max_chunk_size: 10 * 1024 * 1024, // 10MB default
            worker_threads: 8,
            assembly_workers: 2,
            assembly_queue_capacity: 64,
            stale_upload_after: Duration::from_secs(3600),
            result_retention: Duration::from_secs(3600),
            janitor_interval: Duration::from_secs(300),
            snapshot_interval: Duration::from_secs(10),
            watch_debounce: Duration::from_millis(100),
            keepalive_interval: Duration::from_secs(10),
            delete_retry_attempts: 3,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            admin_rate_limit_per_second: 2,
        }
    }
}

impl Config {
    /// load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        // parse cors origins
        let cors_origins = match std::env::var("CORS_ORIGINS") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => defaults.cors_origins,
        };

        Self {
            files_dir: std::env::var("FILES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.files_dir),
            chunks_dir: std::env::var("CHUNKS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.chunks_dir),
            public_host: std::env::var("PUBLIC_HOST").unwrap_or(defaults.public_host),
            public_port: env_parse("PUBLIC_PORT", defaults.public_port),
            api_host: std::env::var("API_HOST").unwrap_or(defaults.api_host),
            api_port: env_parse("API_PORT", defaults.api_port),
            max_chunk_size: env_parse("MAX_CHUNK_SIZE", defaults.max_chunk_size),
            worker_threads: env_parse("WORKER_THREADS", defaults.worker_threads),
            assembly_workers: env_parse("ASSEMBLY_WORKERS", defaults.assembly_workers).max(1),
            assembly_queue_capacity: env_parse("ASSEMBLY_QUEUE_CAPACITY", defaults.assembly_queue_capacity).max(1),
            stale_upload_after: env_secs("STALE_UPLOAD_SECS", defaults.stale_upload_after),
            result_retention: env_secs("RESULT_RETENTION_SECS", defaults.result_retention),
            janitor_interval: env_secs("JANITOR_INTERVAL_SECS", defaults.janitor_interval),
            snapshot_interval: env_secs("SNAPSHOT_INTERVAL_SECS", defaults.snapshot_interval),
            watch_debounce: Duration::from_millis(env_parse(
                "WATCH_DEBOUNCE_MS",
                defaults.watch_debounce.as_millis() as u64,
            )),
            keepalive_interval: env_secs("KEEPALIVE_SECS", defaults.keepalive_interval),
            delete_retry_attempts: env_parse("DELETE_RETRY_ATTEMPTS", defaults.delete_retry_attempts),
            cors_origins,
            admin_rate_limit_per_second: env_parse(
                "ADMIN_RATE_LIMIT_PER_SECOND",
                defaults.admin_rate_limit_per_second,
            ),
        }
    }

    /// request body limit for chunk uploads: one chunk plus multipart framing
    pub fn chunk_body_limit(&self) -> usize {
        self.max_chunk_size + 1024 * 1024
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
