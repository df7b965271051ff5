use std::env;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

// --- CONFIG AGGREGATOR ---

#[derive(Debug, Clone)]
pub struct Config {
    pub log: LogConfig,
    pub puller: PullerConfig,
    pub attach: AttachConfig,
}

impl Config {
    pub fn global() -> &'static Config {
        CONFIG.get_or_init(Self::load)
    }

    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Self {
            log: LogConfig::load(),
            puller: PullerConfig::load(),
            attach: AttachConfig::load(),
        }
    }
}

// --- MODULES ---

// APPEND LOG
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// None disables persistence: records live only in the RAM tail.
    pub persistence_path: Option<String>,
    pub flush_ms: u64,
    pub max_open_files: usize,
    pub max_ram_records: usize,
    pub actor_channel_capacity: usize,
}

impl LogConfig {
    fn load() -> Self {
        let persist: bool = get_env("MANIFOLD_PERSIST", "true");
        Self {
            persistence_path:       persist.then(|| get_env("MANIFOLD_DATA_PATH", "./data/manifold")),
            flush_ms:               get_env("MANIFOLD_LOG_FLUSH_MS", "50"),
            max_open_files:         get_env("MANIFOLD_LOG_MAX_OPEN_FILES", "512"),
            max_ram_records:        get_env("MANIFOLD_LOG_MAX_RAM_RECORDS", "20000"),
            actor_channel_capacity: get_env("MANIFOLD_LOG_CHAN_CAP", "10000"),
        }
    }
}

// PULLER
#[derive(Debug, Clone)]
pub struct PullerConfig {
    pub idle_poll_ms: u64,
    pub min_cycle_ms: u64,
    pub read_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_ceiling_ms: u64,
    /// Per-key cap on records returned by one batched read.
    pub batch_limit: usize,
}

impl PullerConfig {
    fn load() -> Self {
        Self {
            idle_poll_ms:       get_env("MANIFOLD_PULL_IDLE_MS", "200"),
            min_cycle_ms:       get_env("MANIFOLD_PULL_MIN_CYCLE_MS", "25"),
            read_timeout_ms:    get_env("MANIFOLD_PULL_READ_TIMEOUT_MS", "5000"),
            backoff_base_ms:    get_env("MANIFOLD_PULL_BACKOFF_BASE_MS", "100"),
            backoff_ceiling_ms: get_env("MANIFOLD_PULL_BACKOFF_CEILING_MS", "5000"),
            batch_limit:        get_env("MANIFOLD_PULL_BATCH_LIMIT", "500"),
        }
    }
}

// ATTACHMENTS
#[derive(Debug, Clone)]
pub struct AttachConfig {
    /// Bounded buffer between the puller and one subscriber.
    pub sink_capacity: usize,
    /// Hard per-attachment lifetime; the stream is force-completed after it.
    pub max_lifetime_ms: u64,
}

impl AttachConfig {
    fn load() -> Self {
        Self {
            sink_capacity:   get_env("MANIFOLD_SINK_CAPACITY", "1024"),
            max_lifetime_ms: get_env("MANIFOLD_MAX_LIFETIME_MS", "600000"), // 10 minutes
        }
    }
}

// --- PRIVATE HELPER ---

fn get_env<T: std::str::FromStr>(key: &str, default: &str) -> T {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| format!("Config error: {} must be valid", key))
        .unwrap()
}
