use serde::Deserialize;
use std::time::Duration;

/// Worker-side task settings.
///
/// Loaded from the TOML file named by `IGLOO_WORKER_CONFIG_PATH` and overridden
/// by `IGLOO_WORKER__*` environment variables. Every tunable has a default so
/// a partial file is enough.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Prefix used to build each task's self URI.
    #[serde(default = "default_base_uri")]
    pub base_uri: String,

    /// Upper bound a task status long-poll is held open.
    #[serde(default = "default_status_max_wait_ms")]
    pub status_max_wait_ms: u64,
    #[serde(default = "default_info_max_wait_ms")]
    pub info_max_wait_ms: u64,

    /// Bytes buffered across all buffer ids of one task before producers block.
    #[serde(default = "default_max_buffer_size_bytes")]
    pub max_buffer_size_bytes: u64,
    /// Producers are released once usage falls to this fraction of the maximum.
    #[serde(default = "default_buffer_low_water_ratio")]
    pub buffer_low_water_ratio: f64,
    /// Keep-alive for a page read that has nothing to return yet.
    #[serde(default = "default_client_max_wait_ms")]
    pub client_max_wait_ms: u64,

    #[serde(default = "default_query_max_memory_bytes")]
    pub query_max_memory_bytes: u64,

    /// Grace period a terminal task (and its buffer) stays queryable.
    #[serde(default = "default_info_max_age_secs")]
    pub info_max_age_secs: u64,
    /// A task without a coordinator heartbeat for this long is failed.
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

fn default_node_id() -> String {
    "igloo-worker".to_string()
}

fn default_base_uri() -> String {
    "http://127.0.0.1:50051".to_string()
}

fn default_status_max_wait_ms() -> u64 {
    1000
}

fn default_info_max_wait_ms() -> u64 {
    1000
}

fn default_max_buffer_size_bytes() -> u64 {
    32 * 1024 * 1024
}

fn default_buffer_low_water_ratio() -> f64 {
    0.5
}

fn default_client_max_wait_ms() -> u64 {
    1000
}

fn default_query_max_memory_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_info_max_age_secs() -> u64 {
    15 * 60
}

fn default_client_timeout_secs() -> u64 {
    120
}

fn default_reaper_interval_secs() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            base_uri: default_base_uri(),
            status_max_wait_ms: default_status_max_wait_ms(),
            info_max_wait_ms: default_info_max_wait_ms(),
            max_buffer_size_bytes: default_max_buffer_size_bytes(),
            buffer_low_water_ratio: default_buffer_low_water_ratio(),
            client_max_wait_ms: default_client_max_wait_ms(),
            query_max_memory_bytes: default_query_max_memory_bytes(),
            info_max_age_secs: default_info_max_age_secs(),
            client_timeout_secs: default_client_timeout_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let config_file_path = std::env::var("IGLOO_WORKER_CONFIG_PATH")
            .unwrap_or_else(|_| "crates/worker/config/default.toml".to_string());

        let s = config::Config::builder()
            .add_source(config::File::with_name(&config_file_path).required(true))
            .add_source(config::Environment::with_prefix("IGLOO_WORKER").separator("__"))
            .build()?;
        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if !(0.0..=1.0).contains(&self.buffer_low_water_ratio) {
            return Err(config::ConfigError::Message(format!(
                "buffer_low_water_ratio must be within [0, 1], got {}",
                self.buffer_low_water_ratio
            )));
        }
        if self.max_buffer_size_bytes == 0 {
            return Err(config::ConfigError::Message(
                "max_buffer_size_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn status_max_wait(&self) -> Duration {
        Duration::from_millis(self.status_max_wait_ms)
    }

    pub fn info_max_wait(&self) -> Duration {
        Duration::from_millis(self.info_max_wait_ms)
    }

    pub fn client_max_wait(&self) -> Duration {
        Duration::from_millis(self.client_max_wait_ms)
    }

    pub fn info_max_age(&self) -> Duration {
        Duration::from_secs(self.info_max_age_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// Usage at or below which a full buffer unblocks its producers.
    pub fn buffer_low_water_bytes(&self) -> u64 {
        (self.max_buffer_size_bytes as f64 * self.buffer_low_water_ratio) as u64
    }
}
