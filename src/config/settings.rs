use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the server, the broker engine, storage and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub storage: StorageSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// Defines the listen address and the largest accepted websocket frame.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
}

/// Configuration settings for the broker engine.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub heartbeat_sec: u64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub allow_anonymous: bool,
    pub gc_interval_sec: u64,
    pub gc_boost_sec: u64,
    pub gc_batch: usize,
    pub burst_passes: usize,
    pub idle_delay_ms: u64,
    pub max_route_passes: usize,
    pub max_route_topics: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StorageSettings {
    /// `sled` or `memory`.
    pub backend: String,
    pub path: String,
    pub resources_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_frame_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub heartbeat_sec: Option<u64>,
    pub min_workers: Option<usize>,
    pub max_workers: Option<usize>,
    pub allow_anonymous: Option<bool>,
    pub gc_interval_sec: Option<u64>,
    pub gc_boost_sec: Option<u64>,
    pub gc_batch: Option<usize>,
    pub burst_passes: Option<usize>,
    pub idle_delay_ms: Option<u64>,
    pub max_route_passes: Option<usize>,
    pub max_route_topics: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStorageSettings {
    pub backend: Option<String>,
    pub path: Option<String>,
    pub resources_file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            heartbeat_sec: 30,
            min_workers: 1,
            max_workers: 100,
            allow_anonymous: true,
            gc_interval_sec: 60,
            gc_boost_sec: 15,
            gc_batch: 1000,
            burst_passes: 100,
            idle_delay_ms: 5,
            max_route_passes: 32,
            max_route_topics: 1024,
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_frame_bytes: 4 * 1024 * 1024,
            },
            broker: BrokerSettings::default(),
            storage: StorageSettings {
                backend: "sled".to_string(),
                path: "topicd_db".to_string(),
                resources_file: None,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl BrokerSettings {
    /// Clamp a client's requested concurrency into `[min_workers, max_workers]`.
    pub fn clamp_workers(&self, requested: Option<usize>) -> usize {
        let max = self.max_workers.max(self.min_workers);
        requested.unwrap_or(self.min_workers).clamp(self.min_workers, max)
    }
}
