mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerSettings, LogSettings, ServerSettings, Settings, StorageSettings};

/// Loads the configuration from the default file and environment variables
/// (`TOPICD_BROKER__MAX_WORKERS=8` sets `broker.max_workers`)
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the server, broker, storage and log configurations
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("TOPICD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server;
    let broker = partial.broker;
    let storage = partial.storage;
    let log = partial.log;

    Settings {
        server: ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
            max_frame_bytes: server
                .as_ref()
                .and_then(|s| s.max_frame_bytes)
                .unwrap_or(default.server.max_frame_bytes),
        },
        broker: BrokerSettings {
            heartbeat_sec: broker
                .as_ref()
                .and_then(|b| b.heartbeat_sec)
                .unwrap_or(default.broker.heartbeat_sec),
            min_workers: broker
                .as_ref()
                .and_then(|b| b.min_workers)
                .unwrap_or(default.broker.min_workers),
            max_workers: broker
                .as_ref()
                .and_then(|b| b.max_workers)
                .unwrap_or(default.broker.max_workers),
            allow_anonymous: broker
                .as_ref()
                .and_then(|b| b.allow_anonymous)
                .unwrap_or(default.broker.allow_anonymous),
            gc_interval_sec: broker
                .as_ref()
                .and_then(|b| b.gc_interval_sec)
                .unwrap_or(default.broker.gc_interval_sec),
            gc_boost_sec: broker
                .as_ref()
                .and_then(|b| b.gc_boost_sec)
                .unwrap_or(default.broker.gc_boost_sec),
            gc_batch: broker
                .as_ref()
                .and_then(|b| b.gc_batch)
                .unwrap_or(default.broker.gc_batch),
            burst_passes: broker
                .as_ref()
                .and_then(|b| b.burst_passes)
                .unwrap_or(default.broker.burst_passes),
            idle_delay_ms: broker
                .as_ref()
                .and_then(|b| b.idle_delay_ms)
                .unwrap_or(default.broker.idle_delay_ms),
            max_route_passes: broker
                .as_ref()
                .and_then(|b| b.max_route_passes)
                .unwrap_or(default.broker.max_route_passes),
            max_route_topics: broker
                .as_ref()
                .and_then(|b| b.max_route_topics)
                .unwrap_or(default.broker.max_route_topics),
        },
        storage: StorageSettings {
            backend: storage
                .as_ref()
                .and_then(|s| s.backend.clone())
                .unwrap_or(default.storage.backend),
            path: storage
                .as_ref()
                .and_then(|s| s.path.clone())
                .unwrap_or(default.storage.path),
            resources_file: storage
                .as_ref()
                .and_then(|s| s.resources_file.clone())
                .or(default.storage.resources_file),
        },
        log: LogSettings {
            level: log
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.log.level),
        },
    }
}
