use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variables with this prefix override file settings,
/// e.g. `STREAM_SCHEDULER__WEB__PORT=9000`.
pub const ENV_PREFIX: &str = "STREAM_SCHEDULER";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub base_url: String,
    /// Upper bound for a single multipart upload request
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Where source media lives while its job is scheduled or live
    pub uploads_path: PathBuf,
    /// Where multipart uploads are written before validation
    pub staging_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Encoder executable, resolved through PATH when not absolute
    pub ffmpeg_command: String,
    /// Seconds between liveness probes on a status channel
    pub probe_interval_secs: u64,
    /// Seconds an immediate start waits for the encoder to settle before answering
    pub startup_grace_secs: u64,
    /// Seconds to wait after SIGTERM before the encoder is killed outright
    pub stop_timeout_secs: u64,
    /// Start schedules whose time passed while the service was down
    pub run_missed_immediately: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            ffmpeg_command: "ffmpeg".to_string(),
            probe_interval_secs: 5,
            startup_grace_secs: 5,
            stop_timeout_secs: 10,
            run_missed_immediately: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://./stream-scheduler.db".to_string(),
                max_connections: Some(10),
            },
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
                base_url: "http://localhost:5000".to_string(),
                max_upload_bytes: 4 * 1024 * 1024 * 1024,
            },
            storage: StorageConfig {
                uploads_path: PathBuf::from("./data/uploads"),
                staging_path: PathBuf::from("./data/staging"),
            },
            streaming: StreamingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `CONFIG_FILE` (default `config.toml`).
    ///
    /// A missing file is created from the defaults so operators have
    /// something to edit. Environment overrides are applied last.
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(Path::new(&config_file))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let contents = toml::to_string_pretty(&Self::default())?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)
                .with_context(|| format!("writing default config to {}", path.display()))?;
        }

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("reading config from {}", path.display()))?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.streaming.ffmpeg_command.trim().is_empty() {
            anyhow::bail!("streaming.ffmpeg_command must not be empty");
        }
        if self.streaming.probe_interval_secs == 0 {
            anyhow::bail!("streaming.probe_interval_secs must be at least 1");
        }
        Ok(())
    }
}
