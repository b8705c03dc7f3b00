//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_AUDIO__SAMPLE_RATE`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are joined with a double underscore because several field
//! names (`sample_rate`, `retention_minutes`) contain single underscores.

use crate::audio::AudioFormat;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Bit depths the WAV writer can produce.
pub const SUPPORTED_BIT_DEPTHS: [u16; 3] = [8, 16, 24];

/// Main application configuration that contains all settings.
///
/// Broken into logical groups so each component only needs to look at the
/// part it cares about (the sweeper reads `retention`, the pipeline reads
/// `audio`, the upload handler reads `limits`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub audio: AudioProfileConfig,
    pub limits: LimitsConfig,
}

/// Server-specific configuration settings.
///
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Where uploads, converted files and the task document live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Backing JSON document for the task store
    pub tasks_file: PathBuf,
}

/// How long files and task records are kept around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Age after which files and task records are swept
    pub retention_minutes: u64,
    /// How often the sweeper runs
    pub sweep_interval_seconds: u64,
    /// Delay between a successful download and the record's removal
    pub download_grace_seconds: u64,
    /// Upper bound on how long shutdown waits for background work
    pub shutdown_grace_seconds: u64,
}

/// Target audio profile. Each property can be overridden on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioProfileConfig {
    pub channels: u16,
    pub sample_rate: u32,
    pub bit_depth: u16,
}

/// Request and task limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted upload in bytes
    pub max_upload_bytes: u64,
    /// Per-task conversion timeout; 0 disables it
    pub task_timeout_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                upload_dir: PathBuf::from("temp_uploads"),
                output_dir: PathBuf::from("temp_converted"),
                tasks_file: PathBuf::from("conversion_tasks.json"),
            },
            retention: RetentionConfig {
                retention_minutes: 30,
                sweep_interval_seconds: 300,   // every 5 minutes
                download_grace_seconds: 300,
                shutdown_grace_seconds: 10,
            },
            audio: AudioProfileConfig {
                channels: 1,          // mono
                sample_rate: 8000,    // 8kHz telephony rate
                bit_depth: 16,        // 16-bit linear PCM
            },
            limits: LimitsConfig {
                max_upload_bytes: 100 * 1024 * 1024,  // 100MB
                task_timeout_seconds: 0,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_AUDIO__SAMPLE_RATE=16000`: Convert to 16kHz instead of 8kHz
    /// - `APP_RETENTION__RETENTION_MINUTES=60`: Keep files for an hour
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup keeps a bad target profile
    /// from turning every single upload into a failed task.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Target channel count must be greater than 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Target sample rate must be greater than 0"));
        }

        if !SUPPORTED_BIT_DEPTHS.contains(&self.audio.bit_depth) {
            return Err(anyhow::anyhow!(
                "Target bit depth must be one of {:?}, got {}",
                SUPPORTED_BIT_DEPTHS,
                self.audio.bit_depth
            ));
        }

        if self.retention.retention_minutes == 0 {
            return Err(anyhow::anyhow!("Retention window must be greater than 0"));
        }

        if self.retention.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("Sweep interval must be greater than 0"));
        }

        if self.limits.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("Maximum upload size must be greater than 0"));
        }

        Ok(())
    }

    /// The format every converted file must end up in.
    pub fn target_profile(&self) -> AudioFormat {
        AudioFormat {
            channels: self.audio.channels,
            sample_rate: self.audio.sample_rate,
            bit_depth: self.audio.bit_depth,
        }
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention.retention_minutes * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention.sweep_interval_seconds)
    }

    pub fn download_grace(&self) -> Duration {
        Duration::from_secs(self.retention.download_grace_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.retention.shutdown_grace_seconds)
    }

    /// `None` when no per-task timeout is configured.
    pub fn task_timeout(&self) -> Option<Duration> {
        match self.limits.task_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
