//! Configuration for the export archiver.
//!
//! Settings are loaded from optional config files and environment
//! variables (prefix `ARCHIVER`, `__` separator, e.g.
//! `ARCHIVER__S3__BUCKET`). AWS credentials come from the standard
//! environment and are validated at startup.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::FixedOffset;
use serde::Deserialize;

/// Main configuration for the archiver.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service-level configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Recorder API configuration
    #[serde(default)]
    pub recorder: RecorderConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Archival behavior configuration
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Cycle cadence configuration
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for an additional file log sink; stdout-only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Prometheus metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Recorder API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    /// Base URL of the recorder HTTP API
    #[serde(default = "default_recorder_url")]
    pub base_url: String,
    /// Cameras to export, one request per camera per window
    #[serde(default = "default_cameras")]
    pub cameras: Vec<String>,
    /// Shared mount where the recorder writes export files
    #[serde(default = "default_exports_dir")]
    pub exports_dir: PathBuf,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// S3 storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket receiving archived exports
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// File size above which multipart upload is used
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    /// Part size for multipart uploads
    #[serde(default = "default_part_size")]
    pub part_size_bytes: u64,
    /// Parts uploaded concurrently
    #[serde(default = "default_part_concurrency")]
    pub part_concurrency: usize,
    /// TCP endpoint probed before each upload cycle
    #[serde(default = "default_probe_addr")]
    pub probe_addr: String,
    /// Probe timeout in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

/// Archival behavior configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Fixed UTC offset, in minutes, of the zone the recorder runs in.
    /// Export windows are grid-aligned in this zone and filename
    /// timestamps are interpreted in it.
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

/// Minute-grid cadence for the three cycles.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Export request cycle: period in minutes
    #[serde(default = "default_export_period_minutes")]
    pub export_period_minutes: u32,
    /// Export request cycle: minute offset within the period
    #[serde(default = "default_export_offset_minutes")]
    pub export_offset_minutes: u32,
    /// Upload-and-cleanup cycle: period in minutes
    #[serde(default = "default_upload_period_minutes")]
    pub upload_period_minutes: u32,
    /// Stuck-recovery cycle: period in minutes
    #[serde(default = "default_stuck_period_minutes")]
    pub stuck_period_minutes: u32,
}

// Default value functions

fn default_service_name() -> String {
    "export-archiver".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_recorder_url() -> String {
    "http://frigate:5000".to_string()
}

fn default_cameras() -> Vec<String> {
    vec!["roadside".to_string(), "stairs".to_string()]
}

fn default_exports_dir() -> PathBuf {
    PathBuf::from("/media/frigate/exports")
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_region() -> String {
    "ap-south-1".to_string()
}

fn default_multipart_threshold() -> u64 {
    100 * 1024 * 1024 // 100MiB
}

fn default_part_size() -> u64 {
    100 * 1024 * 1024 // 100MiB
}

fn default_part_concurrency() -> usize {
    2
}

fn default_probe_addr() -> String {
    "s3.amazonaws.com:443".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_utc_offset_minutes() -> i32 {
    330 // UTC+05:30
}

fn default_export_period_minutes() -> u32 {
    10
}

fn default_export_offset_minutes() -> u32 {
    2
}

fn default_upload_period_minutes() -> u32 {
    5
}

fn default_stuck_period_minutes() -> u32 {
    30
}

impl Config {
    /// Load configuration from config files and the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/archiver").required(false))
            .add_source(config::File::with_name("/etc/export-archiver/archiver").required(false))
            .add_source(
                config::Environment::with_prefix("ARCHIVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.s3.bucket.is_empty() {
            anyhow::bail!("s3.bucket must not be empty");
        }
        if self.recorder.cameras.is_empty() {
            anyhow::bail!("recorder.cameras must name at least one camera");
        }
        if self.s3.part_size_bytes == 0 {
            anyhow::bail!("s3.part_size_bytes must be positive");
        }
        if self.s3.part_concurrency == 0 {
            anyhow::bail!("s3.part_concurrency must be positive");
        }

        for (name, period, offset) in [
            (
                "schedule.export",
                self.schedule.export_period_minutes,
                self.schedule.export_offset_minutes,
            ),
            ("schedule.upload", self.schedule.upload_period_minutes, 0),
            ("schedule.stuck", self.schedule.stuck_period_minutes, 0),
        ] {
            if period == 0 || period > 60 {
                anyhow::bail!("{name} period must be between 1 and 60 minutes");
            }
            if offset >= period {
                anyhow::bail!("{name} offset must be smaller than its period");
            }
        }

        self.zone().map(|_| ())
    }

    /// The fixed-offset zone used for window alignment and filename
    /// timestamps.
    pub fn zone(&self) -> anyhow::Result<FixedOffset> {
        FixedOffset::east_opt(self.archive.utc_offset_minutes * 60)
            .context("archive.utc_offset_minutes is out of range")
    }

    /// Recorder request timeout as a Duration.
    pub fn recorder_timeout(&self) -> Duration {
        Duration::from_secs(self.recorder.request_timeout_secs)
    }

    /// Connectivity probe timeout as a Duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.s3.probe_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_dir: None,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            base_url: default_recorder_url(),
            cameras: default_cameras(),
            exports_dir: default_exports_dir(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            export_period_minutes: default_export_period_minutes(),
            export_offset_minutes: default_export_offset_minutes(),
            upload_period_minutes: default_upload_period_minutes(),
            stuck_period_minutes: default_stuck_period_minutes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            recorder: RecorderConfig::default(),
            s3: S3Config {
                bucket: "nvr-archive".to_string(),
                region: default_region(),
                endpoint_url: None,
                force_path_style: false,
                multipart_threshold_bytes: default_multipart_threshold(),
                part_size_bytes: default_part_size(),
                part_concurrency: default_part_concurrency(),
                probe_addr: default_probe_addr(),
                probe_timeout_secs: default_probe_timeout_secs(),
            },
            archive: ArchiveConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_default_values() {
        let config = test_config();
        assert_eq!(config.recorder.cameras, vec!["roadside", "stairs"]);
        assert_eq!(config.s3.region, "ap-south-1");
        assert_eq!(config.s3.multipart_threshold_bytes, 100 * 1024 * 1024);
        assert_eq!(config.s3.part_concurrency, 2);
        assert_eq!(config.archive.utc_offset_minutes, 330);
    }

    #[test]
    fn test_empty_bucket_is_rejected() {
        let mut config = test_config();
        config.s3.bucket.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_camera_list_is_rejected() {
        let mut config = test_config();
        config.recorder.cameras.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_offset_must_fit_period() {
        let mut config = test_config();
        config.schedule.export_offset_minutes = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_zone_offset_is_rejected() {
        let mut config = test_config();
        config.archive.utc_offset_minutes = 24 * 60 + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zone_matches_offset() {
        let zone = test_config().zone().unwrap();
        assert_eq!(zone.local_minus_utc(), 330 * 60);
    }
}
