//! Configuration for the bucket engine.
//!
//! Configuration is loaded from TOML. Every section and field is optional;
//! missing values fall back to the defaults documented on each field.
//!
//! ```toml
//! [bucket]
//! bucket_dir = "/var/lib/henyey/buckets"
//! max_protocol_version = 25
//! count_merge_events = true
//! rename_retry_delay_ms = 100
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```
//!
//! ```rust,no_run
//! use henyey_common::Config;
//! use std::path::Path;
//!
//! let config = Config::from_file(Path::new("henyey.toml"))?;
//! # Ok::<(), henyey_common::Error>(())
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::CURRENT_LEDGER_PROTOCOL_VERSION;

/// Log levels for filtering log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Bucket storage settings.
    #[serde(default)]
    pub bucket: BucketConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bucket storage and merge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Directory holding canonical `bucket-<hash>.xdr` files.
    #[serde(default = "default_bucket_dir")]
    pub bucket_dir: PathBuf,

    /// Scratch directory for in-progress merge output.
    ///
    /// Defaults to `<bucket_dir>/tmp`. It should live on the same filesystem
    /// as `bucket_dir` so adoption is a rename rather than a copy.
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,

    /// Highest ledger protocol a merge may produce.
    #[serde(default = "default_max_protocol_version")]
    pub max_protocol_version: u32,

    /// Whether merges report their counters to the bucket manager.
    #[serde(default = "default_true")]
    pub count_merge_events: bool,

    /// Delay before the single retry of a failed bucket rename.
    #[serde(default = "default_rename_retry_delay_ms")]
    pub rename_retry_delay_ms: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            bucket_dir: default_bucket_dir(),
            tmp_dir: None,
            max_protocol_version: default_max_protocol_version(),
            count_merge_events: true,
            rename_retry_delay_ms: default_rename_retry_delay_ms(),
        }
    }
}

impl BucketConfig {
    /// Bucket config rooted at `bucket_dir`, everything else defaulted.
    pub fn with_dir(bucket_dir: impl Into<PathBuf>) -> Self {
        Self {
            bucket_dir: bucket_dir.into(),
            ..Self::default()
        }
    }

    /// The effective scratch directory.
    pub fn effective_tmp_dir(&self) -> PathBuf {
        self.tmp_dir
            .clone()
            .unwrap_or_else(|| self.bucket_dir.join("tmp"))
    }

    pub fn rename_retry_delay(&self) -> Duration {
        Duration::from_millis(self.rename_retry_delay_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum log level.
    #[serde(default)]
    pub level: LogLevel,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_bucket_dir() -> PathBuf {
    PathBuf::from("buckets")
}

fn default_max_protocol_version() -> u32 {
    CURRENT_LEDGER_PROTOCOL_VERSION
}

fn default_true() -> bool {
    true
}

fn default_rename_retry_delay_ms() -> u64 {
    100
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid TOML.
    pub fn from_file(path: &Path) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, crate::Error> {
        let config: Config =
            toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.bucket.max_protocol_version > CURRENT_LEDGER_PROTOCOL_VERSION {
            return Err(crate::Error::Config(format!(
                "max_protocol_version {} exceeds supported protocol {}",
                self.bucket.max_protocol_version, CURRENT_LEDGER_PROTOCOL_VERSION
            )));
        }
        if self.bucket.bucket_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("bucket_dir must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.bucket.bucket_dir, PathBuf::from("buckets"));
        assert_eq!(config.bucket.effective_tmp_dir(), PathBuf::from("buckets/tmp"));
        assert_eq!(config.bucket.max_protocol_version, CURRENT_LEDGER_PROTOCOL_VERSION);
        assert!(config.bucket.count_merge_events);
        assert_eq!(config.bucket.rename_retry_delay(), Duration::from_millis(100));
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml_str(
            r#"
            [bucket]
            bucket_dir = "/data/buckets"
            tmp_dir = "/data/scratch"
            max_protocol_version = 10
            count_merge_events = false
            rename_retry_delay_ms = 5

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.bucket.bucket_dir, PathBuf::from("/data/buckets"));
        assert_eq!(config.bucket.effective_tmp_dir(), PathBuf::from("/data/scratch"));
        assert_eq!(config.bucket.max_protocol_version, 10);
        assert!(!config.bucket.count_merge_events);
        assert_eq!(config.bucket.rename_retry_delay_ms, 5);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_rejects_unsupported_protocol() {
        let err = Config::from_toml_str("[bucket]\nmax_protocol_version = 999\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_rejects_invalid_toml() {
        let err = Config::from_toml_str("[bucket\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("henyey.toml");
        std::fs::write(&path, "[logging]\nlevel = \"warn\"\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(config.bucket, BucketConfig::default());
    }
}
