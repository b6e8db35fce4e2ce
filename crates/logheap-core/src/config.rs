//! Configuration management for Logheap.
//!
//! Configuration is stored in TOML format in a platform-appropriate location.
//! Every section falls back to its defaults, so a file only needs the keys it
//! changes.

use crate::date::{detect_message_start, message_start_from_format, DateFormat, COMMON_FORMATS};
use crate::error::{LogheapError, Result};
use crate::scanner::{BoundaryScanner, DEFAULT_READ_SIZE};
use crate::tokenizer::Tokenizer;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `date_format` value asking for detection from the log files.
pub const AUTO_DATE_FORMAT: &str = "auto";

/// Main configuration structure for Logheap.
///
/// ## Example Configuration File (logheap.toml)
///
/// ```toml
/// [general]
/// storage_dir = "/var/lib/logheap"
///
/// [ingest]
/// files = ["/var/log/app/*.log"]
/// date_format = "%Y-%m-%d %H:%M:%S"
/// segment_size = 5000000
///
/// [search]
/// concurrency = 4
///
/// [maintenance]
/// interval_secs = 10
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,

    /// What to ingest and how to cut it into segments
    pub ingest: IngestConfig,

    pub search: SearchConfig,

    pub maintenance: MaintenanceConfig,
}

/// General configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Snapshot directory (None = platform data directory)
    pub storage_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            storage_dir: None,
            log_level: "info".to_string(),
        }
    }
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Glob patterns of log files
    pub files: Vec<String>,

    /// chrono format of the date that starts every message, or `"auto"` to
    /// detect it from the first log file
    pub date_format: String,

    /// Regex marking a message start; capture group 1 is the date.
    /// Derived from `date_format` when unset.
    pub message_start: Option<String>,

    /// Target segment length in bytes
    pub segment_size: u64,

    /// Worker threads (0 = number of CPUs)
    pub concurrency: usize,

    pub min_term_len: usize,
    pub max_term_len: usize,

    /// Scanner read buffer size in bytes
    pub read_size: usize,

    /// Period of the service ingestion loop
    pub interval_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            files: Vec::new(),
            date_format: "%Y-%m-%dT%H:%M:%S%.f%:z".to_string(),
            message_start: None,
            segment_size: 5_000_000,
            concurrency: 0,
            min_term_len: 4,
            max_term_len: 8,
            read_size: DEFAULT_READ_SIZE,
            interval_secs: 60,
        }
    }
}

/// Search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Worker threads (0 = number of CPUs)
    pub concurrency: usize,

    /// Bytes a search worker reads through one descriptor before reopening the file
    pub reopen_after_bytes: u64,

    /// Auto-flush period of the result writer
    pub result_flush_ms: u64,

    /// How long finished query records are kept
    pub query_ttl_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            concurrency: 0,
            reopen_after_bytes: 500_000_000,
            result_flush_ms: 200,
            query_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Period of tail correction, merging, GC and query eviction
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig { interval_secs: 10 }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default config if no config file exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Config::default());
        }

        info!(path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| LogheapError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), "saving configuration");
        let contents = toml::to_string_pretty(self).map_err(|e| LogheapError::ConfigError {
            reason: format!("failed to serialize config: {e}"),
        })?;

        fs::write(path, contents)?;
        Ok(())
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("", "", "logheap").ok_or_else(|| LogheapError::ConfigError {
            reason: "could not determine the home directory".to_string(),
        })
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("logheap.toml"))
    }

    /// Snapshot directory (from config or the platform data directory).
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.general.storage_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::project_dirs()?.data_dir().to_path_buf()),
        }
    }

    /// The message start regex, derived from the date format when unset.
    pub fn message_start_pattern(&self) -> Result<String> {
        match &self.ingest.message_start {
            Some(pattern) => Ok(pattern.clone()),
            None => message_start_from_format(&self.ingest.date_format),
        }
    }

    /// Replace an `"auto"` date format with the first common format that
    /// starts the first readable log file. Returns the detected format.
    pub fn detect_date_format(&mut self) -> Result<Option<String>> {
        if self.ingest.date_format != AUTO_DATE_FORMAT {
            return Ok(None);
        }
        let mut sample = Vec::new();
        for pattern in &self.ingest.files {
            let Ok(paths) = glob::glob(pattern) else {
                continue;
            };
            for path in paths.flatten() {
                let Ok(file) = File::open(&path) else {
                    continue;
                };
                sample.clear();
                if let Err(e) = file.take(self.ingest.read_size as u64).read_to_end(&mut sample) {
                    warn!(file = %path.display(), error = %e, "cannot sample log file");
                    continue;
                }
                if let Some((format, _)) = detect_message_start(&sample, COMMON_FORMATS) {
                    info!(file = %path.display(), format, "date format detected");
                    self.ingest.date_format = format.to_string();
                    return Ok(Some(format.to_string()));
                }
            }
        }
        Err(LogheapError::ConfigError {
            reason: "ingest.date_format is \"auto\" but no log file starts with a known date".to_string(),
        })
    }

    pub fn date_format(&self) -> DateFormat {
        DateFormat::new(self.ingest.date_format.clone())
    }

    pub fn tokenizer(&self) -> Result<Tokenizer> {
        Tokenizer::new(self.ingest.min_term_len, self.ingest.max_term_len)
    }

    pub fn scanner(&self) -> Result<BoundaryScanner> {
        Ok(BoundaryScanner::new(&self.message_start_pattern()?)?
            .with_read_size(self.ingest.read_size))
    }

    pub fn ingest_concurrency(&self) -> usize {
        resolve_concurrency(self.ingest.concurrency)
    }

    pub fn search_concurrency(&self) -> usize {
        resolve_concurrency(self.search.concurrency)
    }

    pub fn ingest_interval(&self) -> Duration {
        Duration::from_secs(self.ingest.interval_secs.max(1))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance.interval_secs.max(1))
    }

    /// Check the settings ingestion and search depend on.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(LogheapError::ConfigError { reason });

        if self.ingest.files.is_empty() {
            return invalid("ingest.files lists no glob patterns".to_string());
        }
        for pattern in &self.ingest.files {
            if let Err(e) = glob::Pattern::new(pattern) {
                return invalid(format!("ingest.files: bad glob {pattern:?}: {e}"));
            }
        }
        if self.ingest.segment_size == 0 {
            return invalid("ingest.segment_size must be positive".to_string());
        }
        if self.ingest.read_size == 0 {
            return invalid("ingest.read_size must be positive".to_string());
        }
        self.tokenizer()?;
        self.scanner()?;
        Ok(())
    }
}

fn resolve_concurrency(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
