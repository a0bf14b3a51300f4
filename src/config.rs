// ⚙️ Configuration - slip-renewal.toml
//
// Every key has a default, so an empty file (or no file) is a valid config:
//
//   database_path = "slip-renewal.db"
//   unit_price = 100
//   max_months_per_submission = 120
//   buffer_minutes = 30
//   history_window = 50
//   year_offset = 543
//   slip_policy = "guarded"
//
//   [ocr]
//   command = "tesseract"
//   args = ["stdin", "stdout", "-l", "tha+eng"]
//   timeout_secs = 30
//
//   [server]
//   bind = "0.0.0.0:3000"

use crate::deduplication::{DEFAULT_BUFFER_MINUTES, DEFAULT_HISTORY_WINDOW};
use crate::error::ConfigError;
use crate::extender::{DEFAULT_MAX_MONTHS, DEFAULT_UNIT_PRICE};
use crate::slip::{CommandRecognizer, DEFAULT_OCR_TIMEOUT_SECS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "slip-renewal.toml";

/// Gregorian → Buddhist Era
pub const DEFAULT_YEAR_OFFSET: i32 = 543;

/// Upper bound accepted for `max_months_per_submission`
pub const MONTHS_PER_SUBMISSION_LIMIT: u32 = 1200;

// ============================================================================
// SLIP POLICY
// ============================================================================

/// What to do when the slip time cannot be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlipPolicy {
    /// Block the submission
    #[default]
    Guarded,

    /// Fall back to the time typed on the form
    Lenient,
}

impl SlipPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlipPolicy::Guarded => "guarded",
            SlipPolicy::Lenient => "lenient",
        }
    }
}

// ============================================================================
// APP CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// SQLite file holding members, log and events
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Price of one month
    #[serde(default = "default_unit_price")]
    pub unit_price: i64,

    /// Most months a single payment may buy
    #[serde(default = "default_max_months")]
    pub max_months_per_submission: u32,

    /// Duplicate buffer window in minutes
    #[serde(default = "default_buffer_minutes")]
    pub buffer_minutes: i64,

    /// Recent log rows checked for duplicates
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Added to the Gregorian year to get the stored year numbering
    #[serde(default = "default_year_offset")]
    pub year_offset: i32,

    #[serde(default)]
    pub slip_policy: SlipPolicy,

    /// Shown above the form ("transfer to account ...")
    #[serde(default)]
    pub payment_instructions: String,

    /// OCR command; absent means slips are never read automatically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr: Option<OcrConfig>,

    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_command")]
    pub command: String,

    #[serde(default = "default_ocr_args")]
    pub args: Vec<String>,

    /// The OCR process is killed after this many seconds
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

impl OcrConfig {
    pub fn recognizer(&self) -> CommandRecognizer {
        CommandRecognizer::new(&self.command, &self.args)
            .with_timeout(Duration::from_secs(self.timeout_secs))
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        OcrConfig {
            command: default_ocr_command(),
            args: default_ocr_args(),
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { bind: default_bind() }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("slip-renewal.db")
}

fn default_unit_price() -> i64 {
    DEFAULT_UNIT_PRICE
}

fn default_buffer_minutes() -> i64 {
    DEFAULT_BUFFER_MINUTES
}

fn default_history_window() -> usize {
    DEFAULT_HISTORY_WINDOW
}

fn default_year_offset() -> i32 {
    DEFAULT_YEAR_OFFSET
}

fn default_max_months() -> u32 {
    DEFAULT_MAX_MONTHS
}

fn default_ocr_timeout_secs() -> u64 {
    DEFAULT_OCR_TIMEOUT_SECS
}

fn default_ocr_command() -> String {
    CommandRecognizer::tesseract().program
}

fn default_ocr_args() -> Vec<String> {
    CommandRecognizer::tesseract().args
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            database_path: default_database_path(),
            unit_price: default_unit_price(),
            max_months_per_submission: default_max_months(),
            buffer_minutes: default_buffer_minutes(),
            history_window: default_history_window(),
            year_offset: default_year_offset(),
            slip_policy: SlipPolicy::default(),
            payment_instructions: String::new(),
            ocr: None,
            server: ServerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load and validate a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the submission flow cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unit_price <= 0 {
            return Err(ConfigError::Validation(format!(
                "unit_price must be positive, got {}",
                self.unit_price
            )));
        }
        if self.max_months_per_submission == 0
            || self.max_months_per_submission > MONTHS_PER_SUBMISSION_LIMIT
        {
            return Err(ConfigError::Validation(format!(
                "max_months_per_submission must be between 1 and {}, got {}",
                MONTHS_PER_SUBMISSION_LIMIT, self.max_months_per_submission
            )));
        }
        if self.buffer_minutes <= 0 {
            return Err(ConfigError::Validation(format!(
                "buffer_minutes must be positive, got {}",
                self.buffer_minutes
            )));
        }
        if self.history_window == 0 {
            return Err(ConfigError::Validation(
                "history_window must be at least 1".to_string(),
            ));
        }
        if let Some(ocr) = &self.ocr {
            if ocr.command.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "ocr.command must not be empty".to_string(),
                ));
            }
            if ocr.timeout_secs == 0 {
                return Err(ConfigError::Validation(
                    "ocr.timeout_secs must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.unit_price, 100);
        assert_eq!(config.history_window, 50);
        assert_eq!(config.year_offset, 543);
        assert_eq!(config.max_months_per_submission, 120);
        assert_eq!(config.slip_policy, SlipPolicy::Guarded);
        assert!(config.ocr.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_toml(
            r#"
            database_path = "/var/lib/club/members.db"
            buffer_minutes = 10
            slip_policy = "lenient"
            payment_instructions = "Transfer to GSB 020300995519"

            [ocr]
            command = "/usr/bin/tesseract"

            [server]
            bind = "127.0.0.1:8080"
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/var/lib/club/members.db"));
        assert_eq!(config.buffer_minutes, 10);
        assert_eq!(config.slip_policy, SlipPolicy::Lenient);
        assert_eq!(config.server.bind, "127.0.0.1:8080");

        let ocr = config.ocr.unwrap();
        assert_eq!(ocr.command, "/usr/bin/tesseract");
        assert_eq!(ocr.args, vec!["stdin", "stdout", "-l", "tha+eng"]);
        assert_eq!(ocr.timeout_secs, 30);
        assert_eq!(ocr.recognizer().timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        for bad in [
            "unit_price = 0",
            "buffer_minutes = -5",
            "history_window = 0",
            "max_months_per_submission = 0",
            "max_months_per_submission = 5000",
            "[ocr]\ncommand = \"  \"",
            "[ocr]\ntimeout_secs = 0",
        ] {
            assert!(
                matches!(AppConfig::from_toml(bad), Err(ConfigError::Validation(_))),
                "{:?} should fail validation",
                bad
            );
        }
    }

    #[test]
    fn test_unknown_policy_is_parse_error() {
        assert!(matches!(
            AppConfig::from_toml("slip_policy = \"strict\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file_and_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "unit_price = 150\nyear_offset = 0").unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.unit_price, 150);
        assert_eq!(config.year_offset, 0);

        let reparsed = AppConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }
}
