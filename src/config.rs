//! Configuration loader and validator for the receipt sync daemon.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Settings for one daemon instance, as laid out in `config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub api: Api,
    pub printer: Printer,
}

/// Polling and local storage settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_seconds: u64,
    pub retention_days: u32,
    /// Delay before a halted runner restarts itself. Absent means a halt ends the run.
    #[serde(default)]
    pub restart_after_seconds: Option<u64>,
}

/// Remote receipt API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub base_url: String,
    pub pos_id: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Receipt printer identification and geometry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Printer {
    pub vendor_id: String,
    pub product_id: String,
    pub width: u32,
    #[serde(default)]
    pub device_path: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}

impl Config {
    /// Create the data directory when it does not exist yet.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.app.data_dir)
    }

    /// Base URL with a guaranteed trailing slash so endpoint names join beneath it.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let mut raw = self.api.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let url = Url::parse(&raw).map_err(|_| ConfigError::Invalid("api.base_url must be a valid URL"))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Invalid("api.base_url must use http or https"));
        }
        Ok(url)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.app.poll_interval_seconds)
    }

    pub fn restart_after(&self) -> Option<Duration> {
        self.app.restart_after_seconds.map(Duration::from_secs)
    }

    pub fn vendor_id(&self) -> Result<u16, ConfigError> {
        parse_usb_id(&self.printer.vendor_id)
            .ok_or(ConfigError::Invalid("printer.vendor_id must be a hexadecimal u16"))
    }

    pub fn product_id(&self) -> Result<u16, ConfigError> {
        parse_usb_id(&self.printer.product_id)
            .ok_or(ConfigError::Invalid("printer.product_id must be a hexadecimal u16"))
    }
}

/// Parse a USB id written in hex, with or without a `0x` prefix.
pub fn parse_usb_id(raw: &str) -> Option<u16> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

/// Read `path` (or `./config.yaml`) and reject settings the daemon cannot run with.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Check ranges and formats that serde alone cannot express.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_seconds == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_seconds must be > 0"));
    }

    cfg.base_url()?;
    if cfg.api.pos_id.trim().is_empty() {
        return Err(ConfigError::Invalid("api.pos_id must be non-empty"));
    }
    if cfg.api.max_attempts == 0 {
        return Err(ConfigError::Invalid("api.max_attempts must be >= 1"));
    }

    cfg.vendor_id()?;
    cfg.product_id()?;
    if cfg.printer.width == 0 {
        return Err(ConfigError::Invalid("printer.width must be > 0"));
    }
    if let Some(path) = &cfg.printer.device_path {
        if path.trim().is_empty() {
            return Err(ConfigError::Invalid("printer.device_path must be non-empty when set"));
        }
    }

    Ok(())
}

/// Returns the example YAML content shipped with the daemon.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_seconds: 30
  retention_days: 7
  restart_after_seconds: 60

api:
  base_url: "https://example.com/sistema/"
  pos_id: "3"
  max_attempts: 3

printer:
  vendor_id: "0x0416"
  product_id: "0x5011"
  width: 512
  device_path: "/dev/usb/lp0"
"#
}
