//! Configuration system for the license monitor.
//!
//! Configuration is loaded from multiple sources with the following precedence:
//! 1. Command-line overrides (highest priority)
//! 2. Environment variables
//! 3. A TOML or JSON config file
//! 4. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `LICMON_SMI_PATH` - Path to the `nvidia-smi` executable
//! - `LICMON_TOKEN_DIR` - Directory that holds the client configuration token
//! - `LICMON_SERVER_URL` - URL the token is downloaded from
//! - `LICMON_IGNORE_SSL` - Skip TLS certificate verification for the download
//! - `LICMON_INTERVAL_SECS` - Seconds between checks in service mode
//! - `LICMON_LOG_LEVEL` - Log level (trace, debug, info, warn, error)
//!
//! The loaded value is handed to the monitor by the caller. Nothing in the
//! crate reads configuration from ambient state after startup.

use config::Config;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{LicenseError, LicenseResult};

#[cfg(target_os = "windows")]
mod defaults {
    pub const SMI_PATH: &str = r"C:\Windows\System32\nvidia-smi.exe";
    pub const TOKEN_DIR: &str =
        r"C:\Program Files\NVIDIA Corporation\vGPU Licensing\ClientConfigToken\";
    pub const DRIVER_SERVICE: &str = "NVDisplay.ContainerLocalSystem";
    pub const SERVICE_CONFIG: &str =
        r"C:\Program Files\NVIDIA Corporation\vGPU Licensing\NVLicenseMonitor\config.toml";
    pub const SERVICE_LOG_DIR: &str =
        r"C:\Program Files\NVIDIA Corporation\vGPU Licensing\NVLicenseMonitor\";
}

#[cfg(not(target_os = "windows"))]
mod defaults {
    pub const SMI_PATH: &str = "/usr/bin/nvidia-smi";
    pub const TOKEN_DIR: &str = "/etc/nvidia/ClientConfigToken";
    pub const DRIVER_SERVICE: &str = "nvidia-gridd";
    pub const SERVICE_CONFIG: &str = "/etc/licmon/config.toml";
    pub const SERVICE_LOG_DIR: &str = "/var/log/licmon";
}

/// Interval between checks when running as a service.
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Timeout applied to the token download.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Location of the persisted configuration used in service mode.
pub fn service_config_path() -> PathBuf {
    PathBuf::from(defaults::SERVICE_CONFIG)
}

/// Directory the service-mode log file is written to unless overridden.
pub fn service_log_dir() -> PathBuf {
    PathBuf::from(defaults::SERVICE_LOG_DIR)
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LicmonConfig {
    /// Local GPU driver configuration
    pub nvidia: NvidiaConfig,
    /// License server configuration
    pub server: ServerConfig,
    /// Scheduling configuration
    pub monitor: MonitorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Local GPU driver configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NvidiaConfig {
    /// Path to the `nvidia-smi` executable
    pub smi_path: PathBuf,
    /// Directory the client configuration token is stored in
    pub token_dir: PathBuf,
    /// OS service restarted after a new token is written
    pub driver_service: String,
}

impl Default for NvidiaConfig {
    fn default() -> Self {
        Self {
            smi_path: PathBuf::from(defaults::SMI_PATH),
            token_dir: PathBuf::from(defaults::TOKEN_DIR),
            driver_service: defaults::DRIVER_SERVICE.to_string(),
        }
    }
}

/// License server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// URL the token is fetched from with a plain GET
    pub url: String,
    /// Disable certificate verification for the token download only
    pub ignore_ssl: bool,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ignore_ssl: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between license checks in service mode
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Directory for the service-mode log file; `service_log_dir()` when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Directory the service writes its rolling log file to.
    pub fn service_dir(&self) -> PathBuf {
        self.file.clone().unwrap_or_else(service_log_dir)
    }
}

/// Where the config file comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource<'a> {
    /// No file; defaults, environment and overrides only
    None,
    /// A file that may be absent
    Optional(&'a Path),
    /// A file that must exist (service mode)
    Required(&'a Path),
}

/// Values supplied on the command line. `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub smi_path: Option<PathBuf>,
    pub token_dir: Option<PathBuf>,
    pub server_url: Option<String>,
    pub ignore_ssl: Option<bool>,
    pub log_level: Option<String>,
}

fn path_value(path: Option<PathBuf>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}

impl LicmonConfig {
    /// Load configuration from defaults, the given file, the environment and
    /// the command-line overrides, then validate it.
    pub fn load(source: ConfigSource<'_>, overrides: &ConfigOverrides) -> LicenseResult<Self> {
        let mut builder = Config::builder()
            // Start with defaults
            .set_default("nvidia.smi_path", defaults::SMI_PATH)?
            .set_default("nvidia.token_dir", defaults::TOKEN_DIR)?
            .set_default("nvidia.driver_service", defaults::DRIVER_SERVICE)?
            .set_default("server.url", "")?
            .set_default("server.ignore_ssl", false)?
            .set_default("server.timeout_secs", DEFAULT_TIMEOUT_SECS)?
            .set_default("monitor.interval_secs", DEFAULT_INTERVAL_SECS)?
            .set_default("logging.level", "info")?;

        builder = match source {
            ConfigSource::None => builder,
            ConfigSource::Optional(path) => {
                builder.add_source(config::File::from(path).required(false))
            }
            ConfigSource::Required(path) => {
                if !path.exists() {
                    return Err(LicenseError::ConfigError(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                builder.add_source(config::File::from(path).required(true))
            }
        };

        let settings = builder
            // Override with environment variables
            .set_override_option("nvidia.smi_path", env::var("LICMON_SMI_PATH").ok())?
            .set_override_option("nvidia.token_dir", env::var("LICMON_TOKEN_DIR").ok())?
            .set_override_option("server.url", env::var("LICMON_SERVER_URL").ok())?
            // Typed values are converted on deserialize, so a bad value is an error
            .set_override_option("server.ignore_ssl", env::var("LICMON_IGNORE_SSL").ok())?
            .set_override_option("monitor.interval_secs", env::var("LICMON_INTERVAL_SECS").ok())?
            .set_override_option("logging.level", env::var("LICMON_LOG_LEVEL").ok())?
            // Command-line flags win over everything else
            .set_override_option("nvidia.smi_path", path_value(overrides.smi_path.clone()))?
            .set_override_option("nvidia.token_dir", path_value(overrides.token_dir.clone()))?
            .set_override_option("server.url", overrides.server_url.clone())?
            .set_override_option("server.ignore_ssl", overrides.ignore_ssl)?
            .set_override_option("logging.level", overrides.log_level.clone())?
            .build()
            .map_err(|e| LicenseError::ConfigError(format!("failed to build config: {e}")))?;

        let config: LicmonConfig = settings
            .try_deserialize()
            .map_err(|e| LicenseError::ConfigError(format!("failed to deserialize config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> LicenseResult<()> {
        let url = self.server.url.trim();
        if url.is_empty() {
            return Err(LicenseError::ConfigError(
                "server.url is required".to_string(),
            ));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(LicenseError::ConfigError(format!(
                "server.url must be an http(s) URL, got '{url}'"
            )));
        }

        if self.nvidia.token_dir.as_os_str().is_empty() {
            return Err(LicenseError::ConfigError(
                "nvidia.token_dir cannot be empty".to_string(),
            ));
        }

        if self.monitor.interval_secs == 0 {
            return Err(LicenseError::ConfigError(
                "monitor.interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.server.timeout_secs == 0 {
            return Err(LicenseError::ConfigError(
                "server.timeout_secs must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(LicenseError::ConfigError(format!(
                    "logging.level must be one of: trace, debug, info, warn, error. Got '{other}'"
                )));
            }
        }

        Ok(())
    }
}
