//! licmon - keeps an NVIDIA vGPU guest licensed.
//!
//! Every cycle the monitor asks `nvidia-smi` for the GPU's license status.
//! When the GPU is not licensed it downloads a fresh client configuration
//! token from the license server, replaces the old token and restarts the
//! driver service so the new token is picked up.
//!
//! # Modes
//!
//! - One-shot: [`monitor::LicenseMonitor::run_once`], used by `licmon run`.
//! - Service: [`monitor::LicenseMonitor::run_service`], used by
//!   `licmon service`, checks every five minutes by default.
//!
//! # Example
//!
//! ```rust,ignore
//! use licmon::config::{ConfigOverrides, ConfigSource, LicmonConfig};
//! use licmon::monitor::SystemMonitor;
//!
//! let config = LicmonConfig::load(ConfigSource::None, &ConfigOverrides {
//!     server_url: Some("https://dls.example.internal/token".into()),
//!     ..Default::default()
//! })?;
//! let outcome = SystemMonitor::from_config(&config).run_once().await?;
//! ```

// Ambient modules
pub mod config;
pub mod errors;
pub mod logging;
pub mod notice;

// License check pipeline
pub mod diagnostics;
pub mod monitor;
pub mod service;
pub mod signals;
pub mod status;
pub mod token;
pub mod validity;
