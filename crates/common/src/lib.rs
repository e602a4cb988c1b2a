//! Common utilities for hid-usb
//!
//! This crate provides the pieces shared between the library and the command
//! line tool: error handling, logging setup and the configuration file.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, DeviceSettings, LoggingSettings, load_config};
pub use error::{Error, Result};
pub use logging::{level_from_env, setup_logging};
