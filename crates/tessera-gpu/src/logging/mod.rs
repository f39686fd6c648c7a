//! Logging utilities.
//!
//! The library itself only uses the `log` facade; binaries and tests call
//! [`init_logging`] to install an `env_logger` backend.

mod init;

pub use init::{init_logging, LoggingConfig, DEFAULT_FILTER};
