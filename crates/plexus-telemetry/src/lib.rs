//! Plexus Telemetry - logging setup for Plexus hosts.
//!
//! Builds a `tracing` subscriber from a [`LogConfig`]: level and directive
//! filtering, pretty/compact/JSON output, and stdout, stderr or rotating
//! file targets. Records emitted by plugins arrive under
//! [`PLUGIN_LOG_TARGET`] and can be filtered separately.
//!
//! # Example
//!
//! ```rust,no_run
//! use plexus_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), plexus_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("plexus::plugin=debug")
//!     .from_env()?;
//!
//! setup_logging(&config)?;
//! tracing::info!("Host started");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    ENV_LOG, ENV_LOG_FORMAT, FileRotation, LogConfig, LogFormat, LogTarget, PLUGIN_LOG_TARGET,
    setup_default_logging, setup_logging, setup_test_logging,
};
