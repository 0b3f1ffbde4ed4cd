//! Logging prelude module for convenient access to tracing macros.
//!
//! This module provides convenient re-exports of common tracing macros
//! to reduce verbosity and maintain consistency across the codebase.
//!
//! # Usage
//!
//! ```ignore
//! use crate::logging::*;
//!
//! info!("restored result from cache");
//! warn!("remote storage timed out");
//! debug!("direct mode key computed");
//! ```

pub use tracing::{debug, error, info, trace, warn};

/// Initialize the tracing subscriber with environment filter support.
///
/// By default, logs at WARN level and above are displayed. Control the log
/// level with the `RUST_LOG` environment variable:
///
/// ```bash
/// RUST_LOG=debug cc-wrapper ...
/// RUST_LOG=cachr=trace cc-wrapper ...
/// RUST_LOG=cachr::storage=debug,cachr::hasher=trace cc-wrapper ...
/// ```
///
/// Output goes to stderr so that it never mixes with forwarded compiler
/// stdout.
pub fn init_tracing() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
		)
		.with_writer(std::io::stderr)
		.init();
}
