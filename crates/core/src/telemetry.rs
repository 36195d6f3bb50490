use std::env;
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Registry, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

type LogHandle = reload::Handle<EnvFilter, Registry>;

#[derive(Error, Debug)]
pub enum Error {
	#[error("parse failure: {0}")]
	InvalidFilter(String),
	#[error("logging is not initialized")]
	Uninitialized,
}

fn default_filter() -> EnvFilter {
	// The env variable takes precedence over the compiled-in default.
	let var = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
	EnvFilter::try_new(var).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initializes the global tracing subscriber. The returned guard must be held
/// for the lifetime of the process. Safe to call once; later calls are no-ops
/// (used by tests).
pub fn setup_logging() {
	Lazy::force(&APPLICATION_START_TIME);
	let (filter, handle) = reload::Layer::new(default_filter());
	let fmt = tracing_subscriber::fmt::layer()
		.with_target(true)
		.with_writer(std::io::stderr);
	if tracing_subscriber::registry()
		.with(filter)
		.with(fmt)
		.try_init()
		.is_ok()
	{
		let _ = LOG_HANDLE.set(handle);
	}
}

/// Changes the active log filter at runtime. `reset` restores the default
/// filter before applying `level`.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
	let handle = LOG_HANDLE.get().ok_or(Error::Uninitialized)?;
	let directives = if reset { "info".to_string() } else { level.to_string() };
	let filter =
		EnvFilter::try_new(&directives).map_err(|e| Error::InvalidFilter(e.to_string()))?;
	handle
		.reload(filter)
		.map_err(|e| Error::InvalidFilter(e.to_string()))
}

pub fn get_current_loglevel() -> Result<String, Error> {
	let handle = LOG_HANDLE.get().ok_or(Error::Uninitialized)?;
	handle
		.with_current(|f| f.to_string())
		.map_err(|e| Error::InvalidFilter(e.to_string()))
}

/// Maps a numeric verbosity (as carried by the control protocol) to a filter
/// directive.
pub fn verbosity_to_directive(verbosity: u8) -> &'static str {
	match verbosity {
		0 => "error",
		1 => "warn",
		2 | 3 => "info",
		4 | 5 => "debug",
		_ => "trace",
	}
}

#[cfg(test)]
pub mod testing {
	/// Enables logging in tests; initialization is shared and idempotent.
	pub fn setup_test_logging() {
		super::setup_logging();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn verbosity_mapping_is_monotonic() {
		assert_eq!(verbosity_to_directive(0), "error");
		assert_eq!(verbosity_to_directive(2), "info");
		assert_eq!(verbosity_to_directive(4), "debug");
		assert_eq!(verbosity_to_directive(9), "trace");
	}
}
