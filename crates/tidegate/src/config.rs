use std::path::PathBuf;

use anyhow::Context;

use crate::types::local::{self, NormalizedConfig, Settings};
use crate::*;

/// Process-wide tunables, split out of the routing model.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Config {
	/// Maximum concurrent upstream connections per endpoint.
	pub stock_limit: usize,
	/// Idle upstream connections retained per endpoint.
	pub stock_max_idle: usize,
	pub connect_timeout: Duration,
	/// How long to wait for a backend to start answering a forwarded
	/// request.
	pub response_timeout: Duration,
	pub termination_deadline: Duration,
	/// 0 picks the number of available CPUs.
	pub worker_threads: usize,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub state_file: Option<PathBuf>,
}

impl From<&Settings> for Config {
	fn from(s: &Settings) -> Self {
		Config {
			stock_limit: s.stock_limit,
			stock_max_idle: s.stock_max_idle,
			connect_timeout: s.connect_timeout,
			response_timeout: s.response_timeout,
			termination_deadline: s.termination_deadline,
			worker_threads: s.worker_threads,
			state_file: s.state_file.clone(),
		}
	}
}

impl Default for Config {
	fn default() -> Self {
		Config::from(&Settings::default())
	}
}

pub struct Loaded {
	pub config: Config,
	pub local: NormalizedConfig,
}

/// Parses and validates a configuration file. Everything that can fail,
/// fails here, before any socket is bound.
pub fn parse_config(contents: String, filename: Option<PathBuf>) -> anyhow::Result<Loaded> {
	let local = local::parse(&contents)
		.with_context(|| match &filename {
			Some(f) => format!("in {}", f.display()),
			None => "in inline configuration".to_string(),
		})?;
	let normalized = local::normalize(local)?;
	let config = Config::from(&normalized.settings);
	Ok(Loaded {
		config,
		local: normalized,
	})
}
