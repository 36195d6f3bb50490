pub use tidegate_core::prelude::*;

pub mod app;
pub mod client;
pub mod cluster;
pub mod config;
pub mod control;
pub mod health;
pub mod http;
pub mod proxy;
pub mod route;
pub mod store;
pub mod telemetry;
#[cfg(test)]
pub mod test_helpers;
pub mod transport;
pub mod types;

pub use config::Config;

/// Shared, process-scoped state handed to every proxy component. Constructed
/// once in `app::run` and passed explicitly; there are no globals.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub stores: store::Stores,
	pub metrics: Arc<telemetry::metrics::Metrics>,
	pub registry: Arc<prometheus_client::registry::Registry>,
	pub upstream: client::Client,
	pub failures: Arc<health::FailureManager>,
}
