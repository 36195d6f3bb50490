use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum BindProtocol {
	http,
	https,
	tcp,
	tls,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectionLabels {
	pub listener: String,
	pub protocol: BindProtocol,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub listener: String,
	pub destination: String,
	pub status: u16,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamErrorLabels {
	pub cluster: String,
	pub kind: ErrorKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum ErrorKind {
	connect,
	protocol,
}

pub struct Metrics {
	pub downstream_connections: Family<ConnectionLabels, Counter>,
	pub rejected_connections: Family<ConnectionLabels, Counter>,
	pub requests: Family<RequestLabels, Counter>,
	pub upstream_errors: Family<UpstreamErrorLabels, Counter>,
	pub tarpit_delays: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let downstream_connections = Family::default();
		registry.register(
			"downstream_connections",
			"Accepted downstream connections",
			downstream_connections.clone(),
		);
		let rejected_connections = Family::default();
		registry.register(
			"rejected_connections",
			"Connections refused by the per-client limit",
			rejected_connections.clone(),
		);
		let requests = Family::default();
		registry.register(
			"requests",
			"Requests processed, by listener, destination and status",
			requests.clone(),
		);
		let upstream_errors = Family::default();
		registry.register(
			"upstream_errors",
			"Upstream failures observed, by cluster and kind",
			upstream_errors.clone(),
		);
		let tarpit_delays = Counter::default();
		registry.register(
			"tarpit_delays",
			"Requests delayed by the per-client tarpit",
			tarpit_delays.clone(),
		);
		Metrics {
			downstream_connections,
			rejected_connections,
			requests,
			upstream_errors,
			tarpit_delays,
		}
	}
}
