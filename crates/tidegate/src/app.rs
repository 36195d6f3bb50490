use prometheus_client::registry::Registry;
use tidegate_core::drain;
use tokio::net::{UdpSocket, UnixDatagram};
use tokio::sync::watch;

use crate::client::Client;
use crate::cluster::discovery;
use crate::config::Loaded;
use crate::control::ControlServer;
use crate::health::{FailureManager, monitor};
use crate::proxy::Gateway;
use crate::store::Stores;
use crate::telemetry::metrics::Metrics;
use crate::transport::stock::SocketStock;
use crate::types::ControlBind;
use crate::*;

pub async fn run(loaded: Loaded) -> anyhow::Result<Bound> {
	let Loaded { config, local } = loaded;
	let cfg = Arc::new(config);

	// Anything that wants time to exit gracefully holds a drain watcher
	// clone; the trigger completes once all of them are dropped.
	let (drain_tx, drain_rx) = drain::new();

	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let failures = Arc::new(FailureManager::new());
	let stores = Stores::new(&local, cfg.state_file.clone());
	if cfg.state_file.is_some() {
		stores.reload_state(&failures);
	}

	let stock = SocketStock::new(cfg.stock_limit, cfg.stock_max_idle);
	let upstream = Client::new(stock, cfg.connect_timeout, cfg.response_timeout);

	let inputs = Arc::new(ProxyInputs {
		cfg: cfg.clone(),
		stores: stores.clone(),
		metrics,
		registry: Arc::new(registry),
		upstream,
		failures: failures.clone(),
	});

	// Dynamic clusters refresh their membership in the background; the
	// control plane can pause them.
	let (discovery_tx, discovery_rx) = watch::channel(true);
	let dynamic: Vec<_> = {
		let state = inputs.stores.read();
		state
			.clusters
			.values()
			.filter(|c| c.config.discovery.is_some())
			.cloned()
			.collect()
	};
	if !dynamic.is_empty() {
		let resolver = Arc::new(discovery::resolver());
		for cluster in dynamic {
			tokio::spawn(discovery::run(
				cluster,
				resolver.clone(),
				discovery_rx.clone(),
				drain_rx.clone(),
			));
		}
	}

	monitor::spawn_monitors(&inputs, &drain_rx);

	let control = ControlServer::new(inputs.clone(), discovery_tx);
	for cc in &local.controls {
		match &cc.bind {
			ControlBind::Udp(addr) => {
				let socket = UdpSocket::bind(addr)
					.await
					.with_context(|| format!("binding control socket {addr}"))?;
				info!(address = %addr, "control listening on udp");
				tokio::spawn(control.clone().run_udp(socket, drain_rx.clone()));
			},
			ControlBind::Unix(path) => {
				let _ = std::fs::remove_file(path);
				let socket = UnixDatagram::bind(path)
					.with_context(|| format!("binding control socket {path:?}"))?;
				info!(address = ?path, "control listening on unix datagram");
				tokio::spawn(control.clone().run_unix(socket, drain_rx.clone()));
			},
		}
	}

	let gateway = Gateway::new(inputs, drain_rx);
	tokio::spawn(gateway.run());

	Ok(Bound { drain_tx })
}

pub struct Bound {
	drain_tx: drain::DrainTrigger,
}

impl Bound {
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		drain::wait_for_shutdown().await;

		// Start a drain; this will attempt to end all connections gracefully
		// within the termination deadline.
		self
			.drain_tx
			.start_drain_and_wait(drain::DrainMode::Graceful)
			.await;

		Ok(())
	}
}
