use tracing::event;

use crate::health::FailureStatus;
use crate::proxy::{FAILURE_DURATION, ProxyError};
use crate::route;
use crate::telemetry::metrics::{ErrorKind, UpstreamErrorLabels};
use crate::transport::stream::Socket;
use crate::types::{Listener, Protocol};
use crate::*;

/// Relays raw TCP connections to a cluster member. The backend is dialed
/// after TLS termination has completed, so by the time we connect, the
/// client's first bytes may already be buffered and are relayed immediately.
#[derive(Clone)]
pub struct TCPProxy {
	pub(super) inputs: Arc<ProxyInputs>,
	pub(super) listener: Arc<Listener>,
}

impl TCPProxy {
	pub async fn proxy(&self, mut connection: Socket) {
		let peer = connection.tcp().peer_addr;
		let start = Instant::now();
		let res = self.proxy_internal(&mut connection).await;
		let error = res.as_ref().err().map(|e| e.to_string());
		let duration = format!("{}ms", start.elapsed().as_millis());
		event!(
			target: "access",
			parent: None,
			tracing::Level::INFO,

			listener = %self.listener.name,
			peer = %peer,
			error = error.as_deref(),

			duration = duration,
		);
	}

	async fn proxy_internal(&self, connection: &mut Socket) -> Result<(), ProxyError> {
		let client_ip = connection.tcp().peer_addr.ip();
		let cluster = {
			let state = self.inputs.stores.read();
			route::find_tcp_leaf(&state, &self.listener.destination, client_ip)
				.map_err(|_| ProxyError::RouteNotFound)?
		};
		if cluster.config.protocol != Protocol::Tcp {
			return Err(ProxyError::WrongProtocol);
		}

		let failures = &self.inputs.failures;
		let pick = cluster
			.pick_tcp(failures, Instant::now(), client_ip)
			.ok_or(ProxyError::NoValidBackends)?;
		let address = pick.member.address;
		let bind = cluster.config.transparent_source.then_some(client_ip);

		debug!(listener = %self.listener.name, cluster = %cluster.name(), backend = %address, "relaying connection");
		let connect_timeout = self.inputs.cfg.connect_timeout;
		let mut upstream = match Socket::dial(address, bind, connect_timeout).await {
			Ok(s) => s,
			Err(e) => {
				failures.set(address, FailureStatus::Connect, FAILURE_DURATION);
				self
					.inputs
					.metrics
					.upstream_errors
					.get_or_create(&UpstreamErrorLabels {
						cluster: cluster.name().to_string(),
						kind: ErrorKind::connect,
					})
					.inc();
				return Err(ProxyError::UpstreamConnect(e));
			},
		};

		tidegate_core::copy::copy_bidirectional(connection, &mut upstream)
			.await
			.map_err(|e| ProxyError::Processing(e.into()))?;
		Ok(())
	}
}
