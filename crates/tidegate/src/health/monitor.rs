//! Active backend health checks.
//!
//! Each cluster may reference a monitor; every member is probed on the
//! monitor's interval. A failing probe sets the `Monitor` failure status,
//! which outranks every other category; a succeeding probe clears it. A
//! graceful-shutdown banner fades the member instead.

use hyper_util::rt::TokioIo;
use tidegate_core::drain::DrainWatcher;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::cluster::Cluster;
use crate::health::FailureStatus;
use crate::http::Body;
use crate::types::{MonitorConfig, MonitorKind};
use crate::*;

const MAX_EXPECT_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
	Ok,
	/// The backend answered with its graceful-shutdown banner.
	Fade,
	Fail,
}

pub fn spawn_monitors(inputs: &Arc<ProxyInputs>, drain: &DrainWatcher) {
	let monitored: Vec<(Arc<Cluster>, Arc<MonitorConfig>)> = {
		let state = inputs.stores.read();
		state
			.clusters
			.values()
			.filter_map(|cluster| {
				let name = cluster.config.monitor.as_ref()?;
				let config = state.monitors.get(name)?;
				Some((cluster.clone(), config.clone()))
			})
			.collect()
	};
	for (cluster, config) in monitored {
		tokio::spawn(run_cluster_monitor(
			inputs.clone(),
			cluster,
			config,
			drain.clone(),
		));
	}
}

async fn run_cluster_monitor(
	inputs: Arc<ProxyInputs>,
	cluster: Arc<Cluster>,
	config: Arc<MonitorConfig>,
	drain: DrainWatcher,
) {
	let shutdown = drain.wait_for_drain();
	tokio::pin!(shutdown);
	loop {
		let members = cluster.member_set();
		for member in members.members.iter() {
			match probe(&config, member.address).await {
				Probe::Ok => inputs.failures.set_monitor(member.address, false),
				Probe::Fade => {
					info!(monitor = %config.name, backend = %member.address, "graceful shutdown announced");
					inputs
						.failures
						.set(member.address, FailureStatus::Fade, config.interval * 3);
				},
				Probe::Fail => {
					debug!(monitor = %config.name, backend = %member.address, "probe failed");
					inputs.failures.set_monitor(member.address, true);
				},
			}
		}
		tokio::select! {
			_ = tokio::time::sleep(config.interval) => {},
			_ = &mut shutdown => return,
		}
	}
}

pub async fn probe(config: &MonitorConfig, address: SocketAddr) -> Probe {
	match tokio::time::timeout(config.timeout, probe_inner(&config.kind, address)).await {
		Ok(Ok(p)) => p,
		Ok(Err(_)) | Err(_) => Probe::Fail,
	}
}

async fn probe_inner(kind: &MonitorKind, address: SocketAddr) -> anyhow::Result<Probe> {
	let mut stream = TcpStream::connect(address).await?;
	match kind {
		MonitorKind::Ping => Ok(Probe::Ok),
		MonitorKind::TcpExpect {
			send,
			expect,
			expect_graceful,
		} => {
			if let Some(payload) = send {
				stream.write_all(payload.as_bytes()).await?;
			}
			let mut collected = Vec::new();
			let mut chunk = [0u8; 512];
			loop {
				let n = stream.read(&mut chunk).await?;
				if n == 0 {
					return Ok(Probe::Fail);
				}
				collected.extend_from_slice(&chunk[..n]);
				let text = String::from_utf8_lossy(&collected);
				if let Some(graceful) = expect_graceful
					&& text.contains(graceful.as_str())
				{
					return Ok(Probe::Fade);
				}
				if text.contains(expect.as_str()) {
					return Ok(Probe::Ok);
				}
				if collected.len() > MAX_EXPECT_BYTES {
					return Ok(Probe::Fail);
				}
			}
		},
		MonitorKind::Http { uri, host } => {
			let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
			tokio::spawn(async move {
				let _ = conn.await;
			});
			let host_value = host
				.as_deref()
				.map(|h| h.to_string())
				.unwrap_or_else(|| address.to_string());
			let req = ::http::Request::builder()
				.method(::http::Method::GET)
				.uri(uri.as_str())
				.header(::http::header::HOST, host_value)
				.body(Body::empty())?;
			let resp = sender.send_request(req).await?;
			let status = resp.status();
			Ok(if status.is_success() || status.is_redirection() {
				Probe::Ok
			} else {
				Probe::Fail
			})
		},
	}
}
