//! DNS-based dynamic cluster membership.
//!
//! Clusters with a `discovery` block re-resolve their hostname on an
//! interval and swap the member set atomically. The control plane can pause
//! and resume the refresh; while paused, the last resolved member set stays
//! in effect.

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tidegate_core::drain::DrainWatcher;
use tokio::sync::watch;

use crate::cluster::Cluster;
use crate::types::Member;
use crate::*;

pub fn resolver() -> TokioAsyncResolver {
	TokioAsyncResolver::tokio_from_system_conf()
		.unwrap_or_else(|_| TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()))
}

pub async fn run(
	cluster: Arc<Cluster>,
	resolver: Arc<TokioAsyncResolver>,
	mut enabled: watch::Receiver<bool>,
	drain: DrainWatcher,
) {
	let Some(discovery) = cluster.config.discovery.clone() else {
		return;
	};
	let shutdown = drain.wait_for_drain();
	tokio::pin!(shutdown);

	loop {
		if *enabled.borrow() {
			match resolver.lookup_ip(discovery.hostname.as_str()).await {
				Ok(ips) => {
					let mut members: Vec<Member> = ips
						.iter()
						.map(|ip| {
							let address = SocketAddr::new(ip, discovery.port);
							Member {
								name: strng::format!("{address}"),
								address,
								jvm_route: None,
							}
						})
						.collect();
					// A stable order keeps hash-to-member mappings steady
					// between refreshes.
					members.sort_by_key(|m| m.address);
					members.dedup_by_key(|m| m.address);
					debug!(
						cluster = %cluster.name(),
						members = members.len(),
						"discovery refresh"
					);
					cluster.set_members(members);
				},
				Err(e) => {
					warn!(cluster = %cluster.name(), "discovery lookup failed: {e}");
				},
			}
		}

		let toggled = async {
			// A vanished control plane leaves discovery in its current state.
			if enabled.changed().await.is_err() {
				std::future::pending::<()>().await
			}
		};
		tokio::select! {
			_ = tokio::time::sleep(discovery.refresh) => {},
			_ = toggled => {},
			_ = &mut shutdown => {
				return;
			}
		}
	}
}
