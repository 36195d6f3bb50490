//! TLS client configuration for upstream clusters.

use std::sync::Arc;

use anyhow::Context;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde::{Serialize, Serializer};
use tidegate_core::strng::Strng;
use tracing::warn;

use crate::transport::tls::parse_cert;

#[derive(Clone)]
pub struct BackendTls {
	/// The cluster name; doubles as the pool-key component so streams with
	/// different TLS parameters are never mixed.
	pub name: Strng,
	pub config: Arc<ClientConfig>,
	/// SNI override; defaults to the member's IP address.
	pub server_name: Option<Strng>,
}

impl std::fmt::Debug for BackendTls {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BackendTls")
			.field("name", &self.name)
			.field("server_name", &self.server_name)
			.finish_non_exhaustive()
	}
}

impl Serialize for BackendTls {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		self.name.serialize(serializer)
	}
}

impl BackendTls {
	pub fn server_name_for(&self, ip: std::net::IpAddr) -> ServerName<'static> {
		if let Some(name) = &self.server_name
			&& let Ok(sn) = ServerName::try_from(name.to_string())
		{
			return sn;
		}
		ServerName::IpAddress(ip.into())
	}
}

pub fn build_backend_tls(
	name: Strng,
	ca_pem: Option<&[u8]>,
	server_name: Option<Strng>,
) -> anyhow::Result<BackendTls> {
	let mut roots = RootCertStore::empty();
	match ca_pem {
		Some(ca) => {
			for der in parse_cert(ca).context("parsing backend CA certificate")? {
				roots.add(der)?;
			}
		},
		None => {
			let result = rustls_native_certs::load_native_certs();
			for e in &result.errors {
				warn!("failed to load some native root certificates: {e}");
			}
			let (added, ignored) = roots.add_parsable_certificates(result.certs);
			if added == 0 {
				warn!("no native root certificates loaded ({ignored} ignored)");
			}
		},
	}
	let mut config = ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	Ok(BackendTls {
		name,
		config: Arc::new(config),
		server_name,
	})
}
