use std::io::Cursor;
use std::sync::Arc;

use anyhow::anyhow;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::Item;
use tidegate_core::strng;
use tidegate_core::strng::Strng;

/// Client certificate verification policy of a TLS listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslVerify {
	#[default]
	No,
	Yes,
	Optional,
}

pub fn parse_cert(mut cert: &[u8]) -> Result<Vec<CertificateDer<'static>>, anyhow::Error> {
	let mut reader = std::io::BufReader::new(Cursor::new(&mut cert));
	let parsed: Result<Vec<_>, _> = rustls_pemfile::read_all(&mut reader).collect();
	parsed?
		.into_iter()
		.map(|p| {
			let Item::X509Certificate(der) = p else {
				return Err(anyhow!("no certificate"));
			};
			Ok(der)
		})
		.collect::<Result<Vec<_>, _>>()
}

pub fn parse_key(mut key: &[u8]) -> Result<PrivateKeyDer<'static>, anyhow::Error> {
	let mut reader = std::io::BufReader::new(Cursor::new(&mut key));
	let parsed = rustls_pemfile::read_one(&mut reader)?;
	let parsed = parsed.ok_or_else(|| anyhow!("no key"))?;
	match parsed {
		Item::Pkcs8Key(c) => Ok(PrivateKeyDer::Pkcs8(c)),
		Item::Pkcs1Key(c) => Ok(PrivateKeyDer::Pkcs1(c)),
		Item::Sec1Key(c) => Ok(PrivateKeyDer::Sec1(c)),
		_ => Err(anyhow!("unsupported key")),
	}
}

/// Builds the rustls server configuration for a TLS listener.
pub fn build_server_config(
	cert_pem: &[u8],
	key_pem: &[u8],
	ca_pem: Option<&[u8]>,
	verify: SslVerify,
	alpn_http2: bool,
) -> anyhow::Result<Arc<ServerConfig>> {
	let certs = parse_cert(cert_pem)?;
	let key = parse_key(key_pem)?;
	let builder = match (verify, ca_pem) {
		(SslVerify::No, _) => ServerConfig::builder().with_no_client_auth(),
		(_, None) => return Err(anyhow!("ssl_verify requires ssl_ca_cert")),
		(v, Some(ca)) => {
			let mut roots = RootCertStore::empty();
			for der in parse_cert(ca)? {
				roots.add(der)?;
			}
			let builder = WebPkiClientVerifier::builder(Arc::new(roots));
			let verifier = if v == SslVerify::Optional {
				builder.allow_unauthenticated().build()?
			} else {
				builder.build()?
			};
			ServerConfig::builder().with_client_cert_verifier(verifier)
		},
	};
	let mut config = builder.with_single_cert(certs, key)?;
	config.alpn_protocols = if alpn_http2 {
		vec![b"h2".to_vec(), b"http/1.1".to_vec()]
	} else {
		vec![b"http/1.1".to_vec()]
	};
	Ok(Arc::new(config))
}

/// Extracts the subject and issuer of the peer's end-entity certificate,
/// rendered as RFC 4514 distinguished names.
pub fn peer_identity(
	certs: Option<&[CertificateDer<'_>]>,
) -> (Option<Strng>, Option<Strng>) {
	let Some(end_entity) = certs.and_then(|c| c.first()) else {
		return (None, None);
	};
	match x509_parser::parse_x509_certificate(end_entity.as_ref()) {
		Ok((_, cert)) => (
			Some(strng::new(cert.subject().to_string())),
			Some(strng::new(cert.issuer().to_string())),
		),
		Err(_) => (None, None),
	}
}
