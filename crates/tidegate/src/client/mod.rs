pub mod tls;

use std::net::IpAddr;

use hyper_util::rt::TokioIo;
use tokio_rustls::TlsConnector;
use tracing::event;

use crate::proxy::ProxyError;
use crate::transport::buffered::BufferedStream;
use crate::transport::stock::{ReleaseAction, SocketStock, StockKey};
use crate::transport::stream::Socket;
use crate::*;

use self::tls::BackendTls;

/// The upstream HTTP/1.1 client.
///
/// Connections are checked out of the socket stock, driven through one
/// exchange, and recovered afterwards: hyper returns the io object together
/// with whatever it over-read, and that residual input travels with the
/// stream back into the stock.
#[derive(Clone)]
pub struct Client {
	stock: Arc<SocketStock>,
	connect_timeout: Duration,
	/// Bounds the wait for response headers; body streaming is unbounded.
	response_timeout: Duration,
}

impl Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").finish()
	}
}

pub struct Call {
	pub req: http::Request,
	pub address: SocketAddr,
	/// Local bind address for transparent source clusters.
	pub bind: Option<IpAddr>,
	pub tls: Option<BackendTls>,
	/// See [`StockKey::fairness`].
	pub fairness: u64,
	/// The request asks for a protocol upgrade; the connection is consumed
	/// by it and never pooled.
	pub upgrade: bool,
}

impl Client {
	pub fn new(
		stock: Arc<SocketStock>,
		connect_timeout: Duration,
		response_timeout: Duration,
	) -> Client {
		Client {
			stock,
			connect_timeout,
			response_timeout,
		}
	}

	/// Waits for the response headers, bounded by the response timeout.
	/// Dropping the in-flight request tears the connection down, so a stuck
	/// backend cannot pin the lease.
	async fn send_request(
		&self,
		sender: &mut hyper::client::conn::http1::SendRequest<http::Body>,
		req: http::Request,
	) -> Result<::http::Response<hyper::body::Incoming>, ProxyError> {
		match tokio::time::timeout(self.response_timeout, sender.send_request(req)).await {
			Ok(Ok(resp)) => Ok(resp),
			Ok(Err(e)) => Err(ProxyError::UpstreamCallFailed(e)),
			Err(_) => Err(ProxyError::RequestTimeout),
		}
	}

	pub async fn call(&self, call: Call) -> Result<http::Response, ProxyError> {
		let start = Instant::now();
		let Call {
			req,
			address,
			bind,
			tls,
			fairness,
			upgrade,
		} = call;
		let key = StockKey {
			address,
			bind,
			tls: tls.as_ref().map(|t| t.name.clone()),
			fairness,
		};
		let (lease, idle) = self.stock.checkout(key).await;
		let (stream, reused) = match idle {
			Some(stream) => (stream, true),
			None => (self.connect(address, bind, tls.as_ref()).await?, false),
		};

		let io = TokioIo::new(stream);
		let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
			.handshake(io)
			.await
			.map_err(ProxyError::UpstreamCallFailed)?;

		if upgrade {
			// An upgraded connection belongs to the tunnel; it cannot return
			// to the stock.
			tokio::spawn(async move {
				let _ = conn.with_upgrades().await;
				lease.release(ReleaseAction::Destroy);
			});
			let method = req.method().clone();
			let path = req.uri().path().to_string();
			let result = self.send_request(&mut sender, req).await;
			drop(sender);
			let resp = result?;
			log_upstream(address, reused, &method, &path, resp.status(), start);
			return Ok(resp.map(http::Body::new));
		}

		// Drive the connection to completion in the background; once the
		// exchange is done, recover the stream and its residual input.
		let recover = tokio::spawn(conn.without_shutdown());
		tokio::spawn(async move {
			match recover.await {
				Ok(Ok(parts)) => {
					let mut stream = parts.io.into_inner();
					stream.unread(parts.read_buf);
					lease.release(ReleaseAction::Reuse(stream));
				},
				_ => lease.release(ReleaseAction::Destroy),
			}
		});

		let method = req.method().clone();
		let path = req.uri().path().to_string();
		let result = self.send_request(&mut sender, req).await;
		drop(sender);
		let resp = result?;
		log_upstream(address, reused, &method, &path, resp.status(), start);
		Ok(resp.map(http::Body::new))
	}

	async fn connect(
		&self,
		address: SocketAddr,
		bind: Option<IpAddr>,
		tls: Option<&BackendTls>,
	) -> Result<BufferedStream, ProxyError> {
		let socket = Socket::dial(address, bind, self.connect_timeout)
			.await
			.map_err(ProxyError::UpstreamConnect)?;
		let socket = match tls {
			None => socket,
			Some(tls) => {
				let connector = TlsConnector::from(tls.config.clone());
				let server_name = tls.server_name_for(address.ip());
				let (ext, inner) = socket.into_parts();
				let handshake = connector.connect(server_name, Box::new(inner));
				let stream = tokio::time::timeout(self.connect_timeout, handshake)
					.await
					.map_err(|_| {
						ProxyError::UpstreamConnect(anyhow::anyhow!("TLS handshake to {address} timed out"))
					})?
					.map_err(|e| ProxyError::UpstreamConnect(e.into()))?;
				Socket::from_tls(ext, tokio_rustls::TlsStream::Client(stream))
			},
		};
		Ok(BufferedStream::new(socket))
	}
}

fn log_upstream(
	address: SocketAddr,
	reused: bool,
	method: &http::Method,
	path: &str,
	status: http::StatusCode,
	start: Instant,
) {
	let dur = format!("{}ms", start.elapsed().as_millis());
	event!(
		target: "upstream request",
		parent: None,
		tracing::Level::DEBUG,

		endpoint = %address,
		reused,

		http.method = %method,
		http.path = %path,
		http.status = status.as_u16(),

		duration = dur,
	);
}
