//! Shared plumbing for in-process end-to-end tests: mock HTTP backends, a
//! gateway bound to an ephemeral port, and a small HTTP/1 test client.

use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper_util::rt::TokioIo;
use prometheus_client::registry::Registry;
use tidegate_core::drain;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::config::parse_config;
use crate::health::FailureManager;
use crate::http::{Body, HeaderValue, Request, Response, StatusCode, header};
use crate::proxy::Gateway;
use crate::store::Stores;
use crate::telemetry::metrics::Metrics;
use crate::transport::stock::SocketStock;
use crate::*;

/// A mock origin server. Echoes request attributes into `echo-*` response
/// headers; the response body is the request body, or `abc` for `GET /`,
/// or an unknown-length stream for `/stream`.
pub struct MockBackend {
	pub address: SocketAddr,
	handle: JoinHandle<()>,
}

impl Drop for MockBackend {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

pub async fn mock_backend(id: &'static str) -> MockBackend {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let address = listener.local_addr().unwrap();
	let handle = tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			tokio::spawn(async move {
				let service = hyper::service::service_fn(move |req| mock_handler(id, req));
				let _ = hyper::server::conn::http1::Builder::new()
					.serve_connection(TokioIo::new(stream), service)
					.await;
			});
		}
	});
	MockBackend { address, handle }
}

async fn mock_handler(
	id: &'static str,
	req: ::http::Request<hyper::body::Incoming>,
) -> Result<Response, Infallible> {
	let path = req.uri().path().to_string();
	let mut builder = ::http::Response::builder()
		.status(StatusCode::OK)
		.header("echo-backend", id)
		.header("echo-path", path.clone())
		.header("echo-method", req.method().as_str());
	for (name, echo) in [
		(header::HOST.as_str(), "echo-host"),
		("x-forwarded-for", "echo-xff"),
		("x-forwarded-proto", "echo-proto"),
		("x-tls-client-subject", "echo-subject"),
		(header::COOKIE.as_str(), "echo-cookie"),
		(header::VIA.as_str(), "echo-via"),
	] {
		if let Some(v) = req.headers().get(name) {
			builder = builder.header(echo, v.clone());
		}
	}

	let body = if path == "/stream" {
		// No known length: forces chunked transfer coding downstream.
		let frames = vec![
			Ok::<_, Infallible>(Frame::data(Bytes::from_static(b"chunk-one,"))),
			Ok(Frame::data(Bytes::from_static(b"chunk-two"))),
		];
		Body::new(StreamBody::new(futures_util::stream::iter(frames)))
	} else {
		let received = req
			.into_body()
			.collect()
			.await
			.map(|b| b.to_bytes())
			.unwrap_or_default();
		if received.is_empty() {
			Body::from("abc")
		} else {
			Body::from(received)
		}
	};
	Ok(builder.body(body).unwrap())
}

/// A running gateway listener plus everything needed to assert against it.
pub struct TestGateway {
	pub address: SocketAddr,
	pub inputs: Arc<ProxyInputs>,
	_drain: drain::DrainTrigger,
}

/// Parses the configuration, wires up fresh inputs and serves the first
/// configured listener on an ephemeral port.
pub async fn setup_gateway(yaml: &str) -> TestGateway {
	let loaded = parse_config(yaml.to_string(), None).expect("test config must parse");
	let inputs = test_inputs(loaded);
	let listener = inputs.stores.read().listeners[0].clone();
	let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let address = socket.local_addr().unwrap();
	let (drain_tx, drain_rx) = drain::new();
	tokio::spawn(Gateway::serve_listener(
		socket,
		inputs.clone(),
		drain_rx,
		listener,
	));
	TestGateway {
		address,
		inputs,
		_drain: drain_tx,
	}
}

pub fn test_inputs(loaded: crate::config::Loaded) -> Arc<ProxyInputs> {
	let cfg = Arc::new(loaded.config);
	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let stock = SocketStock::new(cfg.stock_limit, cfg.stock_max_idle);
	Arc::new(ProxyInputs {
		upstream: Client::new(stock, cfg.connect_timeout, cfg.response_timeout),
		stores: Stores::new(&loaded.local, cfg.state_file.clone()),
		cfg,
		metrics,
		registry: Arc::new(registry),
		failures: Arc::new(FailureManager::new()),
	})
}

/// An HTTP/1 keep-alive client connection to the gateway.
pub struct TestClient {
	sender: hyper::client::conn::http1::SendRequest<Body>,
	_conn: JoinHandle<()>,
}

pub async fn connect(address: SocketAddr) -> TestClient {
	let stream = TcpStream::connect(address).await.unwrap();
	let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
		.await
		.unwrap();
	let conn = tokio::spawn(async move {
		let _ = conn.await;
	});
	TestClient {
		sender,
		_conn: conn,
	}
}

impl TestClient {
	pub async fn send(&mut self, req: Request) -> Response {
		self
			.sender
			.send_request(req)
			.await
			.unwrap()
			.map(Body::new)
	}

	pub async fn get(&mut self, path: &str) -> Response {
		self.send(simple_request("GET", path, &[])).await
	}
}

pub fn simple_request(method: &str, path: &str, headers: &[(&str, &str)]) -> Request {
	let mut builder = ::http::Request::builder()
		.method(method)
		.uri(path)
		.header(header::HOST, "test.example");
	for (k, v) in headers {
		builder = builder.header(*k, *v);
	}
	builder.body(Body::empty()).unwrap()
}

pub async fn read_body(resp: Response) -> Bytes {
	resp.into_body().collect().await.unwrap().to_bytes()
}

pub trait ResponseExt {
	fn hdr(&self, name: &str) -> &str;
}

impl ResponseExt for Response {
	fn hdr(&self, name: &str) -> &str {
		self
			.headers()
			.get(name)
			.map(HeaderValue::to_str)
			.and_then(Result::ok)
			.unwrap_or_default()
	}
}

/// A raw TCP echo server, for TCP relay tests.
pub async fn echo_backend() -> (SocketAddr, JoinHandle<()>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let address = listener.local_addr().unwrap();
	let handle = tokio::spawn(async move {
		loop {
			let Ok((mut stream, _)) = listener.accept().await else {
				return;
			};
			tokio::spawn(async move {
				let (mut r, mut w) = stream.split();
				let _ = tokio::io::copy(&mut r, &mut w).await;
			});
		}
	});
	(address, handle)
}
