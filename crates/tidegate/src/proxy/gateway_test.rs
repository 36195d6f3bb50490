use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::health::FailureStatus;
use crate::http::{Body, StatusCode, header};
use crate::test_helpers::*;
use crate::*;

fn single_backend_config(backend: SocketAddr, listener_extra: &str, cluster_extra: &str) -> String {
	format!(
		r#"
nodes:
  - name: b1
    address: "{backend}"
clusters:
  - name: web
    members: ["b1"]
{cluster_extra}
listeners:
  - name: main
    bind: 127.0.0.1:0
    pool: web
{listener_extra}
"#
	)
}

#[tokio::test]
async fn minimal_forward() {
	let backend = mock_backend("b1").await;
	let gw = setup_gateway(&single_backend_config(backend.address, "", "")).await;
	let mut client = connect(gw.address).await;

	let resp = client.get("/").await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.hdr("echo-xff"), "127.0.0.1");
	assert_eq!(resp.hdr("echo-host"), "test.example");
	assert_eq!(resp.hdr("echo-proto"), "http");
	assert_eq!(resp.hdr("echo-via"), "1.1 tidegate");
	assert_eq!(&read_body(resp).await[..], b"abc");
}

#[tokio::test]
async fn round_trip_bodies() {
	let backend = mock_backend("b1").await;
	let gw = setup_gateway(&single_backend_config(backend.address, "", "")).await;
	let mut client = connect(gw.address).await;

	for size in [1usize, 4095, 4096, 65536, 1_000_000] {
		let payload = vec![b'x'; size];
		let req = ::http::Request::builder()
			.method("POST")
			.uri("/echo")
			.header(header::HOST, "test.example")
			.body(Body::from(payload.clone()))
			.unwrap();
		let resp = client.send(req).await;
		assert_eq!(resp.status(), StatusCode::OK);
		let body = read_body(resp).await;
		assert_eq!(body.len(), size, "body size {size} mangled");
		assert_eq!(&body[..], &payload[..]);
	}
}

#[tokio::test]
async fn head_request_has_no_body() {
	let backend = mock_backend("b1").await;
	let gw = setup_gateway(&single_backend_config(backend.address, "", "")).await;
	let mut client = connect(gw.address).await;

	let resp = client.send(simple_request("HEAD", "/", &[])).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.hdr("echo-method"), "HEAD");
	assert!(read_body(resp).await.is_empty());
}

#[tokio::test]
async fn unknown_length_response_is_chunked() {
	let backend = mock_backend("b1").await;
	let gw = setup_gateway(&single_backend_config(backend.address, "", "")).await;
	let mut client = connect(gw.address).await;

	let resp = client.get("/stream").await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert!(resp.headers().get(header::CONTENT_LENGTH).is_none());
	assert_eq!(resp.hdr("transfer-encoding"), "chunked");
	assert_eq!(&read_body(resp).await[..], b"chunk-one,chunk-two");
}

#[tokio::test]
async fn fallback_on_connect_error() {
	// Reserve a port, then free it so nothing is listening there.
	let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let dead_addr = dead.local_addr().unwrap();
	drop(dead);

	let cfg = single_backend_config(
		dead_addr,
		"",
		r#"    fallback: { status: 502, message: down }"#,
	);
	let gw = setup_gateway(&cfg).await;
	let mut client = connect(gw.address).await;

	let resp = client.get("/").await;
	assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
	assert_eq!(&read_body(resp).await[..], b"down");

	assert_eq!(
		gw.inputs.failures.get(Instant::now(), dead_addr),
		FailureStatus::Connect
	);
}

#[tokio::test]
async fn unresponsive_backend_times_out() {
	// A backend that accepts the connection but never answers.
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let mut held = Vec::new();
		while let Ok((stream, _)) = listener.accept().await {
			held.push(stream);
		}
	});

	let cfg = format!(
		r#"
config:
  response_timeout: 1
nodes:
  - name: b1
    address: "{addr}"
clusters:
  - name: web
    members: ["b1"]
listeners:
  - name: main
    bind: 127.0.0.1:0
    pool: web
"#
	);
	let gw = setup_gateway(&cfg).await;
	let mut client = connect(gw.address).await;

	let resp = client.get("/").await;
	assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn missing_fallback_yields_plain_502() {
	let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let dead_addr = dead.local_addr().unwrap();
	drop(dead);

	let gw = setup_gateway(&single_backend_config(dead_addr, "", "")).await;
	let mut client = connect(gw.address).await;
	let resp = client.get("/").await;
	assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn hsts_sent_once_per_connection() {
	let backend = mock_backend("b1").await;
	let cfg = single_backend_config(backend.address, "    hsts: true", "");
	let gw = setup_gateway(&cfg).await;
	let mut client = connect(gw.address).await;

	let first = client.get("/").await;
	assert_eq!(
		first.hdr("strict-transport-security"),
		"max-age=7776000"
	);
	let second = client.get("/").await;
	assert_eq!(second.status(), StatusCode::OK);
	assert!(second.headers().get("strict-transport-security").is_none());

	// A fresh connection starts over.
	let mut other = connect(gw.address).await;
	let again = other.get("/").await;
	assert_eq!(again.hdr("strict-transport-security"), "max-age=7776000");
}

#[tokio::test]
async fn pipelined_requests_answered_in_order() {
	let backend = mock_backend("b1").await;
	let gw = setup_gateway(&single_backend_config(backend.address, "", "")).await;

	let mut stream = TcpStream::connect(gw.address).await.unwrap();
	let mut wire = Vec::new();
	for path in ["/a", "/b"] {
		wire.extend_from_slice(
			format!("GET {path} HTTP/1.1\r\nHost: test.example\r\n\r\n").as_bytes(),
		);
	}
	wire.extend_from_slice(
		b"GET /c HTTP/1.1\r\nHost: test.example\r\nConnection: close\r\n\r\n",
	);
	stream.write_all(&wire).await.unwrap();

	let mut out = String::new();
	stream.read_to_string(&mut out).await.unwrap();
	let statuses = out.matches("HTTP/1.1 200").count();
	assert_eq!(statuses, 3, "expected 3 responses, got: {out}");
	let a = out.find("echo-path: /a").expect("/a answered");
	let b = out.find("echo-path: /b").expect("/b answered");
	let c = out.find("echo-path: /c").expect("/c answered");
	assert!(a < b && b < c, "responses out of order: {out}");
}

fn two_backend_config(b1: SocketAddr, b2: SocketAddr, sticky: &str) -> String {
	format!(
		r#"
nodes:
  - name: b1
    address: "{b1}"
  - name: b2
    address: "{b2}"
clusters:
  - name: web
    members: ["b1", "b2"]
    sticky: {sticky}
listeners:
  - name: main
    bind: 127.0.0.1:0
    pool: web
"#
	)
}

#[tokio::test]
async fn sticky_cookie_pins_backend() {
	let b1 = mock_backend("one").await;
	let b2 = mock_backend("two").await;
	let gw = setup_gateway(&two_backend_config(b1.address, b2.address, "cookie")).await;
	let mut client = connect(gw.address).await;

	let resp = client.get("/").await;
	assert_eq!(resp.status(), StatusCode::OK);
	let set_cookie = resp.hdr("set-cookie").to_string();
	assert!(
		set_cookie.starts_with("beng_lb_node=0-"),
		"unexpected cookie: {set_cookie}"
	);
	let chosen = resp.hdr("echo-backend").to_string();

	let cookie = set_cookie.split(';').next().unwrap().to_string();
	for _ in 0..5 {
		let resp = client
			.send(simple_request("GET", "/", &[("cookie", &cookie)]))
			.await;
		assert_eq!(resp.hdr("echo-backend"), chosen);
		// No new cookie is generated for pinned requests.
		assert!(resp.headers().get("set-cookie").is_none());
	}
}

#[tokio::test]
async fn faded_node_is_skipped_until_enabled() {
	let b1 = mock_backend("one").await;
	let b2 = mock_backend("two").await;
	let gw = setup_gateway(&two_backend_config(b1.address, b2.address, "host")).await;
	let mut client = connect(gw.address).await;

	let first = client.get("/").await.hdr("echo-backend").to_string();
	let (faded_payload, other) = if first == "one" {
		(format!("b1:{}", b1.address.port()), "two")
	} else {
		(format!("b2:{}", b2.address.port()), "one")
	};

	assert!(gw.inputs.stores.fade_node(&faded_payload, &gw.inputs.failures));
	for _ in 0..3 {
		assert_eq!(client.get("/").await.hdr("echo-backend"), other);
	}

	assert!(gw.inputs.stores.enable_node(&faded_payload, &gw.inputs.failures));
	assert_eq!(client.get("/").await.hdr("echo-backend"), first);
}

#[tokio::test]
async fn branch_routes_by_uri_and_falls_back() {
	let b1 = mock_backend("one").await;
	let b2 = mock_backend("two").await;
	let cfg = format!(
		r#"
nodes:
  - name: b1
    address: "{b1}"
  - name: b2
    address: "{b2}"
clusters:
  - name: web
    members: ["b1"]
  - name: api
    members: ["b2"]
branches:
  - name: split
    cases:
      - attribute: uri
        regex: "^/api"
        goto: api
      - attribute: method
        equals: DELETE
        goto: {{ status: 405, message: "not here" }}
    fallback: web
listeners:
  - name: main
    bind: 127.0.0.1:0
    pool: split
"#,
		b1 = b1.address,
		b2 = b2.address,
	);
	let gw = setup_gateway(&cfg).await;
	let mut client = connect(gw.address).await;

	assert_eq!(client.get("/api/x").await.hdr("echo-backend"), "two");
	assert_eq!(client.get("/other").await.hdr("echo-backend"), "one");

	let resp = client.send(simple_request("DELETE", "/zzz", &[])).await;
	assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
	assert_eq!(&read_body(resp).await[..], b"not here");
}

#[tokio::test]
async fn redirect_https_listener() {
	let cfg = r#"
listeners:
  - name: main
    bind: 127.0.0.1:0
    redirect_https: true
"#;
	let gw = setup_gateway(cfg).await;
	let mut client = connect(gw.address).await;

	let resp = client.get("/path?q=1").await;
	assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
	assert_eq!(resp.hdr("location"), "https://test.example/path?q=1");
}

#[tokio::test]
async fn overlong_uri_is_rejected() {
	let backend = mock_backend("b1").await;
	let gw = setup_gateway(&single_backend_config(backend.address, "", "")).await;
	let mut client = connect(gw.address).await;

	let path = format!("/{}", "a".repeat(9000));
	let resp = client.get(&path).await;
	assert_eq!(resp.status(), StatusCode::URI_TOO_LONG);
}

#[tokio::test]
async fn metrics_exporter_destination() {
	let cfg = r#"
exporters: ["metrics"]
listeners:
  - name: main
    bind: 127.0.0.1:0
    pool: metrics
"#;
	let gw = setup_gateway(cfg).await;
	let mut client = connect(gw.address).await;

	let resp = client.get("/metrics").await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert!(resp.hdr("content-type").contains("openmetrics"));
	let body = read_body(resp).await;
	assert!(std::str::from_utf8(&body).unwrap().contains("# EOF"));
}

#[tokio::test]
async fn tcp_relay_round_trip() {
	let (echo_addr, _echo) = echo_backend().await;
	let cfg = format!(
		r#"
nodes:
  - name: raw
    address: "{echo_addr}"
clusters:
  - name: relay
    protocol: tcp
    members: ["raw"]
listeners:
  - name: main
    bind: 127.0.0.1:0
    protocol: tcp
    pool: relay
"#
	);
	let gw = setup_gateway(&cfg).await;

	let mut stream = TcpStream::connect(gw.address).await.unwrap();
	stream.write_all(b"hello relay").await.unwrap();
	let mut buf = [0u8; 11];
	stream.read_exact(&mut buf).await.unwrap();
	assert_eq!(&buf, b"hello relay");

	// Client close tears the relay down.
	stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn tls_termination() {
	use hyper_util::rt::TokioIo;

	let backend = mock_backend("b1").await;

	let signed = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
	let dir = std::env::temp_dir().join(format!("tidegate-tls-{}", std::process::id()));
	std::fs::create_dir_all(&dir).unwrap();
	let cert_path = dir.join("cert.pem");
	let key_path = dir.join("key.pem");
	std::fs::write(&cert_path, signed.cert.pem()).unwrap();
	std::fs::write(&key_path, signed.key_pair.serialize_pem()).unwrap();

	let cfg = format!(
		r#"
nodes:
  - name: b1
    address: "{backend}"
clusters:
  - name: web
    members: ["b1"]
listeners:
  - name: main
    bind: 127.0.0.1:0
    pool: web
    ssl: true
    ssl_cert: {cert_path}
    ssl_key: {key_path}
"#,
		backend = backend.address,
		cert_path = cert_path.display(),
		key_path = key_path.display(),
	);
	let gw = setup_gateway(&cfg).await;

	let mut roots = rustls::RootCertStore::empty();
	roots.add(signed.cert.der().clone()).unwrap();
	let client_config = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
	let tcp = TcpStream::connect(gw.address).await.unwrap();
	let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
	let tls = connector.connect(server_name, tcp).await.unwrap();

	let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
		.await
		.unwrap();
	tokio::spawn(async move {
		let _ = conn.await;
	});
	let resp = sender
		.send_request(simple_request("GET", "/", &[]))
		.await
		.unwrap()
		.map(Body::new);
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.hdr("echo-proto"), "https");
	assert_eq!(&read_body(resp).await[..], b"abc");

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn cleartext_http2_prior_knowledge() {
	use hyper_util::rt::{TokioExecutor, TokioIo};

	let backend = mock_backend("b1").await;
	let cfg = single_backend_config(backend.address, "    force_http2: true", "");
	let gw = setup_gateway(&cfg).await;

	let stream = TcpStream::connect(gw.address).await.unwrap();
	let (mut sender, conn) =
		hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
			.await
			.unwrap();
	tokio::spawn(async move {
		let _ = conn.await;
	});

	let req = ::http::Request::builder()
		.method("GET")
		.uri("http://test.example/")
		.body(Body::empty())
		.unwrap();
	let resp = sender.send_request(req).await.unwrap().map(Body::new);
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.hdr("echo-host"), "test.example");
	// The upstream exchange is plain HTTP/1.1 regardless of the inbound
	// protocol.
	assert_eq!(resp.hdr("echo-proto"), "http");
	assert_eq!(&read_body(resp).await[..], b"abc");
}

#[tokio::test]
async fn client_certificate_identity_routes_and_forwards() {
	use hyper_util::rt::TokioIo;
	use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

	let b1 = mock_backend("anon").await;
	let b2 = mock_backend("authed").await;

	// A tiny PKI: one CA, a server certificate and a client certificate.
	let mut ca_params = CertificateParams::new(vec![]).unwrap();
	ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	ca_params
		.distinguished_name
		.push(DnType::CommonName, "test ca");
	let ca_key = KeyPair::generate().unwrap();
	let ca_cert = ca_params.self_signed(&ca_key).unwrap();

	let server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
	let server_key = KeyPair::generate().unwrap();
	let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

	let mut client_params = CertificateParams::new(vec![]).unwrap();
	client_params
		.distinguished_name
		.push(DnType::CommonName, "client-one");
	let client_key = KeyPair::generate().unwrap();
	let client_cert = client_params
		.signed_by(&client_key, &ca_cert, &ca_key)
		.unwrap();

	let dir = std::env::temp_dir().join(format!("tidegate-mtls-{}", std::process::id()));
	std::fs::create_dir_all(&dir).unwrap();
	let cert_path = dir.join("server.pem");
	let key_path = dir.join("server.key");
	let ca_path = dir.join("ca.pem");
	std::fs::write(&cert_path, server_cert.pem()).unwrap();
	std::fs::write(&key_path, server_key.serialize_pem()).unwrap();
	std::fs::write(&ca_path, ca_cert.pem()).unwrap();

	let cfg = format!(
		r#"
nodes:
  - name: b1
    address: "{b1}"
  - name: b2
    address: "{b2}"
clusters:
  - name: anon
    members: ["b1"]
  - name: authed
    members: ["b2"]
branches:
  - name: by-identity
    cases:
      - attribute: peer_subject
        equals: "CN=client-one"
        goto: authed
    fallback: anon
listeners:
  - name: main
    bind: 127.0.0.1:0
    pool: by-identity
    ssl: true
    ssl_cert: {cert_path}
    ssl_key: {key_path}
    ssl_ca_cert: {ca_path}
    ssl_verify: optional
"#,
		b1 = b1.address,
		b2 = b2.address,
		cert_path = cert_path.display(),
		key_path = key_path.display(),
		ca_path = ca_path.display(),
	);
	let gw = setup_gateway(&cfg).await;

	let mut roots = rustls::RootCertStore::empty();
	roots.add(ca_cert.der().clone()).unwrap();

	// Without a client certificate, the fallback cluster answers.
	let anon_config = rustls::ClientConfig::builder()
		.with_root_certificates(roots.clone())
		.with_no_client_auth();
	let resp = tls_get(gw.address, Arc::new(anon_config)).await;
	assert_eq!(resp.hdr("echo-backend"), "anon");
	assert_eq!(resp.hdr("echo-subject"), "");

	// With the certificate, the identity condition matches and the subject
	// is forwarded upstream.
	let authed_config = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_client_auth_cert(
			vec![client_cert.der().clone()],
			rustls::pki_types::PrivateKeyDer::try_from(client_key.serialize_der()).unwrap(),
		)
		.unwrap();
	let resp = tls_get(gw.address, Arc::new(authed_config)).await;
	assert_eq!(resp.hdr("echo-backend"), "authed");
	assert_eq!(resp.hdr("echo-subject"), "CN=client-one");

	let _ = std::fs::remove_dir_all(&dir);

	async fn tls_get(
		address: SocketAddr,
		config: Arc<rustls::ClientConfig>,
	) -> crate::http::Response {
		let connector = tokio_rustls::TlsConnector::from(config);
		let tcp = TcpStream::connect(address).await.unwrap();
		let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
		let tls = connector.connect(server_name, tcp).await.unwrap();
		let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
			.await
			.unwrap();
		tokio::spawn(async move {
			let _ = conn.await;
		});
		sender
			.send_request(simple_request("GET", "/", &[]))
			.await
			.unwrap()
			.map(Body::new)
	}
}

#[tokio::test]
async fn per_ip_connection_limit_refuses_excess() {
	let backend = mock_backend("b1").await;
	let cfg = single_backend_config(backend.address, "    max_connections_per_ip: 1", "");
	let gw = setup_gateway(&cfg).await;

	let mut first = connect(gw.address).await;
	assert_eq!(first.get("/").await.status(), StatusCode::OK);

	// The second connection is accepted at the TCP level but closed without
	// serving a request.
	let mut second = TcpStream::connect(gw.address).await.unwrap();
	second
		.write_all(b"GET / HTTP/1.1\r\nHost: test.example\r\n\r\n")
		.await
		.unwrap();
	let mut buf = Vec::new();
	let n = second.read_to_end(&mut buf).await.unwrap();
	assert_eq!(n, 0, "refused connection must not answer");
}
