use std::sync::atomic::{AtomicU8, Ordering};

use ::http::{HeaderMap, Version, header};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, error, trace};

use crate::client::Call;
use crate::cluster::Cluster;
use crate::cluster::sticky::{STICKY_COOKIE, fairness_hash};
use crate::health::{ClientAccounting, FailureStatus};
use crate::http::{
	Body, HeaderName, HeaderValue, Request, Response, StatusCode, Uri, get_host,
};
use crate::proxy::{FAILURE_DURATION, ProxyError};
use crate::route::{self, Leaf, RequestCtx};
use crate::telemetry::log::RequestLog;
use crate::telemetry::metrics::{ErrorKind, RequestLabels, UpstreamErrorLabels};
use crate::transport::stream::{Extension, TCPConnectionInfo, TLSConnectionInfo};
use crate::types::{Listener, Protocol, SimpleResponse};
use crate::*;

const MAX_URI_LENGTH: usize = 8192;
const HSTS_HEADER: HeaderName = HeaderName::from_static("strict-transport-security");
const HSTS_VALUE: HeaderValue = HeaderValue::from_static("max-age=7776000");

/// Connection lifecycle hint, used to pick victims under overload and logged
/// when the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Score {
	New = 0,
	First = 1,
	Success = 2,
	Error = 3,
}

/// State shared by all requests on one downstream connection.
pub struct ConnectionState {
	hsts_sent: std::sync::atomic::AtomicBool,
	score: AtomicU8,
}

impl ConnectionState {
	pub fn new() -> Arc<Self> {
		Arc::new(ConnectionState {
			hsts_sent: std::sync::atomic::AtomicBool::new(false),
			score: AtomicU8::new(Score::New as u8),
		})
	}

	fn observe_request(&self) {
		let _ = self.score.compare_exchange(
			Score::New as u8,
			Score::First as u8,
			Ordering::Relaxed,
			Ordering::Relaxed,
		);
	}

	fn observe_result(&self, ok: bool) {
		if ok {
			let _ = self.score.compare_exchange(
				Score::First as u8,
				Score::Success as u8,
				Ordering::Relaxed,
				Ordering::Relaxed,
			);
		} else {
			self.score.store(Score::Error as u8, Ordering::Relaxed);
		}
	}

	pub fn score(&self) -> Score {
		match self.score.load(Ordering::Relaxed) {
			0 => Score::New,
			1 => Score::First,
			2 => Score::Success,
			_ => Score::Error,
		}
	}
}

#[derive(Clone)]
pub struct HTTPProxy {
	pub(super) inputs: Arc<ProxyInputs>,
	pub(super) listener: Arc<Listener>,
	pub(super) accounting: Arc<ClientAccounting>,
}

impl HTTPProxy {
	pub async fn proxy(
		&self,
		connection: Arc<Extension>,
		state: Arc<ConnectionState>,
		req: ::http::Request<Incoming>,
	) -> Response {
		let tcp = connection
			.get::<TCPConnectionInfo>()
			.expect("tcp connection info must be set")
			.clone();
		state.observe_request();
		let mut log = RequestLog::new(
			self.listener.name.clone(),
			tcp.peer_addr,
			self.listener.access_log_only_errors,
			self.listener.tag.clone(),
		);

		let req = req.map(Body::new);
		let mut hsts = self.listener.hsts;
		let ret = self
			.proxy_internal(&connection, &mut log, &mut hsts, req)
			.await;

		state.observe_result(ret.is_ok());
		let mut resp = match ret {
			Ok(resp) => resp,
			Err(e) => {
				log.error = Some(e.to_string());
				e.as_response(self.listener.verbose_response)
			},
		};

		// Send the HSTS header only on the first response of this connection
		// to save some overhead.
		if hsts && !state.hsts_sent.swap(true, Ordering::Relaxed) {
			resp.headers_mut().insert(HSTS_HEADER, HSTS_VALUE);
		}

		log.status = Some(resp.status());
		self.inputs.metrics.requests.get_or_create(&RequestLabels {
			listener: self.listener.name.to_string(),
			destination: log
				.destination
				.as_ref()
				.map(|d| d.to_string())
				.unwrap_or_default(),
			status: resp.status().as_u16(),
		})
		.inc();
		self.accounting.note_response_finished(tcp.peer_addr.ip());
		log.emit();
		resp
	}

	async fn proxy_internal(
		&self,
		connection: &Extension,
		log: &mut RequestLog,
		hsts: &mut bool,
		mut req: Request,
	) -> Result<Response, ProxyError> {
		let tcp = connection
			.get::<TCPConnectionInfo>()
			.expect("tcp connection info must be set")
			.clone();
		let tls_info = connection.get::<TLSConnectionInfo>().cloned();
		let client_ip = tcp.peer_addr.ip();

		normalize_uri(&tls_info, &mut req)?;
		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str().to_string())
			.unwrap_or_else(|| "/".to_string());
		if path_and_query.len() > MAX_URI_LENGTH {
			return Err(ProxyError::UriTooLong);
		}
		let host = get_host(&req)?.to_string();
		if host.is_empty() {
			return Err(ProxyError::MalformedHost);
		}

		log.method = Some(req.method().clone());
		log.host = Some(host.clone());
		log.path = Some(req.uri().path().to_string());
		debug!(listener = %self.listener.name, host = %host, path = %path_and_query, "routing request");

		// The routing walk is pure and must not hold the store lock across
		// any await point.
		let leaf = {
			let state = self.inputs.stores.read();

			if let Some(check) = &state.global_http_check
				&& check.matches(&path_and_query, &host, client_ip)
			{
				return Ok(if check.check() {
					crate::http::plaintext_response(StatusCode::OK, check.success_message.to_string())
				} else {
					crate::http::plaintext_response(StatusCode::NOT_FOUND, "")
				});
			}

			let ctx = RequestCtx {
				method: req.method(),
				uri: &path_and_query,
				headers: req.headers(),
				remote: client_ip,
				peer_subject: tls_info.as_ref().and_then(|t| t.peer_subject.as_deref()),
				peer_issuer_subject: tls_info
					.as_ref()
					.and_then(|t| t.peer_issuer_subject.as_deref()),
			};
			route::find_request_leaf(&state, &self.listener.destination, &ctx)
				.map_err(|_| ProxyError::RouteNotFound)?
		};

		match leaf {
			Leaf::Response(r) => {
				log.destination = Some(strng::format!("response:{}", r.status));
				build_static_response(&r, &host, &path_and_query)
			},
			Leaf::Metrics => {
				log.destination = Some(strng::literal!("metrics"));
				self.metrics_response()
			},
			Leaf::Cluster(cluster) => {
				if cluster.config.protocol != Protocol::Http {
					return Err(ProxyError::WrongProtocol);
				}
				*hsts |= cluster.config.hsts;
				log.destination = Some(cluster.name());

				if cluster.config.tarpit {
					let delay = self.accounting.note_request(client_ip);
					if delay > Duration::ZERO {
						self.inputs.metrics.tarpit_delays.inc();
						trace!(client = %client_ip, ?delay, "tarpit delay");
						tokio::time::sleep(delay).await;
					}
				}

				self
					.forward(cluster, req, log, tls_info.as_ref(), client_ip, &host)
					.await
			},
		}
	}

	async fn forward(
		&self,
		cluster: Arc<Cluster>,
		mut req: Request,
		log: &mut RequestLog,
		tls_info: Option<&TLSConnectionInfo>,
		client_ip: IpAddr,
		host: &str,
	) -> Result<Response, ProxyError> {
		let failures = &self.inputs.failures;
		let pick = cluster
			.pick_http(failures, Instant::now(), client_ip, Some(host), req.headers())
			.ok_or(ProxyError::NoValidBackends)?;
		let address = pick.member.address;
		log.forwarded_to = Some(address);
		debug!(cluster = %cluster.name(), backend = %address, "selected backend");

		let bind = match (cluster.config.transparent_source, client_ip) {
			(true, ip @ (IpAddr::V4(_) | IpAddr::V6(_))) => Some(ip),
			_ => None,
		};
		let fairness = if cluster.config.fair_scheduling {
			fairness_hash(Some(host))
		} else {
			0
		};

		let mut req_upgrade = hop_by_hop_headers(&mut req);
		forward_request_headers(&mut req, client_ip, tls_info, cluster.config.mangle_via);

		// The upstream exchange is always origin-form HTTP/1.1 with an
		// explicit Host header.
		let host_header = cluster
			.config
			.http_host
			.as_deref()
			.unwrap_or(host)
			.to_string();
		set_origin_form(&mut req, &host_header)?;

		let call = Call {
			req,
			address,
			bind,
			tls: cluster.config.tls.clone(),
			fairness,
			upgrade: req_upgrade.is_some(),
		};
		match self.inputs.upstream.call(call).await {
			Ok(mut resp) => {
				failures.unset(address, FailureStatus::Protocol);
				if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
					return handle_upgrade(&mut req_upgrade, resp).await;
				}
				// Framing is re-applied on the downstream side; forwarding the
				// upstream's hop-by-hop headers would be wrong there (and
				// malformed on HTTP/2).
				for h in HOP_HEADERS.iter() {
					resp.headers_mut().remove(h);
				}
				if let Some(cookie) = pick.new_cookie {
					append_sticky_cookie(resp.headers_mut(), cookie);
				}
				Ok(resp)
			},
			Err(e) if e.is_connect() => {
				failures.set(address, FailureStatus::Connect, FAILURE_DURATION);
				self.inputs.metrics.upstream_errors.get_or_create(&UpstreamErrorLabels {
					cluster: cluster.name().to_string(),
					kind: ErrorKind::connect,
				})
				.inc();
				debug!(cluster = %cluster.name(), backend = %address, "connect error: {e}");
				match &cluster.config.fallback {
					Some(fallback) => {
						log.error = Some(e.to_string());
						build_static_response(fallback, host, "/")
					},
					None => Err(e),
				}
			},
			Err(e) => {
				if matches!(e, ProxyError::UpstreamCallFailed(_)) {
					failures.set(address, FailureStatus::Protocol, FAILURE_DURATION);
					self.inputs.metrics.upstream_errors.get_or_create(&UpstreamErrorLabels {
						cluster: cluster.name().to_string(),
						kind: ErrorKind::protocol,
					})
					.inc();
				}
				Err(e)
			},
		}
	}

	fn metrics_response(&self) -> Result<Response, ProxyError> {
		let mut buf = String::new();
		prometheus_client::encoding::text::encode(&mut buf, &self.inputs.registry)
			.map_err(|e| ProxyError::Processing(anyhow::anyhow!("metrics encoding failed: {e}")))?;
		Ok(
			::http::Response::builder()
				.status(StatusCode::OK)
				.header(
					header::CONTENT_TYPE,
					"application/openmetrics-text; version=1.0.0; charset=utf-8",
				)
				.body(Body::from(buf))
				.expect("static response must build"),
		)
	}
}

fn build_static_response(
	r: &SimpleResponse,
	host: &str,
	uri: &str,
) -> Result<Response, ProxyError> {
	let status = StatusCode::from_u16(r.status).unwrap_or(StatusCode::BAD_GATEWAY);
	let mut builder = ::http::Response::builder().status(status);
	if r.redirect_https {
		let location = format!("https://{host}{uri}");
		builder = builder.header(header::LOCATION, location);
	} else if let Some(location) = &r.location {
		builder = builder.header(header::LOCATION, location.as_str());
	}
	let body = r
		.message
		.as_deref()
		.map(|m| m.to_string())
		.unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_string());
	builder
		.header(header::CONTENT_TYPE, "text/plain")
		.body(Body::from(body))
		.map_err(|e| ProxyError::Processing(e.into()))
}

fn append_sticky_cookie(headers: &mut HeaderMap, cookie: u32) {
	// "Discard" must be last, to work around an Android bug.
	let value = format!("{STICKY_COOKIE}=0-{cookie:x}; HttpOnly; Path=/; Version=1; Discard");
	if let Ok(v) = HeaderValue::try_from(value) {
		headers.append(HeaderName::from_static("cookie2"), HeaderValue::from_static("$Version=\"1\""));
		headers.append(header::SET_COOKIE, v);
	}
}

// Hop-by-hop headers. These are removed when sent to the backend.
// As of RFC 7230, hop-by-hop headers are required to appear in the
// Connection header field. These are the headers defined by the
// obsoleted RFC 2616 (section 13.5.1) and are used for backward
// compatibility.
static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	// non-standard but still sent by libcurl and rejected by e.g. google
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

pub(super) struct RequestUpgrade {
	upgrade_type: HeaderValue,
	upgrade: OnUpgrade,
}

fn hop_by_hop_headers(req: &mut Request) -> Option<RequestUpgrade> {
	let trailers = req
		.headers()
		.get(header::TE)
		.and_then(|h| h.to_str().ok())
		.map(|s| s.contains("trailers"))
		.unwrap_or(false);
	let upgrade_type = upgrade_type(req.headers());
	for h in HOP_HEADERS.iter() {
		req.headers_mut().remove(h);
	}
	// If the incoming request supports trailers, the forwarded one will as
	// well.
	if trailers {
		req
			.headers_mut()
			.insert(header::TE, HeaderValue::from_static("trailers"));
	}
	// After stripping the hop-by-hop headers above, add back the ones
	// necessary for protocol upgrades, such as websockets.
	if let Some(upgrade_type) = upgrade_type.clone() {
		req
			.headers_mut()
			.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
		req.headers_mut().insert(header::UPGRADE, upgrade_type);
	}
	let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();
	if let Some(t) = upgrade_type
		&& let Some(u) = on_upgrade
	{
		Some(RequestUpgrade {
			upgrade_type: t,
			upgrade: u,
		})
	} else {
		None
	}
}

fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
	let connection_upgrade = headers
		.get(header::CONNECTION)
		.and_then(|h| h.to_str().ok())
		.map(|s| {
			s.split(',')
				.any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
		})
		.unwrap_or(false);
	if connection_upgrade {
		headers.get(header::UPGRADE).cloned()
	} else {
		None
	}
}

async fn handle_upgrade(
	req_upgrade: &mut Option<RequestUpgrade>,
	mut resp: Response,
) -> Result<Response, ProxyError> {
	let Some(RequestUpgrade {
		upgrade_type: req_upgrade_type,
		upgrade,
	}) = std::mem::take(req_upgrade)
	else {
		return Err(ProxyError::UpgradeFailed);
	};
	let resp_upgrade_type = upgrade_type(resp.headers());
	if Some(&req_upgrade_type) != resp_upgrade_type.as_ref() {
		return Err(ProxyError::UpgradeFailed);
	}
	let response_upgraded = resp
		.extensions_mut()
		.remove::<OnUpgrade>()
		.ok_or(ProxyError::UpgradeFailed)?
		.await
		.map_err(|_| ProxyError::UpgradeFailed)?;
	tokio::task::spawn(async move {
		let downstream = match upgrade.await {
			Ok(u) => u,
			Err(e) => {
				error!("upgrade error: {e}");
				return;
			},
		};
		let mut downstream = TokioIo::new(downstream);
		let mut upstream = TokioIo::new(response_upgraded);
		let _ = tidegate_core::copy::copy_bidirectional(&mut downstream, &mut upstream).await;
	});
	Ok(resp)
}

/// Rewrites the forwarded header set: append the client to
/// `x-forwarded-for`, record the inbound protocol, advertise ourselves in
/// `via`, fold repeated Cookie headers, and forward the TLS client identity.
fn forward_request_headers(
	req: &mut Request,
	client_ip: IpAddr,
	tls_info: Option<&TLSConnectionInfo>,
	mangle_via: bool,
) {
	let headers = req.headers_mut();

	let xff = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
		Some(existing) => format!("{existing}, {client_ip}"),
		None => client_ip.to_string(),
	};
	if let Ok(v) = HeaderValue::try_from(xff) {
		headers.insert(HeaderName::from_static("x-forwarded-for"), v);
	}

	headers.insert(
		HeaderName::from_static("x-forwarded-proto"),
		HeaderValue::from_static(if tls_info.is_some() { "https" } else { "http" }),
	);

	if mangle_via {
		headers.remove(header::VIA);
	} else {
		let via = match headers.get(header::VIA).and_then(|v| v.to_str().ok()) {
			Some(existing) => format!("{existing}, 1.1 tidegate"),
			None => "1.1 tidegate".to_string(),
		};
		if let Ok(v) = HeaderValue::try_from(via) {
			headers.insert(header::VIA, v);
		}
	}

	// Fold multiple Cookie headers into one; some backends only read the
	// first.
	let cookies: Vec<String> = headers
		.get_all(header::COOKIE)
		.iter()
		.filter_map(|v| v.to_str().ok().map(|s| s.to_string()))
		.collect();
	if cookies.len() > 1 {
		headers.remove(header::COOKIE);
		if let Ok(v) = HeaderValue::try_from(cookies.join("; ")) {
			headers.insert(header::COOKIE, v);
		}
	}

	// Never trust client-supplied identity headers.
	headers.remove(HeaderName::from_static("x-tls-client-subject"));
	headers.remove(HeaderName::from_static("x-tls-client-issuer"));
	if let Some(tls) = tls_info {
		if let Some(subject) = &tls.peer_subject
			&& let Ok(v) = HeaderValue::try_from(subject.as_str())
		{
			headers.insert(HeaderName::from_static("x-tls-client-subject"), v);
		}
		if let Some(issuer) = &tls.peer_issuer_subject
			&& let Ok(v) = HeaderValue::try_from(issuer.as_str())
		{
			headers.insert(HeaderName::from_static("x-tls-client-issuer"), v);
		}
	}
}

fn set_origin_form(req: &mut Request, host: &str) -> Result<(), ProxyError> {
	let pq = req
		.uri()
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/");
	let uri = Uri::builder()
		.path_and_query(pq)
		.build()
		.map_err(|e| ProxyError::Processing(e.into()))?;
	*req.uri_mut() = uri;
	*req.version_mut() = Version::HTTP_11;
	let host_value =
		HeaderValue::try_from(host).map_err(|_| ProxyError::MalformedHost)?;
	req.headers_mut().insert(header::HOST, host_value);
	Ok(())
}

// The http library will not put the authority into req.uri().authority for
// HTTP/1. Normalize so the rest of the code doesn't need to worry about it.
fn normalize_uri(
	tls_info: &Option<TLSConnectionInfo>,
	req: &mut Request,
) -> Result<(), ProxyError> {
	if let Version::HTTP_10 | Version::HTTP_11 = req.version()
		&& req.uri().authority().is_none()
	{
		let mut parts = std::mem::take(req.uri_mut()).into_parts();
		let host = req
			.headers()
			.get(header::HOST)
			.and_then(|h| h.to_str().ok())
			.and_then(|h| h.parse::<crate::http::Authority>().ok())
			.ok_or(ProxyError::NoHost)?;
		req.headers_mut().remove(header::HOST);

		parts.authority = Some(host);
		if parts.path_and_query.is_some() {
			parts.scheme = Some(if tls_info.is_some() {
				crate::http::Scheme::HTTPS
			} else {
				crate::http::Scheme::HTTP
			});
		}
		*req.uri_mut() = Uri::from_parts(parts).map_err(|_| ProxyError::MalformedHost)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
		let mut builder = ::http::Request::builder().uri(uri).method("GET");
		for (k, v) in headers {
			builder = builder.header(*k, *v);
		}
		builder.body(Body::empty()).unwrap()
	}

	#[test]
	fn normalize_moves_host_into_uri() {
		let mut req = request("/path?q=1", &[("host", "example.com:8080")]);
		normalize_uri(&None, &mut req).unwrap();
		assert_eq!(req.uri().host(), Some("example.com"));
		assert_eq!(req.uri().scheme_str(), Some("http"));
		assert_eq!(get_host(&req).unwrap(), "example.com");
		assert!(req.headers().get(header::HOST).is_none());
	}

	#[test]
	fn normalize_without_host_fails() {
		let mut req = request("/path", &[]);
		assert!(matches!(
			normalize_uri(&None, &mut req),
			Err(ProxyError::NoHost)
		));
	}

	#[test]
	fn hop_by_hop_headers_are_stripped() {
		let mut req = request(
			"/",
			&[
				("host", "h"),
				("connection", "keep-alive"),
				("transfer-encoding", "chunked"),
				("te", "trailers"),
				("proxy-authorization", "secret"),
				("x-keep", "yes"),
			],
		);
		let upgrade = hop_by_hop_headers(&mut req);
		assert!(upgrade.is_none());
		assert!(req.headers().get(header::CONNECTION).is_none());
		assert!(req.headers().get(header::TRANSFER_ENCODING).is_none());
		assert!(req.headers().get(header::PROXY_AUTHORIZATION).is_none());
		// TE: trailers is restored after the sweep.
		assert_eq!(req.headers().get(header::TE).unwrap(), "trailers");
		assert_eq!(req.headers().get("x-keep").unwrap(), "yes");
	}

	#[test]
	fn forwarded_headers_append_xff_and_fold_cookies() {
		let mut req = request(
			"/",
			&[
				("host", "h"),
				("x-forwarded-for", "198.51.100.9"),
				("cookie", "a=1"),
				("cookie", "b=2"),
				("x-tls-client-subject", "CN=spoofed"),
			],
		);
		forward_request_headers(&mut req, "192.0.2.3".parse().unwrap(), None, false);
		assert_eq!(
			req.headers().get("x-forwarded-for").unwrap(),
			"198.51.100.9, 192.0.2.3"
		);
		assert_eq!(req.headers().get(header::VIA).unwrap(), "1.1 tidegate");
		assert_eq!(req.headers().get("x-forwarded-proto").unwrap(), "http");
		assert_eq!(req.headers().get(header::COOKIE).unwrap(), "a=1; b=2");
		assert!(req.headers().get("x-tls-client-subject").is_none());
	}

	#[test]
	fn sticky_cookie_format() {
		let mut headers = HeaderMap::new();
		append_sticky_cookie(&mut headers, 0x2a);
		let value = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
		assert!(value.starts_with("beng_lb_node=0-2a;"));
		assert!(value.ends_with("Discard"));
	}

	#[test]
	fn static_response_redirect_https() {
		let r = SimpleResponse {
			status: 301,
			location: None,
			message: None,
			redirect_https: true,
		};
		let resp = build_static_response(&r, "example.com", "/x?y=1").unwrap();
		assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
		assert_eq!(
			resp.headers().get(header::LOCATION).unwrap(),
			"https://example.com/x?y=1"
		);
	}
}
