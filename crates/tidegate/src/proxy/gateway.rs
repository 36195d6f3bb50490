use std::convert::Infallible;

use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tidegate_core::drain;
use tidegate_core::drain::DrainWatcher;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::health::{ClientAccounting, ConnectionToken};
use crate::proxy::httpproxy::{ConnectionState, HTTPProxy};
use crate::proxy::tcpproxy::TCPProxy;
use crate::telemetry::metrics::{BindProtocol, ConnectionLabels};
use crate::transport::stream::{Socket, to_canonical};
use crate::types::{Listener, ListenerTls, Protocol, SocketOptions};
use crate::*;

/// Read timeout while collecting request headers.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Cap on buffered header bytes per request.
const MAX_HEADER_BYTES: usize = 64 * 1024;
/// HTTP/2 stream ceiling per connection.
const MAX_CONCURRENT_STREAMS: u32 = 64;
/// Small initial stream window: an idle stream cannot congest the
/// connection with an unread upload. Streams whose bodies are consumed grow
/// back to a full window through the adaptive window.
const INITIAL_STREAM_WINDOW: u32 = 4096;
/// Generous connection-level window for many parallel small requests.
const INITIAL_CONNECTION_WINDOW: u32 = 256 * 1024;

pub struct Gateway {
	inputs: Arc<ProxyInputs>,
	drain: DrainWatcher,
}

impl Gateway {
	pub fn new(inputs: Arc<ProxyInputs>, drain: DrainWatcher) -> Gateway {
		Gateway { inputs, drain }
	}

	pub async fn run(self) {
		let listeners = self.inputs.stores.read().listeners.clone();
		let mut js = JoinSet::new();
		for listener in listeners {
			js.spawn(
				Self::run_listener(self.inputs.clone(), self.drain.clone(), listener).in_current_span(),
			);
		}
		while let Some(res) = js.join_next().await {
			match res {
				Ok(Ok(())) => {},
				Ok(Err(e)) => warn!("listener failed: {e}"),
				Err(e) => warn!("listener task panicked: {e}"),
			}
		}
	}

	async fn run_listener(
		inputs: Arc<ProxyInputs>,
		drain: DrainWatcher,
		listener: Arc<Listener>,
	) -> anyhow::Result<()> {
		let tcp_listener = bind_listener(&listener)?;
		Self::serve_listener(tcp_listener, inputs, drain, listener).await
	}

	pub(crate) async fn serve_listener(
		tcp_listener: TcpListener,
		inputs: Arc<ProxyInputs>,
		drain: DrainWatcher,
		listener: Arc<Listener>,
	) -> anyhow::Result<()> {
		let bound = tcp_listener.local_addr()?;
		info!(
			listener = %listener.name,
			address = %bound,
			destination = %listener.destination.name(),
			"started listener"
		);
		let accounting = ClientAccounting::new(listener.max_connections_per_ip);
		let deadline = inputs.cfg.termination_deadline;

		let accept = |drain: DrainWatcher, force_shutdown: watch::Receiver<()>| {
			let inputs = inputs.clone();
			let listener = listener.clone();
			let accounting = accounting.clone();
			async move {
				loop {
					let (stream, peer) = match tcp_listener.accept().await {
						Ok(conn) => conn,
						Err(e) => {
							warn!(listener = %listener.name, "accept failed: {e}");
							tokio::time::sleep(Duration::from_millis(100)).await;
							continue;
						},
					};
					let peer = to_canonical(peer);

					let labels = ConnectionLabels {
						listener: listener.name.to_string(),
						protocol: bind_protocol(&listener),
					};
					let Some(token) = accounting.try_connect(peer.ip()) else {
						debug!(listener = %listener.name, %peer, "refusing connection: per-client limit");
						inputs.metrics.rejected_connections.get_or_create(&labels).inc();
						continue;
					};
					inputs
						.metrics
						.downstream_connections
						.get_or_create(&labels)
						.inc();

					let inputs = inputs.clone();
					let listener = listener.clone();
					let accounting = accounting.clone();
					let drain = drain.clone();
					let mut force_shutdown = force_shutdown.clone();
					let start = Instant::now();
					tokio::spawn(async move {
						debug!(listener = %listener.name, %peer, "connection started");
						tokio::select! {
							_ = force_shutdown.changed() => {
								debug!(listener = %listener.name, %peer, "connection forcefully terminated");
							}
							_ = Self::handle_connection(inputs, listener.clone(), accounting, token, stream) => {}
						}
						debug!(listener = %listener.name, %peer, dur = ?start.elapsed(), "connection completed");
						// Mark we are done with the connection, so drain can
						// complete.
						drop(drain);
					});
				}
			}
		};

		drain::run_with_drain(
			format!("listener {}", listener.name),
			drain,
			deadline,
			accept,
		)
		.await;
		Ok(())
	}

	async fn handle_connection(
		inputs: Arc<ProxyInputs>,
		listener: Arc<Listener>,
		accounting: Arc<ClientAccounting>,
		token: ConnectionToken,
		stream: TcpStream,
	) {
		let _token = token;
		apply_connection_options(&stream, &listener.socket);
		let socket = match Socket::from_tcp(stream) {
			Ok(s) => s,
			Err(e) => {
				debug!(listener = %listener.name, "failed to set up connection: {e}");
				return;
			},
		};
		let socket = match &listener.tls {
			Some(tls) => match terminate_tls(socket, tls).await {
				Ok(s) => s,
				Err(e) => {
					debug!(listener = %listener.name, "TLS handshake failed: {e}");
					return;
				},
			},
			None => socket,
		};

		match listener.protocol {
			Protocol::Http => {
				let state = ConnectionState::new();
				if let Err(e) = Self::serve_http(
					inputs,
					listener.clone(),
					accounting,
					state.clone(),
					socket,
				)
				.await
				{
					debug!(listener = %listener.name, "connection error: {e}");
				}
				debug!(listener = %listener.name, score = ?state.score(), "connection finished");
			},
			Protocol::Tcp => {
				TCPProxy {
					inputs,
					listener,
				}
				.proxy(socket)
				.await
			},
		}
	}

	async fn serve_http(
		inputs: Arc<ProxyInputs>,
		listener: Arc<Listener>,
		accounting: Arc<ClientAccounting>,
		state: Arc<ConnectionState>,
		socket: Socket,
	) -> anyhow::Result<()> {
		let connection = Arc::new(socket.get_ext());
		let proxy = HTTPProxy {
			inputs,
			listener: listener.clone(),
			accounting,
		};

		let mut builder = auto::Builder::new(TokioExecutor::new());
		builder
			.http1()
			.timer(TokioTimer::new())
			.header_read_timeout(HEADER_READ_TIMEOUT)
			.max_buf_size(MAX_HEADER_BYTES);
		builder
			.http2()
			.timer(TokioTimer::new())
			.max_concurrent_streams(MAX_CONCURRENT_STREAMS)
			.initial_stream_window_size(INITIAL_STREAM_WINDOW)
			.initial_connection_window_size(INITIAL_CONNECTION_WINDOW)
			.adaptive_window(true);
		if listener.force_http2 {
			builder = builder.http2_only();
		}

		let serve = builder.serve_connection_with_upgrades(
			TokioIo::new(socket),
			hyper::service::service_fn(move |req| {
				let proxy = proxy.clone();
				let connection = connection.clone();
				let state = state.clone();
				async move { Ok::<_, Infallible>(proxy.proxy(connection, state, req).await) }
			}),
		);
		serve.await.map_err(|e| anyhow::anyhow!("{e}"))
	}
}

async fn terminate_tls(socket: Socket, tls: &ListenerTls) -> anyhow::Result<Socket> {
	let (ext, inner) = socket.into_parts();
	let acceptor = TlsAcceptor::from(tls.config.clone());
	let stream = acceptor.accept(Box::new(inner)).await?;
	Ok(Socket::from_tls(ext, tokio_rustls::TlsStream::Server(stream)))
}

fn bind_protocol(listener: &Listener) -> BindProtocol {
	match (listener.protocol, listener.tls.is_some()) {
		(Protocol::Http, false) => BindProtocol::http,
		(Protocol::Http, true) => BindProtocol::https,
		(Protocol::Tcp, false) => BindProtocol::tcp,
		(Protocol::Tcp, true) => BindProtocol::tls,
	}
}

fn bind_listener(listener: &Listener) -> anyhow::Result<TcpListener> {
	use socket2::{Domain, Protocol as SockProtocol, Type};

	let domain = if listener.address.is_ipv4() {
		Domain::IPV4
	} else {
		Domain::IPV6
	};
	#[cfg(target_os = "linux")]
	let protocol = if listener.socket.mptcp {
		SockProtocol::MPTCP
	} else {
		SockProtocol::TCP
	};
	#[cfg(not(target_os = "linux"))]
	let protocol = SockProtocol::TCP;
	let socket = socket2::Socket::new(domain, Type::STREAM, Some(protocol))?;
	socket.set_nonblocking(true)?;
	socket.set_reuse_address(true)?;
	#[cfg(unix)]
	if listener.socket.reuse_port {
		socket.set_reuse_port(true)?;
	}
	if listener.address.is_ipv6()
		&& let Some(v6only) = listener.socket.v6only
	{
		socket.set_only_v6(v6only)?;
	}
	#[cfg(target_os = "linux")]
	{
		if listener.socket.free_bind {
			socket.set_freebind(true)?;
		}
		if let Some(interface) = &listener.socket.interface {
			socket.bind_device(Some(interface.as_bytes()))?;
		}
	}
	socket.bind(&listener.address.into())?;
	socket.listen(1024)?;
	let std_listener: std::net::TcpListener = socket.into();
	Ok(TcpListener::from_std(std_listener)?)
}

fn apply_connection_options(stream: &TcpStream, opts: &SocketOptions) {
	let sock = socket2::SockRef::from(stream);
	if opts.keepalive {
		let _ = sock.set_keepalive(true);
	}
	#[cfg(target_os = "linux")]
	if let Some(timeout) = opts.ack_timeout {
		let _ = sock.set_tcp_user_timeout(Some(timeout));
	}
}
