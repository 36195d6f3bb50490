use std::io::{Error, IoSlice};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tidegate_core::strng::Strng;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsStream;

use crate::transport::tls::peer_identity;

#[derive(Debug, Clone)]
pub struct TCPConnectionInfo {
	pub peer_addr: SocketAddr,
	pub local_addr: SocketAddr,
	pub start: Instant,
}

#[derive(Debug, Clone, Eq, PartialEq, Copy)]
pub enum Alpn {
	Http11,
	H2,
	Other,
}

impl From<&[u8]> for Alpn {
	fn from(value: &[u8]) -> Self {
		if value == b"h2" {
			Alpn::H2
		} else if value == b"http/1.1" {
			Alpn::Http11
		} else {
			Alpn::Other
		}
	}
}

#[derive(Debug, Clone)]
pub struct TLSConnectionInfo {
	pub server_name: Option<String>,
	pub negotiated_alpn: Option<Alpn>,
	/// Subject of the verified client certificate, if any.
	pub peer_subject: Option<Strng>,
	pub peer_issuer_subject: Option<Strng>,
}

pub struct Socket {
	ext: Extension,
	inner: SocketType,
}

impl Socket {
	pub fn into_parts(self) -> (Extension, SocketType) {
		(self.ext, self.inner)
	}

	pub fn from_memory(stream: DuplexStream, info: TCPConnectionInfo) -> Self {
		let mut ext = Extension::new();
		ext.insert(info);
		Socket {
			ext,
			inner: SocketType::Memory(stream),
		}
	}

	pub fn from_tcp(stream: TcpStream) -> anyhow::Result<Self> {
		let mut ext = Extension::new();
		stream.set_nodelay(true)?;
		ext.insert(TCPConnectionInfo {
			peer_addr: to_canonical(stream.peer_addr()?),
			local_addr: to_canonical(stream.local_addr()?),
			start: Instant::now(),
		});
		Ok(Socket {
			ext,
			inner: SocketType::Tcp(stream),
		})
	}

	pub fn from_tls(mut ext: Extension, tls: TlsStream<Box<SocketType>>) -> Self {
		let info = {
			let server_name = match &tls {
				TlsStream::Server(s) => {
					let (_, conn) = s.get_ref();
					conn.server_name().map(|s| s.to_string())
				},
				_ => None,
			};
			let (_, common) = tls.get_ref();
			let (peer_subject, peer_issuer_subject) = peer_identity(common.peer_certificates());
			TLSConnectionInfo {
				server_name,
				negotiated_alpn: common.alpn_protocol().map(Alpn::from),
				peer_subject,
				peer_issuer_subject,
			}
		};
		ext.insert(info);
		Socket {
			ext,
			inner: SocketType::Tls(Box::new(tls)),
		}
	}

	pub fn get_ext(&self) -> Extension {
		self.ext.clone()
	}

	pub fn ext<T: Send + Sync + Clone + 'static>(&self) -> Option<&T> {
		self.ext.get::<T>()
	}

	pub fn tcp(&self) -> &TCPConnectionInfo {
		self
			.ext
			.get::<TCPConnectionInfo>()
			.expect("tcp connection info must be set")
	}

	/// Dials the target, optionally binding the local side to a specific
	/// address first (transparent source addressing uses the client IP with
	/// port 0 so the kernel picks an ephemeral port).
	pub async fn dial(
		target: SocketAddr,
		bind: Option<std::net::IpAddr>,
		timeout: Duration,
	) -> anyhow::Result<Socket> {
		let sock = if target.is_ipv4() {
			TcpSocket::new_v4()?
		} else {
			TcpSocket::new_v6()?
		};
		if let Some(ip) = bind {
			sock.set_reuseaddr(true)?;
			sock.bind(SocketAddr::new(ip, 0))?;
		}
		let stream = tokio::time::timeout(timeout, sock.connect(target))
			.await
			.map_err(|_| anyhow::anyhow!("connect to {target} timed out"))??;
		Socket::from_tcp(stream)
	}
}

pub enum SocketType {
	Tcp(TcpStream),
	Tls(Box<TlsStream<Box<SocketType>>>),
	Memory(DuplexStream),
	Boxed(Box<SocketType>),
}

impl AsyncRead for SocketType {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketType::Tls(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketType::Memory(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketType::Boxed(inner) => Pin::new(inner).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for SocketType {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, std::io::Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketType::Tls(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketType::Memory(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketType::Boxed(inner) => Pin::new(inner).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_flush(cx),
			SocketType::Tls(inner) => Pin::new(inner).poll_flush(cx),
			SocketType::Memory(inner) => Pin::new(inner).poll_flush(cx),
			SocketType::Boxed(inner) => Pin::new(inner).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketType::Tls(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketType::Memory(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketType::Boxed(inner) => Pin::new(inner).poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, std::io::Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketType::Tls(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketType::Memory(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketType::Boxed(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match &self {
			SocketType::Tcp(inner) => inner.is_write_vectored(),
			SocketType::Tls(inner) => inner.is_write_vectored(),
			SocketType::Memory(inner) => inner.is_write_vectored(),
			SocketType::Boxed(inner) => inner.is_write_vectored(),
		}
	}
}

impl AsyncRead for Socket {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl AsyncWrite for Socket {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, Error>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, Error>> {
		Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}

/// Per-connection attribute bag, shared between the accept loop and the
/// request handlers running on that connection.
#[derive(Debug, Clone, Default)]
pub struct Extension(::http::Extensions);

impl Extension {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, val: T) -> Option<T> {
		self.0.insert(val)
	}

	pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<&T> {
		self.0.get::<T>()
	}

	pub fn copy<T: Send + Clone + Sync + 'static>(&self, ext: &mut ::http::Extensions) {
		if let Some(got) = self.get::<T>() {
			ext.insert(got.clone());
		}
	}
}

pub fn to_canonical(addr: SocketAddr) -> SocketAddr {
	let ip = addr.ip().to_canonical();
	SocketAddr::from((ip, addr.port()))
}
