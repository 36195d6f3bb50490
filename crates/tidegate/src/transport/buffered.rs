//! A byte stream that owns a residual input buffer.
//!
//! Pooled upstream connections are handed back with bytes that were read off
//! the socket but never consumed by the protocol layer (for HTTP/1 this is
//! whatever the parser over-read past the end of the last response). Keeping
//! those bytes attached to the stream means the next checkout observes them
//! before any fresh socket data, so nothing is lost across a lease cycle.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::task::noop_waker_ref;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::transport::stream::Socket;

pub struct BufferedStream {
	residual: BytesMut,
	inner: Socket,
}

impl BufferedStream {
	pub fn new(inner: Socket) -> Self {
		BufferedStream {
			residual: BytesMut::new(),
			inner,
		}
	}

	pub fn residual_len(&self) -> usize {
		self.residual.len()
	}

	pub fn is_empty(&self) -> bool {
		self.residual.is_empty()
	}

	/// Pushes unconsumed bytes back in front of the stream. Subsequent reads
	/// observe them before any socket data.
	pub fn unread(&mut self, data: Bytes) {
		if data.is_empty() {
			return;
		}
		if self.residual.is_empty() {
			self.residual.extend_from_slice(&data);
		} else {
			let mut merged = BytesMut::with_capacity(data.len() + self.residual.len());
			merged.extend_from_slice(&data);
			merged.extend_from_slice(&self.residual);
			self.residual = merged;
		}
	}

	/// Reads whatever the socket has available right now (up to `max` bytes)
	/// into the residual buffer, without consuming it.
	pub async fn read_ahead(&mut self, max: usize) -> io::Result<usize> {
		let mut buf = vec![0u8; max];
		let n = self.inner.read(&mut buf).await?;
		self.residual.extend_from_slice(&buf[..n]);
		Ok(n)
	}

	/// Checks whether an idle stream is still usable: a pooled connection on
	/// which the peer sent EOF (or garbage that errors out) must be discarded
	/// rather than handed to a new lease. Bytes that arrive early are stashed
	/// into the residual buffer.
	pub fn is_stale(&mut self) -> bool {
		if !self.residual.is_empty() {
			// Preserved input is still waiting to be consumed.
			return false;
		}
		let mut cx = Context::from_waker(noop_waker_ref());
		let mut probe = [0u8; 512];
		let mut rb = ReadBuf::new(&mut probe);
		match Pin::new(&mut self.inner).poll_read(&mut cx, &mut rb) {
			Poll::Pending => false,
			Poll::Ready(Err(_)) => true,
			Poll::Ready(Ok(())) => {
				if rb.filled().is_empty() {
					true
				} else {
					let filled = rb.filled().to_vec();
					self.residual.extend_from_slice(&filled);
					false
				}
			},
		}
	}
}

impl AsyncRead for BufferedStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		if !this.residual.is_empty() {
			let n = std::cmp::min(this.residual.len(), buf.remaining());
			buf.put_slice(&this.residual[..n]);
			this.residual.advance(n);
			return Poll::Ready(Ok(()));
		}
		Pin::new(&mut this.inner).poll_read(cx, buf)
	}
}

impl AsyncWrite for BufferedStream {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, io::Error>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[io::IoSlice<'_>],
	) -> Poll<Result<usize, io::Error>> {
		Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}

#[cfg(test)]
pub(crate) mod testing {
	use std::net::{Ipv4Addr, SocketAddr};
	use std::time::Instant;

	use tokio::io::DuplexStream;

	use crate::transport::stream::{Socket, TCPConnectionInfo};

	pub fn memory_socket(stream: DuplexStream) -> Socket {
		let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 1234));
		Socket::from_memory(
			stream,
			TCPConnectionInfo {
				peer_addr: addr,
				local_addr: addr,
				start: Instant::now(),
			},
		)
	}
}
