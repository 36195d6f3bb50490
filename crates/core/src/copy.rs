//! Bidirectional byte relay between a downstream and an upstream stream.
//!
//! The two directions are not symmetric: when the upstream side reaches
//! end-of-stream, the remaining bytes are flushed downstream and the
//! downstream write side is shut down. When the downstream side reaches
//! end-of-stream, the relay ends immediately.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionResult {
	/// Bytes relayed from downstream to upstream.
	pub sent: u64,
	/// Bytes relayed from upstream to downstream.
	pub received: u64,
}

pub async fn copy_bidirectional<A, B>(downstream: &mut A, upstream: &mut B) -> io::Result<ConnectionResult>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let mut res = ConnectionResult::default();
	let mut down_buf = vec![0u8; BUFFER_SIZE];
	let mut up_buf = vec![0u8; BUFFER_SIZE];

	loop {
		tokio::select! {
			r = downstream.read(&mut down_buf) => {
				let n = r?;
				if n == 0 {
					// Downstream hung up; there is nobody left to relay for.
					let _ = upstream.shutdown().await;
					return Ok(res);
				}
				upstream.write_all(&down_buf[..n]).await?;
				res.sent += n as u64;
			}
			r = upstream.read(&mut up_buf) => {
				let n = r?;
				if n == 0 {
					downstream.flush().await?;
					let _ = downstream.shutdown().await;
					return Ok(res);
				}
				downstream.write_all(&up_buf[..n]).await?;
				res.received += n as u64;
			}
		}
	}
}
