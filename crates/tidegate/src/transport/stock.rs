//! A keyed pool of idle upstream connections.
//!
//! Each key corresponds to one upstream endpoint (address + local bind +
//! TLS parameters). A lease must be checked out before dialing or reusing a
//! connection; the per-key semaphore bounds the number of concurrent leases
//! and queues waiters in FIFO order. Releasing a lease either returns the
//! stream to the idle list (with any residual input preserved) or destroys
//! it.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use tidegate_core::strng::Strng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::transport::buffered::BufferedStream;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StockKey {
	pub address: SocketAddr,
	/// Local bind address, set for transparent source clusters.
	pub bind: Option<IpAddr>,
	/// Name of the TLS client configuration, when the upstream is TLS.
	pub tls: Option<Strng>,
	/// Fair-scheduling hash: gives each origin host its own lease queue so a
	/// busy host cannot starve the others. Zero when fair scheduling is off.
	pub fairness: u64,
}

pub enum ReleaseAction {
	/// The connection finished cleanly and may serve another lease. Residual
	/// input stays attached to the stream.
	Reuse(BufferedStream),
	/// The connection carries half-state or failed; close it.
	Destroy,
}

struct StockEntry {
	sem: Arc<Semaphore>,
	idle: Arc<Mutex<VecDeque<BufferedStream>>>,
}

pub struct SocketStock {
	entries: Mutex<HashMap<StockKey, StockEntry>>,
	limit: usize,
	max_idle: usize,
}

impl SocketStock {
	pub fn new(limit: usize, max_idle: usize) -> Arc<Self> {
		Arc::new(SocketStock {
			entries: Mutex::new(HashMap::new()),
			limit: limit.max(1),
			max_idle,
		})
	}

	/// Acquires a lease for the given key, waiting if the per-key limit is
	/// reached. Returns an idle connection when a fresh one is available.
	pub async fn checkout(self: &Arc<Self>, key: StockKey) -> (StockLease, Option<BufferedStream>) {
		let (sem, idle) = {
			let mut entries = self.entries.lock().expect("stock lock poisoned");
			let entry = entries.entry(key.clone()).or_insert_with(|| StockEntry {
				sem: Arc::new(Semaphore::new(self.limit)),
				idle: Arc::new(Mutex::new(VecDeque::new())),
			});
			(entry.sem.clone(), entry.idle.clone())
		};
		let permit = sem
			.acquire_owned()
			.await
			.expect("stock semaphore never closed");

		let mut got = None;
		{
			let mut q = idle.lock().expect("idle lock poisoned");
			while let Some(mut stream) = q.pop_front() {
				if stream.is_stale() {
					trace!(?key, "discarding stale idle connection");
					continue;
				}
				got = Some(stream);
				break;
			}
		}
		let lease = StockLease {
			key,
			idle,
			max_idle: self.max_idle,
			_permit: permit,
		};
		(lease, got)
	}

	pub fn idle_count(&self, key: &StockKey) -> usize {
		let entries = self.entries.lock().expect("stock lock poisoned");
		entries
			.get(key)
			.map(|e| e.idle.lock().expect("idle lock poisoned").len())
			.unwrap_or(0)
	}
}

/// A checked-out slot in the stock. Dropping the lease without releasing it
/// counts as `Destroy`.
pub struct StockLease {
	key: StockKey,
	idle: Arc<Mutex<VecDeque<BufferedStream>>>,
	max_idle: usize,
	_permit: OwnedSemaphorePermit,
}

impl StockLease {
	pub fn key(&self) -> &StockKey {
		&self.key
	}

	pub fn release(self, action: ReleaseAction) {
		match action {
			ReleaseAction::Reuse(stream) => {
				let mut q = self.idle.lock().expect("idle lock poisoned");
				if q.len() < self.max_idle {
					trace!(key = ?self.key, residual = stream.residual_len(), "returning connection to stock");
					q.push_back(stream);
				}
			},
			ReleaseAction::Destroy => {},
		}
		// The permit drops here, waking the next waiter.
	}
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;
	use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

	use super::*;
	use crate::transport::buffered::testing::memory_socket;

	fn test_key() -> StockKey {
		StockKey {
			address: "127.0.0.1:8080".parse().unwrap(),
			bind: None,
			tls: None,
			fairness: 0,
		}
	}

	#[tokio::test]
	async fn released_lease_preserves_unconsumed_input() {
		let stock = SocketStock::new(4, 4);
		let key = test_key();

		let (near, mut far) = duplex(1024);
		let (lease, idle) = stock.checkout(key.clone()).await;
		assert!(idle.is_none());
		let mut stream = BufferedStream::new(memory_socket(near));

		// The remote writes 11 bytes; the lease holder consumes 5 and
		// over-reads the rest into the stream's buffer.
		far.write_all(b"hello world").await.unwrap();
		let mut buf = [0u8; 5];
		stream.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");
		stream.read_ahead(64).await.unwrap();
		assert_eq!(stream.residual_len(), 6);

		lease.release(ReleaseAction::Reuse(stream));
		assert_eq!(stock.idle_count(&key), 1);

		// The next checkout observes exactly the 6 unconsumed bytes.
		let (lease2, idle2) = stock.checkout(key.clone()).await;
		let mut reused = idle2.expect("idle connection expected");
		let mut rest = [0u8; 6];
		reused.read_exact(&mut rest).await.unwrap();
		assert_eq!(&rest, b" world");
		lease2.release(ReleaseAction::Destroy);
	}

	#[tokio::test]
	async fn hyper_style_read_buf_survives_release() {
		let stock = SocketStock::new(4, 4);
		let key = test_key();

		let (near, _far) = duplex(1024);
		let (lease, _) = stock.checkout(key.clone()).await;
		let mut stream = BufferedStream::new(memory_socket(near));
		// The protocol layer hands back the bytes it over-read.
		stream.unread(Bytes::from_static(b"HTTP/1.1 200 OK\r\n"));
		lease.release(ReleaseAction::Reuse(stream));

		let (lease2, idle) = stock.checkout(key).await;
		let mut reused = idle.expect("idle connection expected");
		let mut first = [0u8; 8];
		reused.read_exact(&mut first).await.unwrap();
		assert_eq!(&first, b"HTTP/1.1");
		lease2.release(ReleaseAction::Destroy);
	}

	#[tokio::test]
	async fn stale_idle_connections_are_discarded() {
		let stock = SocketStock::new(4, 4);
		let key = test_key();

		let (near, far) = duplex(1024);
		let (lease, _) = stock.checkout(key.clone()).await;
		let stream = BufferedStream::new(memory_socket(near));
		lease.release(ReleaseAction::Reuse(stream));
		assert_eq!(stock.idle_count(&key), 1);

		// The peer hangs up while the connection sits idle.
		drop(far);
		let (lease2, idle) = stock.checkout(key.clone()).await;
		assert!(idle.is_none());
		lease2.release(ReleaseAction::Destroy);
		assert_eq!(stock.idle_count(&key), 0);
	}

	#[tokio::test]
	async fn limit_queues_waiters() {
		let stock = SocketStock::new(1, 4);
		let key = test_key();

		let (lease, _) = stock.checkout(key.clone()).await;
		let second = stock.checkout(key.clone());
		tokio::pin!(second);
		// With the single slot held, the second checkout must wait.
		assert!(
			tokio::time::timeout(std::time::Duration::from_millis(50), &mut second)
				.await
				.is_err()
		);
		lease.release(ReleaseAction::Destroy);
		let (lease2, _) = second.await;
		lease2.release(ReleaseAction::Destroy);
	}

	#[tokio::test]
	async fn idle_list_is_bounded() {
		let stock = SocketStock::new(4, 1);
		let key = test_key();

		let (l1, _) = stock.checkout(key.clone()).await;
		let (l2, _) = stock.checkout(key.clone()).await;
		let (near1, _far1) = duplex(64);
		let (near2, _far2) = duplex(64);
		l1.release(ReleaseAction::Reuse(BufferedStream::new(memory_socket(near1))));
		l2.release(ReleaseAction::Reuse(BufferedStream::new(memory_socket(near2))));
		assert_eq!(stock.idle_count(&key), 1);
	}
}
