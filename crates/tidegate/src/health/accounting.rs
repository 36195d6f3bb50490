//! Per-client connection accounting and the progressive request-rate tarpit.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const IDLE_THRESHOLD: Duration = Duration::from_secs(2);
const BUSY_THRESHOLD: Duration = Duration::from_secs(120);
const TARPIT_FOR: Duration = Duration::from_secs(60);
const MAX_DELAY: Duration = Duration::from_secs(60);
const DELAY_STEP: Duration = Duration::from_millis(500);
/// Records with no connections left stay around this long before collection.
const GRACE: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct PerClient {
	connections: usize,
	idle_since: Instant,
	busy_since: Instant,
	tarpit_until: Option<Instant>,
	delay: Duration,
	expires: Instant,
}

impl PerClient {
	fn new(now: Instant) -> Self {
		PerClient {
			connections: 0,
			idle_since: now,
			busy_since: now,
			tarpit_until: None,
			delay: Duration::ZERO,
			expires: now + GRACE,
		}
	}

	fn note_request(&mut self, now: Instant) -> Duration {
		if now.duration_since(self.idle_since) > IDLE_THRESHOLD {
			self.busy_since = now;

			if self.delay > DELAY_STEP {
				self.delay -= DELAY_STEP;
			}
		} else if now.duration_since(self.busy_since) > BUSY_THRESHOLD {
			self.tarpit_until = Some(now + TARPIT_FOR);

			if self.delay < MAX_DELAY {
				self.delay += DELAY_STEP;
			}
		}

		self.idle_since = now;

		if self.tarpit_until.is_none_or(|t| now >= t) {
			self.delay = Duration::ZERO;
		}
		self.delay
	}
}

/// One accounting map per listener, keyed by the client IP.
#[derive(Debug)]
pub struct ClientAccounting {
	map: Mutex<HashMap<IpAddr, PerClient>>,
	/// 0 means unlimited.
	max_connections: usize,
}

impl ClientAccounting {
	pub fn new(max_connections: usize) -> Arc<Self> {
		Arc::new(ClientAccounting {
			map: Mutex::new(HashMap::new()),
			max_connections,
		})
	}

	/// Registers a new connection from `ip`, or refuses it when the per-IP
	/// limit is reached. The returned token releases the slot on drop.
	pub fn try_connect(self: &Arc<Self>, ip: IpAddr) -> Option<ConnectionToken> {
		let now = Instant::now();
		let mut map = self.map.lock().expect("accounting lock poisoned");
		map.retain(|_, c| c.connections > 0 || c.expires > now);
		let client = map.entry(ip).or_insert_with(|| PerClient::new(now));
		if self.max_connections != 0 && client.connections >= self.max_connections {
			return None;
		}
		client.connections += 1;
		Some(ConnectionToken {
			accounting: self.clone(),
			ip,
		})
	}

	/// Observes one request and returns the delay to apply before forwarding.
	pub fn note_request(&self, ip: IpAddr) -> Duration {
		self.note_request_at(ip, Instant::now())
	}

	pub fn note_request_at(&self, ip: IpAddr, now: Instant) -> Duration {
		let mut map = self.map.lock().expect("accounting lock poisoned");
		let client = map.entry(ip).or_insert_with(|| PerClient::new(now));
		client.note_request(now)
	}

	pub fn note_response_finished(&self, ip: IpAddr) {
		let mut map = self.map.lock().expect("accounting lock poisoned");
		if let Some(client) = map.get_mut(&ip) {
			client.idle_since = Instant::now();
		}
	}

	fn disconnect(&self, ip: IpAddr) {
		let now = Instant::now();
		let mut map = self.map.lock().expect("accounting lock poisoned");
		if let Some(client) = map.get_mut(&ip) {
			client.connections = client.connections.saturating_sub(1);
			if client.connections == 0 {
				client.expires = now + GRACE;
			}
		}
	}

	#[cfg(test)]
	fn connections(&self, ip: IpAddr) -> usize {
		self
			.map
			.lock()
			.unwrap()
			.get(&ip)
			.map(|c| c.connections)
			.unwrap_or(0)
	}
}

pub struct ConnectionToken {
	accounting: Arc<ClientAccounting>,
	ip: IpAddr,
}

impl ConnectionToken {
	pub fn ip(&self) -> IpAddr {
		self.ip
	}
}

impl Drop for ConnectionToken {
	fn drop(&mut self) {
		self.accounting.disconnect(self.ip);
	}
}
