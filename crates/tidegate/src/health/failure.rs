//! Remembers which backend addresses failed recently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Health categories in increasing severity. The effective status of an
/// address is the most severe category that has not expired yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
	Ok,
	/// Administrative mark; the member should drain.
	Fade,
	/// Transient connect error.
	Connect,
	/// The backend returned malformed data.
	Protocol,
	/// External health check failed.
	Monitor,
}

impl FailureStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			FailureStatus::Ok => "ok",
			FailureStatus::Fade => "fade",
			FailureStatus::Connect | FailureStatus::Protocol | FailureStatus::Monitor => "error",
		}
	}
}

#[derive(Debug, Default, Clone)]
struct FailureInfo {
	fade: Option<Instant>,
	connect: Option<Instant>,
	protocol: Option<Instant>,
	/// Monitor state has no expiry; the monitor itself clears it.
	monitor: bool,
}

impl FailureInfo {
	fn status(&self, now: Instant) -> FailureStatus {
		if self.monitor {
			return FailureStatus::Monitor;
		}
		if active(self.protocol, now) {
			return FailureStatus::Protocol;
		}
		if active(self.connect, now) {
			return FailureStatus::Connect;
		}
		if active(self.fade, now) {
			return FailureStatus::Fade;
		}
		FailureStatus::Ok
	}

	fn is_idle(&self, now: Instant) -> bool {
		!self.monitor
			&& !active(self.fade, now)
			&& !active(self.connect, now)
			&& !active(self.protocol, now)
	}
}

fn active(expiry: Option<Instant>, now: Instant) -> bool {
	expiry.is_some_and(|e| e > now)
}

#[derive(Debug, Default)]
pub struct FailureManager {
	map: Mutex<HashMap<SocketAddr, FailureInfo>>,
}

impl FailureManager {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(&self, address: SocketAddr, status: FailureStatus, duration: Duration) {
		let now = Instant::now();
		let expiry = Some(now + duration);
		let mut map = self.map.lock().expect("failure lock poisoned");
		let info = map.entry(address).or_default();
		match status {
			FailureStatus::Fade => info.fade = expiry,
			FailureStatus::Connect => info.connect = expiry,
			FailureStatus::Protocol => info.protocol = expiry,
			FailureStatus::Monitor => info.monitor = true,
			FailureStatus::Ok => {},
		}
		Self::prune(&mut map, now);
	}

	pub fn set_monitor(&self, address: SocketAddr, failed: bool) {
		let now = Instant::now();
		let mut map = self.map.lock().expect("failure lock poisoned");
		if failed {
			map.entry(address).or_default().monitor = true;
		} else if let Some(info) = map.get_mut(&address) {
			info.monitor = false;
			if info.is_idle(now) {
				map.remove(&address);
			}
		}
	}

	pub fn unset(&self, address: SocketAddr, status: FailureStatus) {
		let now = Instant::now();
		let mut map = self.map.lock().expect("failure lock poisoned");
		if let Some(info) = map.get_mut(&address) {
			match status {
				FailureStatus::Fade => info.fade = None,
				FailureStatus::Connect => info.connect = None,
				FailureStatus::Protocol => info.protocol = None,
				FailureStatus::Monitor => info.monitor = false,
				FailureStatus::Ok => {},
			}
			if info.is_idle(now) {
				map.remove(&address);
			}
		}
	}

	pub fn unset_all(&self, address: SocketAddr) {
		let mut map = self.map.lock().expect("failure lock poisoned");
		map.remove(&address);
	}

	pub fn get(&self, now: Instant, address: SocketAddr) -> FailureStatus {
		let map = self.map.lock().expect("failure lock poisoned");
		map
			.get(&address)
			.map(|info| info.status(now))
			.unwrap_or(FailureStatus::Ok)
	}

	/// Whether the address may receive traffic. Failover scanning passes
	/// `allow_fade` to keep draining members usable as a last resort.
	pub fn check(&self, now: Instant, address: SocketAddr, allow_fade: bool) -> bool {
		match self.get(now, address) {
			FailureStatus::Ok => true,
			FailureStatus::Fade => allow_fade,
			_ => false,
		}
	}

	fn prune(map: &mut HashMap<SocketAddr, FailureInfo>, now: Instant) {
		if map.len() > 64 {
			map.retain(|_, info| !info.is_idle(now));
		}
	}
}
