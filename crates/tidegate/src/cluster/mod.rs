pub mod discovery;
pub mod sticky;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::health::FailureManager;
use crate::http::HeaderMap;
use crate::types::{ClusterConfig, Member, StickyMethod, StickyMode};
use crate::*;

use self::sticky::*;

const STICKY_CACHE_CAPACITY: usize = 1024;
const RING_POINTS_PER_MEMBER: usize = 16;

/// The resolved member set plus the hashing structures derived from it.
/// Swapped wholesale when discovery refreshes the membership.
pub struct MemberSet {
	pub members: Vec<Member>,
	/// Sorted hash ring, only built for consistent-hashing clusters.
	ring: Vec<(u64, usize)>,
}

impl MemberSet {
	fn new(members: Vec<Member>, build_ring: bool) -> Self {
		let ring = if build_ring {
			let mut ring = Vec::with_capacity(members.len() * RING_POINTS_PER_MEMBER);
			for (i, m) in members.iter().enumerate() {
				for v in 0..RING_POINTS_PER_MEMBER {
					let point = fnv1a_64(format!("{}#{v}", m.name).as_bytes());
					ring.push((point, i));
				}
			}
			ring.sort_unstable();
			ring
		} else {
			Vec::new()
		};
		MemberSet { members, ring }
	}

	fn ring_lookup(&self, hash: u64) -> Option<usize> {
		if self.ring.is_empty() {
			return None;
		}
		let at = self.ring.partition_point(|(p, _)| *p < hash);
		let (_, idx) = self.ring[at % self.ring.len()];
		Some(idx)
	}
}

/// The outcome of a member selection.
#[derive(Debug, Clone)]
pub struct Pick {
	pub index: usize,
	pub member: Member,
	/// Set when a fresh pinning cookie was generated for this request.
	pub new_cookie: Option<u32>,
}

/// Runtime state of a configured cluster: immutable policy plus the mutable
/// member set (static, or refreshed by discovery).
pub struct Cluster {
	pub config: ClusterConfig,
	members: RwLock<Arc<MemberSet>>,
	round_robin: AtomicUsize,
	sticky_cache: Mutex<StickyCache>,
}

impl Cluster {
	pub fn new(config: ClusterConfig) -> Arc<Self> {
		let build_ring =
			config.discovery.is_some() && config.sticky_method == StickyMethod::ConsistentHashing;
		let members = Arc::new(MemberSet::new(config.members.clone(), build_ring));
		Arc::new(Cluster {
			config,
			members: RwLock::new(members),
			round_robin: AtomicUsize::new(0),
			sticky_cache: Mutex::new(StickyCache::default()),
		})
	}

	pub fn name(&self) -> Strng {
		self.config.name.clone()
	}

	pub fn member_set(&self) -> Arc<MemberSet> {
		self.members.read().expect("member lock poisoned").clone()
	}

	/// Replaces the member set (discovery refresh).
	pub fn set_members(&self, members: Vec<Member>) {
		let build_ring = self.config.sticky_method == StickyMethod::ConsistentHashing;
		let set = Arc::new(MemberSet::new(members, build_ring));
		*self.members.write().expect("member lock poisoned") = set;
	}

	/// Selects a member for an HTTP request, honouring the sticky policy and
	/// the failure state.
	pub fn pick_http(
		&self,
		failures: &FailureManager,
		now: Instant,
		remote: IpAddr,
		host: Option<&str>,
		headers: &HeaderMap,
	) -> Option<Pick> {
		let set = self.member_set();
		let members = &set.members;
		if members.is_empty() {
			return None;
		}

		let mut new_cookie = None;
		let hash = match self.config.sticky_mode {
			StickyMode::None => 0,
			StickyMode::Failover => return self.pick_failover(failures, now, members),
			StickyMode::SourceIp => address_hash(remote),
			StickyMode::Host => host_hash(host),
			StickyMode::Xhost => host_hash(
				headers
					.get("x-forwarded-host")
					.and_then(|v| v.to_str().ok()),
			),
			StickyMode::SessionModulo => {
				session_modulo_hash(headers, self.config.session_cookie.as_str())
			},
			StickyMode::Cookie => {
				let h = sticky_cookie_hash(headers);
				if h == 0 && members.len() >= 2 {
					let c = generate_cookie(failures, now, members);
					new_cookie = Some(c);
					c
				} else {
					h
				}
			},
			StickyMode::JvmRoute => jvm_route_hash(headers, members),
		};

		Some(self.pick_from_hash(failures, now, &set, hash, new_cookie))
	}

	/// Selects a member for a raw TCP connection. Only address stickiness is
	/// possible before any bytes arrive.
	pub fn pick_tcp(&self, failures: &FailureManager, now: Instant, remote: IpAddr) -> Option<Pick> {
		let set = self.member_set();
		if set.members.is_empty() {
			return None;
		}
		let hash = match self.config.sticky_mode {
			StickyMode::SourceIp => address_hash(remote),
			StickyMode::Failover => return self.pick_failover(failures, now, &set.members),
			_ => 0,
		};
		Some(self.pick_from_hash(failures, now, &set, hash, None))
	}

	fn pick_failover(
		&self,
		failures: &FailureManager,
		now: Instant,
		members: &[Member],
	) -> Option<Pick> {
		let index = members
			.iter()
			.position(|m| failures.check(now, m.address, false))
			.unwrap_or(0);
		Some(Pick {
			index,
			member: members[index].clone(),
			new_cookie: None,
		})
	}

	fn pick_from_hash(
		&self,
		failures: &FailureManager,
		now: Instant,
		set: &MemberSet,
		hash: u32,
		new_cookie: Option<u32>,
	) -> Pick {
		let members = &set.members;
		let n = members.len();
		let base = if hash == 0 {
			self.round_robin.fetch_add(1, Ordering::Relaxed) % n
		} else if self.config.discovery.is_some() {
			self.map_discovered(failures, now, set, hash)
		} else {
			hash as usize % n
		};

		// Scan forward from the sticky index, skipping failed members. When
		// everything has failed, stay on the sticky index so a bad fleet
		// still drains traffic instead of hard-erroring.
		for step in 0..n {
			let index = (base + step) % n;
			if failures.check(now, members[index].address, false) {
				return Pick {
					index,
					member: members[index].clone(),
					new_cookie,
				};
			}
		}
		Pick {
			index: base,
			member: members[base].clone(),
			new_cookie,
		}
	}

	/// Maps a sticky hash onto the member set of a discovered cluster, where
	/// membership churns and plain modulo would reshuffle everything.
	fn map_discovered(
		&self,
		failures: &FailureManager,
		now: Instant,
		set: &MemberSet,
		hash: u32,
	) -> usize {
		let members = &set.members;
		match self.config.sticky_method {
			StickyMethod::ConsistentHashing => set
				.ring_lookup(hash as u64)
				.unwrap_or(hash as usize % members.len()),
			StickyMethod::RendezvousHashing => rendezvous(members, hash),
			StickyMethod::Cache => {
				let mut cache = self.sticky_cache.lock().expect("sticky cache poisoned");
				if let Some(name) = cache.get(hash)
					&& let Some(index) = members.iter().position(|m| &m.name == name)
					&& failures.check(now, members[index].address, false)
				{
					return index;
				}
				let index = rendezvous(members, hash);
				cache.put(hash, members[index].name.clone());
				index
			},
		}
	}
}

/// Highest-random-weight hashing.
fn rendezvous(members: &[Member], hash: u32) -> usize {
	let mut best = 0;
	let mut best_weight = 0u64;
	for (i, m) in members.iter().enumerate() {
		let mut key = Vec::with_capacity(m.name.len() + 4);
		key.extend_from_slice(m.name.as_bytes());
		key.extend_from_slice(&hash.to_be_bytes());
		let weight = fnv1a_64(&key);
		if i == 0 || weight > best_weight {
			best = i;
			best_weight = weight;
		}
	}
	best
}

/// Small LRU-ish cache absorbing membership churn: a sticky hash keeps
/// mapping to the node it was first assigned to for as long as that node
/// stays present and healthy.
#[derive(Default)]
struct StickyCache {
	map: HashMap<u32, Strng>,
	order: std::collections::VecDeque<u32>,
}

impl StickyCache {
	fn get(&self, hash: u32) -> Option<&Strng> {
		self.map.get(&hash)
	}

	fn put(&mut self, hash: u32, name: Strng) {
		if self.map.insert(hash, name).is_none() {
			self.order.push_back(hash);
			if self.order.len() > STICKY_CACHE_CAPACITY
				&& let Some(evict) = self.order.pop_front()
			{
				self.map.remove(&evict);
			}
		}
	}
}
