//! Sticky hash computation for backend pinning.
//!
//! Each sticky mode derives a small integer from a request attribute; the
//! balancer maps it onto the member list. A hash of 0 always means "no
//! stickiness" and falls back to round-robin.

use std::net::IpAddr;
use std::time::Instant;

use rand::Rng;

use crate::health::FailureManager;
use crate::http::HeaderMap;
use crate::types::Member;

/// Cookie used for worker pinning in `cookie` sticky mode. The value format
/// is `<generation>-<node hex>`.
pub const STICKY_COOKIE: &str = "beng_lb_node";

const FNV32_OFFSET: u32 = 2166136261;
const FNV32_PRIME: u32 = 16777619;
const FNV64_OFFSET: u64 = 14695981039346656037;
const FNV64_PRIME: u64 = 1099511628211;

pub fn fnv1a_32(data: &[u8]) -> u32 {
	let mut hash = FNV32_OFFSET;
	for b in data {
		hash ^= *b as u32;
		hash = hash.wrapping_mul(FNV32_PRIME);
	}
	hash
}

pub fn fnv1a_64(data: &[u8]) -> u64 {
	let mut hash = FNV64_OFFSET;
	for b in data {
		hash ^= *b as u64;
		hash = hash.wrapping_mul(FNV64_PRIME);
	}
	hash
}

/// Sticky hash from the client address.
pub fn address_hash(ip: IpAddr) -> u32 {
	match ip {
		IpAddr::V4(v4) => fnv1a_32(&v4.octets()),
		IpAddr::V6(v6) => fnv1a_32(&v6.octets()),
	}
}

pub fn host_hash(host: Option<&str>) -> u32 {
	host.map(|h| fnv1a_32(h.as_bytes())).unwrap_or(0)
}

/// 64-bit hash used to spread concurrent requests for one host evenly across
/// the members of a fair-scheduling cluster.
pub fn fairness_hash(host: Option<&str>) -> u64 {
	fnv1a_64(host.unwrap_or_default().as_bytes())
}

/// Looks up a cookie value in the (possibly repeated) Cookie headers.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
	for header in headers.get_all(::http::header::COOKIE) {
		let Ok(s) = header.to_str() else { continue };
		for pair in s.split(';') {
			let pair = pair.trim();
			if let Some((k, v)) = pair.split_once('=')
				&& k.trim() == name
			{
				return Some(v.trim());
			}
		}
	}
	None
}

/// Parses the worker-pinning cookie; the part after `-` is the hex node
/// number. Returns 0 when absent or malformed.
pub fn sticky_cookie_hash(headers: &HeaderMap) -> u32 {
	let Some(value) = cookie_value(headers, STICKY_COOKIE) else {
		return 0;
	};
	let Some((_generation, node)) = value.split_once('-') else {
		return 0;
	};
	u32::from_str_radix(node, 16).unwrap_or(0)
}

/// Session-modulo stickiness: the trailing hex digits of the session cookie
/// are interpreted as an integer.
pub fn session_modulo_hash(headers: &HeaderMap, session_cookie: &str) -> u32 {
	let Some(value) = cookie_value(headers, session_cookie) else {
		return 0;
	};
	let tail: String = value
		.chars()
		.rev()
		.take_while(|c| c.is_ascii_hexdigit())
		.take(8)
		.collect::<Vec<_>>()
		.into_iter()
		.rev()
		.collect();
	if tail.is_empty() {
		return 0;
	}
	u32::from_str_radix(&tail, 16).unwrap_or(0)
}

/// JVM route stickiness: `JSESSIONID=<id>.<route>`; the member whose
/// `jvm_route` equals `<route>` is selected.
pub fn jvm_route_hash(headers: &HeaderMap, members: &[Member]) -> u32 {
	let Some(value) = cookie_value(headers, "JSESSIONID") else {
		return 0;
	};
	let Some((_, route)) = value.rsplit_once('.') else {
		return 0;
	};
	for (i, member) in members.iter().enumerate() {
		if member.jvm_route.as_deref() == Some(route) {
			// Return a hash that maps back onto index i under `hash % n`.
			return if i == 0 { members.len() as u32 } else { i as u32 };
		}
	}
	0
}

/// Picks a worker number for a new pinning cookie. Only returns numbers of
/// members that are not known to be failing; on total failure the random
/// starting point is returned anyway.
pub fn generate_cookie(failures: &FailureManager, now: Instant, members: &[Member]) -> u32 {
	debug_assert!(members.len() >= 2);
	let n = members.len() as u32;
	let first = rand::rng().random_range(1..=n);

	let mut i = first;
	loop {
		let address = members[(i % n) as usize].address;
		if failures.check(now, address, false) {
			return i;
		}
		i = i % n + 1;
		if i == first {
			// All nodes have failed.
			return first;
		}
	}
}
