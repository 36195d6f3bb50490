//! The routing decision tree.
//!
//! A listener's destination is a `Goto`; branches evaluate conditions over
//! request attributes in order and recurse into the first match, else the
//! fallback. Evaluation is pure, so retry paths may re-evaluate freely.

use std::net::IpAddr;

use thiserror::Error;

use crate::cluster::Cluster;
use crate::http::{HeaderMap, Method};
use crate::store::LbState;
use crate::types::{Attribute, Condition, Goto, Matcher, SimpleResponse};
use crate::*;

const MAX_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum RouteError {
	#[error("destination {0:?} does not exist")]
	UnknownDestination(Strng),
	#[error("routing loop detected")]
	TooDeep,
	#[error("destination protocol mismatch")]
	WrongProtocol,
}

/// Request attributes a condition may inspect.
pub struct RequestCtx<'a> {
	pub method: &'a Method,
	/// Path and query, as received.
	pub uri: &'a str,
	pub headers: &'a HeaderMap,
	pub remote: IpAddr,
	pub peer_subject: Option<&'a str>,
	pub peer_issuer_subject: Option<&'a str>,
}

pub enum Leaf {
	Response(SimpleResponse),
	Cluster(Arc<Cluster>),
	Metrics,
}

pub fn find_request_leaf(state: &LbState, root: &Goto, ctx: &RequestCtx) -> Result<Leaf, RouteError> {
	let mut current = root;
	for _ in 0..MAX_DEPTH {
		match current {
			Goto::Response(r) => return Ok(Leaf::Response(r.clone())),
			Goto::MetricsExporter => return Ok(Leaf::Metrics),
			Goto::Cluster(name) => {
				let cluster = state
					.clusters
					.get(name)
					.ok_or_else(|| RouteError::UnknownDestination(name.clone()))?;
				return Ok(Leaf::Cluster(cluster.clone()));
			},
			Goto::Branch(name) => {
				let branch = state
					.branches
					.get(name)
					.ok_or_else(|| RouteError::UnknownDestination(name.clone()))?;
				current = branch
					.cases
					.iter()
					.find(|case| matches(&case.condition, ctx))
					.map(|case| &case.destination)
					.unwrap_or(&branch.fallback);
			},
		}
	}
	Err(RouteError::TooDeep)
}

/// Leaf resolution for raw TCP connections: only the client address is known
/// at this point, so conditions over other attributes never match.
pub fn find_tcp_leaf(
	state: &LbState,
	root: &Goto,
	remote: IpAddr,
) -> Result<Arc<Cluster>, RouteError> {
	let mut current = root;
	for _ in 0..MAX_DEPTH {
		match current {
			Goto::Cluster(name) => {
				let cluster = state
					.clusters
					.get(name)
					.ok_or_else(|| RouteError::UnknownDestination(name.clone()))?;
				return Ok(cluster.clone());
			},
			Goto::Branch(name) => {
				let branch = state
					.branches
					.get(name)
					.ok_or_else(|| RouteError::UnknownDestination(name.clone()))?;
				current = branch
					.cases
					.iter()
					.find(|case| {
						case.condition.attribute == Attribute::RemoteAddress
							&& matches_value(&case.condition, &remote.to_string(), Some(remote))
					})
					.map(|case| &case.destination)
					.unwrap_or(&branch.fallback);
			},
			Goto::Response(_) | Goto::MetricsExporter => return Err(RouteError::WrongProtocol),
		}
	}
	Err(RouteError::TooDeep)
}

pub fn matches(condition: &Condition, ctx: &RequestCtx) -> bool {
	let (value, ip): (Option<std::borrow::Cow<str>>, Option<IpAddr>) = match &condition.attribute {
		Attribute::Method => (Some(ctx.method.as_str().into()), None),
		Attribute::Uri => (Some(ctx.uri.into()), None),
		Attribute::RemoteAddress => (Some(ctx.remote.to_string().into()), Some(ctx.remote)),
		Attribute::PeerSubject => (ctx.peer_subject.map(Into::into), None),
		Attribute::PeerIssuerSubject => (ctx.peer_issuer_subject.map(Into::into), None),
		Attribute::Header(name) => (
			ctx
				.headers
				.get(name.as_str())
				.and_then(|v| v.to_str().ok())
				.map(Into::into),
			None,
		),
	};
	let result = match value {
		None => false,
		Some(v) => matches_value(condition, &v, ip),
	};
	result != condition.negate
}

fn matches_value(condition: &Condition, value: &str, ip: Option<IpAddr>) -> bool {
	match &condition.matcher {
		Matcher::Equals(expected) => expected.as_str() == value,
		Matcher::Regex(re) => re.is_match(value),
		Matcher::Cidr(net) => ip.is_some_and(|ip| net.contains(&ip)),
	}
}
