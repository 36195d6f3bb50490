//! Structured access logging.

use std::net::SocketAddr;
use std::time::Instant;

use tidegate_core::strng::Strng;
use tracing::event;

use crate::http::{Method, StatusCode};

/// Collected along the request path and emitted once the response is ready.
#[derive(Debug)]
pub struct RequestLog {
	pub listener: Strng,
	pub peer: SocketAddr,
	pub start: Instant,
	pub method: Option<Method>,
	pub host: Option<String>,
	pub path: Option<String>,
	pub destination: Option<Strng>,
	/// The backend address the request was ultimately sent to.
	pub forwarded_to: Option<SocketAddr>,
	pub status: Option<StatusCode>,
	pub error: Option<String>,
	pub tag: Option<Strng>,
	/// Suppress entries for non-error responses.
	pub only_errors: bool,
}

impl RequestLog {
	pub fn new(listener: Strng, peer: SocketAddr, only_errors: bool, tag: Option<Strng>) -> Self {
		RequestLog {
			listener,
			peer,
			start: Instant::now(),
			method: None,
			host: None,
			path: None,
			destination: None,
			forwarded_to: None,
			status: None,
			error: None,
			tag,
			only_errors,
		}
	}

	pub fn emit(self) {
		let is_error = self.error.is_some()
			|| self
				.status
				.map(|s| s.is_server_error())
				.unwrap_or(true);
		if self.only_errors && !is_error {
			return;
		}
		let duration = format!("{}ms", self.start.elapsed().as_millis());
		event!(
			target: "access",
			parent: None,
			tracing::Level::INFO,

			listener = %self.listener,
			peer = %self.peer,
			tag = self.tag.as_deref(),

			http.method = self.method.as_ref().map(|m| m.as_str()),
			http.host = self.host.as_deref(),
			http.path = self.path.as_deref(),
			http.status = self.status.map(|s| s.as_u16()),

			destination = self.destination.as_deref(),
			forwarded_to = self.forwarded_to.map(tracing::field::display),
			error = self.error.as_deref(),

			duration = duration,
		);
	}
}
