mod gateway;
#[cfg(test)]
mod gateway_test;
pub mod httpproxy;
pub mod tcpproxy;

pub use gateway::Gateway;

use crate::http::{Body, Response, StatusCode};
use crate::*;

/// How long a backend address stays marked after an observed failure.
pub const FAILURE_DURATION: Duration = Duration::from_secs(20);

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("no Host header")]
	NoHost,
	#[error("malformed Host header")]
	MalformedHost,
	#[error("request URI too long")]
	UriTooLong,
	#[error("destination not found")]
	RouteNotFound,
	#[error("destination protocol mismatch")]
	WrongProtocol,
	#[error("no valid backends")]
	NoValidBackends,
	#[error("connect failed: {0}")]
	UpstreamConnect(anyhow::Error),
	#[error("upstream call failed: {0}")]
	UpstreamCallFailed(hyper::Error),
	#[error("request timeout")]
	RequestTimeout,
	#[error("request upgrade failed")]
	UpgradeFailed,
	#[error("processing failed: {0}")]
	Processing(anyhow::Error),
}

impl ProxyError {
	/// A connection-level problem, eligible for the cluster's fallback
	/// response.
	pub fn is_connect(&self) -> bool {
		matches!(self, ProxyError::UpstreamConnect(_))
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::NoHost | ProxyError::MalformedHost => StatusCode::BAD_REQUEST,
			ProxyError::UriTooLong => StatusCode::URI_TOO_LONG,
			ProxyError::RouteNotFound => StatusCode::NOT_FOUND,
			ProxyError::WrongProtocol => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::NoValidBackends => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamCallFailed(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpgradeFailed => StatusCode::BAD_GATEWAY,
			ProxyError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::Processing(_) => StatusCode::SERVICE_UNAVAILABLE,
		}
	}

	/// Synthesizes the user-visible response. By default only a short
	/// generic message is revealed; `verbose` serializes the error chain.
	pub fn as_response(&self, verbose: bool) -> Response {
		let status = self.status();
		let msg = if verbose {
			let mut msg = self.to_string();
			// Bounded: these bodies are diagnostics, not documents.
			msg.truncate(4096);
			msg
		} else {
			status
				.canonical_reason()
				.unwrap_or("Bad gateway")
				.to_string()
		};
		::http::Response::builder()
			.status(status)
			.header(crate::http::header::CONTENT_TYPE, "text/plain")
			.body(Body::from(msg))
			.expect("static response must build")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_statuses() {
		assert_eq!(ProxyError::NoHost.status(), StatusCode::BAD_REQUEST);
		assert_eq!(ProxyError::UriTooLong.status(), StatusCode::URI_TOO_LONG);
		assert_eq!(ProxyError::RouteNotFound.status(), StatusCode::NOT_FOUND);
		assert_eq!(
			ProxyError::RequestTimeout.status(),
			StatusCode::GATEWAY_TIMEOUT
		);
		assert_eq!(
			ProxyError::UpstreamConnect(anyhow::anyhow!("nope")).status(),
			StatusCode::BAD_GATEWAY
		);
	}

	#[test]
	fn verbose_response_reveals_detail() {
		let err = ProxyError::UpstreamConnect(anyhow::anyhow!("connection refused by 10.0.0.1"));
		let terse = err.as_response(false);
		let verbose = err.as_response(true);
		assert_eq!(terse.status(), verbose.status());
		// The terse body is the canonical reason only.
		assert!(err.is_connect());
		assert_eq!(terse.status(), StatusCode::BAD_GATEWAY);
	}
}
