pub mod context;
pub mod debug;
pub mod engine;
pub mod server;
pub mod stream;

use crate::http::{Response, StatusCode, x_headers};
use crate::*;

pub const SERVER_NAME: &str = "Skipper";

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("route not found")]
	RouteNotFound,
	#[error("max loopbacks reached")]
	MaxLoopbacks,
	#[error("circuit breaker open")]
	CircuitOpen,
	#[error("backend call failed: {0}")]
	BackendNetwork(String),
	#[error("backend timeout")]
	BackendTimeout,
	#[error("client cancelled")]
	ClientCancelled,
	#[error("rate limited")]
	RateLimited {
		status: StatusCode,
		retry_after_seconds: u64,
		group: Strng,
	},
	#[error("no healthy endpoints")]
	NoHealthyEndpoints,
	#[error("invalid request")]
	InvalidRequest,
	#[error("processing failed: {0}")]
	Processing(anyhow::Error),
}

impl ProxyError {
	/// Counter label for the failure taxonomy.
	pub fn kind(&self) -> &'static str {
		match self {
			ProxyError::RouteNotFound => "route_not_found",
			ProxyError::MaxLoopbacks => "max_loopbacks",
			ProxyError::CircuitOpen => "circuit_open",
			ProxyError::BackendNetwork(_) => "backend_network",
			ProxyError::BackendTimeout => "backend_timeout",
			ProxyError::ClientCancelled => "client_cancelled",
			ProxyError::RateLimited { .. } => "rate_limited",
			ProxyError::NoHealthyEndpoints => "no_healthy_endpoints",
			ProxyError::InvalidRequest => "invalid_request",
			ProxyError::Processing(_) => "processing",
		}
	}

	/// Client-visible response. Bodies never leak internal error text.
	pub fn into_response(self) -> Response {
		let status = match &self {
			ProxyError::RouteNotFound => StatusCode::NOT_FOUND,
			ProxyError::MaxLoopbacks => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::BackendNetwork(_) => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
			// Non-standard but widely understood "client closed request".
			ProxyError::ClientCancelled => StatusCode::from_u16(499).expect("status in range"),
			ProxyError::RateLimited { status, .. } => *status,
			ProxyError::NoHealthyEndpoints => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::InvalidRequest => StatusCode::BAD_REQUEST,
			ProxyError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		let mut rb = ::http::Response::builder().status(status);
		match &self {
			ProxyError::CircuitOpen => {
				rb = rb.header(x_headers::X_CIRCUIT_OPEN, "true");
			},
			ProxyError::RateLimited {
				retry_after_seconds,
				group,
				..
			} => {
				rb = rb.header(http::header::RETRY_AFTER, retry_after_seconds.to_string());
				if !group.is_empty() {
					rb = rb.header(x_headers::X_RATE_LIMIT, group.as_str());
				}
			},
			_ => {},
		}
		rb.body(http::full_body(status.canonical_reason().unwrap_or("")))
			.expect("static response builds")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rate_limited_response_carries_retry_after() {
		let e = ProxyError::RateLimited {
			status: StatusCode::TOO_MANY_REQUESTS,
			retry_after_seconds: 7,
			group: strng::literal!("api"),
		};
		let resp = e.into_response();
		assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(resp.headers()[http::header::RETRY_AFTER], "7");
		assert_eq!(resp.headers()[x_headers::X_RATE_LIMIT], "api");
	}

	#[test]
	fn circuit_open_is_flagged() {
		let resp = ProxyError::CircuitOpen.into_response();
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(resp.headers()[x_headers::X_CIRCUIT_OPEN], "true");
	}

	#[test]
	fn internal_text_does_not_leak() {
		let resp = ProxyError::Processing(anyhow::anyhow!("secret detail")).into_response();
		assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
	}
}
