//! Per-request mutable state owned by exactly one task at a time. Filters see
//! sequential access; nothing in here needs internal synchronization.

use std::collections::HashMap;

use crate::http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use crate::ratelimit;
use crate::types::route::{Params, Route};
use crate::*;

/// Keys filters and the proxy core use to talk to each other through the
/// state bag.
pub mod bag_keys {
	pub const RATELIMIT_SETTINGS: &str = "ratelimit.settings";
	pub const RATELIMIT_FAIL_CLOSED: &str = "ratelimit.fail-closed";
	pub const BACKEND_RATELIMIT: &str = "backend.ratelimit";
	pub const BACKEND_TIMEOUT: &str = "backend.timeout";
	pub const AUTH_USER: &str = "auth.user";
	pub const AUTH_REJECT_REASON: &str = "auth.reject-reason";
	pub const ACCESS_LOG_ENABLED: &str = "access-log.enabled";
	pub const ACCESS_LOG_PREFIXES: &str = "access-log.prefixes";
	pub const ACCESS_LOG_MASKED_QUERY: &str = "access-log.masked-query";
}

#[derive(Debug, Clone)]
pub enum BagValue {
	String(Strng),
	Bool(bool),
	Int(i64),
	Duration(Duration),
	StringList(Vec<Strng>),
	Ratelimit(ratelimit::Settings),
}

#[derive(Debug, Default)]
pub struct StateBag {
	entries: HashMap<Strng, BagValue>,
}

impl StateBag {
	pub fn set(&mut self, key: impl AsRef<str>, value: BagValue) {
		self.entries.insert(strng::new(key), value);
	}

	pub fn get(&self, key: &str) -> Option<&BagValue> {
		self.entries.get(key)
	}

	pub fn bool(&self, key: &str) -> Option<bool> {
		match self.get(key)? {
			BagValue::Bool(b) => Some(*b),
			_ => None,
		}
	}

	pub fn duration(&self, key: &str) -> Option<Duration> {
		match self.get(key)? {
			BagValue::Duration(d) => Some(*d),
			_ => None,
		}
	}

	pub fn ratelimit(&self, key: &str) -> Option<&ratelimit::Settings> {
		match self.get(key)? {
			BagValue::Ratelimit(s) => Some(s),
			_ => None,
		}
	}

	pub fn string(&self, key: &str) -> Option<&Strng> {
		match self.get(key)? {
			BagValue::String(s) => Some(s),
			_ => None,
		}
	}
}

/// Retained head of the request as it arrived, before any filter touched it.
#[derive(Debug, Clone)]
pub struct OriginalRequest {
	pub method: Method,
	pub uri: Uri,
	pub headers: HeaderMap,
}

pub struct RequestContext {
	/// The outgoing request; filters mutate this in place and the proxy
	/// rewrites the URI when forwarding.
	pub request: Request,
	pub original: OriginalRequest,
	/// Head of the request as it was sent upstream, captured at dispatch for
	/// the debug report.
	pub outgoing: Option<OriginalRequest>,
	pub peer_addr: Option<SocketAddr>,
	/// Backend response once obtained (or synthesized by a filter).
	pub response: Option<Response>,
	pub route: Option<Arc<Route>>,
	pub params: Params,
	/// Overrides the Host header sent upstream.
	pub outgoing_host: Option<Strng>,
	pub state_bag: StateBag,
	pub loop_counter: i32,
	/// A filter produced the final response; skip the backend and remaining
	/// request filters.
	pub served: bool,
	/// Filters replaced the backend; synthesize an empty response.
	pub shunted: bool,
	/// Names of the filters whose request hook ran, across loopback hops.
	pub filters_run: Vec<Strng>,
	/// Filter panics captured for the debug report.
	pub panics: Vec<String>,
}

impl RequestContext {
	pub fn new(request: Request, peer_addr: Option<SocketAddr>) -> RequestContext {
		let original = OriginalRequest {
			method: request.method().clone(),
			uri: request.uri().clone(),
			headers: request.headers().clone(),
		};
		RequestContext {
			request,
			original,
			outgoing: None,
			peer_addr,
			response: None,
			route: None,
			params: Params::new(),
			outgoing_host: None,
			state_bag: StateBag::default(),
			loop_counter: 0,
			served: false,
			shunted: false,
			filters_run: Vec::new(),
			panics: Vec::new(),
		}
	}

	/// Serve the response directly, short-circuiting the rest of the request
	/// chain and the backend.
	pub fn serve(&mut self, response: Response) {
		self.response = Some(response);
		self.served = true;
	}

	pub fn serve_status(&mut self, status: StatusCode) {
		self.serve(
			::http::Response::builder()
				.status(status)
				.body(http::empty_body())
				.expect("static response builds"),
		);
	}

	pub fn response_mut(&mut self) -> Option<&mut Response> {
		self.response.as_mut()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn serve_sets_short_circuit() {
		let req = ::http::Request::builder()
			.uri("http://h/x")
			.body(http::empty_body())
			.unwrap();
		let mut ctx = RequestContext::new(req, None);
		assert!(!ctx.served);
		ctx.serve_status(StatusCode::IM_A_TEAPOT);
		assert!(ctx.served);
		assert_eq!(
			ctx.response.as_ref().unwrap().status(),
			StatusCode::IM_A_TEAPOT
		);
	}

	#[test]
	fn bag_typed_accessors() {
		let mut bag = StateBag::default();
		bag.set(bag_keys::BACKEND_TIMEOUT, BagValue::Duration(Duration::from_secs(2)));
		bag.set(bag_keys::ACCESS_LOG_ENABLED, BagValue::Bool(false));
		assert_eq!(
			bag.duration(bag_keys::BACKEND_TIMEOUT),
			Some(Duration::from_secs(2))
		);
		assert_eq!(bag.bool(bag_keys::ACCESS_LOG_ENABLED), Some(false));
		assert_eq!(bag.bool(bag_keys::BACKEND_TIMEOUT), None);
	}
}
