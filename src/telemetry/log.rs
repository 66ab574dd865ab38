//! Logging bootstrap and the per-request access log event.

use tracing_subscriber::EnvFilter;

use crate::http::{Method, StatusCode};
use crate::proxy::context::{BagValue, RequestContext, bag_keys};
use crate::*;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(level: &str) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.init();
}

/// Everything the access log line needs, captured at response-head time and
/// emitted once the body finishes streaming.
#[derive(Debug)]
pub struct AccessLog {
	pub method: Method,
	pub path: String,
	pub query: String,
	pub route: Strng,
	pub peer: Option<SocketAddr>,
	pub status: StatusCode,
	pub start: Instant,
}

impl AccessLog {
	/// `None` when a filter suppressed the line through the state bag,
	/// possibly scoped to status prefixes (e.g. `1`, `301`, `40`).
	pub fn build(ctx: &RequestContext, status: StatusCode, start: Instant) -> Option<AccessLog> {
		if let Some(false) = ctx.state_bag.bool(bag_keys::ACCESS_LOG_ENABLED) {
			let suppressed = match ctx.state_bag.get(bag_keys::ACCESS_LOG_PREFIXES) {
				Some(BagValue::StringList(prefixes)) => {
					let code = status.as_u16().to_string();
					prefixes.iter().any(|p| code.starts_with(p.as_str()))
				},
				// No prefix scoping: every status is suppressed.
				_ => true,
			};
			if suppressed {
				return None;
			}
		}
		let query = match ctx.state_bag.get(bag_keys::ACCESS_LOG_MASKED_QUERY) {
			Some(BagValue::StringList(masked)) => mask_query(ctx.original.uri.query(), masked),
			_ => ctx.original.uri.query().unwrap_or("").to_string(),
		};
		Some(AccessLog {
			method: ctx.original.method.clone(),
			path: ctx.original.uri.path().to_string(),
			query,
			route: ctx
				.route
				.as_ref()
				.map(|r| r.id.clone())
				.unwrap_or_default(),
			peer: ctx.peer_addr,
			status,
			start,
		})
	}

	pub fn emit(&self) {
		tracing::event!(
			target: "access",
			tracing::Level::INFO,
			method = %self.method,
			path = %self.path,
			query = %self.query,
			status = self.status.as_u16(),
			route = self.route.as_str(),
			peer = self.peer.map(|p| p.to_string()).unwrap_or_default(),
			duration_ms = self.start.elapsed().as_millis() as u64,
		);
	}
}

fn mask_query(query: Option<&str>, masked: &[Strng]) -> String {
	let Some(query) = query else {
		return String::new();
	};
	query
		.split('&')
		.map(|kv| {
			let key = kv.split('=').next().unwrap_or(kv);
			if masked.iter().any(|m| m.as_str() == key) {
				format!("{key}=*")
			} else {
				kv.to_string()
			}
		})
		.collect::<Vec<_>>()
		.join("&")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn masking_replaces_only_listed_keys() {
		let masked = vec![strng::literal!("token")];
		assert_eq!(
			mask_query(Some("a=1&token=secret&b=2"), &masked),
			"a=1&token=*&b=2"
		);
		assert_eq!(mask_query(None, &masked), "");
	}

	#[test]
	fn suppression_respects_status_prefixes() {
		let req = ::http::Request::builder()
			.uri("http://h/x")
			.body(http::empty_body())
			.unwrap();
		let mut ctx = RequestContext::new(req, None);
		ctx
			.state_bag
			.set(bag_keys::ACCESS_LOG_ENABLED, BagValue::Bool(false));
		ctx.state_bag.set(
			bag_keys::ACCESS_LOG_PREFIXES,
			BagValue::StringList(vec![strng::literal!("30")]),
		);
		let start = Instant::now();
		assert!(AccessLog::build(&ctx, StatusCode::MOVED_PERMANENTLY, start).is_none());
		assert!(AccessLog::build(&ctx, StatusCode::OK, start).is_some());
	}
}
