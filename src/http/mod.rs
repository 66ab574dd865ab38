pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub use ::http::uri::{Authority, Scheme};
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};
use http_body_util::{BodyExt, Empty, Full};

use crate::*;

pub mod x_headers {
	use http::HeaderName;

	pub const X_POWERED_BY: HeaderName = HeaderName::from_static("x-powered-by");
	pub const X_CIRCUIT_OPEN: HeaderName = HeaderName::from_static("x-circuit-open");
	pub const X_RATE_LIMIT: HeaderName = HeaderName::from_static("x-rate-limit");
}

pub fn empty_body() -> Body {
	Empty::new().map_err(|e| match e {}).boxed_unsync()
}

pub fn full_body(data: impl Into<Bytes>) -> Body {
	Full::new(data.into()).map_err(|e| match e {}).boxed_unsync()
}

pub fn modify_req_uri(
	req: &mut Request,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let mut parts = std::mem::take(req.uri_mut()).into_parts();
	f(&mut parts)?;
	*req.uri_mut() = Uri::from_parts(parts)?;
	Ok(())
}

/// Host of the request, without port. Expects a normalized request, so the
/// authority is always present in the URI.
pub fn get_host(req: &Request) -> Option<&str> {
	req.uri().host().map(strip_port)
}

/// Lowercases, strips the port and a trailing dot. Host comparisons all run on
/// the patched form.
pub fn normalize_host(host: &str) -> String {
	let host = strip_port(host);
	host.trim_end_matches('.').to_ascii_lowercase()
}

fn strip_port(auth: &str) -> &str {
	let host_port = auth
		.rsplit('@')
		.next()
		.expect("split always has at least 1 item");
	if host_port.as_bytes().first() == Some(&b'[') {
		match host_port.find(']') {
			Some(i) => &host_port[0..i + 1],
			None => host_port,
		}
	} else {
		host_port
			.split(':')
			.next()
			.expect("split always has at least 1 item")
	}
}

/// Client IP for rate-limit keys and consistent hashing: first entry of
/// `X-Forwarded-For` when present, else the peer address.
pub fn client_ip(req: &Request, peer: Option<SocketAddr>) -> Option<IpAddr> {
	if let Some(xff) = req.headers().get("x-forwarded-for")
		&& let Ok(s) = xff.to_str()
		&& let Some(first) = s.split(',').next()
		&& let Ok(ip) = first.trim().parse::<IpAddr>()
	{
		return Some(ip);
	}
	peer.map(|p| p.ip())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn host_patching() {
		assert_eq!(normalize_host("Example.COM:8080"), "example.com");
		assert_eq!(normalize_host("example.com."), "example.com");
		assert_eq!(normalize_host("[::1]:443"), "[::1]");
	}

	#[test]
	fn client_ip_prefers_forwarded_for() {
		let req = ::http::Request::builder()
			.uri("http://example.com/")
			.header("x-forwarded-for", "10.0.0.1, 192.168.0.1")
			.body(empty_body())
			.unwrap();
		let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
		assert_eq!(
			client_ip(&req, Some(peer)),
			Some("10.0.0.1".parse().unwrap())
		);
	}
}
