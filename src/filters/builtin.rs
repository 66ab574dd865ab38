//! Builtin filters: response shaping, header manipulation, host and timeout
//! policy, and the rate-limit family.

use crate::http::{HeaderName, HeaderValue, StatusCode};
use crate::proxy::context::{BagValue, RequestContext, bag_keys};
use crate::ratelimit::{Lookuper, RatelimitType, Settings};
use crate::types::value::{ArgError, Value, arg, expect_args};
use crate::*;

use super::{BuildContext, Filter, FilterSpec};

pub fn all() -> Vec<Arc<dyn FilterSpec>> {
	vec![
		Arc::new(StatusSpec),
		Arc::new(InlineContentSpec),
		Arc::new(RedirectToSpec),
		Arc::new(SetPathSpec),
		Arc::new(SetRequestHeaderSpec),
		Arc::new(DropRequestHeaderSpec),
		Arc::new(SetResponseHeaderSpec),
		Arc::new(AppendResponseHeaderSpec),
		Arc::new(PreserveHostSpec),
		Arc::new(BackendTimeoutSpec),
		Arc::new(FailClosedSpec),
		Arc::new(ShuntSpec),
		Arc::new(DisableAccessLogSpec),
		Arc::new(MaskAccessLogQuerySpec),
		Arc::new(RatelimitSpec),
		Arc::new(ClientRatelimitSpec),
		Arc::new(ClusterRatelimitSpec),
		Arc::new(ClusterClientRatelimitSpec),
		Arc::new(BackendRatelimitSpec),
		Arc::new(LeakyBucketRatelimitSpec),
	]
}

fn parse_header_pair(args: &[Value]) -> Result<(HeaderName, HeaderValue), ArgError> {
	expect_args(args, 2)?;
	let name = args[0]
		.as_str(0)?
		.parse::<HeaderName>()
		.map_err(|e| ArgError::Invalid {
			index: 0,
			reason: e.to_string(),
		})?;
	let value = args[1]
		.as_str(1)?
		.parse::<HeaderValue>()
		.map_err(|e| ArgError::Invalid {
			index: 1,
			reason: e.to_string(),
		})?;
	Ok((name, value))
}

/// `status(503)`: overrides the response status.
struct StatusSpec;

struct Status(StatusCode);

impl FilterSpec for StatusSpec {
	fn name(&self) -> Strng {
		strng::literal!("status")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		expect_args(args, 1)?;
		let code = args[0].as_int(0)?;
		let status =
			StatusCode::from_u16(u16::try_from(code).map_err(|_| ArgError::Invalid {
				index: 0,
				reason: format!("status {code} out of range"),
			})?)
			.map_err(|e| ArgError::Invalid {
				index: 0,
				reason: e.to_string(),
			})?;
		Ok(Arc::new(Status(status)))
	}
}

impl Filter for Status {
	fn response(&self, ctx: &mut RequestContext) {
		if let Some(resp) = ctx.response_mut() {
			*resp.status_mut() = self.0;
		}
	}
}

/// `inlineContent("body"[, "text/plain"])`: serves the given body directly.
struct InlineContentSpec;

struct InlineContent {
	body: Bytes,
	content_type: HeaderValue,
}

impl FilterSpec for InlineContentSpec {
	fn name(&self) -> Strng {
		strng::literal!("inlineContent")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		if args.is_empty() || args.len() > 2 {
			return Err(ArgError::Arity {
				expected: 1,
				got: args.len(),
			});
		}
		let body = Bytes::copy_from_slice(args[0].as_str(0)?.as_bytes());
		let content_type = match args.get(1) {
			Some(v) => v.as_str(1)?.parse().map_err(|_| ArgError::Invalid {
				index: 1,
				reason: "invalid content type".to_string(),
			})?,
			None => HeaderValue::from_static("text/plain; charset=utf-8"),
		};
		Ok(Arc::new(InlineContent { body, content_type }))
	}
}

impl Filter for InlineContent {
	fn request(&self, ctx: &mut RequestContext) {
		ctx.serve(
			::http::Response::builder()
				.status(StatusCode::OK)
				.header(http::header::CONTENT_TYPE, self.content_type.clone())
				.body(http::full_body(self.body.clone()))
				.expect("static response builds"),
		);
	}
}

/// `redirectTo(308, "https://example.org/base")`.
struct RedirectToSpec;

struct RedirectTo {
	status: StatusCode,
	location: HeaderValue,
}

impl FilterSpec for RedirectToSpec {
	fn name(&self) -> Strng {
		strng::literal!("redirectTo")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		expect_args(args, 2)?;
		let code = args[0].as_int(0)?;
		let status = StatusCode::from_u16(code as u16).map_err(|e| ArgError::Invalid {
			index: 0,
			reason: e.to_string(),
		})?;
		if !status.is_redirection() {
			return Err(ArgError::Invalid {
				index: 0,
				reason: format!("{status} is not a redirect status"),
			});
		}
		let location = args[1].as_str(1)?.parse().map_err(|_| ArgError::Invalid {
			index: 1,
			reason: "invalid location".to_string(),
		})?;
		Ok(Arc::new(RedirectTo { status, location }))
	}
}

impl Filter for RedirectTo {
	fn request(&self, ctx: &mut RequestContext) {
		ctx.serve(
			::http::Response::builder()
				.status(self.status)
				.header(http::header::LOCATION, self.location.clone())
				.body(http::empty_body())
				.expect("static response builds"),
		);
	}
}

/// `setPath("/new/path")`: rewrites the outgoing path, keeping the query.
struct SetPathSpec;

struct SetPath(String);

impl FilterSpec for SetPathSpec {
	fn name(&self) -> Strng {
		strng::literal!("setPath")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		expect_args(args, 1)?;
		Ok(Arc::new(SetPath(args[0].as_str(0)?.to_string())))
	}
}

impl Filter for SetPath {
	fn request(&self, ctx: &mut RequestContext) {
		let path = self.0.clone();
		let res = http::modify_req_uri(&mut ctx.request, |parts| {
			let pq = match parts.path_and_query.as_ref().and_then(|pq| pq.query()) {
				Some(q) => format!("{path}?{q}"),
				None => path,
			};
			parts.path_and_query = Some(pq.parse()?);
			Ok(())
		});
		if let Err(e) = res {
			debug!("setPath failed: {e}");
		}
	}
}

struct SetRequestHeaderSpec;

struct SetRequestHeader(HeaderName, HeaderValue);

impl FilterSpec for SetRequestHeaderSpec {
	fn name(&self) -> Strng {
		strng::literal!("setRequestHeader")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		let (n, v) = parse_header_pair(args)?;
		Ok(Arc::new(SetRequestHeader(n, v)))
	}
}

impl Filter for SetRequestHeader {
	fn request(&self, ctx: &mut RequestContext) {
		ctx.request.headers_mut().insert(self.0.clone(), self.1.clone());
	}
}

struct DropRequestHeaderSpec;

struct DropRequestHeader(HeaderName);

impl FilterSpec for DropRequestHeaderSpec {
	fn name(&self) -> Strng {
		strng::literal!("dropRequestHeader")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		expect_args(args, 1)?;
		let name = args[0]
			.as_str(0)?
			.parse::<HeaderName>()
			.map_err(|e| ArgError::Invalid {
				index: 0,
				reason: e.to_string(),
			})?;
		Ok(Arc::new(DropRequestHeader(name)))
	}
}

impl Filter for DropRequestHeader {
	fn request(&self, ctx: &mut RequestContext) {
		ctx.request.headers_mut().remove(&self.0);
	}
}

struct SetResponseHeaderSpec;

struct SetResponseHeader(HeaderName, HeaderValue);

impl FilterSpec for SetResponseHeaderSpec {
	fn name(&self) -> Strng {
		strng::literal!("setResponseHeader")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		let (n, v) = parse_header_pair(args)?;
		Ok(Arc::new(SetResponseHeader(n, v)))
	}
}

impl Filter for SetResponseHeader {
	fn response(&self, ctx: &mut RequestContext) {
		if let Some(resp) = ctx.response_mut() {
			resp.headers_mut().insert(self.0.clone(), self.1.clone());
		}
	}
}

struct AppendResponseHeaderSpec;

struct AppendResponseHeader(HeaderName, HeaderValue);

impl FilterSpec for AppendResponseHeaderSpec {
	fn name(&self) -> Strng {
		strng::literal!("appendResponseHeader")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		let (n, v) = parse_header_pair(args)?;
		Ok(Arc::new(AppendResponseHeader(n, v)))
	}
}

impl Filter for AppendResponseHeader {
	fn response(&self, ctx: &mut RequestContext) {
		if let Some(resp) = ctx.response_mut() {
			resp.headers_mut().append(self.0.clone(), self.1.clone());
		}
	}
}

/// `preserveHost("true")`: forward the client's Host header instead of the
/// backend authority.
struct PreserveHostSpec;

struct PreserveHost(bool);

impl FilterSpec for PreserveHostSpec {
	fn name(&self) -> Strng {
		strng::literal!("preserveHost")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		expect_args(args, 1)?;
		let on = match args[0].as_str(0)? {
			"true" => true,
			"false" => false,
			other => {
				return Err(ArgError::Invalid {
					index: 0,
					reason: format!("expected \"true\" or \"false\", got {other:?}"),
				});
			},
		};
		Ok(Arc::new(PreserveHost(on)))
	}
}

impl Filter for PreserveHost {
	fn request(&self, ctx: &mut RequestContext) {
		if self.0 {
			if let Some(host) = ctx.original.uri.host() {
				ctx.outgoing_host = Some(strng::new(host));
			}
		} else {
			ctx.outgoing_host = None;
		}
	}
}

/// `backendTimeout("2s")`: per-request override for the backend deadline.
struct BackendTimeoutSpec;

struct BackendTimeout(Duration);

impl FilterSpec for BackendTimeoutSpec {
	fn name(&self) -> Strng {
		strng::literal!("backendTimeout")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		expect_args(args, 1)?;
		Ok(Arc::new(BackendTimeout(args[0].as_duration(0)?)))
	}
}

impl Filter for BackendTimeout {
	fn request(&self, ctx: &mut RequestContext) {
		// Zero means "no override".
		if !self.0.is_zero() {
			ctx
				.state_bag
				.set(bag_keys::BACKEND_TIMEOUT, BagValue::Duration(self.0));
		}
	}
}

/// Marker: rate limiters later in this chain deny when their backend is
/// unreachable instead of admitting.
struct FailClosedSpec;

struct FailClosed;

impl FilterSpec for FailClosedSpec {
	fn name(&self) -> Strng {
		strng::literal!("failClosed")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		expect_args(args, 0)?;
		Ok(Arc::new(FailClosed))
	}
}

impl Filter for FailClosed {
	fn request(&self, ctx: &mut RequestContext) {
		ctx
			.state_bag
			.set(bag_keys::RATELIMIT_FAIL_CLOSED, BagValue::Bool(true));
	}
}

/// Replace the backend with an empty response, keeping the filter chain.
struct ShuntSpec;

struct Shunt;

impl FilterSpec for ShuntSpec {
	fn name(&self) -> Strng {
		strng::literal!("shunt")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		expect_args(args, 0)?;
		Ok(Arc::new(Shunt))
	}
}

impl Filter for Shunt {
	fn request(&self, ctx: &mut RequestContext) {
		ctx.shunted = true;
	}
}

struct DisableAccessLogSpec;

struct DisableAccessLog(Vec<Strng>);

impl FilterSpec for DisableAccessLogSpec {
	fn name(&self) -> Strng {
		strng::literal!("disableAccessLog")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		// Optional status prefixes, e.g. disableAccessLog(1, 301, 40).
		let prefixes = args
			.iter()
			.enumerate()
			.map(|(i, v)| v.as_int(i).map(|n| strng::format!("{n}")))
			.collect::<Result<Vec<_>, _>>()?;
		Ok(Arc::new(DisableAccessLog(prefixes)))
	}
}

impl Filter for DisableAccessLog {
	fn request(&self, ctx: &mut RequestContext) {
		ctx
			.state_bag
			.set(bag_keys::ACCESS_LOG_ENABLED, BagValue::Bool(false));
		if !self.0.is_empty() {
			ctx.state_bag.set(
				bag_keys::ACCESS_LOG_PREFIXES,
				BagValue::StringList(self.0.clone()),
			);
		}
	}
}

struct MaskAccessLogQuerySpec;

struct MaskAccessLogQuery(Vec<Strng>);

impl FilterSpec for MaskAccessLogQuerySpec {
	fn name(&self) -> Strng {
		strng::literal!("maskAccessLogQuery")
	}
	fn create(&self, args: &[Value], _b: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		if args.is_empty() {
			return Err(ArgError::Arity {
				expected: 1,
				got: 0,
			});
		}
		let names = args
			.iter()
			.enumerate()
			.map(|(i, v)| v.as_str(i).map(strng::new))
			.collect::<Result<Vec<_>, _>>()?;
		Ok(Arc::new(MaskAccessLogQuery(names)))
	}
}

impl Filter for MaskAccessLogQuery {
	fn request(&self, ctx: &mut RequestContext) {
		ctx.state_bag.set(
			bag_keys::ACCESS_LOG_MASKED_QUERY,
			BagValue::StringList(self.0.clone()),
		);
	}
}

// ---- rate limit family -----------------------------------------------------

/// Shared body of every rate-limit filter: record the settings in the state
/// bag; the proxy consults them before dispatch.
struct RecordRatelimit {
	key: &'static str,
	settings: Settings,
}

impl Filter for RecordRatelimit {
	fn request(&self, ctx: &mut RequestContext) {
		ctx
			.state_bag
			.set(self.key, BagValue::Ratelimit(self.settings.clone()));
		if self.settings.fail_closed {
			ctx
				.state_bag
				.set(bag_keys::RATELIMIT_FAIL_CLOSED, BagValue::Bool(true));
		}
	}
}

fn ratelimit_filter(
	kind: RatelimitType,
	group: Strng,
	max_hits: i64,
	window: Duration,
	lookuper: Lookuper,
	bctx: &BuildContext,
	key: &'static str,
) -> Result<Arc<dyn Filter>, ArgError> {
	if max_hits <= 0 {
		return Err(ArgError::Invalid {
			index: 0,
			reason: "max hits must be positive".to_string(),
		});
	}
	let settings = Settings {
		kind,
		group,
		max_hits: max_hits as u64,
		time_window: window,
		lookuper,
		fail_closed: bctx.fail_closed,
		..Settings::disabled()
	};
	Ok(Arc::new(RecordRatelimit { key, settings }))
}

/// `ratelimit(20, "1s")`: per-instance limit over all requests of the route.
struct RatelimitSpec;

impl FilterSpec for RatelimitSpec {
	fn name(&self) -> Strng {
		strng::literal!("ratelimit")
	}
	fn create(&self, args: &[Value], bctx: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		expect_args(args, 2)?;
		ratelimit_filter(
			RatelimitType::LocalService,
			Strng::default(),
			args[0].as_int(0)?,
			args[1].as_duration(1)?,
			Lookuper::SameBucket,
			bctx,
			bag_keys::RATELIMIT_SETTINGS,
		)
	}
}

/// `clientRatelimit(10, "1m"[, "X-Forwarded-User"])`: per-instance limit
/// keyed by client IP or a header.
struct ClientRatelimitSpec;

impl FilterSpec for ClientRatelimitSpec {
	fn name(&self) -> Strng {
		strng::literal!("clientRatelimit")
	}
	fn create(&self, args: &[Value], bctx: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		if args.len() < 2 || args.len() > 3 {
			return Err(ArgError::Arity {
				expected: 2,
				got: args.len(),
			});
		}
		let lookuper = match args.get(2) {
			Some(v) => Lookuper::Header(strng::new(v.as_str(2)?)),
			None => Lookuper::ClientIp,
		};
		ratelimit_filter(
			RatelimitType::LocalClient,
			Strng::default(),
			args[0].as_int(0)?,
			args[1].as_duration(1)?,
			lookuper,
			bctx,
			bag_keys::RATELIMIT_SETTINGS,
		)
	}
}

/// `clusterRatelimit("group", 200, "1m")`.
struct ClusterRatelimitSpec;

impl FilterSpec for ClusterRatelimitSpec {
	fn name(&self) -> Strng {
		strng::literal!("clusterRatelimit")
	}
	fn create(&self, args: &[Value], bctx: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		expect_args(args, 3)?;
		ratelimit_filter(
			RatelimitType::ClusterService,
			strng::new(args[0].as_str(0)?),
			args[1].as_int(1)?,
			args[2].as_duration(2)?,
			Lookuper::SameBucket,
			bctx,
			bag_keys::RATELIMIT_SETTINGS,
		)
	}
}

/// `clusterClientRatelimit("group", 10, "1m"[, "Authorization"])`.
struct ClusterClientRatelimitSpec;

impl FilterSpec for ClusterClientRatelimitSpec {
	fn name(&self) -> Strng {
		strng::literal!("clusterClientRatelimit")
	}
	fn create(&self, args: &[Value], bctx: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		if args.len() < 3 || args.len() > 4 {
			return Err(ArgError::Arity {
				expected: 3,
				got: args.len(),
			});
		}
		let lookuper = match args.get(3) {
			Some(v) => {
				let name = v.as_str(3)?;
				if name.eq_ignore_ascii_case("authorization") {
					Lookuper::Authorization
				} else {
					Lookuper::Header(strng::new(name))
				}
			},
			None => Lookuper::ClientIp,
		};
		ratelimit_filter(
			RatelimitType::ClusterClient,
			strng::new(args[0].as_str(0)?),
			args[1].as_int(1)?,
			args[2].as_duration(2)?,
			lookuper,
			bctx,
			bag_keys::RATELIMIT_SETTINGS,
		)
	}
}

/// `backendRatelimit(100, "1s")`: protects the backend; exceeding it serves
/// 503 without contacting the backend.
struct BackendRatelimitSpec;

impl FilterSpec for BackendRatelimitSpec {
	fn name(&self) -> Strng {
		strng::literal!("backendRatelimit")
	}
	fn create(&self, args: &[Value], bctx: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		expect_args(args, 2)?;
		ratelimit_filter(
			RatelimitType::LocalService,
			Strng::default(),
			args[0].as_int(0)?,
			args[1].as_duration(1)?,
			Lookuper::SameBucket,
			bctx,
			bag_keys::BACKEND_RATELIMIT,
		)
	}
}

/// `leakyBucketRatelimit("group", 5, "1s", 5, 1)`: capacity, leak period,
/// leak volume, increment.
struct LeakyBucketRatelimitSpec;

impl FilterSpec for LeakyBucketRatelimitSpec {
	fn name(&self) -> Strng {
		strng::literal!("leakyBucketRatelimit")
	}
	fn create(&self, args: &[Value], bctx: &BuildContext) -> Result<Arc<dyn Filter>, ArgError> {
		expect_args(args, 5)?;
		let capacity = args[1].as_int(1)?;
		let leak_period = args[2].as_duration(2)?;
		let leak_volume = args[3].as_int(3)?;
		let increment = args[4].as_int(4)?;
		if capacity <= 0 || leak_volume <= 0 || increment <= 0 {
			return Err(ArgError::Invalid {
				index: 1,
				reason: "capacity, volume and increment must be positive".to_string(),
			});
		}
		let settings = Settings {
			kind: RatelimitType::LeakyBucket,
			group: strng::new(args[0].as_str(0)?),
			max_hits: leak_volume as u64,
			time_window: leak_period,
			lookuper: Lookuper::ClientIp,
			capacity: capacity as u64,
			increment: increment as u64,
			fail_closed: bctx.fail_closed,
			..Settings::disabled()
		};
		Ok(Arc::new(RecordRatelimit {
			key: bag_keys::RATELIMIT_SETTINGS,
			settings,
		}))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::filters::FilterRegistry;
	use crate::proxy::context::RequestContext;

	fn ctx() -> RequestContext {
		let req = ::http::Request::builder()
			.uri("http://client.example/x?q=1")
			.header("host", "client.example")
			.body(http::empty_body())
			.unwrap();
		RequestContext::new(req, None)
	}

	fn create(name: &str, args: &[Value]) -> Arc<dyn Filter> {
		FilterRegistry::with_defaults()
			.create(name, args, &BuildContext::default())
			.unwrap()
	}

	#[test]
	fn inline_content_serves() {
		let f = create("inlineContent", &[Value::String("hello".into())]);
		let mut c = ctx();
		f.request(&mut c);
		assert!(c.served);
		assert_eq!(c.response.unwrap().status(), StatusCode::OK);
	}

	#[test]
	fn set_path_keeps_query() {
		let f = create("setPath", &[Value::String("/rewritten".into())]);
		let mut c = ctx();
		f.request(&mut c);
		assert_eq!(c.request.uri().path(), "/rewritten");
		assert_eq!(c.request.uri().query(), Some("q=1"));
	}

	#[test]
	fn backend_timeout_zero_means_no_override() {
		let mut c = ctx();
		create("backendTimeout", &[Value::Int(0)]).request(&mut c);
		assert!(c.state_bag.duration(bag_keys::BACKEND_TIMEOUT).is_none());
		create("backendTimeout", &[Value::String("2s".into())]).request(&mut c);
		assert_eq!(
			c.state_bag.duration(bag_keys::BACKEND_TIMEOUT),
			Some(Duration::from_secs(2))
		);
	}

	#[test]
	fn ratelimit_records_settings_in_bag() {
		let f = create(
			"clusterClientRatelimit",
			&[
				Value::String("api".into()),
				Value::Int(10),
				Value::String("1m".into()),
			],
		);
		let mut c = ctx();
		f.request(&mut c);
		let s = c.state_bag.ratelimit(bag_keys::RATELIMIT_SETTINGS).unwrap();
		assert_eq!(s.kind, RatelimitType::ClusterClient);
		assert_eq!(s.max_hits, 10);
		assert_eq!(s.time_window, Duration::from_secs(60));
		assert_eq!(s.group.as_str(), "api");
	}

	#[test]
	fn fail_closed_marker_taints_later_limits() {
		let reg = FilterRegistry::with_defaults();
		let mut bctx = BuildContext::default();
		// The builder flips the flag when it walks past the marker.
		let _marker = reg.create("failClosed", &[], &bctx).unwrap();
		bctx.fail_closed = true;
		let limit = reg
			.create(
				"clusterRatelimit",
				&[
					Value::String("g".into()),
					Value::Int(5),
					Value::String("1s".into()),
				],
				&bctx,
			)
			.unwrap();
		let mut c = ctx();
		limit.request(&mut c);
		assert!(
			c.state_bag
				.ratelimit(bag_keys::RATELIMIT_SETTINGS)
				.unwrap()
				.fail_closed
		);
	}

	#[test]
	fn shunt_flags_context() {
		let mut c = ctx();
		create("shunt", &[]).request(&mut c);
		assert!(c.shunted);
		assert!(!c.served);
	}
}
