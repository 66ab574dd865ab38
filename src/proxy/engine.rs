//! The per-request state machine: lookup, request filters, dispatch (with
//! loopback iteration, breaker and rate-limit gates), response filters in
//! reverse, and the streaming copy back to the client.

use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;

use crate::breaker::BreakerRegistry;
use crate::client::Client;
use crate::config::ProxyConfig;
use crate::filters::Filter;
use crate::http::{
	Authority, Body, HeaderValue, Request, Response, Scheme, StatusCode, Uri, header, x_headers,
};
use crate::lb::LbContext;
use crate::proxy::context::{RequestContext, bag_keys};
use crate::proxy::stream::{InflightGuard, StreamBody};
use crate::proxy::{ProxyError, SERVER_NAME, debug as debug_mode};
use crate::ratelimit::RatelimitRegistry;
use crate::routing::{RoutingHandle, STARTUP_WAIT};
use crate::telemetry::log::AccessLog;
use crate::telemetry::metrics::{ErrorLabels, Metrics, RequestLabels};
use crate::types::route::{Backend, Route};
use crate::*;

/// Everything the engine needs, wired once at startup and shared by all
/// connections.
pub struct ProxyInputs {
	pub cfg: ProxyConfig,
	pub routing: Arc<RoutingHandle>,
	pub client: Client,
	pub ratelimits: Arc<RatelimitRegistry>,
	pub breakers: Arc<BreakerRegistry>,
	pub metrics: Arc<Metrics>,
}

#[derive(Clone)]
pub struct ProxyEngine {
	inputs: Arc<ProxyInputs>,
}

impl ProxyEngine {
	pub fn new(inputs: Arc<ProxyInputs>) -> ProxyEngine {
		ProxyEngine { inputs }
	}

	pub async fn handle<B>(
		&self,
		req: ::http::Request<B>,
		peer: Option<SocketAddr>,
		tls: bool,
	) -> Response
	where
		B: http_body::Body<Data = Bytes> + Send + 'static,
		B::Error: Into<http::BoxError>,
	{
		let start = Instant::now();
		// The first request may arrive before the first table build; bounded
		// wait, then serve whatever table exists.
		if !self.inputs.routing.is_ready() {
			self.inputs.routing.wait_ready(STARTUP_WAIT).await;
		}

		let mut req = req.map(|b| Body::new(b.map_err(Into::into)));
		if let Err(e) = normalize_uri(&mut req, tls) {
			debug!("rejecting unparseable request: {e}");
			return self.finish_error(ProxyError::InvalidRequest, start);
		}

		let mut ctx = RequestContext::new(req, peer);
		let mut applied: Vec<Arc<dyn Filter>> = Vec::new();
		let result = self.dispatch(&mut ctx, &mut applied).await;

		let guard = match result {
			Ok(guard) => guard,
			Err(e) => {
				self.count_error(&e);
				ctx.response = Some(e.into_response());
				None
			},
		};

		// Response hooks run in reverse, exactly for the filters whose
		// request hook ran. Panic isolation keeps the pairing intact.
		for f in applied.iter().rev() {
			let f = f.clone();
			self.guarded(&mut ctx, "response", |ctx| f.response(ctx));
		}

		let mut resp = ctx
			.response
			.take()
			.unwrap_or_else(|| ProxyError::RouteNotFound.into_response());
		resp
			.headers_mut()
			.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
		resp
			.headers_mut()
			.insert(x_headers::X_POWERED_BY, HeaderValue::from_static(SERVER_NAME));

		self.inputs.metrics.requests.get_or_create(&RequestLabels {
			route: ctx
				.route
				.as_ref()
				.map(|r| r.id.to_string())
				.unwrap_or_default(),
			method: ctx.original.method.to_string(),
			status: resp.status().as_u16().to_string(),
		})
		.inc();

		if self.inputs.cfg.debug {
			return debug_mode::envelope(&ctx, resp);
		}

		let log = AccessLog::build(&ctx, resp.status(), start);
		let metrics = self.inputs.metrics.clone();
		resp.map(move |b| Body::new(StreamBody::new(b, metrics, guard, log)))
	}

	fn finish_error(&self, e: ProxyError, _start: Instant) -> Response {
		self.count_error(&e);
		let mut resp = e.into_response();
		resp
			.headers_mut()
			.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
		resp
			.headers_mut()
			.insert(x_headers::X_POWERED_BY, HeaderValue::from_static(SERVER_NAME));
		resp
	}

	fn count_error(&self, e: &ProxyError) {
		self.inputs.metrics.proxy_errors.get_or_create(&ErrorLabels {
			kind: e.kind().to_string(),
		})
		.inc();
		match e {
			ProxyError::RateLimited { .. } => {
				self.inputs.metrics.ratelimit_denied.inc();
			},
			ProxyError::CircuitOpen => {
				self.inputs.metrics.breaker_rejected.inc();
			},
			_ => {},
		}
	}

	/// Lookup → request filters → dispatch, iterating on loopback backends
	/// with an explicit counter rather than recursion.
	async fn dispatch(
		&self,
		ctx: &mut RequestContext,
		applied: &mut Vec<Arc<dyn Filter>>,
	) -> Result<Option<InflightGuard>, ProxyError> {
		let snapshot = self.inputs.routing.snapshot();
		let max_loopbacks = self.inputs.cfg.max_loopbacks;
		loop {
			let (route, params) = snapshot.route(&ctx.request).ok_or(ProxyError::RouteNotFound)?;
			debug!(route = route.id.as_str(), "route matched");
			ctx.route = Some(route.clone());
			ctx.params = params;

			for (i, f) in route.filters.iter().enumerate() {
				let hook = f.clone();
				self.guarded(ctx, "request", |ctx| hook.request(ctx));
				applied.push(f.clone());
				if let Some(name) = route.filter_names.get(i) {
					ctx.filters_run.push(name.clone());
				}
				if ctx.served || ctx.shunted {
					break;
				}
			}

			if ctx.served {
				return Ok(None);
			}
			if ctx.shunted || matches!(route.backend, Backend::Shunt) {
				ctx.response = Some(
					::http::Response::builder()
						.status(StatusCode::OK)
						.body(http::empty_body())
						.expect("static response builds"),
				);
				return Ok(None);
			}
			if matches!(route.backend, Backend::Loopback) {
				ctx.loop_counter += 1;
				if max_loopbacks < 0 || ctx.loop_counter > max_loopbacks {
					warn!(route = route.id.as_str(), "loopback limit exceeded");
					return Err(ProxyError::MaxLoopbacks);
				}
				// Re-enter lookup with the filter-mutated request.
				continue;
			}

			self
				.check_ratelimit(ctx, bag_keys::RATELIMIT_SETTINGS, StatusCode::TOO_MANY_REQUESTS)
				.await?;
			self
				.check_ratelimit(ctx, bag_keys::BACKEND_RATELIMIT, StatusCode::SERVICE_UNAVAILABLE)
				.await?;

			return self.forward(ctx, &route).await;
		}
	}

	/// Consult a rate-limit entry the filters left in the state bag. Limiter
	/// infra errors admit the request unless the route is tagged fail-closed.
	async fn check_ratelimit(
		&self,
		ctx: &mut RequestContext,
		key: &'static str,
		status: StatusCode,
	) -> Result<(), ProxyError> {
		let Some(settings) = ctx.state_bag.ratelimit(key).cloned() else {
			return Ok(());
		};
		let limiter = self.inputs.ratelimits.get(&settings);
		let lkey = settings.lookuper.lookup(&ctx.request, ctx.peer_addr);
		match limiter.allow(&lkey).await {
			Ok(true) => Ok(()),
			Ok(false) => {
				let retry_after_seconds = limiter.retry_after(&lkey).await;
				Err(ProxyError::RateLimited {
					status,
					retry_after_seconds,
					group: settings.group.clone(),
				})
			},
			Err(e) => {
				let fail_closed = settings.fail_closed
					|| ctx
						.state_bag
						.bool(bag_keys::RATELIMIT_FAIL_CLOSED)
						.unwrap_or(false);
				if fail_closed {
					warn!("rate limiter unavailable, failing closed: {e}");
					Err(ProxyError::RateLimited {
						status,
						retry_after_seconds: 1,
						group: settings.group.clone(),
					})
				} else {
					debug!("rate limiter unavailable, failing open: {e}");
					Ok(())
				}
			},
		}
	}

	async fn forward(
		&self,
		ctx: &mut RequestContext,
		route: &Arc<Route>,
	) -> Result<Option<InflightGuard>, ProxyError> {
		let (scheme, authority, backend_auth, guard) = match &route.backend {
			Backend::Network(nb) => (
				nb.scheme.clone(),
				nb.authority.clone(),
				nb.auth.clone(),
				None,
			),
			Backend::LoadBalanced(lb) => {
				let lbctx = LbContext {
					endpoints: &lb.endpoints,
					request: &ctx.request,
					params: &ctx.params,
					peer_addr: ctx.peer_addr,
				};
				let idx = lb
					.algorithm
					.apply(&lbctx)
					.ok_or(ProxyError::NoHealthyEndpoints)?;
				let ep = &lb.endpoints[idx];
				ep.metrics.begin_request();
				(
					ep.scheme.clone(),
					ep.authority.clone(),
					None,
					Some(InflightGuard::new(route.clone(), idx)),
				)
			},
			Backend::Dynamic => {
				let uri = ctx.request.uri();
				(
					uri.scheme().cloned().unwrap_or(Scheme::HTTP),
					uri
						.authority()
						.cloned()
						.ok_or(ProxyError::InvalidRequest)?,
					None,
					None,
				)
			},
			Backend::Shunt | Backend::Loopback => {
				return Err(ProxyError::Processing(anyhow::anyhow!(
					"sentinel backend reached dispatch"
				)));
			},
		};

		let breaker = self.inputs.breakers.get(authority.host());
		if let Some(b) = &breaker
			&& !b.allow()
		{
			return Err(ProxyError::CircuitOpen);
		}

		self.map_request(ctx, scheme, &authority, backend_auth)?;
		let upgrade = extract_upgrade(ctx, self.inputs.cfg.experimental_upgrade);

		ctx.outgoing = Some(crate::proxy::context::OriginalRequest {
			method: ctx.request.method().clone(),
			uri: ctx.request.uri().clone(),
			headers: ctx.request.headers().clone(),
		});

		let deadline = ctx
			.state_bag
			.duration(bag_keys::BACKEND_TIMEOUT)
			.or(self.inputs.cfg.backend_timeout);

		let outgoing = std::mem::replace(&mut ctx.request, placeholder_request());
		let res = self.inputs.client.call(outgoing, deadline).await;

		if let Some(b) = &breaker {
			// Failure means a network error or a 5xx answer.
			let success = matches!(&res, Ok(r) if r.status().as_u16() < 500);
			b.done(success);
		}
		if res.is_err()
			&& let Some(g) = &guard
		{
			g.note_failure();
		}

		let mut resp = res?;
		if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
			handle_upgrade(upgrade, &mut resp)?;
		}
		ctx.response = Some(resp);
		Ok(guard)
	}

	/// Rewrite the URL for the chosen backend, apply the Host policy, and
	/// attach URL-derived basic auth (an existing Authorization header wins).
	fn map_request(
		&self,
		ctx: &mut RequestContext,
		scheme: Scheme,
		authority: &Authority,
		backend_auth: Option<HeaderValue>,
	) -> Result<(), ProxyError> {
		strip_hop_headers(ctx.request.headers_mut());

		let target = authority.clone();
		http::modify_req_uri(&mut ctx.request, |parts| {
			parts.scheme = Some(scheme);
			parts.authority = Some(target);
			if parts.path_and_query.is_none() {
				parts.path_and_query = Some("/".parse()?);
			}
			Ok(())
		})
		.map_err(ProxyError::Processing)?;

		let host = match (&ctx.outgoing_host, self.inputs.cfg.preserve_host) {
			(Some(h), _) => HeaderValue::try_from(h.as_str()),
			(None, true) => HeaderValue::try_from(
				ctx
					.original
					.uri
					.authority()
					.map(|a| a.as_str())
					.unwrap_or(authority.as_str()),
			),
			(None, false) => HeaderValue::try_from(authority.as_str()),
		}
		.map_err(|e| ProxyError::Processing(e.into()))?;
		ctx.request.headers_mut().insert(header::HOST, host);

		if let Some(auth) = backend_auth
			&& !ctx.request.headers().contains_key(header::AUTHORIZATION)
		{
			ctx
				.request
				.headers_mut()
				.insert(header::AUTHORIZATION, auth);
		}
		Ok(())
	}

	/// Run a filter hook inside an isolation boundary. A faulting filter is
	/// recorded and the request carries on.
	fn guarded(&self, ctx: &mut RequestContext, phase: &str, f: impl FnOnce(&mut RequestContext)) {
		let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(ctx)));
		if let Err(p) = res {
			self.inputs.metrics.filter_panics.inc();
			let msg = panic_message(p.as_ref());
			error!(phase, "filter panicked: {msg}");
			ctx.panics.push(format!("{phase}: {msg}"));
		}
	}
}

fn panic_message(p: &(dyn std::any::Any + Send)) -> String {
	if let Some(s) = p.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = p.downcast_ref::<String>() {
		s.clone()
	} else {
		"unknown panic".to_string()
	}
}

fn placeholder_request() -> Request {
	::http::Request::new(http::empty_body())
}

// Hop-by-hop headers are stripped before forwarding (RFC 7230 §6.1, plus the
// legacy set from RFC 2616 §13.5.1).
const HOP_HEADERS: [header::HeaderName; 9] = [
	header::CONNECTION,
	header::HeaderName::from_static("proxy-connection"),
	header::HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

fn strip_hop_headers(headers: &mut http::HeaderMap) {
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
}

struct RequestUpgrade {
	upgrade_type: HeaderValue,
	on_upgrade: OnUpgrade,
}

/// When the client asked for a protocol upgrade and upgrades are enabled,
/// re-attach the upgrade headers (stripped with the hop-by-hop set) and keep
/// the client's upgrade handle for splicing.
fn extract_upgrade(ctx: &mut RequestContext, enabled: bool) -> Option<RequestUpgrade> {
	if !enabled {
		ctx.request.extensions_mut().remove::<OnUpgrade>();
		return None;
	}
	use headers::HeaderMapExt;
	let upgrade_type = upgrade_type(&ctx.original.headers)?;
	let on_upgrade = ctx.request.extensions_mut().remove::<OnUpgrade>()?;
	ctx
		.request
		.headers_mut()
		.typed_insert(headers::Connection::upgrade());
	ctx
		.request
		.headers_mut()
		.insert(header::UPGRADE, upgrade_type.clone());
	Some(RequestUpgrade {
		upgrade_type,
		on_upgrade,
	})
}

fn upgrade_type(headers: &http::HeaderMap) -> Option<HeaderValue> {
	use headers::HeaderMapExt;
	let con = headers.typed_get::<headers::Connection>()?;
	if con.contains(header::UPGRADE) {
		headers.get(header::UPGRADE).cloned()
	} else {
		None
	}
}

/// Splice the two upgraded connections together in the background.
fn handle_upgrade(upgrade: Option<RequestUpgrade>, resp: &mut Response) -> Result<(), ProxyError> {
	let Some(RequestUpgrade {
		upgrade_type: requested,
		on_upgrade,
	}) = upgrade
	else {
		return Err(ProxyError::Processing(anyhow::anyhow!(
			"backend switched protocols without a client upgrade"
		)));
	};
	if upgrade_type(resp.headers()).as_ref() != Some(&requested) {
		return Err(ProxyError::Processing(anyhow::anyhow!(
			"backend upgraded to a different protocol"
		)));
	}
	let backend_upgrade = resp
		.extensions_mut()
		.remove::<OnUpgrade>()
		.ok_or_else(|| ProxyError::Processing(anyhow::anyhow!("missing backend upgrade handle")))?;
	tokio::spawn(async move {
		let client = match on_upgrade.await {
			Ok(c) => c,
			Err(e) => {
				debug!("client upgrade failed: {e}");
				return;
			},
		};
		let backend = match backend_upgrade.await {
			Ok(b) => b,
			Err(e) => {
				debug!("backend upgrade failed: {e}");
				return;
			},
		};
		let mut client = hyper_util::rt::TokioIo::new(client);
		let mut backend = hyper_util::rt::TokioIo::new(backend);
		if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut backend).await {
			debug!("upgraded connection closed: {e}");
		}
	});
	Ok(())
}

// The http library leaves the authority out of the URI for origin-form
// HTTP/1.x requests; normalize so the rest of the engine can rely on it.
fn normalize_uri(req: &mut Request, tls: bool) -> anyhow::Result<()> {
	if req.uri().authority().is_some() {
		return Ok(());
	}
	let host = req
		.headers()
		.get(header::HOST)
		.and_then(|h| h.to_str().ok())
		.and_then(|h| h.parse::<Authority>().ok())
		.ok_or_else(|| anyhow::anyhow!("no authority or host"))?;
	let mut parts = std::mem::take(req.uri_mut()).into_parts();
	parts.authority = Some(host);
	parts.scheme = Some(if tls { Scheme::HTTPS } else { Scheme::HTTP });
	if parts.path_and_query.is_none() {
		parts.path_and_query = Some("/".parse()?);
	}
	*req.uri_mut() = Uri::from_parts(parts)?;
	Ok(())
}
