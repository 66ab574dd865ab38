//! End-to-end proxy tests against a stub backend.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use skipper::client::{Client, ClientConfig};
use skipper::config::ProxyConfig;
use skipper::filters::FilterRegistry;
use skipper::http::{self, StatusCode};
use skipper::proxy::engine::{ProxyEngine, ProxyInputs};
use skipper::ratelimit::{RatelimitRegistry, RegistryBackends};
use skipper::routing::RoutingHandle;
use skipper::routing::builder::RouteBuilder;
use skipper::routing::predicate::PredicateRegistry;
use skipper::telemetry::metrics::Metrics;
use skipper::types::route::{BackendDefinition, RouteDefinition, SpecInvocation};
use skipper::types::value::Value;
use skipper::{breaker, strng};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn invocation(name: &str, args: Vec<Value>) -> SpecInvocation {
	SpecInvocation {
		name: strng::new(name),
		args,
	}
}

fn route(id: &str, path_pattern: &str, backend: BackendDefinition) -> RouteDefinition {
	RouteDefinition {
		id: strng::new(id),
		predicates: vec![invocation("Path", vec![Value::String(path_pattern.into())])],
		filters: vec![],
		backend,
	}
}

fn engine(routes: Vec<RouteDefinition>, cfg: ProxyConfig) -> ProxyEngine {
	let builder = RouteBuilder::new(
		Arc::new(PredicateRegistry::with_defaults()),
		Arc::new(FilterRegistry::with_defaults()),
	);
	let union: Vec<_> = routes
		.into_iter()
		.map(|r| (skipper::strng::Strng::default(), r))
		.collect();
	let table = builder.build_table(&union);
	let routing = Arc::new(RoutingHandle::new());
	routing.install(table);
	let metrics = Arc::new(Metrics::new(
		&mut prometheus_client::registry::Registry::default(),
	));
	ProxyEngine::new(Arc::new(ProxyInputs {
		cfg,
		routing,
		client: Client::new(&ClientConfig {
			insecure: true,
			..ClientConfig::default()
		})
		.unwrap(),
		ratelimits: Arc::new(RatelimitRegistry::new(RegistryBackends::default())),
		breakers: Arc::new(breaker::BreakerRegistry::disabled()),
		metrics,
	}))
}

fn request(path: &str) -> ::http::Request<skipper::http::Body> {
	::http::Request::builder()
		.method(::http::Method::GET)
		.uri(format!("http://proxy.test{path}"))
		.body(http::empty_body())
		.unwrap()
}

#[tokio::test]
async fn forwards_verbatim_with_branded_headers() {
	let backend = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/api/users"))
		.respond_with(ResponseTemplate::new(200).set_body_string("user list"))
		.mount(&backend)
		.await;

	let e = engine(
		vec![route(
			"api",
			"/api/*rest",
			BackendDefinition::Network(backend.uri()),
		)],
		ProxyConfig::default(),
	);
	let resp = e.handle(request("/api/users"), None, false).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers()[::http::header::SERVER], "Skipper");
	assert_eq!(resp.headers()["x-powered-by"], "Skipper");
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"user list");
}

#[tokio::test]
async fn request_and_response_filters_apply_in_order() {
	let backend = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/x"))
		.and(header("x-injected", "yes"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&backend)
		.await;

	let mut r = route("f", "/x", BackendDefinition::Network(backend.uri()));
	r.filters = vec![
		invocation(
			"setRequestHeader",
			vec![
				Value::String("x-injected".into()),
				Value::String("yes".into()),
			],
		),
		invocation(
			"setResponseHeader",
			vec![
				Value::String("x-out".into()),
				Value::String("from-filter".into()),
			],
		),
	];
	let e = engine(vec![r], ProxyConfig::default());
	let resp = e.handle(request("/x"), None, false).await;
	assert_eq!(resp.status(), StatusCode::OK, "header must reach the backend");
	assert_eq!(resp.headers()["x-out"], "from-filter");
}

#[tokio::test]
async fn backend_timeout_filter_overrides_the_deadline() {
	let backend = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/slow"))
		.respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
		.mount(&backend)
		.await;

	let mut r = route("slow", "/slow", BackendDefinition::Network(backend.uri()));
	r.filters = vec![invocation(
		"backendTimeout",
		vec![Value::String("50ms".into())],
	)];
	let e = engine(vec![r], ProxyConfig::default());
	let resp = e.handle(request("/slow"), None, false).await;
	assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn loopback_reenters_routing_with_the_mutated_request() {
	let backend = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/new"))
		.respond_with(ResponseTemplate::new(200).set_body_string("relocated"))
		.mount(&backend)
		.await;

	let mut entry = route("entry", "/old", BackendDefinition::Loopback);
	entry.filters = vec![invocation("setPath", vec![Value::String("/new".into())])];
	let target = route("target", "/new", BackendDefinition::Network(backend.uri()));

	let e = engine(vec![entry, target], ProxyConfig::default());
	let resp = e.handle(request("/old"), None, false).await;
	assert_eq!(resp.status(), StatusCode::OK);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"relocated");
}

#[tokio::test]
async fn lb_round_robin_spreads_over_endpoints() {
	let a = MockServer::start().await;
	let b = MockServer::start().await;
	for (srv, name) in [(&a, "a"), (&b, "b")] {
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(200).set_body_string(name))
			.mount(srv)
			.await;
	}

	let e = engine(
		vec![route(
			"lb",
			"/x",
			BackendDefinition::Lb {
				algorithm: Some(strng::new("roundRobin")),
				endpoints: vec![a.uri(), b.uri()],
				balance_factor: None,
			},
		)],
		ProxyConfig::default(),
	);
	let mut seen = std::collections::HashSet::new();
	for _ in 0..4 {
		let resp = e.handle(request("/x"), None, false).await;
		assert_eq!(resp.status(), StatusCode::OK);
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		seen.insert(body.to_vec());
	}
	assert_eq!(seen.len(), 2, "both endpoints must serve traffic");
}

#[tokio::test]
async fn dead_backend_yields_503() {
	let e = engine(
		vec![route(
			"dead",
			"/x",
			BackendDefinition::Network("http://127.0.0.1:1".to_string()),
		)],
		ProxyConfig::default(),
	);
	let resp = e.handle(request("/x"), None, false).await;
	assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}
