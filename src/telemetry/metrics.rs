use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub route: String,
	pub method: String,
	pub status: String,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
	pub kind: String,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct CloseLabels {
	pub reason: String,
}

type CounterFamily<L> = Family<L, Counter>;

#[derive(Debug)]
pub struct Metrics {
	pub requests: CounterFamily<RequestLabels>,
	pub proxy_errors: CounterFamily<ErrorLabels>,
	pub filter_panics: Counter,
	pub streaming_errors: Counter,
	pub route_build_failures: Counter,
	pub routes_active: Gauge,
	pub ratelimit_denied: Counter,
	pub breaker_rejected: Counter,
	pub connections_opened: Counter,
	pub connections_active: Gauge,
	pub connections_closed: CounterFamily<CloseLabels>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		fn counter(registry: &mut Registry, name: &str, help: &str) -> Counter {
			let c = Counter::default();
			registry.register(name, help, c.clone());
			c
		}
		let requests = Family::default();
		registry.register(
			"requests",
			"Total proxied HTTP requests",
			requests.clone(),
		);
		let proxy_errors = Family::default();
		registry.register(
			"proxy_errors",
			"Requests failed before or during dispatch, by kind",
			proxy_errors.clone(),
		);
		let connections_closed = Family::default();
		registry.register(
			"connections_closed",
			"Downstream connections closed, by reason",
			connections_closed.clone(),
		);
		let routes_active = Gauge::default();
		registry.register(
			"routes_active",
			"Routes in the currently served table",
			routes_active.clone(),
		);
		let connections_active = Gauge::default();
		registry.register(
			"connections_active",
			"Open downstream connections",
			connections_active.clone(),
		);
		Metrics {
			requests,
			proxy_errors,
			filter_panics: counter(registry, "filter_panics", "Recovered filter panics"),
			streaming_errors: counter(
				registry,
				"streaming_errors",
				"Response bodies aborted mid-stream",
			),
			route_build_failures: counter(
				registry,
				"route_build_failures",
				"Route loads or builds that failed",
			),
			routes_active,
			ratelimit_denied: counter(registry, "ratelimit_denied", "Requests denied by a rate limit"),
			breaker_rejected: counter(
				registry,
				"breaker_rejected",
				"Requests rejected by an open circuit breaker",
			),
			connections_opened: counter(
				registry,
				"connections_opened",
				"Downstream connections accepted",
			),
			connections_active,
			connections_closed,
		}
	}
}
