//! Wires the pieces together: registries, data clients, the route update
//! pipeline, the shared backend client, and the listening server.

use std::future::Future;

use prometheus_client::registry::Registry;

use crate::breaker::BreakerRegistry;
use crate::client::Client;
use crate::filters::FilterRegistry;
use crate::kv::KvStore;
use crate::kv::redis::RedisRing;
use crate::proxy::engine::{ProxyEngine, ProxyInputs};
use crate::proxy::server::Server;
use crate::ratelimit::{RatelimitRegistry, RegistryBackends};
use crate::routing::builder::RouteBuilder;
use crate::routing::datasource::{DataClient, FileClient, StaticClient};
use crate::routing::predicate::PredicateRegistry;
use crate::routing::{RouteUpdater, RoutingHandle};
use crate::telemetry::metrics::Metrics;
use crate::*;

pub async fn run(cfg: Config) -> anyhow::Result<()> {
	let mut registry = Registry::with_prefix("skipper");
	let metrics = Arc::new(Metrics::new(&mut registry));
	run_with(cfg, metrics, shutdown_signal()).await
}

/// Entry point split out so tests and embedders can inject metrics and their
/// own shutdown condition.
pub async fn run_with(
	cfg: Config,
	metrics: Arc<Metrics>,
	shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
	let predicates = Arc::new(PredicateRegistry::with_defaults());
	let filters = Arc::new(FilterRegistry::with_defaults());

	let mut builder = RouteBuilder::new(predicates, filters);
	builder.ignore_trailing_slash = cfg.routing.ignore_trailing_slash;
	builder.default_filters = cfg.routing.default_filters.clone();
	builder.priority_routes = cfg.routing.priority_routes.clone();

	let mut clients: Vec<Arc<dyn DataClient>> = Vec::new();
	if !cfg.routing.inline_routes.is_empty() {
		clients.push(Arc::new(StaticClient::new(
			strng::literal!("inline"),
			cfg.routing.inline_routes.clone(),
		)));
	}
	for (i, path) in cfg.routing.route_files.iter().enumerate() {
		let namespace = if cfg.routing.route_files.len() == 1 {
			strng::literal!("file")
		} else {
			strng::format!("file{i}")
		};
		clients.push(Arc::new(FileClient::new(
			namespace,
			path.clone(),
			cfg.routing.poll_interval,
		)));
	}
	if clients.is_empty() {
		warn!("no route sources configured, serving 404 for everything");
	}

	let routing = Arc::new(RoutingHandle::new());
	let updater = RouteUpdater::new(clients, builder, routing.clone(), metrics.clone());
	tokio::spawn(updater.run());

	let kv: Option<Arc<dyn KvStore>> = match &cfg.ratelimit.redis {
		Some(redis_cfg) => Some(Arc::new(RedisRing::connect(redis_cfg).await?)),
		None => None,
	};
	let ratelimits = Arc::new(RatelimitRegistry::new(RegistryBackends {
		kv,
		swarm: None,
		cache_period_factor: cfg.ratelimit.cache_period_factor,
	}));

	let breakers = Arc::new(BreakerRegistry::new(
		cfg.breakers.default.clone(),
		cfg.breakers.hosts.clone(),
	));

	let client = Client::new(&cfg.client)?;
	let engine = ProxyEngine::new(Arc::new(ProxyInputs {
		cfg: cfg.proxy.clone(),
		routing,
		client,
		ratelimits,
		breakers,
		metrics: metrics.clone(),
	}));

	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
	tokio::spawn(async move {
		shutdown.await;
		let _ = shutdown_tx.send(true);
	});

	Server::new(cfg.listen.clone(), engine, metrics, shutdown_rx)
		.run()
		.await
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("interrupt received");
}
