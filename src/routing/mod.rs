//! The routing façade: an atomically swappable pointer to the current
//! immutable table, plus the update pipeline feeding it from data clients.

pub mod builder;
pub mod datasource;
pub mod predicate;
pub mod tree;

use std::collections::HashMap;

use arc_swap::ArcSwap;
use itertools::Itertools;
use tokio::sync::{Notify, mpsc};

use crate::http::Request;
use crate::routing::builder::RouteBuilder;
use crate::routing::datasource::{DataClient, RouteDelta};
use crate::routing::tree::PathTree;
use crate::telemetry::metrics::Metrics;
use crate::types::route::{Params, Route, RouteDefinition, RouteId};
use crate::*;

/// Bound on how long the first request waits for the first table build.
pub const STARTUP_WAIT: Duration = Duration::from_millis(1200);

pub struct RoutingTable {
	tree: PathTree,
	priority: Vec<Arc<Route>>,
	route_count: usize,
	dropped_count: usize,
	ignore_trailing_slash: bool,
}

impl RoutingTable {
	pub fn new(
		tree: PathTree,
		priority: Vec<Arc<Route>>,
		route_count: usize,
		dropped_count: usize,
		ignore_trailing_slash: bool,
	) -> RoutingTable {
		RoutingTable {
			tree,
			priority,
			route_count,
			dropped_count,
			ignore_trailing_slash,
		}
	}

	pub fn empty() -> RoutingTable {
		RoutingTable::new(PathTree::build(&[], false), Vec::new(), 0, 0, false)
	}

	pub fn route_count(&self) -> usize {
		self.route_count
	}

	pub fn dropped_count(&self) -> usize {
		self.dropped_count
	}

	/// Priority routes first (list order, short-circuiting), then the tree.
	pub fn route(&self, req: &Request) -> Option<(Arc<Route>, Params)> {
		for r in &self.priority {
			let params = match &r.path {
				Some(spec) => spec.matches(req.uri().path(), self.ignore_trailing_slash),
				None => Some(Params::new()),
			};
			if let Some(params) = params
				&& r.matches_non_path(req)
			{
				return Some((r.clone(), params));
			}
		}
		self.tree.lookup(req)
	}
}

/// Atomically swappable handle the proxy reads on every request. Readers take
/// one consistent snapshot per request; installation is a single
/// release-store.
pub struct RoutingHandle {
	table: ArcSwap<RoutingTable>,
	ready: std::sync::atomic::AtomicBool,
	ready_notify: Notify,
}

impl RoutingHandle {
	pub fn new() -> RoutingHandle {
		RoutingHandle {
			table: ArcSwap::from_pointee(RoutingTable::empty()),
			ready: std::sync::atomic::AtomicBool::new(false),
			ready_notify: Notify::new(),
		}
	}

	/// Consistent snapshot for the duration of a request.
	pub fn snapshot(&self) -> Arc<RoutingTable> {
		self.table.load_full()
	}

	pub fn install(&self, table: RoutingTable) {
		let count = table.route_count();
		self.table.store(Arc::new(table));
		if !self.ready.swap(true, std::sync::atomic::Ordering::Release) {
			self.ready_notify.notify_waiters();
		}
		debug!(routes = count, "routing table installed");
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(std::sync::atomic::Ordering::Acquire)
	}

	/// Block until the first build lands or the bounded startup wait
	/// elapses; requests then proceed against whatever table exists (404 on
	/// the empty one).
	pub async fn wait_ready(&self, timeout: Duration) {
		if self.is_ready() {
			return;
		}
		let notified = self.ready_notify.notified();
		if self.is_ready() {
			return;
		}
		let _ = tokio::time::timeout(timeout, notified).await;
	}
}

impl Default for RoutingHandle {
	fn default() -> Self {
		Self::new()
	}
}

enum Update {
	Delta(usize, RouteDelta),
	/// The client lost sync; replace its whole snapshot.
	Resync(usize, Vec<RouteDefinition>),
}

/// Consumes data-client updates, rebuilds the table, and installs it.
/// Multiple deltas arriving during a build are coalesced so only the latest
/// state is rebuilt next.
pub struct RouteUpdater {
	clients: Vec<Arc<dyn DataClient>>,
	builder: RouteBuilder,
	handle: Arc<RoutingHandle>,
	metrics: Arc<Metrics>,
}

impl RouteUpdater {
	pub fn new(
		clients: Vec<Arc<dyn DataClient>>,
		builder: RouteBuilder,
		handle: Arc<RoutingHandle>,
		metrics: Arc<Metrics>,
	) -> RouteUpdater {
		RouteUpdater {
			clients,
			builder,
			handle,
			metrics,
		}
	}

	pub async fn run(self) {
		// Per-client snapshot of unqualified id -> definition.
		let mut state: Vec<HashMap<RouteId, RouteDefinition>> =
			vec![HashMap::new(); self.clients.len()];

		for (i, client) in self.clients.iter().enumerate() {
			match client.load_all().await {
				Ok(defs) => {
					state[i] = defs.into_iter().map(|d| (d.id.clone(), d)).collect();
				},
				Err(e) => {
					self.metrics.route_build_failures.inc();
					error!(
						namespace = client.namespace().as_str(),
						"initial route load failed: {e:#}"
					);
				},
			}
		}
		self.rebuild(&state);

		let (tx, mut rx) = mpsc::channel::<Update>(64);
		for (i, client) in self.clients.iter().enumerate() {
			let client = client.clone();
			let tx = tx.clone();
			tokio::spawn(async move {
				let mut failures = 0u32;
				loop {
					match client.load_update().await {
						Ok(delta) if delta.is_empty() => continue,
						Ok(delta) => {
							failures = 0;
							if tx.send(Update::Delta(i, delta)).await.is_err() {
								return;
							}
						},
						Err(e) => {
							failures += 1;
							warn!(
								namespace = client.namespace().as_str(),
								"route update failed ({failures}): {e:#}"
							);
							tokio::time::sleep(Duration::from_secs(1)).await;
							// After repeated failures assume the delta stream
							// desynced and fall back to a full snapshot.
							if failures >= 3
								&& let Ok(defs) = client.load_all().await
							{
								failures = 0;
								if tx.send(Update::Resync(i, defs)).await.is_err() {
									return;
								}
							}
						},
					}
				}
			});
		}
		drop(tx);

		while let Some(update) = rx.recv().await {
			self.apply(&mut state, update);
			// Coalesce: drain whatever arrived while we were busy and only
			// rebuild once.
			while let Ok(more) = rx.try_recv() {
				self.apply(&mut state, more);
			}
			self.rebuild(&state);
		}
	}

	fn apply(&self, state: &mut [HashMap<RouteId, RouteDefinition>], update: Update) {
		match update {
			Update::Delta(i, delta) => {
				for id in delta.deletions {
					state[i].remove(&id);
				}
				for def in delta.upserts {
					state[i].insert(def.id.clone(), def);
				}
			},
			Update::Resync(i, defs) => {
				state[i] = defs.into_iter().map(|d| (d.id.clone(), d)).collect();
			},
		}
	}

	fn rebuild(&self, state: &[HashMap<RouteId, RouteDefinition>]) {
		let union = self.merge(state);
		let table = self.builder.build_table(&union);
		self
			.metrics
			.routes_active
			.set(table.route_count() as i64);
		if table.dropped_count() > 0 {
			self
				.metrics
				.route_build_failures
				.inc_by(table.dropped_count() as u64);
		}
		self.handle.install(table);
	}

	/// Union of all client snapshots. Ids are qualified by namespace; on a
	/// collision the client with the higher declared priority wins.
	fn merge(&self, state: &[HashMap<RouteId, RouteDefinition>]) -> Vec<(Strng, RouteDefinition)> {
		let order = (0..self.clients.len()).sorted_by_key(|&i| self.clients[i].priority());
		let mut union: HashMap<Strng, (Strng, RouteDefinition)> = HashMap::new();
		for i in order {
			let ns = self.clients[i].namespace();
			for def in state[i].values() {
				let qualified = if ns.is_empty() {
					def.id.clone()
				} else {
					strng::format!("{ns}/{}", def.id)
				};
				if let Some((prev_ns, _)) =
					union.insert(qualified.clone(), (ns.clone(), def.clone()))
				{
					warn!(
						route = qualified.as_str(),
						loser = prev_ns.as_str(),
						winner = ns.as_str(),
						"duplicate route id across data clients"
					);
				}
			}
		}
		union.into_values().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::filters::FilterRegistry;
	use crate::http::empty_body;
	use crate::routing::datasource::{ChannelClient, StaticClient};
	use crate::routing::predicate::PredicateRegistry;
	use crate::types::route::{BackendDefinition, SpecInvocation};
	use crate::types::value::Value;

	fn builder() -> RouteBuilder {
		RouteBuilder::new(
			Arc::new(PredicateRegistry::with_defaults()),
			Arc::new(FilterRegistry::with_defaults()),
		)
	}

	fn metrics() -> Arc<Metrics> {
		Arc::new(Metrics::new(
			&mut prometheus_client::registry::Registry::default(),
		))
	}

	fn def(id: &str, path: &str) -> RouteDefinition {
		RouteDefinition {
			id: strng::new(id),
			predicates: vec![SpecInvocation {
				name: strng::literal!("Path"),
				args: vec![Value::String(path.into())],
			}],
			filters: vec![],
			backend: BackendDefinition::Shunt,
		}
	}

	fn req(path: &str) -> Request {
		::http::Request::builder()
			.uri(format!("http://h{path}"))
			.body(empty_body())
			.unwrap()
	}

	#[tokio::test]
	async fn updater_installs_and_applies_deltas() {
		let (client, tx) = ChannelClient::new(Strng::default(), vec![def("a", "/a")]);
		let handle = Arc::new(RoutingHandle::new());
		let updater = RouteUpdater::new(
			vec![Arc::new(client)],
			builder(),
			handle.clone(),
			metrics(),
		);
		tokio::spawn(updater.run());

		handle.wait_ready(Duration::from_secs(2)).await;
		assert!(handle.is_ready());
		assert!(handle.snapshot().route(&req("/a")).is_some());
		assert!(handle.snapshot().route(&req("/b")).is_none());

		tx.send(RouteDelta {
			upserts: vec![def("b", "/b")],
			deletions: vec![strng::new("a")],
		})
		.await
		.unwrap();

		// Wait for the rebuild to land.
		for _ in 0..100 {
			if handle.snapshot().route(&req("/b")).is_some() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert!(handle.snapshot().route(&req("/b")).is_some());
		assert!(
			handle.snapshot().route(&req("/a")).is_none(),
			"deleted route must be evicted"
		);
	}

	#[tokio::test]
	async fn higher_priority_client_wins_id_collisions() {
		struct Prio(StaticClient, i32);
		#[async_trait::async_trait]
		impl DataClient for Prio {
			fn namespace(&self) -> Strng {
				self.0.namespace()
			}
			fn priority(&self) -> i32 {
				self.1
			}
			async fn load_all(&self) -> anyhow::Result<Vec<RouteDefinition>> {
				self.0.load_all().await
			}
			async fn load_update(&self) -> anyhow::Result<RouteDelta> {
				self.0.load_update().await
			}
		}

		let mut low = def("same", "/low");
		low.id = strng::new("same");
		let mut high = def("same", "/high");
		high.id = strng::new("same");

		let handle = Arc::new(RoutingHandle::new());
		let updater = RouteUpdater::new(
			vec![
				Arc::new(Prio(StaticClient::new(Strng::default(), vec![low]), 0)),
				Arc::new(Prio(StaticClient::new(Strng::default(), vec![high]), 10)),
			],
			builder(),
			handle.clone(),
			metrics(),
		);
		tokio::spawn(updater.run());
		handle.wait_ready(Duration::from_secs(2)).await;

		assert!(handle.snapshot().route(&req("/high")).is_some());
		assert!(handle.snapshot().route(&req("/low")).is_none());
	}

	#[tokio::test]
	async fn empty_table_is_served_after_startup_timeout() {
		let handle = RoutingHandle::new();
		let start = Instant::now();
		handle.wait_ready(Duration::from_millis(50)).await;
		assert!(start.elapsed() >= Duration::from_millis(50));
		assert!(handle.snapshot().route(&req("/anything")).is_none());
	}

	#[test]
	fn priority_routes_short_circuit_the_tree() {
		let mut b = builder();
		b.priority_routes = vec![def("health", "/healthz")];
		let table = b.build_table(&[(Strng::default(), def("tree", "/healthz"))]);
		let (r, _) = table.route(&req("/healthz")).unwrap();
		assert_eq!(r.id.as_str(), "health");
	}
}
