//! Data sources feeding the route builder.
//!
//! A client produces an initial snapshot and then a stream of deltas. Concrete
//! sources (Kubernetes converters, etcd watches) live behind this trait; the
//! crate ships an in-memory client and a polling file client.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::route::{RouteDefinition, RouteId};
use crate::*;

#[derive(Debug, Clone, Default)]
pub struct RouteDelta {
	pub upserts: Vec<RouteDefinition>,
	pub deletions: Vec<RouteId>,
}

impl RouteDelta {
	pub fn is_empty(&self) -> bool {
		self.upserts.is_empty() && self.deletions.is_empty()
	}
}

#[async_trait]
pub trait DataClient: Send + Sync + 'static {
	/// Namespace qualifying this client's route ids, avoiding collisions
	/// across sources. Empty means unqualified.
	fn namespace(&self) -> Strng;

	/// On duplicate qualified ids across clients the higher priority wins.
	fn priority(&self) -> i32 {
		0
	}

	/// Full snapshot. Called on startup and after any unrecoverable desync.
	/// Re-submitting an identical snapshot must be a no-op for the table.
	async fn load_all(&self) -> anyhow::Result<Vec<RouteDefinition>>;

	/// Incremental delta; blocks until a change is observed. Clients without
	/// incremental support pend forever and rely on `load_all` polling.
	async fn load_update(&self) -> anyhow::Result<RouteDelta>;
}

/// Fixed set of routes known at startup, e.g. from inline configuration.
pub struct StaticClient {
	namespace: Strng,
	routes: Vec<RouteDefinition>,
}

impl StaticClient {
	pub fn new(namespace: Strng, routes: Vec<RouteDefinition>) -> Self {
		Self { namespace, routes }
	}
}

#[async_trait]
impl DataClient for StaticClient {
	fn namespace(&self) -> Strng {
		self.namespace.clone()
	}
	async fn load_all(&self) -> anyhow::Result<Vec<RouteDefinition>> {
		Ok(self.routes.clone())
	}
	async fn load_update(&self) -> anyhow::Result<RouteDelta> {
		futures::future::pending().await
	}
}

/// Routes from a YAML file, re-read on a poll interval when the contents
/// change. Updates surface as full-snapshot deltas.
pub struct FileClient {
	namespace: Strng,
	path: std::path::PathBuf,
	poll_interval: Duration,
	state: parking_lot::Mutex<FileState>,
}

#[derive(Default)]
struct FileState {
	digest: Option<u64>,
	known: Vec<RouteId>,
}

impl FileClient {
	pub fn new(
		namespace: Strng,
		path: impl Into<std::path::PathBuf>,
		poll_interval: Duration,
	) -> Self {
		Self {
			namespace,
			path: path.into(),
			poll_interval,
			state: Default::default(),
		}
	}

	fn read(&self) -> anyhow::Result<(Vec<RouteDefinition>, u64)> {
		let contents = std::fs::read_to_string(&self.path)
			.with_context(|| format!("route file {}", self.path.display()))?;
		let routes: Vec<RouteDefinition> = serde_yaml::from_str(&contents)?;
		Ok((routes, digest(&contents)))
	}
}

fn digest(contents: &str) -> u64 {
	use std::hash::{Hash, Hasher};
	let mut h = std::collections::hash_map::DefaultHasher::new();
	contents.hash(&mut h);
	h.finish()
}

#[async_trait]
impl DataClient for FileClient {
	fn namespace(&self) -> Strng {
		self.namespace.clone()
	}

	async fn load_all(&self) -> anyhow::Result<Vec<RouteDefinition>> {
		let (routes, digest) = self.read()?;
		let mut state = self.state.lock();
		state.digest = Some(digest);
		state.known = routes.iter().map(|r| r.id.clone()).collect();
		Ok(routes)
	}

	async fn load_update(&self) -> anyhow::Result<RouteDelta> {
		loop {
			tokio::time::sleep(self.poll_interval).await;
			let (routes, digest) = match self.read() {
				Ok(r) => r,
				Err(e) => {
					// Transient read or parse failures keep the last table.
					warn!("route file reload failed: {e}");
					continue;
				},
			};
			let mut state = self.state.lock();
			if state.digest == Some(digest) {
				continue;
			}
			state.digest = Some(digest);
			let next: Vec<RouteId> = routes.iter().map(|r| r.id.clone()).collect();
			let deletions = state
				.known
				.iter()
				.filter(|id| !next.contains(id))
				.cloned()
				.collect();
			state.known = next;
			return Ok(RouteDelta {
				upserts: routes,
				deletions,
			});
		}
	}
}

/// In-memory client whose contents can be swapped at runtime. Used by tests
/// and by the admin surface to push route updates.
pub struct ChannelClient {
	namespace: Strng,
	initial: Vec<RouteDefinition>,
	rx: AsyncMutexDelta,
}

type AsyncMutexDelta = tokio::sync::Mutex<mpsc::Receiver<RouteDelta>>;

impl ChannelClient {
	pub fn new(namespace: Strng, initial: Vec<RouteDefinition>) -> (Self, mpsc::Sender<RouteDelta>) {
		let (tx, rx) = mpsc::channel(16);
		(
			Self {
				namespace,
				initial,
				rx: tokio::sync::Mutex::new(rx),
			},
			tx,
		)
	}
}

#[async_trait]
impl DataClient for ChannelClient {
	fn namespace(&self) -> Strng {
		self.namespace.clone()
	}
	async fn load_all(&self) -> anyhow::Result<Vec<RouteDefinition>> {
		Ok(self.initial.clone())
	}
	async fn load_update(&self) -> anyhow::Result<RouteDelta> {
		let mut rx = self.rx.lock().await;
		rx.recv()
			.await
			.ok_or_else(|| anyhow::anyhow!("route update channel closed"))
	}
}
