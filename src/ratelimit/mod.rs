//! Rate limiting: per-instance sliding windows, cluster-local gossip
//! estimation, and cluster-shared KV-backed limiters, all constructed and
//! owned by a registry keyed on structural settings equality.

pub mod cluster;
pub mod leaky;
pub mod local;
pub mod swarm;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::http::Request;
use crate::kv::{KvError, KvStore};
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RatelimitType {
	#[default]
	Disabled,
	/// In-instance window keyed by the lookuper.
	LocalClient,
	/// In-instance window over all requests of the route.
	LocalService,
	/// Cluster-wide window keyed by the lookuper (swarm or KV backed).
	ClusterClient,
	/// Cluster-wide window over all requests of the route.
	ClusterService,
	LeakyBucket,
}

/// Selects the limit key from a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Lookuper {
	ClientIp,
	Header(Strng),
	/// `Authorization` header contents; anonymous requests share one bucket.
	Authorization,
	/// Everything lands in a single shared bucket.
	SameBucket,
	Tuple(Vec<Lookuper>),
}

impl Default for Lookuper {
	fn default() -> Self {
		Lookuper::SameBucket
	}
}

impl Lookuper {
	pub fn lookup(&self, req: &Request, peer: Option<SocketAddr>) -> String {
		match self {
			Lookuper::ClientIp => http::client_ip(req, peer)
				.map(|ip| ip.to_string())
				.unwrap_or_else(|| "unknown".to_string()),
			Lookuper::Header(name) => req
				.headers()
				.get(name.as_str())
				.and_then(|v| v.to_str().ok())
				.unwrap_or("")
				.to_string(),
			Lookuper::Authorization => req
				.headers()
				.get(http::header::AUTHORIZATION)
				.and_then(|v| v.to_str().ok())
				.unwrap_or("anonymous")
				.to_string(),
			Lookuper::SameBucket => "s".to_string(),
			Lookuper::Tuple(parts) => parts
				.iter()
				.map(|l| l.lookup(req, peer))
				.collect::<Vec<_>>()
				.join("|"),
		}
	}
}

/// Used both as a configuration record and as the registry key; equality is
/// structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
	#[serde(rename = "type", default)]
	pub kind: RatelimitType,
	#[serde(default)]
	pub group: Strng,
	#[serde(default)]
	pub max_hits: u64,
	#[serde(default, with = "crate::config::serde_duration")]
	pub time_window: Duration,
	#[serde(default)]
	pub lookuper: Lookuper,
	#[serde(default = "default_clean_interval", with = "crate::config::serde_duration")]
	pub clean_interval: Duration,
	/// Leaky bucket only: burst capacity in units.
	#[serde(default)]
	pub capacity: u64,
	/// Leaky bucket only: units added per request.
	#[serde(default)]
	pub increment: u64,
	/// Deny instead of admitting when the limiter backend is unreachable.
	#[serde(default)]
	pub fail_closed: bool,
}

fn default_clean_interval() -> Duration {
	Duration::from_secs(60)
}

impl Settings {
	pub fn disabled() -> Settings {
		Settings {
			kind: RatelimitType::Disabled,
			group: Strng::default(),
			max_hits: 0,
			time_window: Duration::ZERO,
			lookuper: Lookuper::SameBucket,
			clean_interval: default_clean_interval(),
			capacity: 0,
			increment: 0,
			fail_closed: false,
		}
	}

	/// Leaky bucket: time to leak one unit.
	pub fn emission(&self) -> Duration {
		if self.max_hits == 0 {
			return self.time_window;
		}
		self.time_window / self.max_hits as u32
	}
}

/// All limiter variants answer through this surface. Infra errors are
/// surfaced as `Err`; the proxy fails open unless the route is tagged
/// fail-closed.
#[async_trait]
pub trait Limiter: Send + Sync {
	async fn allow(&self, key: &str) -> Result<bool, KvError>;
	/// Seconds a client should wait before retrying; never less than 1.
	async fn retry_after(&self, key: &str) -> u64;
	/// Timestamp of the oldest tracked hit, if any.
	async fn oldest(&self, key: &str) -> Option<std::time::SystemTime>;
	fn close(&self) {}
}

/// Always admits.
pub struct VoidLimiter;

#[async_trait]
impl Limiter for VoidLimiter {
	async fn allow(&self, _key: &str) -> Result<bool, KvError> {
		Ok(true)
	}
	async fn retry_after(&self, _key: &str) -> u64 {
		1
	}
	async fn oldest(&self, _key: &str) -> Option<std::time::SystemTime> {
		None
	}
}

/// Backends available to cluster-scoped limiters.
pub struct RegistryBackends {
	pub kv: Option<Arc<dyn KvStore>>,
	pub swarm: Option<Arc<dyn swarm::Swarm>>,
	/// `cache_period = time_window / cache_period_factor`.
	pub cache_period_factor: u32,
}

impl Default for RegistryBackends {
	fn default() -> Self {
		Self {
			kv: None,
			swarm: None,
			cache_period_factor: cluster::DEFAULT_CACHE_PERIOD_FACTOR,
		}
	}
}

/// Thread-safe lazy construction of limiters; instances are retained for the
/// registry's lifetime and closed when it drops.
pub struct RatelimitRegistry {
	backends: RegistryBackends,
	limiters: Mutex<HashMap<Settings, Arc<dyn Limiter>>>,
}

impl RatelimitRegistry {
	pub fn new(backends: RegistryBackends) -> RatelimitRegistry {
		RatelimitRegistry {
			backends,
			limiters: Mutex::new(HashMap::new()),
		}
	}

	pub fn get(&self, settings: &Settings) -> Arc<dyn Limiter> {
		let mut limiters = self.limiters.lock();
		if let Some(l) = limiters.get(settings) {
			return l.clone();
		}
		let limiter = self.construct(settings);
		limiters.insert(settings.clone(), limiter.clone());
		limiter
	}

	fn construct(&self, settings: &Settings) -> Arc<dyn Limiter> {
		match settings.kind {
			RatelimitType::Disabled => Arc::new(VoidLimiter),
			RatelimitType::LocalClient | RatelimitType::LocalService => {
				Arc::new(local::SlidingWindow::new(settings.clone()))
			},
			RatelimitType::ClusterClient | RatelimitType::ClusterService => {
				if let Some(kv) = &self.backends.kv {
					Arc::new(cluster::ClusterLimiter::new(
						settings.clone(),
						kv.clone(),
						self.backends.cache_period_factor,
					))
				} else if let Some(sw) = &self.backends.swarm {
					Arc::new(swarm::SwarmLimiter::new(settings.clone(), sw.clone()))
				} else {
					warn!(
						group = settings.group.as_str(),
						"cluster rate limit requested without kv or swarm backend, falling back to local"
					);
					Arc::new(local::SlidingWindow::new(settings.clone()))
				}
			},
			RatelimitType::LeakyBucket => match &self.backends.kv {
				Some(kv) => Arc::new(leaky::LeakyBucket::new(settings.clone(), kv.clone())),
				None => {
					warn!(
						group = settings.group.as_str(),
						"leaky bucket requested without kv backend, disabling"
					);
					Arc::new(VoidLimiter)
				},
			},
		}
	}
}

impl Drop for RatelimitRegistry {
	fn drop(&mut self) {
		for l in self.limiters.lock().values() {
			l.close();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn settings_are_structural_map_keys() {
		let reg = RatelimitRegistry::new(RegistryBackends::default());
		let mut a = Settings::disabled();
		a.kind = RatelimitType::LocalClient;
		a.max_hits = 10;
		a.time_window = Duration::from_secs(1);
		let b = a.clone();
		let la = reg.get(&a);
		let lb = reg.get(&b);
		assert!(Arc::ptr_eq(&la, &lb), "equal settings share one limiter");

		let mut c = a.clone();
		c.max_hits = 11;
		let lc = reg.get(&c);
		assert!(!Arc::ptr_eq(&la, &lc));
	}

	#[tokio::test]
	async fn disabled_always_allows() {
		let reg = RatelimitRegistry::new(RegistryBackends::default());
		let l = reg.get(&Settings::disabled());
		for _ in 0..100 {
			assert!(l.allow("k").await.unwrap());
		}
	}

	#[test]
	fn lookuper_variants() {
		let req = ::http::Request::builder()
			.uri("http://h/")
			.header("x-key", "tenant-1")
			.header("authorization", "Bearer t")
			.body(http::empty_body())
			.unwrap();
		let peer: SocketAddr = "10.1.2.3:4444".parse().unwrap();
		assert_eq!(Lookuper::ClientIp.lookup(&req, Some(peer)), "10.1.2.3");
		assert_eq!(
			Lookuper::Header(strng::literal!("x-key")).lookup(&req, Some(peer)),
			"tenant-1"
		);
		assert_eq!(Lookuper::SameBucket.lookup(&req, Some(peer)), "s");
		assert_eq!(
			Lookuper::Tuple(vec![Lookuper::ClientIp, Lookuper::SameBucket]).lookup(&req, Some(peer)),
			"10.1.2.3|s"
		);
	}
}
