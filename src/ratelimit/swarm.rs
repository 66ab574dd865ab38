//! Cluster-local rate limiting over a gossip swarm.
//!
//! Each instance periodically shares, under `ratelimit.<group>.<bucket>`, the
//! timestamp of its most recent admission and its count over the current
//! window. Peers estimate the global rate by summing fresh contributions;
//! the estimate is eventually consistent and may admit short bursts, so the
//! KV-backed limiter is preferred when strict accuracy matters.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Limiter, Settings};
use crate::kv::{KvError, now_micros};
use crate::*;

#[derive(Debug, Clone, Copy)]
pub struct SwarmEntry {
	pub last_request_micros: u64,
	pub count_in_window: u64,
}

/// The gossip transport. Values propagate to peers with arbitrary delay;
/// reads return the latest locally known value per peer.
pub trait Swarm: Send + Sync + 'static {
	fn local_node(&self) -> Strng;
	fn share(&self, key: &str, entry: SwarmEntry);
	fn values(&self, key: &str) -> HashMap<Strng, SwarmEntry>;
}

pub struct SwarmLimiter {
	settings: Settings,
	swarm: Arc<dyn Swarm>,
	/// Local admissions per bucket within the current window.
	local: Mutex<HashMap<String, Vec<u64>>>,
}

impl SwarmLimiter {
	pub fn new(settings: Settings, swarm: Arc<dyn Swarm>) -> SwarmLimiter {
		SwarmLimiter {
			settings,
			swarm,
			local: Mutex::new(HashMap::new()),
		}
	}

	fn swarm_key(&self, key: &str) -> String {
		format!("ratelimit.{}.{}", self.settings.group, key)
	}

	/// Peer contributions, ignoring entries older than the window.
	fn peer_sum(&self, key: &str, now: u64, window: u64) -> u64 {
		let local_node = self.swarm.local_node();
		self
			.swarm
			.values(&self.swarm_key(key))
			.iter()
			.filter(|(node, _)| **node != local_node)
			.filter(|(_, e)| now.saturating_sub(e.last_request_micros) <= window)
			.map(|(_, e)| e.count_in_window)
			.sum()
	}
}

#[async_trait]
impl Limiter for SwarmLimiter {
	async fn allow(&self, key: &str) -> Result<bool, KvError> {
		let now = now_micros();
		let window = self.settings.time_window.as_micros() as u64;
		let (local_count, allowed) = {
			let mut local = self.local.lock();
			let hits = local.entry(key.to_string()).or_default();
			hits.retain(|t| now.saturating_sub(*t) <= window);
			let estimated = hits.len() as u64 + self.peer_sum(key, now, window);
			if estimated >= self.settings.max_hits {
				(hits.len() as u64, false)
			} else {
				hits.push(now);
				(hits.len() as u64, true)
			}
		};
		if allowed {
			self.swarm.share(
				&self.swarm_key(key),
				SwarmEntry {
					last_request_micros: now,
					count_in_window: local_count,
				},
			);
		}
		Ok(allowed)
	}

	async fn retry_after(&self, key: &str) -> u64 {
		let now = now_micros();
		let oldest = {
			let local = self.local.lock();
			local.get(key).and_then(|h| h.first().copied())
		};
		let Some(oldest) = oldest else { return 1 };
		let window = self.settings.time_window.as_micros() as u64;
		(window.saturating_sub(now.saturating_sub(oldest)) / 1_000_000).max(1)
	}

	async fn oldest(&self, key: &str) -> Option<std::time::SystemTime> {
		let local = self.local.lock();
		let micros = local.get(key)?.first().copied()?;
		Some(std::time::UNIX_EPOCH + Duration::from_micros(micros))
	}
}

/// Process-local swarm for tests and single-node setups: all handles share
/// one value map, one handle per simulated node.
pub struct InMemorySwarm {
	node: Strng,
	state: Arc<Mutex<HashMap<String, HashMap<Strng, SwarmEntry>>>>,
}

impl InMemorySwarm {
	pub fn cluster(nodes: usize) -> Vec<Arc<InMemorySwarm>> {
		let state = Arc::new(Mutex::new(HashMap::new()));
		(0..nodes)
			.map(|i| {
				Arc::new(InMemorySwarm {
					node: strng::format!("node-{i}"),
					state: state.clone(),
				})
			})
			.collect()
	}
}

impl Swarm for InMemorySwarm {
	fn local_node(&self) -> Strng {
		self.node.clone()
	}
	fn share(&self, key: &str, entry: SwarmEntry) {
		self
			.state
			.lock()
			.entry(key.to_string())
			.or_default()
			.insert(self.node.clone(), entry);
	}
	fn values(&self, key: &str) -> HashMap<Strng, SwarmEntry> {
		self.state.lock().get(key).cloned().unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ratelimit::RatelimitType;

	fn settings(max_hits: u64, window: Duration) -> Settings {
		Settings {
			kind: RatelimitType::ClusterClient,
			group: strng::literal!("sw"),
			max_hits,
			time_window: window,
			..Settings::disabled()
		}
	}

	#[tokio::test]
	async fn peers_share_the_budget() {
		let nodes = InMemorySwarm::cluster(2);
		let a = SwarmLimiter::new(settings(4, Duration::from_secs(10)), nodes[0].clone());
		let b = SwarmLimiter::new(settings(4, Duration::from_secs(10)), nodes[1].clone());

		assert!(a.allow("k").await.unwrap());
		assert!(a.allow("k").await.unwrap());
		assert!(b.allow("k").await.unwrap());
		assert!(b.allow("k").await.unwrap());
		// Both instances now see an estimated four hits.
		assert!(!a.allow("k").await.unwrap());
		assert!(!b.allow("k").await.unwrap());
	}

	#[tokio::test]
	async fn single_node_behaves_like_local_window() {
		let nodes = InMemorySwarm::cluster(1);
		let l = SwarmLimiter::new(settings(2, Duration::from_millis(50)), nodes[0].clone());
		assert!(l.allow("k").await.unwrap());
		assert!(l.allow("k").await.unwrap());
		assert!(!l.allow("k").await.unwrap());
		tokio::time::sleep(Duration::from_millis(60)).await;
		assert!(l.allow("k").await.unwrap());
	}
}
