//! Endpoint selection for load-balanced backends.
//!
//! Algorithms are stateless with respect to the routing table; the only
//! mutable state is per-endpoint atomic counters and the round-robin cursor.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::http::Request;
use crate::types::route::{LbEndpoint, Params};
use crate::*;

pub struct LbContext<'a> {
	pub endpoints: &'a [LbEndpoint],
	pub request: &'a Request,
	pub params: &'a Params,
	pub peer_addr: Option<SocketAddr>,
}

impl LbContext<'_> {
	/// Consistent-hash key: the `consistentHashKey` route parameter when
	/// present, else the client IP (honoring `X-Forwarded-For`).
	fn hash_key(&self) -> Option<String> {
		if let Some(k) = self.params.get("consistentHashKey") {
			return Some(k.clone());
		}
		http::client_ip(self.request, self.peer_addr).map(|ip| ip.to_string())
	}
}

pub trait LbAlgorithm: Send + Sync {
	fn name(&self) -> &'static str;
	/// Returns an index into `ctx.endpoints`. `None` only for an empty set,
	/// which post-processing already rules out.
	fn apply(&self, ctx: &LbContext) -> Option<usize>;
}

pub const DEFAULT_ALGORITHM: &str = "roundRobin";

/// Resolve an algorithm by its route-definition name.
pub fn create(
	name: &str,
	endpoints: &[LbEndpoint],
	balance_factor: Option<f64>,
) -> anyhow::Result<Arc<dyn LbAlgorithm>> {
	Ok(match name {
		"roundRobin" => Arc::new(RoundRobin::new()),
		"random" => Arc::new(Random),
		"powerOfRandomNChoices" => Arc::new(PowerOfRandomNChoices { n: 2 }),
		"consistentHash" => Arc::new(ConsistentHash::new(endpoints, balance_factor)),
		other => anyhow::bail!("unknown load balancer algorithm {other:?}"),
	})
}

/// Atomic counter modulo endpoint count. The initial value is randomized so a
/// fleet restart does not point every instance at the same endpoint.
pub struct RoundRobin {
	counter: AtomicUsize,
}

impl RoundRobin {
	pub fn new() -> Self {
		Self {
			counter: AtomicUsize::new(rand::rng().random_range(0..usize::MAX / 2)),
		}
	}
}

impl Default for RoundRobin {
	fn default() -> Self {
		Self::new()
	}
}

impl LbAlgorithm for RoundRobin {
	fn name(&self) -> &'static str {
		"roundRobin"
	}
	fn apply(&self, ctx: &LbContext) -> Option<usize> {
		if ctx.endpoints.is_empty() {
			return None;
		}
		Some(self.counter.fetch_add(1, Ordering::Relaxed) % ctx.endpoints.len())
	}
}

pub struct Random;

impl LbAlgorithm for Random {
	fn name(&self) -> &'static str {
		"random"
	}
	fn apply(&self, ctx: &LbContext) -> Option<usize> {
		if ctx.endpoints.is_empty() {
			return None;
		}
		Some(rand::rng().random_range(0..ctx.endpoints.len()))
	}
}

/// Sample N endpoints uniformly, pick the one with the lowest inflight count;
/// ties go to the earlier sample.
pub struct PowerOfRandomNChoices {
	pub n: usize,
}

impl LbAlgorithm for PowerOfRandomNChoices {
	fn name(&self) -> &'static str {
		"powerOfRandomNChoices"
	}
	fn apply(&self, ctx: &LbContext) -> Option<usize> {
		if ctx.endpoints.is_empty() {
			return None;
		}
		let mut rng = rand::rng();
		let mut best: Option<usize> = None;
		for _ in 0..self.n.max(2) {
			let cand = rng.random_range(0..ctx.endpoints.len());
			best = Some(match best {
				None => cand,
				Some(b)
					if ctx.endpoints[cand].metrics.inflight() < ctx.endpoints[b].metrics.inflight() =>
				{
					cand
				},
				Some(b) => b,
			});
		}
		best
	}
}

const VIRTUAL_NODES: usize = 100;

/// Hash ring with 100 virtual nodes per endpoint, hashed by
/// `address||index`. With a balance factor set, the lookup walks the ring
/// past the primary owner until it finds an endpoint whose inflight count is
/// within `factor` of the average; `factor >= 1` guarantees one exists.
pub struct ConsistentHash {
	ring: Vec<(u64, usize)>,
	balance_factor: Option<f64>,
}

impl ConsistentHash {
	pub fn new(endpoints: &[LbEndpoint], balance_factor: Option<f64>) -> Self {
		let mut ring = Vec::with_capacity(endpoints.len() * VIRTUAL_NODES);
		for (i, ep) in endpoints.iter().enumerate() {
			for vn in 0..VIRTUAL_NODES {
				ring.push((hash(&format!("{}{}", ep.address, vn)), i));
			}
		}
		ring.sort_unstable();
		Self {
			ring,
			balance_factor: balance_factor.map(|f| f.max(1.0)),
		}
	}

	fn primary(&self, key: &str) -> Option<usize> {
		if self.ring.is_empty() {
			return None;
		}
		let h = hash(key);
		let pos = match self.ring.binary_search_by_key(&h, |(rh, _)| *rh) {
			Ok(i) => i,
			Err(i) if i == self.ring.len() => 0,
			Err(i) => i,
		};
		Some(pos)
	}
}

impl LbAlgorithm for ConsistentHash {
	fn name(&self) -> &'static str {
		"consistentHash"
	}
	fn apply(&self, ctx: &LbContext) -> Option<usize> {
		if ctx.endpoints.is_empty() {
			return None;
		}
		let key = match ctx.hash_key() {
			Some(k) => k,
			// No usable key: fall back to uniform choice.
			None => return Some(rand::rng().random_range(0..ctx.endpoints.len())),
		};
		let start = self.primary(&key)?;
		let Some(factor) = self.balance_factor else {
			return Some(self.ring[start].1);
		};
		let total: i64 = ctx
			.endpoints
			.iter()
			.map(|e| e.metrics.inflight())
			.sum();
		let limit = (total as f64 / ctx.endpoints.len() as f64) * factor;
		for off in 0..self.ring.len() {
			let (_, idx) = self.ring[(start + off) % self.ring.len()];
			if ctx.endpoints[idx].metrics.inflight() as f64 <= limit {
				return Some(idx);
			}
		}
		Some(self.ring[start].1)
	}
}

fn hash(s: &str) -> u64 {
	// DefaultHasher with default keys is deterministic within a process,
	// which is all ring placement needs.
	let mut h = std::collections::hash_map::DefaultHasher::new();
	s.hash(&mut h);
	h.finish()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::empty_body;

	fn endpoints(n: usize) -> Vec<LbEndpoint> {
		(0..n)
			.map(|i| LbEndpoint::parse(&format!("http://ep-{i}.test:8080")).unwrap())
			.collect()
	}

	fn req() -> Request {
		::http::Request::builder()
			.uri("http://example.test/")
			.body(empty_body())
			.unwrap()
	}

	fn ctx<'a>(eps: &'a [LbEndpoint], request: &'a Request, params: &'a Params) -> LbContext<'a> {
		LbContext {
			endpoints: eps,
			request,
			params,
			peer_addr: Some("10.0.0.1:55555".parse().unwrap()),
		}
	}

	#[test]
	fn round_robin_cycles() {
		let eps = endpoints(3);
		let r = req();
		let params = Params::new();
		let rr = RoundRobin::new();
		let c = ctx(&eps, &r, &params);
		let first = rr.apply(&c).unwrap();
		assert_eq!(rr.apply(&c).unwrap(), (first + 1) % 3);
		assert_eq!(rr.apply(&c).unwrap(), (first + 2) % 3);
	}

	#[test]
	fn power_of_two_prefers_less_loaded() {
		let eps = endpoints(2);
		eps[0].metrics.begin_request();
		eps[0].metrics.begin_request();
		let r = req();
		let params = Params::new();
		let p = PowerOfRandomNChoices { n: 16 };
		// With 16 samples over 2 endpoints both are sampled with near
		// certainty, so the less loaded one must win.
		assert_eq!(p.apply(&ctx(&eps, &r, &params)).unwrap(), 1);
	}

	#[test]
	fn consistent_hash_is_sticky() {
		let eps = endpoints(3);
		let ch = ConsistentHash::new(&eps, None);
		let r = req();
		let params = Params::new();
		let c = ctx(&eps, &r, &params);
		let first = ch.apply(&c).unwrap();
		for _ in 0..1000 {
			assert_eq!(ch.apply(&c).unwrap(), first);
		}
	}

	#[test]
	fn consistent_hash_key_param_overrides_client_ip() {
		let eps = endpoints(3);
		let ch = ConsistentHash::new(&eps, None);
		let r = req();
		let mut params = Params::new();
		params.insert(strng::literal!("consistentHashKey"), "user-1".to_string());
		let with_param = ch.apply(&ctx(&eps, &r, &params)).unwrap();
		for _ in 0..100 {
			assert_eq!(ch.apply(&ctx(&eps, &r, &params)).unwrap(), with_param);
		}
	}

	#[test]
	fn removing_an_endpoint_moves_only_its_keys() {
		let eps = endpoints(3);
		let full = ConsistentHash::new(&eps, None);
		let keys: Vec<String> = (0..300).map(|i| format!("10.0.{}.{}", i / 250, i % 250)).collect();
		let before: Vec<usize> = keys
			.iter()
			.map(|k| full.ring[full.primary(k).unwrap()].1)
			.collect();

		// Drop endpoint 2; survivors keep their ring positions.
		let survivors: Vec<LbEndpoint> = endpoints(2);
		let reduced = ConsistentHash::new(&survivors, None);
		let mut moved = 0;
		for (k, &was) in keys.iter().zip(before.iter()) {
			let now = reduced.ring[reduced.primary(k).unwrap()].1;
			if was < 2 {
				assert_eq!(now, was, "key {k} was not on the removed endpoint");
			} else if now != 2 {
				moved += 1;
			}
		}
		// Everything that was on the removed endpoint moved somewhere else.
		let on_removed = before.iter().filter(|&&b| b == 2).count();
		assert_eq!(moved, on_removed);
		// And that is roughly a third of the key space.
		assert!(on_removed > 0 && on_removed < keys.len() / 2);
	}

	#[test]
	fn bounded_load_skips_hot_endpoint() {
		let eps = endpoints(3);
		let ch = ConsistentHash::new(&eps, Some(1.5));
		let r = req();
		let params = Params::new();
		let c = ctx(&eps, &r, &params);
		let primary = ch.apply(&c).unwrap();
		// Overload the primary; the walk must land elsewhere.
		for _ in 0..100 {
			eps[primary].metrics.begin_request();
		}
		let next = ch.apply(&c).unwrap();
		assert_ne!(next, primary);
	}
}
