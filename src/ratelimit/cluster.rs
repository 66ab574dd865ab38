//! Cluster-shared sliding window synced through the external KV store.
//!
//! KV state per key is a sorted set of `(count, timestamp)` entries, scored
//! by timestamp in microseconds. Each instance batches its admissions into a
//! local sum and flushes it as one entry per cache period, so KV traffic is
//! bounded by `cache_period_factor` regardless of request rate. Accuracy is
//! `(N-1)/N` for factor N.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use super::{Limiter, Settings};
use crate::kv::{KvError, KvStore, now_micros};
use crate::*;

pub const DEFAULT_CACHE_PERIOD_FACTOR: u32 = 256;

#[derive(Default, Clone)]
struct CacheEntry {
	last_sync: Option<Instant>,
	synced_sum: u64,
	local_sum: u64,
	oldest_micros: Option<u64>,
	fail_open: bool,
}

pub struct ClusterLimiter {
	settings: Settings,
	kv: Arc<dyn KvStore>,
	cache: Mutex<HashMap<String, CacheEntry>>,
	cache_period: Duration,
	/// Disambiguates this instance's sorted-set members.
	instance: u64,
}

impl ClusterLimiter {
	pub fn new(settings: Settings, kv: Arc<dyn KvStore>, factor: u32) -> ClusterLimiter {
		let factor = factor.max(2);
		let cache_period = settings.time_window / factor;
		ClusterLimiter {
			settings,
			kv,
			cache: Mutex::new(HashMap::new()),
			cache_period,
			instance: rand::rng().random(),
		}
	}

	fn kv_key(&self, key: &str) -> String {
		format!("ratelimit.{}.{}", self.settings.group, key)
	}

	async fn sync(&self, key: &str, flush: u64) -> Result<(u64, Option<u64>), KvError> {
		let kv_key = self.kv_key(key);
		let now = now_micros();
		let window = self.settings.time_window.as_micros() as u64;

		self
			.kv
			.zremrangebyscore(&kv_key, 0.0, now.saturating_sub(window) as f64)
			.await?;
		if flush > 0 {
			let member = format!("{flush}:{now}:{:x}", self.instance);
			self.kv.zadd(&kv_key, &member, now as f64).await?;
		}
		let entries = self
			.kv
			.zrangebyscore_withscores(&kv_key, now.saturating_sub(window) as f64, now as f64)
			.await?;
		let sum: u64 = entries
			.iter()
			.filter_map(|(m, _)| m.split(':').next()?.parse::<u64>().ok())
			.sum();
		let oldest = entries.first().map(|(_, s)| *s as u64);
		// Keep the key alive one extra window past the active one.
		self
			.kv
			.expire(&kv_key, self.settings.time_window * 2)
			.await?;
		Ok((sum, oldest))
	}
}

#[async_trait]
impl Limiter for ClusterLimiter {
	async fn allow(&self, key: &str) -> Result<bool, KvError> {
		// Snapshot under the lock; KV round trips happen outside it.
		let (needs_sync, flush) = {
			let mut cache = self.cache.lock();
			let entry = cache.entry(key.to_string()).or_default();
			let stale = entry
				.last_sync
				.map(|t| t.elapsed() > self.cache_period)
				.unwrap_or(true);
			if stale {
				// Claim the sync so concurrent requests don't pile onto the KV.
				entry.last_sync = Some(Instant::now());
				let flush = entry.local_sum;
				(true, flush)
			} else {
				(false, 0)
			}
		};

		if needs_sync {
			match self.sync(key, flush).await {
				Ok((sum, oldest)) => {
					let mut cache = self.cache.lock();
					let entry = cache.entry(key.to_string()).or_default();
					// The flushed batch is now part of the synced sum.
					entry.local_sum = entry.local_sum.saturating_sub(flush);
					entry.synced_sum = sum;
					entry.oldest_micros = oldest;
					entry.fail_open = false;
				},
				Err(e) => {
					debug!(key, "rate limit kv sync failed: {e}");
					let mut cache = self.cache.lock();
					let entry = cache.entry(key.to_string()).or_default();
					entry.fail_open = true;
				},
			}
		}

		let mut cache = self.cache.lock();
		let entry = cache.entry(key.to_string()).or_default();
		if entry.fail_open {
			return Ok(!self.settings.fail_closed);
		}
		if entry.synced_sum + entry.local_sum >= self.settings.max_hits {
			return Ok(false);
		}
		entry.local_sum += 1;
		Ok(true)
	}

	async fn retry_after(&self, key: &str) -> u64 {
		let oldest = {
			let cache = self.cache.lock();
			cache.get(key).and_then(|e| e.oldest_micros)
		};
		let Some(oldest) = oldest else {
			return 1;
		};
		let elapsed_micros = now_micros().saturating_sub(oldest);
		let window = self.settings.time_window.as_micros() as u64;
		(window.saturating_sub(elapsed_micros) / 1_000_000).max(1)
	}

	async fn oldest(&self, key: &str) -> Option<std::time::SystemTime> {
		let cache = self.cache.lock();
		let micros = cache.get(key)?.oldest_micros?;
		Some(std::time::UNIX_EPOCH + Duration::from_micros(micros))
	}
}
