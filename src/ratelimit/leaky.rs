//! Leaky bucket over the KV store's atomic script.
//!
//! The only KV state is `empty_at`, the microsecond timestamp at which the
//! bucket drains completely. Adding `increment` units pushes it forward by
//! `increment * emission`; the add is rejected when that would exceed the
//! burst capacity.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Limiter, Settings};
use crate::kv::{KvError, KvStore, LeakyBucketVerdict, now_micros};
use crate::*;

pub struct LeakyBucket {
	settings: Settings,
	kv: Arc<dyn KvStore>,
	/// Last denial per key, so `retry_after` answers without another round
	/// trip.
	last_denial: Mutex<HashMap<String, u64>>,
}

impl LeakyBucket {
	pub fn new(settings: Settings, kv: Arc<dyn KvStore>) -> LeakyBucket {
		LeakyBucket {
			settings,
			kv,
			last_denial: Mutex::new(HashMap::new()),
		}
	}

	fn kv_key(&self, key: &str) -> String {
		format!("leakybucket.{}.{}", self.settings.group, key)
	}
}

#[async_trait]
impl Limiter for LeakyBucket {
	async fn allow(&self, key: &str) -> Result<bool, KvError> {
		let emission = self.settings.emission().as_micros() as u64;
		let verdict = self
			.kv
			.leaky_bucket_add(
				&self.kv_key(key),
				emission,
				self.settings.capacity.max(1),
				self.settings.increment.max(1),
				now_micros(),
			)
			.await?;
		match verdict {
			LeakyBucketVerdict::Allowed => {
				self.last_denial.lock().remove(key);
				Ok(true)
			},
			LeakyBucketVerdict::Denied { retry_after_micros } => {
				self
					.last_denial
					.lock()
					.insert(key.to_string(), retry_after_micros);
				Ok(false)
			},
		}
	}

	async fn retry_after(&self, key: &str) -> u64 {
		let micros = self
			.last_denial
			.lock()
			.get(key)
			.copied()
			.unwrap_or(1_000_000);
		micros.div_ceil(1_000_000).max(1)
	}

	async fn oldest(&self, key: &str) -> Option<std::time::SystemTime> {
		// The bucket only tracks its drain time; expose it as the reference
		// timestamp.
		let v = self.kv.get(&self.kv_key(key)).await.ok()??;
		let micros = v.parse::<u64>().ok()?;
		Some(std::time::UNIX_EPOCH + Duration::from_micros(micros))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::memory::MemoryKv;
	use crate::ratelimit::RatelimitType;

	fn bucket(capacity: u64, leak_period: Duration, leak_volume: u64) -> LeakyBucket {
		let settings = Settings {
			kind: RatelimitType::LeakyBucket,
			group: strng::literal!("lb"),
			// emission = leak_period / leak_volume
			max_hits: leak_volume,
			time_window: leak_period,
			capacity,
			increment: 1,
			..Settings::disabled()
		};
		let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
		LeakyBucket::new(settings, kv)
	}

	#[tokio::test]
	async fn burst_capacity_then_deny_with_retry_after() {
		// capacity=5, leak_period=1s, leak_volume=5: five immediate adds
		// fill the bucket, the sixth is denied for at least a second.
		let b = bucket(5, Duration::from_secs(1), 5);
		for i in 0..5 {
			assert!(b.allow("k").await.unwrap(), "request {i} should fit");
		}
		assert!(!b.allow("k").await.unwrap());
		assert!(b.retry_after("k").await >= 1);
	}

	#[tokio::test]
	async fn bucket_drains_over_time() {
		let b = bucket(2, Duration::from_millis(100), 2);
		assert!(b.allow("k").await.unwrap());
		assert!(b.allow("k").await.unwrap());
		assert!(!b.allow("k").await.unwrap());
		// One emission interval later a single unit fits again.
		tokio::time::sleep(Duration::from_millis(60)).await;
		assert!(b.allow("k").await.unwrap());
		assert!(!b.allow("k").await.unwrap());
	}

	#[tokio::test]
	async fn keys_are_independent() {
		let b = bucket(1, Duration::from_secs(1), 1);
		assert!(b.allow("a").await.unwrap());
		assert!(!b.allow("a").await.unwrap());
		assert!(b.allow("b").await.unwrap());
	}
}
