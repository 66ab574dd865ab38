//! In-memory `KvStore` used by tests and single-instance deployments without
//! an external store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{KvError, KvStore, LeakyBucketVerdict};
use crate::*;

#[derive(Default)]
struct Entry {
	value: Option<String>,
	zset: Vec<(String, f64)>,
	expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct MemoryKv {
	entries: Mutex<HashMap<String, Entry>>,
	/// When set, every command fails; lets tests exercise fail-open paths.
	pub unavailable: std::sync::atomic::AtomicBool,
}

impl MemoryKv {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_unavailable(&self, v: bool) {
		self
			.unavailable
			.store(v, std::sync::atomic::Ordering::Relaxed);
	}

	fn check_up(&self) -> Result<(), KvError> {
		if self.unavailable.load(std::sync::atomic::Ordering::Relaxed) {
			return Err(KvError::Unavailable("kv marked unavailable".to_string()));
		}
		Ok(())
	}

	fn with_entry<R>(&self, key: &str, f: impl FnOnce(&mut Entry) -> R) -> R {
		let mut entries = self.entries.lock();
		let entry = entries.entry(key.to_string()).or_default();
		if let Some(exp) = entry.expires_at
			&& exp <= Instant::now()
		{
			*entry = Entry::default();
		}
		f(entry)
	}
}

#[async_trait]
impl KvStore for MemoryKv {
	async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
		self.check_up()?;
		Ok(self.with_entry(key, |e| e.value.clone()))
	}

	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
		self.check_up()?;
		self.with_entry(key, |e| {
			e.value = Some(value.to_string());
			e.expires_at = ttl.map(|t| Instant::now() + t);
		});
		Ok(())
	}

	async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
		self.check_up()?;
		self.with_entry(key, |e| e.expires_at = Some(Instant::now() + ttl));
		Ok(())
	}

	async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
		self.check_up()?;
		self.with_entry(key, |e| {
			e.zset.retain(|(m, _)| m != member);
			e.zset.push((member.to_string(), score));
		});
		Ok(())
	}

	async fn zcard(&self, key: &str) -> Result<u64, KvError> {
		self.check_up()?;
		Ok(self.with_entry(key, |e| e.zset.len() as u64))
	}

	async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError> {
		self.check_up()?;
		self.with_entry(key, |e| e.zset.retain(|(m, _)| m != member));
		Ok(())
	}

	async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, KvError> {
		self.check_up()?;
		Ok(self.with_entry(key, |e| {
			let before = e.zset.len();
			e.zset.retain(|(_, s)| *s < min || *s > max);
			(before - e.zset.len()) as u64
		}))
	}

	async fn zrangebyscore_withscores(
		&self,
		key: &str,
		min: f64,
		max: f64,
	) -> Result<Vec<(String, f64)>, KvError> {
		self.check_up()?;
		Ok(self.with_entry(key, |e| {
			let mut hits: Vec<(String, f64)> = e
				.zset
				.iter()
				.filter(|(_, s)| *s >= min && *s <= max)
				.cloned()
				.collect();
			hits.sort_by(|a, b| a.1.total_cmp(&b.1));
			hits
		}))
	}

	async fn leaky_bucket_add(
		&self,
		key: &str,
		emission_micros: u64,
		capacity: u64,
		increment: u64,
		now_micros: u64,
	) -> Result<LeakyBucketVerdict, KvError> {
		self.check_up()?;
		Ok(self.with_entry(key, |e| {
			let stored = e
				.value
				.as_deref()
				.and_then(|v| v.parse::<u64>().ok())
				.unwrap_or(0);
			let empty_at = stored.max(now_micros);
			let new_empty_at = empty_at + increment * emission_micros;
			let max_empty_at = now_micros + capacity * emission_micros;
			if new_empty_at > max_empty_at {
				return LeakyBucketVerdict::Denied {
					retry_after_micros: new_empty_at - max_empty_at,
				};
			}
			e.value = Some(new_empty_at.to_string());
			e.expires_at = Some(Instant::now() + Duration::from_micros(new_empty_at - now_micros));
			LeakyBucketVerdict::Allowed
		}))
	}
}
