//! Narrow command surface the rate limiters need from an external KV store.
//!
//! Any store able to supply these primitives suffices; the production
//! implementation is Redis/Valkey (`redis.rs`), tests run on the in-memory
//! fake (`memory.rs`).

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum KvError {
	#[error("kv command failed: {0}")]
	Command(String),
	#[error("kv unavailable: {0}")]
	Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakyBucketVerdict {
	Allowed,
	Denied { retry_after_micros: u64 },
}

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
	async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;
	async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;
	async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError>;
	async fn zcard(&self, key: &str) -> Result<u64, KvError>;
	async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError>;
	async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, KvError>;
	async fn zrangebyscore_withscores(
		&self,
		key: &str,
		min: f64,
		max: f64,
	) -> Result<Vec<(String, f64)>, KvError>;
	/// The one server-side scripted operation: atomically advance a leaky
	/// bucket's drain time. Runs as a single round trip because concurrent
	/// limiter instances race on the same label.
	async fn leaky_bucket_add(
		&self,
		key: &str,
		emission_micros: u64,
		capacity: u64,
		increment: u64,
		now_micros: u64,
	) -> Result<LeakyBucketVerdict, KvError>;
}

pub fn now_micros() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_micros() as u64
}
