//! Redis/Valkey implementation of the KV surface, sharded over a ring of
//! instances. Keys are pinned to shards with a configurable hash algorithm so
//! every proxy instance agrees on key placement without coordination.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{KvError, KvStore, LeakyBucketVerdict};
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
	#[default]
	Rendezvous,
	RendezvousVnodes,
	Jump,
	Mpchash,
}

const LEAKY_BUCKET_SCRIPT: &str = r#"
local empty_at = tonumber(redis.call('GET', KEYS[1]) or '0')
local emission = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local increment = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
if empty_at < now then
  empty_at = now
end
local new_empty_at = empty_at + increment * emission
local max_empty_at = now + capacity * emission
if new_empty_at > max_empty_at then
  return {0, new_empty_at - max_empty_at}
end
redis.call('SET', KEYS[1], tostring(new_empty_at), 'PX', math.ceil((new_empty_at - now) / 1000))
return {1, 0}
"#;

pub struct RedisRing {
	shards: Vec<Shard>,
	algorithm: HashAlgorithm,
	script: redis::Script,
}

struct Shard {
	address: String,
	conn: ConnectionManager,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RedisConfig {
	/// `redis://` / `rediss://` URLs, one per shard.
	pub addresses: Vec<String>,
	#[serde(default)]
	pub password: Option<String>,
	#[serde(default)]
	pub hash_algorithm: HashAlgorithm,
}

impl RedisRing {
	pub async fn connect(cfg: &RedisConfig) -> anyhow::Result<RedisRing> {
		anyhow::ensure!(!cfg.addresses.is_empty(), "no kv addresses configured");
		let mut shards = Vec::with_capacity(cfg.addresses.len());
		for addr in &cfg.addresses {
			let url = match &cfg.password {
				Some(pw) => inject_password(addr, pw)?,
				None => addr.clone(),
			};
			let client = redis::Client::open(url.as_str()).context("kv url")?;
			let conn = ConnectionManager::new(client)
				.await
				.with_context(|| format!("connect kv shard {addr}"))?;
			shards.push(Shard {
				address: addr.clone(),
				conn,
			});
		}
		Ok(RedisRing {
			shards,
			algorithm: cfg.hash_algorithm,
			script: redis::Script::new(LEAKY_BUCKET_SCRIPT),
		})
	}

	fn shard(&self, key: &str) -> ConnectionManager {
		let idx = match self.algorithm {
			HashAlgorithm::Rendezvous => rendezvous(key, &self.shards, 1),
			HashAlgorithm::RendezvousVnodes => rendezvous(key, &self.shards, 16),
			HashAlgorithm::Mpchash => multi_probe(key, self.shards.len()),
			HashAlgorithm::Jump => jump(hash64(key), self.shards.len()),
		};
		self.shards[idx].conn.clone()
	}
}

/// Highest-random-weight placement; vnodes > 1 smooth the distribution.
fn rendezvous(key: &str, shards: &[Shard], vnodes: usize) -> usize {
	shards
		.iter()
		.enumerate()
		.map(|(i, s)| {
			let best = (0..vnodes)
				.map(|v| hash64(&format!("{key}|{}|{v}", s.address)))
				.max()
				.unwrap_or(0);
			(best, i)
		})
		.max()
		.map(|(_, i)| i)
		.unwrap_or(0)
}

/// Two-probe variant: hash the key twice, keep the higher-scoring shard.
fn multi_probe(key: &str, n: usize) -> usize {
	let a = jump(hash64(key), n);
	let b = jump(hash64(&format!("{key}#2")), n);
	if hash64(&format!("{key}/{a}")) >= hash64(&format!("{key}/{b}")) {
		a
	} else {
		b
	}
}

/// Jump consistent hash (Lamping & Veach).
fn jump(mut key: u64, buckets: usize) -> usize {
	let mut b: i64 = -1;
	let mut j: i64 = 0;
	while j < buckets as i64 {
		b = j;
		key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
		j = ((b.wrapping_add(1) as f64) * ((1u64 << 31) as f64 / ((key >> 33).wrapping_add(1) as f64)))
			as i64;
	}
	b.max(0) as usize
}

fn hash64(s: &str) -> u64 {
	use std::hash::{Hash, Hasher};
	let mut h = std::collections::hash_map::DefaultHasher::new();
	s.hash(&mut h);
	h.finish()
}

fn inject_password(addr: &str, password: &str) -> anyhow::Result<String> {
	let rest = addr
		.strip_prefix("redis://")
		.map(|r| ("redis://", r))
		.or_else(|| addr.strip_prefix("rediss://").map(|r| ("rediss://", r)));
	match rest {
		Some((scheme, r)) if !r.contains('@') => Ok(format!("{scheme}:{password}@{r}")),
		Some(_) => Ok(addr.to_string()),
		None => anyhow::bail!("kv address {addr:?} must be a redis:// or rediss:// url"),
	}
}

fn cmd_err(e: redis::RedisError) -> KvError {
	if e.is_connection_refusal() || e.is_timeout() || e.is_connection_dropped() {
		KvError::Unavailable(e.to_string())
	} else {
		KvError::Command(e.to_string())
	}
}

#[async_trait]
impl KvStore for RedisRing {
	async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
		let mut conn = self.shard(key);
		conn.get(key).await.map_err(cmd_err)
	}

	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
		let mut conn = self.shard(key);
		match ttl {
			Some(ttl) => conn
				.set_ex(key, value, ttl.as_secs().max(1))
				.await
				.map_err(cmd_err),
			None => conn.set(key, value).await.map_err(cmd_err),
		}
	}

	async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
		let mut conn = self.shard(key);
		let _: i64 = conn
			.expire(key, ttl.as_secs().max(1) as i64)
			.await
			.map_err(cmd_err)?;
		Ok(())
	}

	async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
		let mut conn = self.shard(key);
		let _: i64 = conn.zadd(key, member, score).await.map_err(cmd_err)?;
		Ok(())
	}

	async fn zcard(&self, key: &str) -> Result<u64, KvError> {
		let mut conn = self.shard(key);
		conn.zcard(key).await.map_err(cmd_err)
	}

	async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError> {
		let mut conn = self.shard(key);
		let _: i64 = conn.zrem(key, member).await.map_err(cmd_err)?;
		Ok(())
	}

	async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, KvError> {
		let mut conn = self.shard(key);
		conn.zrembyscore(key, min, max).await.map_err(cmd_err)
	}

	async fn zrangebyscore_withscores(
		&self,
		key: &str,
		min: f64,
		max: f64,
	) -> Result<Vec<(String, f64)>, KvError> {
		let mut conn = self.shard(key);
		redis::cmd("ZRANGEBYSCORE")
			.arg(key)
			.arg(min)
			.arg(max)
			.arg("WITHSCORES")
			.query_async(&mut conn)
			.await
			.map_err(cmd_err)
	}

	async fn leaky_bucket_add(
		&self,
		key: &str,
		emission_micros: u64,
		capacity: u64,
		increment: u64,
		now_micros: u64,
	) -> Result<LeakyBucketVerdict, KvError> {
		let mut conn = self.shard(key);
		let res: Vec<i64> = self
			.script
			.key(key)
			.arg(emission_micros)
			.arg(capacity)
			.arg(increment)
			.arg(now_micros)
			.invoke_async(&mut conn)
			.await
			.map_err(cmd_err)?;
		match res.as_slice() {
			[1, _] => Ok(LeakyBucketVerdict::Allowed),
			[0, retry] => Ok(LeakyBucketVerdict::Denied {
				retry_after_micros: (*retry).max(0) as u64,
			}),
			other => Err(KvError::Command(format!(
				"unexpected script result {other:?}"
			))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn jump_is_stable_and_in_range() {
		for n in 1..10usize {
			for k in 0..100u64 {
				let b = jump(k, n);
				assert!(b < n);
				assert_eq!(b, jump(k, n));
			}
		}
	}

	#[test]
	fn jump_moves_few_keys_on_growth() {
		let moved = (0..1000u64).filter(|k| jump(*k, 4) != jump(*k, 5)).count();
		// Growing 4 -> 5 shards should move about one fifth of the keys.
		assert!(moved < 350, "moved {moved}");
	}

	#[test]
	fn password_injection() {
		assert_eq!(
			inject_password("redis://h:6379", "pw").unwrap(),
			"redis://:pw@h:6379"
		);
		// Already authenticated URLs are left alone.
		assert_eq!(
			inject_password("redis://u:x@h:6379", "pw").unwrap(),
			"redis://u:x@h:6379"
		);
		assert!(inject_password("http://h", "pw").is_err());
	}
}
