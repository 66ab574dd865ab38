//! Configuration surface: YAML file plus a few CLI/env overrides applied by
//! the binary.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::breaker::BreakerSettings;
use crate::routing::builder::DefaultFilters;
use crate::types::route::RouteDefinition;
use crate::*;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Config {
	pub listen: ListenConfig,
	pub routing: RoutingConfig,
	pub proxy: ProxyConfig,
	pub client: crate::client::ClientConfig,
	pub ratelimit: RatelimitConfig,
	pub breakers: BreakerConfig,
	pub log_level: LogLevel,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
	fn default() -> Self {
		LogLevel("info".to_string())
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ListenConfig {
	pub address: SocketAddr,
	pub tls_cert: Option<PathBuf>,
	pub tls_key: Option<PathBuf>,
	/// Keep-alive connection limits; exceeding either closes the connection
	/// after the next response.
	pub max_keepalive_requests: Option<u64>,
	#[serde(with = "serde_opt_duration")]
	pub max_keepalive_duration: Option<Duration>,
}

impl Default for ListenConfig {
	fn default() -> Self {
		Self {
			address: SocketAddr::from(([0, 0, 0, 0], 9090)),
			tls_cert: None,
			tls_key: None,
			max_keepalive_requests: None,
			max_keepalive_duration: None,
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RoutingConfig {
	pub route_files: Vec<PathBuf>,
	pub inline_routes: Vec<RouteDefinition>,
	#[serde(with = "serde_duration")]
	pub poll_interval: Duration,
	pub ignore_trailing_slash: bool,
	pub priority_routes: Vec<RouteDefinition>,
	pub default_filters: DefaultFilters,
}

impl Default for RoutingConfig {
	fn default() -> Self {
		Self {
			route_files: Vec::new(),
			inline_routes: Vec::new(),
			poll_interval: Duration::from_secs(3),
			ignore_trailing_slash: false,
			priority_routes: Vec::new(),
			default_filters: DefaultFilters::default(),
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ProxyConfig {
	/// Negative means loopback backends are not allowed at all.
	pub max_loopbacks: i32,
	pub preserve_host: bool,
	pub experimental_upgrade: bool,
	pub debug: bool,
	/// Default backend deadline; a `backendTimeout` filter overrides it per
	/// request.
	#[serde(with = "serde_opt_duration")]
	pub backend_timeout: Option<Duration>,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		Self {
			max_loopbacks: 9,
			preserve_host: false,
			experimental_upgrade: false,
			debug: false,
			backend_timeout: None,
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RatelimitConfig {
	pub redis: Option<crate::kv::redis::RedisConfig>,
	pub cache_period_factor: u32,
}

impl Default for RatelimitConfig {
	fn default() -> Self {
		Self {
			redis: None,
			cache_period_factor: crate::ratelimit::cluster::DEFAULT_CACHE_PERIOD_FACTOR,
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BreakerConfig {
	pub default: Option<BreakerSettings>,
	pub hosts: HashMap<Strng, BreakerSettings>,
}

impl Config {
	pub fn load(path: &std::path::Path) -> anyhow::Result<Config> {
		let contents = std::fs::read_to_string(path)
			.with_context(|| format!("config file {}", path.display()))?;
		let cfg: Config = serde_yaml::from_str(&contents)?;
		Ok(cfg)
	}
}

/// Durations in config accept `"250ms"`-style strings or plain seconds.
pub mod serde_duration {
	use std::time::Duration;

	pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&format!("{}ms", d.as_millis()))
	}

	pub fn deserialize<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		struct V;
		impl serde::de::Visitor<'_> for V {
			type Value = Duration;
			fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
				f.write_str("a duration string like \"10s\" or a number of seconds")
			}
			fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Duration, E> {
				duration_str::parse(v).map_err(E::custom)
			}
			fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Duration, E> {
				Ok(Duration::from_secs(v))
			}
			fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Duration, E> {
				u64::try_from(v)
					.map(Duration::from_secs)
					.map_err(E::custom)
			}
		}
		d.deserialize_any(V)
	}
}

pub mod serde_opt_duration {
	use std::time::Duration;

	pub fn serialize<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => super::serde_duration::serialize(d, s),
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: serde::Deserializer<'de>>(
		d: D,
	) -> Result<Option<Duration>, D::Error> {
		#[derive(serde::Deserialize)]
		struct Wrap(#[serde(with = "super::serde_duration")] Duration);
		let opt: Option<Wrap> = serde::Deserialize::deserialize(d)?;
		Ok(opt.map(|w| w.0))
	}
}
