//! Per-host circuit breakers gating backend dispatch.
//!
//! Two modes: consecutive-failure counting and failure-rate over a sliding
//! window of outcomes. An open breaker half-opens after `timeout` and admits
//! a bounded number of probe requests.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakerKind {
	Consecutive,
	Rate,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSettings {
	#[serde(rename = "type")]
	pub kind: BreakerKind,
	#[serde(default)]
	pub failures: usize,
	/// Counted requests in the sliding window; only used by `Rate`.
	#[serde(default)]
	pub window: usize,
	#[serde(with = "crate::config::serde_duration")]
	pub timeout: Duration,
	#[serde(default = "default_half_open")]
	pub half_open_requests: usize,
	#[serde(default = "default_idle_ttl", with = "crate::config::serde_duration")]
	pub idle_ttl: Duration,
}

fn default_half_open() -> usize {
	1
}

fn default_idle_ttl() -> Duration {
	Duration::from_secs(60)
}

enum State {
	Closed {
		consecutive_failures: usize,
		/// Rate mode: ring of recent outcomes, true = failure.
		window: Vec<bool>,
		cursor: usize,
		filled: bool,
	},
	Open {
		since: Instant,
	},
	HalfOpen {
		probes: usize,
		successes: usize,
	},
}

impl State {
	fn closed() -> State {
		State::Closed {
			consecutive_failures: 0,
			window: Vec::new(),
			cursor: 0,
			filled: false,
		}
	}
}

pub struct Breaker {
	settings: BreakerSettings,
	state: Mutex<State>,
}

impl Breaker {
	pub fn new(settings: BreakerSettings) -> Breaker {
		Breaker {
			state: Mutex::new(State::closed()),
			settings,
		}
	}

	/// Whether the request may proceed. The caller must report the outcome
	/// through `done` exactly once per admitted request.
	pub fn allow(&self) -> bool {
		let mut state = self.state.lock();
		match &mut *state {
			State::Closed { .. } => true,
			State::Open { since } => {
				if since.elapsed() >= self.settings.timeout {
					*state = State::HalfOpen {
						probes: 1,
						successes: 0,
					};
					true
				} else {
					false
				}
			},
			State::HalfOpen { probes, .. } => {
				if *probes < self.settings.half_open_requests {
					*probes += 1;
					true
				} else {
					false
				}
			},
		}
	}

	pub fn done(&self, success: bool) {
		let mut state = self.state.lock();
		match &mut *state {
			State::Closed {
				consecutive_failures,
				window,
				cursor,
				filled,
			} => {
				let tripped = match self.settings.kind {
					BreakerKind::Consecutive => {
						if success {
							*consecutive_failures = 0;
						} else {
							*consecutive_failures += 1;
						}
						*consecutive_failures >= self.settings.failures
					},
					BreakerKind::Rate => {
						if window.len() < self.settings.window.max(1) {
							window.push(!success);
							if window.len() == self.settings.window.max(1) {
								*filled = true;
							}
						} else {
							window[*cursor] = !success;
							*cursor = (*cursor + 1) % window.len();
							*filled = true;
						}
						*filled && window.iter().filter(|f| **f).count() >= self.settings.failures
					},
				};
				if tripped {
					*state = State::Open {
						since: Instant::now(),
					};
				}
			},
			State::Open { .. } => {},
			State::HalfOpen { successes, .. } => {
				if !success {
					*state = State::Open {
						since: Instant::now(),
					};
				} else {
					*successes += 1;
					if *successes >= self.settings.half_open_requests {
						*state = State::closed();
					}
				}
			},
		}
	}

	pub fn is_open(&self) -> bool {
		matches!(&*self.state.lock(), State::Open { since } if since.elapsed() < self.settings.timeout)
	}
}

struct Entry {
	breaker: Arc<Breaker>,
	last_seen: Instant,
}

/// Owns breakers keyed by backend host. Hosts without explicit settings use
/// the configured default; entries idle past their `idle_ttl` are evicted on
/// the next lookup sweep.
pub struct BreakerRegistry {
	default: Option<BreakerSettings>,
	per_host: HashMap<Strng, BreakerSettings>,
	active: Mutex<HashMap<Strng, Entry>>,
}

impl BreakerRegistry {
	pub fn new(
		default: Option<BreakerSettings>,
		per_host: HashMap<Strng, BreakerSettings>,
	) -> BreakerRegistry {
		BreakerRegistry {
			default,
			per_host,
			active: Mutex::new(HashMap::new()),
		}
	}

	pub fn disabled() -> BreakerRegistry {
		Self::new(None, HashMap::new())
	}

	pub fn get(&self, host: &str) -> Option<Arc<Breaker>> {
		let settings = self
			.per_host
			.get(host)
			.or(self.default.as_ref())?
			.clone();
		let mut active = self.active.lock();
		let now = Instant::now();
		active.retain(|_, e| now.duration_since(e.last_seen) < e.breaker.settings.idle_ttl);
		let entry = active.entry(strng::new(host)).or_insert_with(|| Entry {
			breaker: Arc::new(Breaker::new(settings)),
			last_seen: now,
		});
		entry.last_seen = now;
		Some(entry.breaker.clone())
	}
}
