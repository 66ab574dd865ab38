//! In-process sliding window over a circular buffer of hit timestamps, one
//! buffer per lookup key.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Limiter, Settings};
use crate::kv::KvError;
use crate::*;

/// Ring of the `max_hits` most recent admissions. A request is admitted when
/// the buffer has room or the oldest admission has left the window; the
/// admission then overwrites the oldest slot.
struct Bucket {
	slots: Vec<Instant>,
	head: usize,
	cap: usize,
}

impl Bucket {
	fn new(cap: usize) -> Bucket {
		Bucket {
			slots: Vec::with_capacity(cap),
			head: 0,
			cap,
		}
	}

	fn allow(&mut self, now: Instant, window: Duration) -> bool {
		if self.cap == 0 {
			return false;
		}
		if self.slots.len() < self.cap {
			self.slots.push(now);
			return true;
		}
		let oldest = self.slots[self.head];
		if now.duration_since(oldest) >= window {
			self.slots[self.head] = now;
			self.head = (self.head + 1) % self.slots.len();
			return true;
		}
		false
	}

	fn oldest(&self) -> Option<Instant> {
		if self.slots.is_empty() {
			return None;
		}
		if self.slots.len() < self.cap {
			Some(self.slots[0])
		} else {
			Some(self.slots[self.head])
		}
	}

	fn newest(&self) -> Option<Instant> {
		if self.slots.is_empty() {
			return None;
		}
		let idx = if self.slots.len() < self.cap {
			self.slots.len() - 1
		} else {
			(self.head + self.slots.len() - 1) % self.slots.len()
		};
		Some(self.slots[idx])
	}
}

pub struct SlidingWindow {
	settings: Settings,
	state: Mutex<State>,
}

struct State {
	buckets: HashMap<String, Bucket>,
	last_clean: Instant,
}

impl SlidingWindow {
	pub fn new(settings: Settings) -> SlidingWindow {
		SlidingWindow {
			settings,
			state: Mutex::new(State {
				buckets: HashMap::new(),
				last_clean: Instant::now(),
			}),
		}
	}

	/// Amortized eviction of idle buckets, run at most once per
	/// `clean_interval` from the allow path.
	fn maybe_clean(&self, state: &mut State, now: Instant) {
		if now.duration_since(state.last_clean) < self.settings.clean_interval {
			return;
		}
		state.last_clean = now;
		let window = self.settings.time_window;
		state.buckets.retain(|_, b| {
			b.newest()
				.map(|n| now.duration_since(n) < window)
				.unwrap_or(false)
		});
	}
}

#[async_trait]
impl Limiter for SlidingWindow {
	async fn allow(&self, key: &str) -> Result<bool, KvError> {
		let now = Instant::now();
		let mut state = self.state.lock();
		self.maybe_clean(&mut state, now);
		let cap = self.settings.max_hits as usize;
		let bucket = state
			.buckets
			.entry(key.to_string())
			.or_insert_with(|| Bucket::new(cap));
		Ok(bucket.allow(now, self.settings.time_window))
	}

	async fn retry_after(&self, key: &str) -> u64 {
		let state = self.state.lock();
		let elapsed = state
			.buckets
			.get(key)
			.and_then(|b| b.oldest())
			.map(|o| o.elapsed())
			.unwrap_or(Duration::ZERO);
		self
			.settings
			.time_window
			.saturating_sub(elapsed)
			.as_secs()
			.max(1)
	}

	async fn oldest(&self, key: &str) -> Option<std::time::SystemTime> {
		let state = self.state.lock();
		let oldest = state.buckets.get(key).and_then(|b| b.oldest())?;
		Some(std::time::SystemTime::now() - oldest.elapsed())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ratelimit::RatelimitType;

	fn settings(max_hits: u64, window: Duration) -> Settings {
		Settings {
			kind: RatelimitType::LocalClient,
			max_hits,
			time_window: window,
			..Settings::disabled()
		}
	}

	#[tokio::test]
	async fn admits_up_to_max_hits_then_denies() {
		let l = SlidingWindow::new(settings(3, Duration::from_secs(10)));
		for _ in 0..3 {
			assert!(l.allow("k").await.unwrap());
		}
		assert!(!l.allow("k").await.unwrap());
		// Other keys are unaffected.
		assert!(l.allow("other").await.unwrap());
	}

	#[tokio::test]
	async fn window_frees_slots() {
		let l = SlidingWindow::new(settings(2, Duration::from_millis(30)));
		assert!(l.allow("k").await.unwrap());
		assert!(l.allow("k").await.unwrap());
		assert!(!l.allow("k").await.unwrap());
		tokio::time::sleep(Duration::from_millis(40)).await;
		assert!(l.allow("k").await.unwrap());
	}

	#[tokio::test]
	async fn retry_after_is_at_least_one_second() {
		let l = SlidingWindow::new(settings(1, Duration::from_millis(100)));
		assert!(l.allow("k").await.unwrap());
		assert!(l.retry_after("k").await >= 1);
	}

	#[tokio::test]
	async fn idle_buckets_are_swept() {
		let mut s = settings(1, Duration::from_millis(10));
		s.clean_interval = Duration::from_millis(10);
		let l = SlidingWindow::new(s);
		assert!(l.allow("stale").await.unwrap());
		tokio::time::sleep(Duration::from_millis(25)).await;
		assert!(l.allow("fresh").await.unwrap());
		assert!(!l.state.lock().buckets.contains_key("stale"));
	}
}
