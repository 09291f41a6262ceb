#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Time-bounded set of recently seen notification ids.
///
/// An id stays "seen" for `window` after its last `set`. Lookups ignore
/// expired entries, so a late sweep never causes a redelivery inside the
/// window. Ids older than the window may be delivered again.
pub struct DedupCache {
	inner: Arc<Inner>,
	sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
	window: Duration,
	seen: Mutex<HashMap<String, Instant>>,
}

impl Inner {
	fn sweep(&self) -> usize {
		let window = self.window;
		let mut seen = self.seen.lock();
		let before = seen.len();
		seen.retain(|_, at| at.elapsed() < window);
		before - seen.len()
	}
}

impl DedupCache {
	/// Cache without background expiry. Expired entries are only dropped by [`DedupCache::sweep`].
	pub fn new(window: Duration) -> Self {
		Self {
			inner: Arc::new(Inner {
				window,
				seen: Mutex::new(HashMap::new()),
			}),
			sweeper: Mutex::new(None),
		}
	}

	/// Cache with a sweeper task on the current tokio runtime.
	pub fn start(window: Duration, sweep_interval: Duration) -> Self {
		let cache = Self::new(window);
		let weak: Weak<Inner> = Arc::downgrade(&cache.inner);

		let handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval(sweep_interval);
			interval.tick().await;
			loop {
				interval.tick().await;
				let Some(inner) = weak.upgrade() else {
					return;
				};
				let removed = inner.sweep();
				if removed > 0 {
					tracing::trace!(removed, "dedup cache swept");
				}
			}
		});

		*cache.sweeper.lock() = Some(handle);
		cache
	}

	pub fn has(&self, id: &str) -> bool {
		self.inner
			.seen
			.lock()
			.get(id)
			.is_some_and(|at| at.elapsed() < self.inner.window)
	}

	/// Insert or refresh `id` for the full window.
	pub fn set(&self, id: impl Into<String>) {
		self.inner.seen.lock().insert(id.into(), Instant::now());
	}

	/// Returns `true` if `id` was not seen within the window, recording it either way.
	pub fn check_and_set(&self, id: &str) -> bool {
		let mut seen = self.inner.seen.lock();
		let now = Instant::now();
		let fresh = seen.get(id).is_none_or(|at| now.duration_since(*at) >= self.inner.window);
		seen.insert(id.to_string(), now);
		fresh
	}

	/// Drop expired entries now. Returns how many were removed.
	pub fn sweep(&self) -> usize {
		self.inner.sweep()
	}

	pub fn len(&self) -> usize {
		self.inner.seen.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Halt background expiry. Idempotent.
	pub fn stop(&self) {
		if let Some(handle) = self.sweeper.lock().take() {
			handle.abort();
		}
	}
}

impl Drop for DedupCache {
	fn drop(&mut self) {
		self.stop();
	}
}
