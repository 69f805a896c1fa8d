//! Named hooks threaded through the garbage-collection pipeline so tests
//! can observe or abort it at precise points (`GC.AfterCollect`,
//! `GC.Rewrite.AfterValueRewrite`, `GC.Rewrite.AfterLSMRewrite`).
//!
//! Outside of test builds (or the `sync-points` feature) every hook
//! compiles down to a constant `false` and costs nothing.

#[cfg(any(test, feature = "sync-points"))]
mod registry {
	use std::collections::HashMap;
	use std::sync::Arc;

	use once_cell::sync::Lazy;
	use parking_lot::Mutex;

	/// A callback returns `true` to request that the instrumented code
	/// path return early, simulating a crash at the sync point.
	pub type Callback = Arc<dyn Fn() -> bool + Send + Sync>;

	static CALLBACKS: Lazy<Mutex<HashMap<String, Callback>>> =
		Lazy::new(|| Mutex::new(HashMap::new()));

	pub fn set<F>(name: &str, cb: F)
	where
		F: Fn() -> bool + Send + Sync + 'static,
	{
		CALLBACKS.lock().insert(name.to_string(), Arc::new(cb));
	}

	pub fn clear(name: &str) {
		CALLBACKS.lock().remove(name);
	}

	pub fn clear_all() {
		CALLBACKS.lock().clear();
	}

	pub fn hit(name: &str) -> bool {
		// The callback is cloned out so the registry lock is not held while
		// it runs: callbacks routinely call back into the database.
		let cb = CALLBACKS.lock().get(name).cloned();
		match cb {
			Some(cb) => cb(),
			None => false,
		}
	}
}

#[cfg(any(test, feature = "sync-points"))]
pub(crate) use registry::{clear, clear_all, hit, set};

#[cfg(not(any(test, feature = "sync-points")))]
#[inline(always)]
pub(crate) fn hit(_name: &str) -> bool {
	false
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	use super::*;

	#[test]
	fn test_hit_without_callback_is_false() {
		clear_all();
		assert!(!hit("no.such.point"));
	}

	#[test]
	fn test_callback_runs_and_controls_return() {
		clear_all();
		let count = Arc::new(AtomicUsize::new(0));
		let c = count.clone();
		set("point.a", move || {
			c.fetch_add(1, Ordering::SeqCst);
			true
		});

		assert!(hit("point.a"));
		assert!(hit("point.a"));
		assert_eq!(count.load(Ordering::SeqCst), 2);

		clear("point.a");
		assert!(!hit("point.a"));
	}
}
