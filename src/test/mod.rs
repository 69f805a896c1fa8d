//! Scenario tests exercising the store end to end: recovery from torn
//! tails, garbage collection under overwrites and injected crashes, and
//! iterator behaviour with and without prefetch.

mod db_tests;
mod recovery_tests;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

/// GC tests install process-global sync-point callbacks and watch global
/// scheduling state; they take this lock to run one at a time.
static GC_TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub(crate) fn gc_test_guard() -> MutexGuard<'static, ()> {
	let guard = GC_TEST_LOCK.lock();
	crate::sync_point::clear_all();
	guard
}
