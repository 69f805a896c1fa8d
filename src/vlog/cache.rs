use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::vlog::rwfile::VLogRoFile;
use crate::vlog::vlog_file_path;

/// LRU of opened read-only vlog files, keyed by file number.
///
/// Lookups hand out pinned (`Arc`) handles; because pins are strong
/// references, evicting an entry can never free a file that an iterator
/// or an in-flight read still uses. A recently evicted file is simply
/// re-opened on the next lookup.
pub(crate) struct VLogCache {
	dir: PathBuf,
	files: Mutex<LruCache<u64, Arc<VLogRoFile>>>,
}

impl VLogCache {
	pub(crate) fn new(dir: PathBuf, capacity: usize) -> Self {
		let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
		Self {
			dir,
			files: Mutex::new(LruCache::new(capacity)),
		}
	}

	/// Returns a pinned handle onto the file, opening it if needed.
	///
	/// A missing file maps to `NotFound`: the caller raced with obsolete
	/// file deletion or holds a handle into a file this store never owned.
	pub(crate) fn get(&self, number: u64) -> Result<Arc<VLogRoFile>> {
		if let Some(file) = self.files.lock().get(&number) {
			return Ok(file.clone());
		}

		let path = vlog_file_path(&self.dir, number);
		let file = match VLogRoFile::open(&path, number) {
			Ok(f) => Arc::new(f),
			Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
				return Err(Error::NotFound);
			}
			Err(e) => return Err(e),
		};

		// Another thread may have opened it concurrently; either handle is
		// equally good, keep the one already cached.
		let mut files = self.files.lock();
		if let Some(existing) = files.get(&number) {
			return Ok(existing.clone());
		}
		files.put(number, file.clone());
		Ok(file)
	}

	/// Drops the cached handle for a deleted file.
	pub(crate) fn evict(&self, number: u64) {
		self.files.lock().pop(&number);
	}
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;
	use crate::vlog::rwfile::VLogRWFile;

	fn seal_file(dir: &std::path::Path, number: u64) {
		let rw = VLogRWFile::open(&vlog_file_path(dir, number), number, 0, 0).unwrap();
		rw.add(b"key", b"value bytes").unwrap();
		rw.finish().unwrap();
	}

	#[test]
	fn test_lookup_opens_and_caches() {
		let dir = TempDir::new().unwrap();
		seal_file(dir.path(), 3);

		let cache = VLogCache::new(dir.path().to_path_buf(), 4);
		let a = cache.get(3).unwrap();
		let b = cache.get(3).unwrap();
		assert!(Arc::ptr_eq(&a, &b));
	}

	#[test]
	fn test_missing_file_is_not_found() {
		let dir = TempDir::new().unwrap();
		let cache = VLogCache::new(dir.path().to_path_buf(), 4);
		assert!(cache.get(42).unwrap_err().is_not_found());
	}

	#[test]
	fn test_eviction_reopens_and_pins_survive() {
		let dir = TempDir::new().unwrap();
		for n in 1..=3 {
			seal_file(dir.path(), n);
		}

		let cache = VLogCache::new(dir.path().to_path_buf(), 2);
		let pinned = cache.get(1).unwrap();
		cache.get(2).unwrap();
		cache.get(3).unwrap(); // evicts 1 from the table

		// The pin still reads fine, and a fresh lookup re-opens the file.
		assert_eq!(pinned.number(), 1);
		let reopened = cache.get(1).unwrap();
		assert!(!Arc::ptr_eq(&pinned, &reopened));
	}
}
