//! blobkv — a key-value separation layer over an LSM engine.
//!
//! Large values live in append-only value-log files; the LSM stores
//! either the value inline (below a threshold) or a compact handle
//! pointing into a vlog file. A background garbage collector reclaims
//! files whose live fraction has dropped below configured thresholds,
//! preserving crash consistency and read-after-write correctness under
//! concurrent foreground writes.
//!
//! ```no_run
//! use blobkv::{BlobDb, Options, ReadOptions, WriteOptions};
//!
//! let db = BlobDb::open(Options::default(), "/tmp/blobdb").unwrap();
//! db.put(&WriteOptions::default(), "key", vec![0u8; 4096]).unwrap();
//! let value = db.get(&ReadOptions::default(), b"key").unwrap();
//! assert_eq!(value.len(), 4096);
//! ```

mod batch;
mod db;
mod error;
mod iter;
mod lockfile;
pub mod lsm;
mod sync_point;
mod vlog;
mod wal;

#[cfg(test)]
mod test;

pub use crate::batch::WriteBatch;
pub use crate::db::BlobDb;
pub use crate::error::{Error, Result};
pub use crate::iter::DbIterator;
pub use crate::lsm::mem::MemLsm;
pub use crate::lsm::{LsmEngine, LsmIterator, ValueKind, WriteCallback};
pub use crate::vlog::format::ValueHandle;

/// The Key type used throughout the store
pub type Key = Vec<u8>;

/// The Value type used throughout the store
pub type Value = Vec<u8>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct Options {
	/// Values at or above this size move to the value log; smaller ones
	/// stay inline in the LSM.
	pub blob_value_size_threshold: usize,

	/// Seal threshold for the active vlog file.
	pub blob_max_file_size: u64,

	/// Seconds between periodic GC attempts.
	pub blob_gc_interval: u64,

	/// Rewrite a file only when the discarded-bytes ratio reaches this
	/// percentage...
	pub blob_gc_size_discard_threshold: u32,

	/// ...or the discarded-entries ratio reaches this percentage.
	pub blob_gc_num_discard_threshold: u32,

	/// Open read-only vlog files kept by the cache.
	pub blob_vlog_cache_capacity: usize,

	/// Worker threads backing iterator prefetch.
	pub blob_background_read_threads: usize,

	/// Create the store when the directory holds no database.
	pub create_if_missing: bool,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			blob_value_size_threshold: 1024,
			blob_max_file_size: 256 * 1024 * 1024, // 256MB
			blob_gc_interval: 600,
			blob_gc_size_discard_threshold: 25,
			blob_gc_num_discard_threshold: 25,
			blob_vlog_cache_capacity: 64,
			blob_background_read_threads: 4,
			create_if_missing: true,
		}
	}
}

impl Options {
	pub fn new() -> Self {
		Self::default()
	}

	pub const fn with_blob_value_size_threshold(mut self, value: usize) -> Self {
		self.blob_value_size_threshold = value;
		self
	}

	pub const fn with_blob_max_file_size(mut self, value: u64) -> Self {
		self.blob_max_file_size = value;
		self
	}

	pub const fn with_blob_gc_interval(mut self, seconds: u64) -> Self {
		self.blob_gc_interval = seconds;
		self
	}

	pub const fn with_blob_gc_size_discard_threshold(mut self, percent: u32) -> Self {
		self.blob_gc_size_discard_threshold = percent;
		self
	}

	pub const fn with_blob_gc_num_discard_threshold(mut self, percent: u32) -> Self {
		self.blob_gc_num_discard_threshold = percent;
		self
	}

	pub const fn with_blob_vlog_cache_capacity(mut self, files: usize) -> Self {
		self.blob_vlog_cache_capacity = files;
		self
	}

	pub const fn with_blob_background_read_threads(mut self, threads: usize) -> Self {
		self.blob_background_read_threads = threads;
		self
	}

	pub const fn with_create_if_missing(mut self, value: bool) -> Self {
		self.create_if_missing = value;
		self
	}
}

/// Per-read settings.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
	/// Read as of this snapshot sequence instead of the latest state.
	pub snapshot: Option<u64>,

	/// Resolve vlog handles ahead of the iterator cursor on a background
	/// pool to hide read latency.
	pub blob_prefetch: bool,
}

/// Per-write settings.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
	/// Fsync the LSM log and the vlog file before returning.
	pub sync: bool,
}
