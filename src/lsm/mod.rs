//! The LSM collaborator.
//!
//! The value-separation layer treats the sorted key-value engine as an
//! external component: everything it relies on is expressed by the
//! [`LsmEngine`] trait. [`MemLsm`](mem::MemLsm) is the bundled reference
//! engine — a WAL-backed memtable with sequence numbers, snapshots and
//! conditional writes — enough to run the store end to end.

pub mod mem;

use crate::error::Result;
use crate::{ReadOptions, Value, WriteOptions};

/// Tags the payload stored against a key in the LSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
	/// Tombstone.
	Deletion = 0,
	/// The value itself, stored inline.
	Value = 1,
	/// An encoded [`ValueHandle`](crate::ValueHandle) pointing into a vlog file.
	ValueHandle = 2,
}

impl ValueKind {
	pub fn from_u8(value: u8) -> Option<Self> {
		match value {
			0 => Some(ValueKind::Deletion),
			1 => Some(ValueKind::Value),
			2 => Some(ValueKind::ValueHandle),
			_ => None,
		}
	}
}

/// A condition evaluated under the engine's write-group lock, immediately
/// before a batch is applied. Returning an error aborts the batch.
///
/// This is the sole cross-layer synchronization between garbage
/// collection and foreground writes: GC refuses to install a rewritten
/// handle for a key the user has overwritten in the meantime.
pub trait WriteCallback: Send + Sync {
	fn check(&self, db: &dyn LsmEngine) -> Result<()>;

	/// Whether the engine may group this batch with others in one write.
	/// GC callbacks demand per-batch isolation.
	fn allow_grouping(&self) -> bool {
		false
	}
}

/// The sorted key-value engine underneath the value-separation layer.
///
/// Writes are atomic per batch. Sequence numbers increase by one per
/// entry; snapshots are sequence numbers kept alive until released.
pub trait LsmEngine: Send + Sync {
	/// Applies `batch` atomically. When `callback` is present it runs
	/// under the write-group lock and a non-OK result aborts the batch.
	fn write(
		&self,
		options: &WriteOptions,
		batch: &crate::batch::WriteBatch,
		callback: Option<&dyn WriteCallback>,
	) -> Result<()>;

	/// Returns the stored payload and its kind. Tombstones and absent
	/// keys surface as `NotFound`.
	fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<(ValueKind, Value)>;

	/// Sequence number of the most recent write.
	fn latest_sequence(&self) -> u64;

	/// Smallest registered snapshot sequence, falling back to
	/// [`latest_sequence`](Self::latest_sequence) when none are live.
	fn oldest_live_snapshot(&self) -> u64;

	fn get_snapshot(&self) -> u64;

	fn release_snapshot(&self, sequence: u64);

	/// Forces the engine's WAL to disk.
	fn sync(&self) -> Result<()>;

	/// Iterator over the latest visible entries, consistent as of its
	/// creation.
	fn iter(&self) -> Box<dyn LsmIterator>;

	fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()>;

	fn property(&self, name: &str) -> Option<String>;

	fn approximate_size(&self, begin: &[u8], end: &[u8]) -> u64;

	/// Orderly shutdown: flush and close the engine's log.
	fn close(&self) -> Result<()>;
}

/// Positioned cursor over LSM entries in key order.
pub trait LsmIterator: Send {
	fn seek_to_first(&mut self);
	fn seek_to_last(&mut self);
	fn seek(&mut self, key: &[u8]);
	fn next(&mut self);
	fn prev(&mut self);
	fn valid(&self) -> bool;
	fn key(&self) -> &[u8];
	fn kind(&self) -> ValueKind;
	fn value(&self) -> &[u8];

	/// Cheap structural clone sharing the same consistent view; used by
	/// the prefetching iterator to scout ahead of the cursor.
	fn boxed_clone(&self) -> Box<dyn LsmIterator>;
}
