use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::batch::ValueBatch;
use crate::error::Result;
use crate::vlog::builder::VLogBuilder;
use crate::vlog::format::ValueHandle;

/// Builder/reader pair over the active vlog file.
///
/// One appender and any number of readers share the file: the appender
/// publishes the logical end-of-data only after flushing, and readers
/// bound themselves by the tail they snapshot, so an iterator opened
/// mid-write never sees uncommitted bytes.
///
/// Reference counting is expressed with `Arc`: the value log holds one
/// strong reference for as long as this is the active writer, and every
/// iterator or cache pin holds another. The file object is released when
/// the last clone drops.
pub(crate) struct VLogRWFile {
	number: u64,
	builder: Mutex<VLogBuilder>,
	/// Separate read-only handle onto the same file, used for preads.
	read_file: File,
	/// Logical end-of-data visible to readers.
	tail: AtomicU32,
	num_entries: AtomicU32,
	sealed: AtomicBool,
}

impl VLogRWFile {
	pub(crate) fn open(
		path: &Path,
		number: u64,
		resume_offset: u32,
		num_entries: u32,
	) -> Result<Self> {
		let builder = VLogBuilder::open(path, number, resume_offset, num_entries)?;
		let read_file = OpenOptions::new().read(true).open(path)?;

		Ok(Self {
			number,
			builder: Mutex::new(builder),
			read_file,
			tail: AtomicU32::new(resume_offset),
			num_entries: AtomicU32::new(num_entries),
			sealed: AtomicBool::new(false),
		})
	}

	/// Appends one record. The handle is valid once the caller has
	/// published the write with [`flush`](Self::flush).
	pub(crate) fn add(&self, key: &[u8], value: &[u8]) -> Result<ValueHandle> {
		debug_assert!(!self.is_sealed());
		self.builder.lock().add(key, value)
	}

	/// Appends a finalized [`ValueBatch`].
	pub(crate) fn write_batch(&self, batch: &ValueBatch) -> Result<()> {
		debug_assert!(!self.is_sealed());
		self.builder.lock().add_batch(batch)
	}

	/// Drains the builder's buffer to the OS and advances the readers'
	/// end-of-data to cover everything appended so far.
	pub(crate) fn flush(&self) -> Result<()> {
		let mut builder = self.builder.lock();
		builder.flush()?;
		self.num_entries.store(builder.num_entries(), Ordering::Release);
		self.tail.store(builder.offset(), Ordering::Release);
		Ok(())
	}

	/// Forces a durable fsync of the file data.
	pub(crate) fn sync(&self) -> Result<()> {
		self.builder.lock().sync()
	}

	/// Seals the file: final flush + sync; no further appends.
	pub(crate) fn finish(&self) -> Result<()> {
		let mut builder = self.builder.lock();
		builder.finish()?;
		self.num_entries.store(builder.num_entries(), Ordering::Release);
		self.tail.store(builder.offset(), Ordering::Release);
		self.sealed.store(true, Ordering::Release);
		Ok(())
	}

	pub(crate) fn number(&self) -> u64 {
		self.number
	}

	/// Logical end-of-data for readers; equals the durable file size once
	/// sealed.
	pub(crate) fn tail(&self) -> u32 {
		self.tail.load(Ordering::Acquire)
	}

	pub(crate) fn file_size(&self) -> u32 {
		self.tail()
	}

	pub(crate) fn num_entries(&self) -> u32 {
		self.num_entries.load(Ordering::Acquire)
	}

	pub(crate) fn is_sealed(&self) -> bool {
		self.sealed.load(Ordering::Acquire)
	}

	pub(crate) fn read_file(&self) -> &File {
		&self.read_file
	}
}

/// Read-only wrapper for a sealed vlog file, handed out by the cache.
#[derive(Debug)]
pub(crate) struct VLogRoFile {
	number: u64,
	file: File,
	size: u32,
}

impl VLogRoFile {
	pub(crate) fn open(path: &Path, number: u64) -> Result<Self> {
		let file = OpenOptions::new().read(true).open(path)?;
		let size = file.metadata()?.len() as u32;
		Ok(Self {
			number,
			file,
			size,
		})
	}

	pub(crate) fn number(&self) -> u64 {
		self.number
	}

	pub(crate) fn size(&self) -> u32 {
		self.size
	}

	pub(crate) fn file(&self) -> &File {
		&self.file
	}
}

/// A pinned reference onto an open vlog file, active or sealed. Holding
/// one keeps the underlying file object alive.
#[derive(Clone)]
pub(crate) enum VLogFileRef {
	Rw(std::sync::Arc<VLogRWFile>),
	Ro(std::sync::Arc<VLogRoFile>),
}

impl VLogFileRef {
	pub(crate) fn number(&self) -> u64 {
		match self {
			VLogFileRef::Rw(f) => f.number(),
			VLogFileRef::Ro(f) => f.number(),
		}
	}

	pub(crate) fn file(&self) -> &File {
		match self {
			VLogFileRef::Rw(f) => f.read_file(),
			VLogFileRef::Ro(f) => f.file(),
		}
	}

	/// Logical end-of-data at the time of the call.
	pub(crate) fn end_offset(&self) -> u32 {
		match self {
			VLogFileRef::Rw(f) => f.tail(),
			VLogFileRef::Ro(f) => f.size(),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use tempfile::TempDir;

	use super::*;
	use crate::vlog::reader;

	#[test]
	fn test_reader_sees_only_flushed_tail() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("000005.vlog");
		let rw = Arc::new(VLogRWFile::open(&path, 5, 0, 0).unwrap());

		let h = rw.add(b"key", b"a value worth logging").unwrap();
		// Not flushed yet: readers still see an empty file.
		assert_eq!(rw.tail(), 0);

		rw.flush().unwrap();
		assert_eq!(rw.tail(), h.offset + h.size);

		let pin = VLogFileRef::Rw(rw.clone());
		let value = reader::read_value(&pin, &h).unwrap();
		assert_eq!(value, b"a value worth logging");
	}

	#[test]
	fn test_snapshotted_end_bounds_iterator() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("000006.vlog");
		let rw = Arc::new(VLogRWFile::open(&path, 6, 0, 0).unwrap());

		rw.add(b"k1", b"first value").unwrap();
		rw.flush().unwrap();

		let pin = VLogFileRef::Rw(rw.clone());
		let end = pin.end_offset();

		// Appends after the snapshot are invisible to this bound.
		rw.add(b"k2", b"second value").unwrap();
		rw.flush().unwrap();

		let mut iter = reader::VLogFileIterator::new(pin, end);
		iter.seek_to_first().unwrap();
		assert!(iter.valid());
		assert_eq!(iter.key(), b"k1");
		iter.next().unwrap();
		assert!(!iter.valid());
	}

	#[test]
	fn test_sealed_file_readable_via_ro_wrapper() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("000007.vlog");
		let rw = VLogRWFile::open(&path, 7, 0, 0).unwrap();
		let h = rw.add(b"key", b"payload").unwrap();
		rw.finish().unwrap();
		assert!(rw.is_sealed());

		let ro = Arc::new(VLogRoFile::open(&path, 7).unwrap());
		assert_eq!(ro.size(), rw.file_size());
		let value = reader::read_value(&VLogFileRef::Ro(ro), &h).unwrap();
		assert_eq!(value, b"payload");
	}
}
