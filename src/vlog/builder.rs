use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::batch::ValueBatch;
use crate::error::Result;
use crate::vlog::format::{encode_record, encoded_record_len, ValueHandle};

/// Appends records to an append-only vlog file, tracking the logical
/// offset and entry count.
///
/// The builder buffers in memory; [`flush`](VLogBuilder::flush) drains to
/// the OS so concurrently-opened readers can see the bytes, and
/// [`sync`](VLogBuilder::sync) makes them durable. [`finish`](VLogBuilder::finish)
/// seals the file.
pub(crate) struct VLogBuilder {
	writer: BufWriter<File>,
	number: u64,
	offset: u32,
	num_entries: u32,
	finished: bool,
}

impl VLogBuilder {
	/// Creates a builder for a fresh file, or resumes one at
	/// `resume_offset` after recovery has truncated the tail.
	pub(crate) fn open(
		path: &Path,
		number: u64,
		resume_offset: u32,
		num_entries: u32,
	) -> Result<Self> {
		let file = OpenOptions::new().create(true).append(true).open(path)?;
		debug_assert_eq!(file.metadata()?.len(), resume_offset as u64);

		Ok(Self {
			writer: BufWriter::new(file),
			number,
			offset: resume_offset,
			num_entries,
			finished: false,
		})
	}

	/// Appends one record and returns its handle.
	pub(crate) fn add(&mut self, key: &[u8], value: &[u8]) -> Result<ValueHandle> {
		debug_assert!(!self.finished);
		let mut buf = Vec::with_capacity(encoded_record_len(key.len(), value.len()) as usize);
		encode_record(&mut buf, key, value);

		self.writer.write_all(&buf)?;

		let handle = ValueHandle::new(self.number, 0, self.offset, buf.len() as u32);
		self.offset += buf.len() as u32;
		self.num_entries += 1;
		Ok(handle)
	}

	/// Appends a finalized [`ValueBatch`]. The batch's handles must have
	/// been finalized against this builder's file number and current
	/// offset; the encoding is written verbatim.
	pub(crate) fn add_batch(&mut self, batch: &ValueBatch) -> Result<()> {
		debug_assert!(!self.finished);
		debug_assert_eq!(batch.table(), Some(self.number));

		let encoded = batch.encoded();
		self.writer.write_all(encoded)?;
		self.offset += encoded.len() as u32;
		self.num_entries += batch.len() as u32;
		Ok(())
	}

	/// Drains buffered bytes to the OS.
	pub(crate) fn flush(&mut self) -> Result<()> {
		self.writer.flush()?;
		Ok(())
	}

	/// Forces a durable fsync.
	pub(crate) fn sync(&mut self) -> Result<()> {
		self.writer.flush()?;
		self.writer.get_ref().sync_all()?;
		Ok(())
	}

	/// Seals the file: final flush + sync. The builder accepts no further
	/// records.
	pub(crate) fn finish(&mut self) -> Result<()> {
		if self.finished {
			return Ok(());
		}
		self.sync()?;
		self.finished = true;
		Ok(())
	}

	/// Logical end of records; equals the file size (no footer).
	pub(crate) fn offset(&self) -> u32 {
		self.offset
	}

	pub(crate) fn file_size(&self) -> u32 {
		self.offset
	}

	pub(crate) fn num_entries(&self) -> u32 {
		self.num_entries
	}
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;

	#[test]
	fn test_add_advances_offset_by_encoded_len() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("000003.vlog");
		let mut builder = VLogBuilder::open(&path, 3, 0, 0).unwrap();

		let h1 = builder.add(b"k01", b"value01").unwrap();
		let h2 = builder.add(b"k02", b"value02").unwrap();
		let h3 = builder.add(b"k03", b"value03").unwrap();

		assert_eq!(h1, ValueHandle::new(3, 0, 0, 12));
		assert_eq!(h2, ValueHandle::new(3, 0, 12, 12));
		assert_eq!(h3, ValueHandle::new(3, 0, 24, 12));
		assert_eq!(builder.offset(), 36);
		assert_eq!(builder.num_entries(), 3);

		builder.finish().unwrap();
		assert_eq!(std::fs::metadata(&path).unwrap().len(), 36);
	}

	#[test]
	fn test_resume_after_truncation() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("000003.vlog");
		{
			let mut builder = VLogBuilder::open(&path, 3, 0, 0).unwrap();
			builder.add(b"k01", b"value01").unwrap();
			builder.add(b"k02", b"value02").unwrap();
			builder.finish().unwrap();
		}

		let mut builder = VLogBuilder::open(&path, 3, 24, 2).unwrap();
		let h = builder.add(b"k03", b"value03").unwrap();
		assert_eq!(h, ValueHandle::new(3, 0, 24, 12));
		builder.finish().unwrap();
		assert_eq!(std::fs::metadata(&path).unwrap().len(), 36);
	}
}
