use std::fs::File;
use std::io;
use std::ops::Range;
use std::os::unix::fs::FileExt;

use integer_encoding::VarInt;

use crate::error::{Error, Result};
use crate::vlog::format::{decode_record, ValueHandle};
use crate::vlog::rwfile::VLogFileRef;

/// Read granularity for sequential scans.
const SCAN_CHUNK: usize = 128 * 1024;

/// Largest possible record prefix: two varint32 length fields.
const MAX_PREFIX: u32 = 10;

fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
	file.read_exact_at(buf, offset).map_err(|e| {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			Error::Corruption(format!("short read at offset {offset}"))
		} else {
			Error::from(e)
		}
	})
}

/// Point read: fetches the record a handle names and returns its value.
///
/// The record must decode to exactly `handle.size` bytes; anything else
/// is corruption (or a handle fabricated against the wrong file).
pub(crate) fn read_value(pin: &VLogFileRef, handle: &ValueHandle) -> Result<Vec<u8>> {
	debug_assert_eq!(pin.number(), handle.table);

	let end = pin.end_offset();
	if handle.offset.checked_add(handle.size).map_or(true, |e| e > end) {
		return Err(Error::Corruption(format!(
			"handle {:?} out of bounds for vlog {} (end {})",
			handle,
			pin.number(),
			end
		)));
	}

	let mut buf = vec![0u8; handle.size as usize];
	read_exact_at(pin.file(), handle.offset as u64, &mut buf)?;

	let record = decode_record(&buf)?;
	if record.encoded_len != handle.size {
		return Err(Error::Corruption(format!(
			"record at {} decodes to {} bytes, handle says {}",
			handle.offset, record.encoded_len, handle.size
		)));
	}
	Ok(record.value.to_vec())
}

/// Sequential reader over one vlog file, bounded by the end-of-data
/// offset snapshotted at construction.
///
/// Holding the iterator pins the underlying file. Record-level failures
/// surface as `Corruption`; recovery interprets them as the file tail.
pub(crate) struct VLogFileIterator {
	pin: VLogFileRef,
	end: u32,

	/// Start offset of the current record; the resume point when a scan
	/// stops at a torn tail.
	offset: u32,
	valid: bool,

	/// Window of file bytes starting at `buf_start`.
	buf: Vec<u8>,
	buf_start: u32,

	key: Range<usize>,
	value: Range<usize>,
	encoded_len: u32,
}

impl VLogFileIterator {
	pub(crate) fn new(pin: VLogFileRef, end: u32) -> Self {
		Self {
			pin,
			end,
			offset: 0,
			valid: false,
			buf: Vec::new(),
			buf_start: 0,
			key: 0..0,
			value: 0..0,
			encoded_len: 0,
		}
	}

	pub(crate) fn seek_to_first(&mut self) -> Result<()> {
		self.seek(0)
	}

	/// Positions the iterator at the record starting at `offset`.
	pub(crate) fn seek(&mut self, offset: u32) -> Result<()> {
		self.offset = offset;
		self.advance()
	}

	pub(crate) fn next(&mut self) -> Result<()> {
		debug_assert!(self.valid);
		self.offset += self.encoded_len;
		self.advance()
	}

	pub(crate) fn valid(&self) -> bool {
		self.valid
	}

	pub(crate) fn key(&self) -> &[u8] {
		debug_assert!(self.valid);
		&self.buf[self.key.clone()]
	}

	pub(crate) fn value(&self) -> &[u8] {
		debug_assert!(self.valid);
		&self.buf[self.value.clone()]
	}

	pub(crate) fn handle(&self) -> ValueHandle {
		debug_assert!(self.valid);
		ValueHandle::new(self.pin.number(), 0, self.offset, self.encoded_len)
	}

	/// Start offset of the current record, or of the first unread byte
	/// once the iterator is exhausted.
	pub(crate) fn offset(&self) -> u32 {
		self.offset
	}

	/// Decodes the record at `self.offset`, or marks the iterator
	/// exhausted at a clean end-of-data.
	fn advance(&mut self) -> Result<()> {
		self.valid = false;
		if self.offset >= self.end {
			return Ok(());
		}

		// Parse the two length varints first to learn the record size.
		let prefix_len = MAX_PREFIX.min(self.end - self.offset);
		self.ensure(self.offset, prefix_len)?;
		let rel = (self.offset - self.buf_start) as usize;
		let prefix = &self.buf[rel..rel + prefix_len as usize];

		let (key_len, n) = u32::decode_var(prefix)
			.ok_or_else(|| Error::Corruption("record key length truncated".into()))?;
		let (value_len, m) = u32::decode_var(&prefix[n..])
			.ok_or_else(|| Error::Corruption("record value length truncated".into()))?;

		let total = (n + m) as u32 + key_len + value_len;
		if self.offset + total > self.end {
			return Err(Error::Corruption(format!(
				"record at {} runs past end-of-data {}",
				self.offset, self.end
			)));
		}

		self.ensure(self.offset, total)?;
		let rel = (self.offset - self.buf_start) as usize;
		let record = decode_record(&self.buf[rel..rel + total as usize])?;
		debug_assert_eq!(record.encoded_len, total);

		let key_start = rel + n + m;
		self.key = key_start..key_start + key_len as usize;
		self.value = self.key.end..self.key.end + value_len as usize;
		self.encoded_len = total;
		self.valid = true;
		Ok(())
	}

	/// Makes `[offset, offset + len)` available in `self.buf`.
	fn ensure(&mut self, offset: u32, len: u32) -> Result<()> {
		let have_start = self.buf_start;
		let have_end = self.buf_start + self.buf.len() as u32;
		if offset >= have_start && offset + len <= have_end {
			return Ok(());
		}

		let want = (len as usize).max(SCAN_CHUNK).min((self.end - offset) as usize);
		self.buf.resize(want, 0);
		read_exact_at(self.pin.file(), offset as u64, &mut self.buf)?;
		self.buf_start = offset;
		Ok(())
	}
}
