use integer_encoding::{VarInt, VarIntWriter};

use crate::error::{Error, Result};
use crate::lsm::ValueKind;
use crate::vlog::format::{encode_record, encoded_record_len, ValueHandle};
use crate::{Key, Value};

pub(crate) const MAX_BATCH_SIZE: u64 = 1 << 32;

/// Represents a single entry in a batch
#[derive(Debug, Clone)]
pub(crate) struct BatchEntry {
	pub kind: ValueKind,
	pub key: Key,
	/// Raw payload: the value for `Value`, an encoded handle for
	/// `ValueHandle`, empty for `Deletion`.
	pub value: Value,
}

/// An ordered set of updates applied atomically by the LSM.
///
/// Users fill it with [`put`](WriteBatch::put) and
/// [`delete`](WriteBatch::delete); the store appends handle entries for
/// values it moved into the vlog.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
	pub(crate) entries: Vec<BatchEntry>,
	size: u64,
}

impl WriteBatch {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn put(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
		self.add_record(ValueKind::Value, key.into(), value.into())
	}

	pub fn delete(&mut self, key: impl Into<Key>) -> Result<()> {
		self.add_record(ValueKind::Deletion, key.into(), Vec::new())
	}

	/// Appends a `(key, encoded handle)` entry; used when large values
	/// have been routed to the vlog, and by GC when re-pointing keys at
	/// rewritten records.
	pub(crate) fn put_handle(&mut self, key: Key, handle: &ValueHandle) -> Result<()> {
		self.add_record(ValueKind::ValueHandle, key, handle.encode())
	}

	/// Moves an already-built entry in; used when splitting a batch into
	/// its inline and vlog-bound halves.
	pub(crate) fn push_entry(&mut self, entry: BatchEntry) -> Result<()> {
		self.add_record(entry.kind, entry.key, entry.value)
	}

	fn add_record(&mut self, kind: ValueKind, key: Key, value: Value) -> Result<()> {
		if key.is_empty() {
			return Err(Error::EmptyKey);
		}
		let record_size = 1 + key.len() as u64 + value.len() as u64 + 10;
		if self.size + record_size > MAX_BATCH_SIZE {
			return Err(Error::BatchTooLarge);
		}
		self.size += record_size;
		self.entries.push(BatchEntry {
			kind,
			key,
			value,
		});
		Ok(())
	}

	pub fn count(&self) -> u32 {
		self.entries.len() as u32
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn clear(&mut self) {
		self.entries.clear();
		self.size = 0;
	}

	/// Wire encoding for the engine WAL: starting sequence, count, then
	/// `kind | key | value` per entry with varint length prefixes.
	pub(crate) fn encode(&self, starting_seq_num: u64) -> Vec<u8> {
		let mut encoded = Vec::with_capacity(self.size as usize);
		encoded.write_varint(starting_seq_num).expect("vec write");
		encoded.write_varint(self.entries.len() as u32).expect("vec write");
		for entry in &self.entries {
			encoded.push(entry.kind as u8);
			encoded.write_varint(entry.key.len() as u64).expect("vec write");
			encoded.extend_from_slice(&entry.key);
			encoded.write_varint(entry.value.len() as u64).expect("vec write");
			encoded.extend_from_slice(&entry.value);
		}
		encoded
	}

	/// Decodes a batch and its starting sequence from the WAL wire format.
	pub(crate) fn decode(data: &[u8]) -> Result<(Self, u64)> {
		let mut pos = 0;
		let (starting_seq, n) =
			u64::decode_var(data).ok_or(Error::InvalidBatchRecord)?;
		pos += n;
		let (count, n) = u32::decode_var(&data[pos..]).ok_or(Error::InvalidBatchRecord)?;
		pos += n;

		let mut batch = WriteBatch::new();
		for _ in 0..count {
			if pos >= data.len() {
				return Err(Error::InvalidBatchRecord);
			}
			let kind = ValueKind::from_u8(data[pos]).ok_or(Error::InvalidBatchRecord)?;
			pos += 1;

			let (key_len, n) = u64::decode_var(&data[pos..]).ok_or(Error::InvalidBatchRecord)?;
			pos += n;
			if data.len() < pos + key_len as usize {
				return Err(Error::InvalidBatchRecord);
			}
			let key = data[pos..pos + key_len as usize].to_vec();
			pos += key_len as usize;

			let (value_len, n) = u64::decode_var(&data[pos..]).ok_or(Error::InvalidBatchRecord)?;
			pos += n;
			if data.len() < pos + value_len as usize {
				return Err(Error::InvalidBatchRecord);
			}
			let value = data[pos..pos + value_len as usize].to_vec();
			pos += value_len as usize;

			batch.add_record(kind, key, value)?;
		}
		if pos != data.len() {
			return Err(Error::InvalidBatchRecord);
		}
		Ok((batch, starting_seq))
	}
}

/// An ordered collection of `(key, value)` pairs staged for one atomic
/// append to a vlog file.
///
/// Handles are finalized at append time: [`finalize`](ValueBatch::finalize)
/// fixes the destination file number and starting offset, computes every
/// record's handle and builds the contiguous on-disk encoding that the
/// builder writes verbatim.
#[derive(Debug, Default, Clone)]
pub(crate) struct ValueBatch {
	entries: Vec<(Key, Value)>,
	handles: Vec<ValueHandle>,
	encoded: Vec<u8>,
	table: Option<u64>,
}

impl ValueBatch {
	pub(crate) fn put(&mut self, key: Key, value: Value) {
		debug_assert!(self.table.is_none(), "batch already finalized");
		self.entries.push((key, value));
	}

	pub(crate) fn len(&self) -> usize {
		self.entries.len()
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Total encoded size of the staged records.
	pub(crate) fn encoded_size(&self) -> u32 {
		self.entries.iter().map(|(k, v)| encoded_record_len(k.len(), v.len())).sum()
	}

	/// Rewrites the batch's handles to their final on-disk positions in
	/// file `table` starting at `start_offset`, and builds the encoding.
	pub(crate) fn finalize(&mut self, table: u64, start_offset: u32) {
		let mut offset = start_offset;
		self.handles.clear();
		self.encoded.clear();
		for (key, value) in &self.entries {
			let len = encoded_record_len(key.len(), value.len());
			self.handles.push(ValueHandle::new(table, 0, offset, len));
			encode_record(&mut self.encoded, key, value);
			offset += len;
		}
		self.table = Some(table);
	}

	pub(crate) fn table(&self) -> Option<u64> {
		self.table
	}

	/// The contiguous record encoding; valid after `finalize`.
	pub(crate) fn encoded(&self) -> &[u8] {
		debug_assert!(self.table.is_some(), "batch not finalized");
		&self.encoded
	}

	/// Iterates `(key, value, handle)`; valid after `finalize`.
	pub(crate) fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8], ValueHandle)> {
		debug_assert!(self.table.is_some(), "batch not finalized");
		self.entries
			.iter()
			.zip(self.handles.iter())
			.map(|((k, v), h)| (k.as_slice(), v.as_slice(), *h))
	}
}
