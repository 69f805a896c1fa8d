//  Copyright (c) 2024 SurrealDB Ltd.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use crate::error::{Error, Result};

use super::format::record_crc;
use super::{BufferedFileWriter, RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Writer for framed log records.
pub(crate) struct Writer {
	/// The underlying buffered file writer.
	dest: BufferedFileWriter,

	/// Current offset within the current block (0 to BLOCK_SIZE).
	block_offset: usize,
}

impl Writer {
	/// Creates a new Writer. `block_offset` is the resume position within
	/// the current block when appending to an existing log.
	pub(crate) fn new(dest: BufferedFileWriter, block_offset: usize) -> Self {
		Self {
			dest,
			block_offset,
		}
	}

	/// Adds a record to the log, fragmenting it across blocks as needed,
	/// and flushes it to the OS cache.
	pub(crate) fn add_record(&mut self, slice: &[u8]) -> Result<()> {
		let mut ptr = slice;
		let mut begin = true;

		// Fragment the record if necessary and emit it
		while begin || !ptr.is_empty() {
			self.maybe_switch_to_new_block()?;

			// Calculate how much data fits in the current block
			let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
			let fragment_length = ptr.len().min(avail);
			let fragment = &ptr[..fragment_length];

			let is_end = fragment_length == ptr.len();
			let record_type = if begin && is_end {
				RecordType::Full
			} else if begin {
				RecordType::First
			} else if is_end {
				RecordType::Last
			} else {
				RecordType::Middle
			};

			self.emit_physical_record(record_type, fragment)?;

			ptr = &ptr[fragment_length..];
			begin = false;
		}

		self.dest.flush()
	}

	/// Syncs data to disk (slow, durable).
	pub(crate) fn sync(&mut self) -> Result<()> {
		self.dest.sync()
	}

	/// Closes the writer, syncing and flushing all data.
	pub(crate) fn close(&mut self) -> Result<()> {
		self.sync()?;
		self.dest.close()
	}

	/// Switches to a new block if there's not enough space for a header.
	///
	/// Only pads when `leftover < HEADER_SIZE` (< 7 bytes remaining).
	/// Padding is always less than 7 bytes, which the reader discards.
	fn maybe_switch_to_new_block(&mut self) -> Result<()> {
		let leftover = BLOCK_SIZE - self.block_offset;

		if leftover < HEADER_SIZE {
			let padding = vec![0u8; leftover];
			self.dest.append(&padding)?;
			self.block_offset = 0;
		}

		Ok(())
	}

	/// Emits a single physical record to the file.
	fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
		let length = data.len();
		if length > 0xffff {
			return Err(Error::InvalidArgument("record fragment too large".into()));
		}

		// Physical record must fit entirely in current block
		debug_assert!(
			self.block_offset + HEADER_SIZE + length <= BLOCK_SIZE,
			"record exceeds block boundary: offset={}, data={}",
			self.block_offset,
			length
		);

		let crc = record_crc(record_type, data);

		let mut header = Vec::with_capacity(HEADER_SIZE);
		header.extend_from_slice(&crc.to_le_bytes());
		header.extend_from_slice(&(length as u16).to_le_bytes());
		header.push(record_type as u8);

		self.dest.append(&header)?;
		self.dest.append(data)?;

		self.block_offset += HEADER_SIZE + length;

		Ok(())
	}
}
