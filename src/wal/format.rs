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

//! Log format constants and types.
//!
//! # File Format
//!
//! A log file is broken down into 32KB blocks. Each block contains one or
//! more records. If a record doesn't fit in the remaining space of a
//! block, it's fragmented across multiple blocks.
//!
//! ```text
//! File Layout:
//!   +-----+-------------+--+----+----------+------+-- ... ----+
//!   | r0  |     r1      |P | r2 |    r3    |  r4  |           |
//!   +-----+-------------+--+----+----------+------+-- ... ----+
//!   <--- BLOCK_SIZE ------>|<-- BLOCK_SIZE ------>|
//! ```
//!
//! # Record Format (7 bytes header)
//!
//! ```text
//! +---------+-----------+-----------+--- ... ---+
//! |CRC (4B) | Size (2B) | Type (1B) | Payload   |
//! +---------+-----------+-----------+--- ... ---+
//! ```
//!
//! The CRC is computed over the record type and payload; size is the
//! payload length, little-endian.

use crate::error::{Error, Result};

/// The size of a single block in bytes (32KB).
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Length of the record header in bytes.
///
/// Header format: CRC (4 bytes) + Length (2 bytes) + Type (1 byte)
pub const HEADER_SIZE: usize = 7;

/// Record types: a record either fits in one block (`Full`) or is split
/// into `First`/`Middle`/`Last` fragments.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
#[repr(u8)]
pub enum RecordType {
	/// Indicates that the rest of the block is empty (zero-filled padding).
	Empty = 0,

	/// A complete record that fits entirely within a single block.
	Full = 1,

	/// The first fragment of a record that spans multiple blocks.
	First = 2,

	/// A middle fragment of a record (not first, not last).
	Middle = 3,

	/// The final fragment of a record.
	Last = 4,
}

impl RecordType {
	pub fn from_u8(value: u8) -> Result<Self> {
		match value {
			0 => Ok(RecordType::Empty),
			1 => Ok(RecordType::Full),
			2 => Ok(RecordType::First),
			3 => Ok(RecordType::Middle),
			4 => Ok(RecordType::Last),
			_ => Err(Error::Corruption(format!("invalid record type {value}"))),
		}
	}
}

/// CRC over the type byte followed by the payload. Writer and reader must
/// agree on this exact composition.
pub fn record_crc(record_type: RecordType, payload: &[u8]) -> u32 {
	let mut hasher = crc32fast::Hasher::new();
	hasher.update(&[record_type as u8]);
	hasher.update(payload);
	hasher.finalize()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_record_type_from_u8() {
		assert_eq!(RecordType::from_u8(0).unwrap(), RecordType::Empty);
		assert_eq!(RecordType::from_u8(1).unwrap(), RecordType::Full);
		assert_eq!(RecordType::from_u8(4).unwrap(), RecordType::Last);
		assert!(RecordType::from_u8(5).is_err());
		assert!(RecordType::from_u8(255).is_err());
	}

	#[test]
	fn test_crc_covers_type_byte() {
		let payload = b"same payload";
		assert_ne!(record_crc(RecordType::Full, payload), record_crc(RecordType::First, payload));
	}
}
