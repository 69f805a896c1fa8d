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

use std::fs::File;
use std::io::{BufReader, Read};

use crate::error::Result;

use super::format::record_crc;
use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Reader for framed log records.
///
/// A single writer appends to these logs and crashes can only tear the
/// tail, so any framing violation (bad CRC, short header, short payload,
/// fragment-state mismatch) ends replay at the last complete record
/// instead of failing it.
pub(crate) struct Reader {
	rdr: BufReader<File>,

	/// Current block contents and cursor.
	buf: [u8; BLOCK_SIZE],
	buf_len: usize,
	pos: usize,

	/// Bytes of whole blocks already consumed (excludes the current one).
	blocks_consumed: u64,

	/// Set once the tail has been reached (clean or torn).
	eof: bool,

	/// File offset just past the last complete logical record.
	valid_offset: u64,

	/// Fragment accumulator for First/Middle/Last records.
	partial: Option<Vec<u8>>,
}

impl Reader {
	pub(crate) fn new(file: File) -> Self {
		Reader {
			rdr: BufReader::with_capacity(BLOCK_SIZE, file),
			buf: [0u8; BLOCK_SIZE],
			buf_len: 0,
			pos: 0,
			blocks_consumed: 0,
			eof: false,
			valid_offset: 0,
			partial: None,
		}
	}

	/// Offset just past the last complete logical record; the file can be
	/// truncated to this length before resuming appends.
	pub(crate) fn valid_offset(&self) -> u64 {
		self.valid_offset
	}

	/// Returns the next logical record, or `None` at the end of the log.
	pub(crate) fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
		loop {
			if self.eof {
				return Ok(None);
			}

			// Less than a header left in this block: the remainder is padding.
			if self.buf_len - self.pos < HEADER_SIZE {
				if !self.load_next_block()? {
					return Ok(None);
				}
				continue;
			}

			let base = self.pos;
			let crc = u32::from_le_bytes([
				self.buf[base],
				self.buf[base + 1],
				self.buf[base + 2],
				self.buf[base + 3],
			]);
			let length = u16::from_le_bytes([self.buf[base + 4], self.buf[base + 5]]) as usize;
			let type_byte = self.buf[base + 6];

			let record_type = match RecordType::from_u8(type_byte) {
				Ok(t) => t,
				Err(_) => {
					self.stop_at_tail("unknown record type");
					return Ok(None);
				}
			};

			if record_type == RecordType::Empty {
				// Zero-filled padding runs to the end of the block.
				self.pos = self.buf_len;
				continue;
			}

			if base + HEADER_SIZE + length > self.buf_len {
				self.stop_at_tail("record payload truncated");
				return Ok(None);
			}

			let payload = &self.buf[base + HEADER_SIZE..base + HEADER_SIZE + length];
			if record_crc(record_type, payload) != crc {
				self.stop_at_tail("record checksum mismatch");
				return Ok(None);
			}

			let payload = payload.to_vec();
			self.pos = base + HEADER_SIZE + length;

			match record_type {
				RecordType::Full => {
					if self.partial.take().is_some() {
						self.stop_at_tail("full record inside fragmented record");
						return Ok(None);
					}
					self.mark_valid();
					return Ok(Some(payload));
				}
				RecordType::First => {
					if self.partial.is_some() {
						self.stop_at_tail("nested first fragment");
						return Ok(None);
					}
					self.partial = Some(payload);
				}
				RecordType::Middle => match self.partial.as_mut() {
					Some(rec) => rec.extend_from_slice(&payload),
					None => {
						self.stop_at_tail("middle fragment without first");
						return Ok(None);
					}
				},
				RecordType::Last => match self.partial.take() {
					Some(mut rec) => {
						rec.extend_from_slice(&payload);
						self.mark_valid();
						return Ok(Some(rec));
					}
					None => {
						self.stop_at_tail("last fragment without first");
						return Ok(None);
					}
				},
				RecordType::Empty => unreachable!(),
			}
		}
	}

	fn mark_valid(&mut self) {
		self.valid_offset = self.blocks_consumed + self.pos as u64;
	}

	fn stop_at_tail(&mut self, reason: &str) {
		log::warn!("log replay stopped at torn tail: {reason}");
		self.partial = None;
		self.eof = true;
	}

	fn load_next_block(&mut self) -> Result<bool> {
		self.blocks_consumed += self.buf_len as u64;
		self.buf_len = 0;
		self.pos = 0;

		// The last block of the file may be partial.
		while self.buf_len < BLOCK_SIZE {
			let n = self.rdr.read(&mut self.buf[self.buf_len..])?;
			if n == 0 {
				break;
			}
			self.buf_len += n;
		}

		if self.buf_len == 0 {
			self.eof = true;
			return Ok(false);
		}
		Ok(true)
	}
}

#[cfg(test)]
mod tests {
	use std::fs::{File, OpenOptions};

	use tempfile::TempDir;

	use super::super::{BufferedFileWriter, Writer};
	use super::*;

	fn write_records(path: &std::path::Path, records: &[&[u8]]) {
		let file = File::create(path).unwrap();
		let mut writer = Writer::new(BufferedFileWriter::new(file, BLOCK_SIZE), 0);
		for r in records {
			writer.add_record(r).unwrap();
		}
		writer.close().unwrap();
	}

	#[test]
	fn test_roundtrip_small_records() {
		let temp_dir = TempDir::new().unwrap();
		let path = temp_dir.path().join("test.wal");
		write_records(&path, &[b"one", b"two", b"three"]);

		let mut reader = Reader::new(File::open(&path).unwrap());
		assert_eq!(reader.read_record().unwrap().unwrap(), b"one");
		assert_eq!(reader.read_record().unwrap().unwrap(), b"two");
		assert_eq!(reader.read_record().unwrap().unwrap(), b"three");
		assert!(reader.read_record().unwrap().is_none());

		let file_len = std::fs::metadata(&path).unwrap().len();
		assert_eq!(reader.valid_offset(), file_len);
	}

	#[test]
	fn test_roundtrip_fragmented_record() {
		let temp_dir = TempDir::new().unwrap();
		let path = temp_dir.path().join("test.wal");
		let big = vec![0xabu8; BLOCK_SIZE * 2 + 17];
		write_records(&path, &[&big, b"after"]);

		let mut reader = Reader::new(File::open(&path).unwrap());
		assert_eq!(reader.read_record().unwrap().unwrap(), big);
		assert_eq!(reader.read_record().unwrap().unwrap(), b"after");
		assert!(reader.read_record().unwrap().is_none());
	}

	#[test]
	fn test_torn_tail_is_ignored() {
		let temp_dir = TempDir::new().unwrap();
		let path = temp_dir.path().join("test.wal");
		write_records(&path, &[b"keep me", b"lose me"]);

		// Chop a few bytes off the second record's payload.
		let len = std::fs::metadata(&path).unwrap().len();
		let f = OpenOptions::new().write(true).open(&path).unwrap();
		f.set_len(len - 3).unwrap();

		let mut reader = Reader::new(File::open(&path).unwrap());
		assert_eq!(reader.read_record().unwrap().unwrap(), b"keep me");
		assert!(reader.read_record().unwrap().is_none());
		assert_eq!(reader.valid_offset(), (HEADER_SIZE + 7) as u64);
	}

	#[test]
	fn test_corrupt_crc_stops_replay() {
		let temp_dir = TempDir::new().unwrap();
		let path = temp_dir.path().join("test.wal");
		write_records(&path, &[b"good", b"bad!"]);

		// Flip a payload byte of the second record.
		let mut data = std::fs::read(&path).unwrap();
		let second_payload = HEADER_SIZE + 4 + HEADER_SIZE;
		data[second_payload] ^= 0xff;
		std::fs::write(&path, &data).unwrap();

		let mut reader = Reader::new(File::open(&path).unwrap());
		assert_eq!(reader.read_record().unwrap().unwrap(), b"good");
		assert!(reader.read_record().unwrap().is_none());
	}
}
