use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use integer_encoding::{VarInt, VarIntWriter};

use crate::error::{Error, Result};

const TAG_ADD_FILE: u32 = 1;
const TAG_DELETE_FILE: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;

/// Metadata for a vlog file that has been sealed or is being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VLogFileMeta {
	pub number: u64,
	pub file_size: u32,
	/// Entry count when known; zero for files recovered from the
	/// manifest, which only records sizes.
	pub num_entries: u32,
}

/// One log-structured mutation of the live vlog file set.
///
/// An edit may carry several operations (GC emits `AddFile` for its
/// output and `DeleteFile` for its input in a single atomic record).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct BlobVersionEdit {
	pub add_files: Vec<(u64, u32)>,
	pub delete_files: Vec<(u64, u64)>,
	pub next_file_number: Option<u64>,
}

impl BlobVersionEdit {
	pub(crate) fn add_file(&mut self, number: u64, file_size: u32) -> &mut Self {
		self.add_files.push((number, file_size));
		self
	}

	pub(crate) fn delete_file(&mut self, number: u64, obsolete_sequence: u64) -> &mut Self {
		self.delete_files.push((number, obsolete_sequence));
		self
	}

	pub(crate) fn set_next_file_number(&mut self, n: u64) -> &mut Self {
		self.next_file_number = Some(n);
		self
	}

	pub(crate) fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		for (number, size) in &self.add_files {
			buf.write_varint(TAG_ADD_FILE).expect("vec write");
			buf.write_varint(*number).expect("vec write");
			buf.write_varint(*size).expect("vec write");
		}
		for (number, sequence) in &self.delete_files {
			buf.write_varint(TAG_DELETE_FILE).expect("vec write");
			buf.write_varint(*number).expect("vec write");
			buf.write_varint(*sequence).expect("vec write");
		}
		if let Some(n) = self.next_file_number {
			buf.write_varint(TAG_NEXT_FILE_NUMBER).expect("vec write");
			buf.write_varint(n).expect("vec write");
		}
		buf
	}

	pub(crate) fn decode(mut data: &[u8]) -> Result<Self> {
		let mut edit = BlobVersionEdit::default();
		while !data.is_empty() {
			let (tag, n) = u32::decode_var(data).ok_or_else(|| corrupt("edit tag"))?;
			data = &data[n..];
			match tag {
				TAG_ADD_FILE => {
					let (number, n) = u64::decode_var(data).ok_or_else(|| corrupt("add number"))?;
					data = &data[n..];
					let (size, n) = u32::decode_var(data).ok_or_else(|| corrupt("add size"))?;
					data = &data[n..];
					edit.add_files.push((number, size));
				}
				TAG_DELETE_FILE => {
					let (number, n) =
						u64::decode_var(data).ok_or_else(|| corrupt("delete number"))?;
					data = &data[n..];
					let (sequence, n) =
						u64::decode_var(data).ok_or_else(|| corrupt("delete sequence"))?;
					data = &data[n..];
					edit.delete_files.push((number, sequence));
				}
				TAG_NEXT_FILE_NUMBER => {
					let (next, n) =
						u64::decode_var(data).ok_or_else(|| corrupt("next file number"))?;
					data = &data[n..];
					edit.next_file_number = Some(next);
				}
				_ => return Err(Error::Corruption(format!("unknown version edit tag {tag}"))),
			}
		}
		Ok(edit)
	}
}

fn corrupt(what: &str) -> Error {
	Error::Corruption(format!("failed to decode version edit {what}"))
}

/// The durable set of live vlog files, reconstructed by replaying
/// [`BlobVersionEdit`] records from the manifest.
#[derive(Debug, Default, Clone)]
pub(crate) struct BlobVersion {
	/// Sealed, readable files by number.
	pub ro_files: BTreeMap<u64, VLogFileMeta>,
	/// Files awaiting physical deletion, with the LSM sequence at which
	/// they became unused.
	pub obsolete_files: BTreeMap<u64, u64>,
	/// Highest file number ever allocated (manifests and vlog files share
	/// the number space); strictly increasing across the process lifetime.
	pub last_file_number: u64,
}

impl BlobVersion {
	pub(crate) fn apply(&mut self, edit: &BlobVersionEdit) {
		for (number, file_size) in &edit.add_files {
			self.ro_files.insert(
				*number,
				VLogFileMeta {
					number: *number,
					file_size: *file_size,
					num_entries: 0,
				},
			);
			self.mark_file_number_used(*number);
		}
		for (number, sequence) in &edit.delete_files {
			self.ro_files.remove(number);
			self.obsolete_files.insert(*number, *sequence);
			self.mark_file_number_used(*number);
		}
		if let Some(n) = edit.next_file_number {
			self.mark_file_number_used(n);
		}
	}

	pub(crate) fn mark_file_number_used(&mut self, number: u64) {
		if number > self.last_file_number {
			self.last_file_number = number;
		}
	}

	pub(crate) fn new_file_number(&mut self) -> u64 {
		self.last_file_number += 1;
		self.last_file_number
	}

	/// One edit expressing the full version, written on open to bound
	/// manifest replay.
	pub(crate) fn snapshot_edit(&self) -> BlobVersionEdit {
		let mut edit = BlobVersionEdit::default();
		for meta in self.ro_files.values() {
			edit.add_file(meta.number, meta.file_size);
		}
		for (number, sequence) in &self.obsolete_files {
			edit.delete_file(*number, *sequence);
		}
		edit.set_next_file_number(self.last_file_number);
		edit
	}
}

/// Reads the manifest file number named by `CURRENT`, if any.
pub(crate) fn read_current(dir: &Path) -> Result<Option<u64>> {
	let path = dir.join("CURRENT");
	let contents = match std::fs::read_to_string(&path) {
		Ok(c) => c,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(e.into()),
	};

	let name = contents.trim_end();
	let number = name
		.strip_prefix("MANIFEST-")
		.and_then(|n| n.parse::<u64>().ok())
		.ok_or_else(|| Error::Corruption(format!("CURRENT names no manifest: {name:?}")))?;
	Ok(Some(number))
}

/// Atomically points `CURRENT` at the manifest with the given number.
pub(crate) fn set_current(dir: &Path, manifest_number: u64) -> Result<()> {
	let tmp = dir.join("CURRENT.dbtmp");
	{
		let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
		writeln!(file, "MANIFEST-{manifest_number:06}")?;
		file.sync_all()?;
	}
	std::fs::rename(&tmp, dir.join("CURRENT"))?;
	if let Ok(dir_handle) = File::open(dir) {
		let _ = dir_handle.sync_all();
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;

	#[test]
	fn test_edit_roundtrip() {
		let mut edit = BlobVersionEdit::default();
		edit.add_file(3, 4096).add_file(7, 1 << 20);
		edit.delete_file(2, 991);
		edit.set_next_file_number(8);

		let decoded = BlobVersionEdit::decode(&edit.encode()).unwrap();
		assert_eq!(decoded, edit);
	}

	#[test]
	fn test_edit_decode_rejects_garbage() {
		assert!(BlobVersionEdit::decode(&[9, 1, 2]).unwrap_err().is_corruption());
	}

	#[test]
	fn test_replay_moves_files_through_states() {
		let mut version = BlobVersion::default();

		let mut edit = BlobVersionEdit::default();
		edit.add_file(3, 100).set_next_file_number(3);
		version.apply(&edit);
		assert!(version.ro_files.contains_key(&3));
		assert_eq!(version.last_file_number, 3);

		let mut edit = BlobVersionEdit::default();
		edit.add_file(5, 60).delete_file(3, 777);
		version.apply(&edit);
		assert!(!version.ro_files.contains_key(&3));
		assert_eq!(version.obsolete_files.get(&3), Some(&777));
		assert!(version.ro_files.contains_key(&5));
		assert_eq!(version.last_file_number, 5);
	}

	#[test]
	fn test_snapshot_edit_rebuilds_identical_version() {
		let mut version = BlobVersion::default();
		let mut edit = BlobVersionEdit::default();
		edit.add_file(3, 100).add_file(4, 200).delete_file(2, 55).set_next_file_number(9);
		version.apply(&edit);

		let mut rebuilt = BlobVersion::default();
		rebuilt.apply(&version.snapshot_edit());
		assert_eq!(rebuilt.ro_files, version.ro_files);
		assert_eq!(rebuilt.obsolete_files, version.obsolete_files);
		assert_eq!(rebuilt.last_file_number, version.last_file_number);
	}

	#[test]
	fn test_current_roundtrip() {
		let dir = TempDir::new().unwrap();
		assert_eq!(read_current(dir.path()).unwrap(), None);

		set_current(dir.path(), 2).unwrap();
		assert_eq!(read_current(dir.path()).unwrap(), Some(2));

		set_current(dir.path(), 17).unwrap();
		assert_eq!(read_current(dir.path()).unwrap(), Some(17));
	}

	#[test]
	fn test_current_with_garbage_is_corruption() {
		let dir = TempDir::new().unwrap();
		std::fs::write(dir.path().join("CURRENT"), "not-a-manifest\n").unwrap();
		assert!(read_current(dir.path()).unwrap_err().is_corruption());
	}
}
