use std::sync::Arc;

use tempfile::TempDir;
use test_log::test;

use crate::lsm::mem::MemLsm;
use crate::lsm::LsmEngine;
use crate::vlog::rwfile::VLogRWFile;
use crate::vlog::{vlog_file_path, ValueLog};
use crate::{Options, ReadOptions, ValueHandle, WriteOptions};

fn open_vlog(options: &Arc<Options>, dir: &TempDir, lsm: &Arc<MemLsm>) -> Arc<ValueLog> {
	let lsm: Arc<dyn LsmEngine> = lsm.clone();
	ValueLog::open(options.clone(), dir.path(), lsm).unwrap()
}

fn truncate(dir: &TempDir, number: u64, len: u64) {
	let file = std::fs::OpenOptions::new()
		.write(true)
		.open(vlog_file_path(dir.path(), number))
		.unwrap();
	file.set_len(len).unwrap();
}

/// Port of the original recovery scenario: exact handles on a fresh
/// store, reads across reopen, and a torn-tail sweep that must always
/// resume at the offset of the lost record.
#[test]
fn test_value_log_recover_from_torn_tail() {
	let dir = TempDir::new().unwrap();
	let options = Arc::new(Options::default().with_blob_max_file_size(8 << 20));
	let lsm = Arc::new(MemLsm::open(dir.path()).unwrap());
	let wo = WriteOptions::default();
	let ro = ReadOptions::default();

	let vlog = open_vlog(&options, &dir, &lsm);
	assert_eq!(vlog.put(&wo, b"k01", b"value01").unwrap(), ValueHandle::new(3, 0, 0, 12));
	assert_eq!(vlog.put(&wo, b"k02", b"value02").unwrap(), ValueHandle::new(3, 0, 12, 12));
	assert_eq!(vlog.put(&wo, b"k03", b"value03").unwrap(), ValueHandle::new(3, 0, 24, 12));
	vlog.close().unwrap();
	drop(vlog);

	let vlog = open_vlog(&options, &dir, &lsm);
	assert_eq!(vlog.get(&ro, &ValueHandle::new(3, 0, 0, 12)).unwrap(), b"value01");
	assert_eq!(vlog.get(&ro, &ValueHandle::new(3, 0, 12, 12)).unwrap(), b"value02");
	assert_eq!(vlog.get(&ro, &ValueHandle::new(3, 0, 24, 12)).unwrap(), b"value03");

	assert_eq!(vlog.put(&wo, b"k04", b"value04").unwrap(), ValueHandle::new(3, 0, 36, 12));
	assert_eq!(vlog.put(&wo, b"k05", b"value05").unwrap(), ValueHandle::new(3, 0, 48, 12));
	assert_eq!(vlog.put(&wo, b"k06", b"value06").unwrap(), ValueHandle::new(3, 0, 60, 12));
	vlog.close().unwrap();
	drop(vlog);

	// Simulate a crashed OS losing part of the last record: for every
	// truncation point inside it, reopen must re-derive offset 60.
	for i in 60..72 {
		truncate(&dir, 3, i);
		let vlog = open_vlog(&options, &dir, &lsm);
		assert_eq!(
			vlog.put(&wo, b"k06", b"value06").unwrap(),
			ValueHandle::new(3, 0, 60, 12),
			"truncation to {i} must resume at offset 60"
		);
		vlog.close().unwrap();
	}

	// The surviving prefix still reads back byte-identical.
	let vlog = open_vlog(&options, &dir, &lsm);
	assert_eq!(vlog.get(&ro, &ValueHandle::new(3, 0, 48, 12)).unwrap(), b"value05");
	assert_eq!(vlog.get(&ro, &ValueHandle::new(3, 0, 60, 12)).unwrap(), b"value06");
	vlog.close().unwrap();
}

#[test]
fn test_recover_adopts_untracked_durable_file() {
	let dir = TempDir::new().unwrap();
	let options = Arc::new(Options::default().with_blob_max_file_size(8 << 20));
	let lsm = Arc::new(MemLsm::open(dir.path()).unwrap());
	let wo = WriteOptions::default();
	let ro = ReadOptions::default();

	let handle_old = {
		let vlog = open_vlog(&options, &dir, &lsm);
		let h = vlog.put(&wo, b"old", b"old-value").unwrap();
		vlog.close().unwrap();
		h
	};

	// A GC output whose manifest edit never landed: durable, sealed,
	// numbered above everything else.
	let handle_new = {
		let rw = VLogRWFile::open(&vlog_file_path(dir.path(), 9), 9, 0, 0).unwrap();
		let h = rw.add(b"moved", b"moved-value").unwrap();
		rw.finish().unwrap();
		h
	};
	assert_eq!(handle_new.table, 9);

	let vlog = open_vlog(&options, &dir, &lsm);
	// Both the old file and the adopted one resolve.
	assert_eq!(vlog.get(&ro, &handle_old).unwrap(), b"old-value");
	assert_eq!(vlog.get(&ro, &handle_new).unwrap(), b"moved-value");

	// The adopted file had the highest number and is below the cap, so
	// it resumed as the active writer.
	let next = vlog.put(&wo, b"appended", b"appended-value").unwrap();
	assert_eq!(next.table, 9);
	assert_eq!(next.offset, handle_new.offset + handle_new.size);
	vlog.close().unwrap();
}

#[test]
fn test_recover_unlinks_untracked_file_with_no_valid_prefix() {
	let dir = TempDir::new().unwrap();
	let options = Arc::new(Options::default());
	let lsm = Arc::new(MemLsm::open(dir.path()).unwrap());
	let wo = WriteOptions::default();

	{
		let vlog = open_vlog(&options, &dir, &lsm);
		vlog.put(&wo, b"k01", b"value01").unwrap();
		vlog.close().unwrap();
	}

	// Garbage from a crashed GC: nothing in it parses.
	let junk = vlog_file_path(dir.path(), 8);
	std::fs::write(&junk, [0xffu8; 16]).unwrap();

	let vlog = open_vlog(&options, &dir, &lsm);
	assert!(!junk.exists(), "junk file should have been unlinked");
	// The store still resumes its real active file.
	assert_eq!(vlog.put(&wo, b"k02", b"value02").unwrap(), ValueHandle::new(3, 0, 12, 12));
	vlog.close().unwrap();
}

#[test]
fn test_recover_seals_oversized_active_file() {
	let dir = TempDir::new().unwrap();
	let lsm = Arc::new(MemLsm::open(dir.path()).unwrap());
	let wo = WriteOptions::default();
	let ro = ReadOptions::default();

	let handle = {
		let options = Arc::new(Options::default().with_blob_max_file_size(8 << 20));
		let vlog = open_vlog(&options, &dir, &lsm);
		let h = vlog.put(&wo, b"k01", b"a value of some length").unwrap();
		vlog.put(&wo, b"k02", b"another value of some length").unwrap();
		vlog.close().unwrap();
		h
	};

	// Reopen with a cap below the file's size: it must be sealed into
	// the read-only set and a fresh active file created.
	let options = Arc::new(Options::default().with_blob_max_file_size(16));
	let vlog = open_vlog(&options, &dir, &lsm);
	let next = vlog.put(&wo, b"k03", b"v3").unwrap();
	assert_ne!(next.table, handle.table);
	assert_eq!(next.offset, 0);

	// Sealed data remains readable through the cache.
	assert_eq!(vlog.get(&ro, &handle).unwrap(), b"a value of some length");
	vlog.close().unwrap();
}

#[test]
fn test_rollover_seals_at_size_cap() {
	let dir = TempDir::new().unwrap();
	// Each record is 12 bytes; the third append crosses the cap.
	let options = Arc::new(Options::default().with_blob_max_file_size(30));
	let lsm = Arc::new(MemLsm::open(dir.path()).unwrap());
	let wo = WriteOptions::default();
	let ro = ReadOptions::default();

	let vlog = open_vlog(&options, &dir, &lsm);
	let h1 = vlog.put(&wo, b"k01", b"value01").unwrap();
	let h2 = vlog.put(&wo, b"k02", b"value02").unwrap();
	let h3 = vlog.put(&wo, b"k03", b"value03").unwrap();
	assert_eq!(h1.table, 3);
	assert_eq!(h2.table, 3);
	// 36 >= 30 sealed file 3; the next write goes to a fresh file.
	assert_eq!(h3.table, 3);
	let h4 = vlog.put(&wo, b"k04", b"value04").unwrap();
	assert_eq!(h4.table, 4);
	assert_eq!(h4.offset, 0);

	// Old handles keep resolving after the seal.
	assert_eq!(vlog.get(&ro, &h1).unwrap(), b"value01");
	assert_eq!(vlog.get(&ro, &h3).unwrap(), b"value03");
	vlog.close().unwrap();
}
