use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tempfile::TempDir;
use test_log::test;

use crate::error::Result;
use crate::lsm::{LsmEngine, WriteCallback};
use crate::{BlobDb, Error, Options, ReadOptions, WriteBatch, WriteOptions};

fn small_options() -> Options {
	Options::default().with_blob_value_size_threshold(256)
}

#[test]
fn test_put_get_delete_inline_and_blob() {
	let dir = TempDir::new().unwrap();
	let db = BlobDb::open(small_options(), dir.path()).unwrap();
	let wo = WriteOptions::default();
	let ro = ReadOptions::default();

	db.put(&wo, "key1", "value1").unwrap();
	assert_eq!(db.get(&ro, b"key1").unwrap(), b"value1");

	// At 100 bytes the value stays inline; at 512 it moves to the vlog.
	db.put(&wo, "key2", vec![b'x'; 100]).unwrap();
	assert_eq!(db.get(&ro, b"key2").unwrap(), vec![b'x'; 100]);

	db.put(&wo, "key3", vec![b'y'; 512]).unwrap();
	assert_eq!(db.get(&ro, b"key3").unwrap(), vec![b'y'; 512]);

	db.delete(&wo, "key1").unwrap();
	assert!(db.get(&ro, b"key1").unwrap_err().is_not_found());
	db.delete(&wo, "key3").unwrap();
	assert!(db.get(&ro, b"key3").unwrap_err().is_not_found());

	assert!(db.get(&ro, b"never-written").unwrap_err().is_not_found());
	db.close().unwrap();
}

#[test]
fn test_reopen_preserves_inline_and_blob_values() {
	let dir = TempDir::new().unwrap();
	{
		let db = BlobDb::open(small_options(), dir.path()).unwrap();
		let wo = WriteOptions {
			sync: true,
		};
		db.put(&wo, "inline", "small").unwrap();
		db.put(&wo, "blob", vec![b'z'; 1000]).unwrap();
		db.delete(&wo, "inline2").unwrap();
		db.close().unwrap();
	}

	let db = BlobDb::open(small_options(), dir.path()).unwrap();
	let ro = ReadOptions::default();
	assert_eq!(db.get(&ro, b"inline").unwrap(), b"small");
	assert_eq!(db.get(&ro, b"blob").unwrap(), vec![b'z'; 1000]);
	assert!(db.get(&ro, b"inline2").unwrap_err().is_not_found());
	db.close().unwrap();
}

/// Conditional writes: a callback that fails under the write-group lock
/// aborts the batch; once its condition holds, the same batch applies.
#[test]
fn test_write_with_callback() {
	struct RequireKey(&'static [u8]);
	impl WriteCallback for RequireKey {
		fn check(&self, db: &dyn LsmEngine) -> Result<()> {
			db.get(&ReadOptions::default(), self.0).map(|_| ())
		}

		fn allow_grouping(&self) -> bool {
			true
		}
	}

	let dir = TempDir::new().unwrap();
	let db = BlobDb::open(small_options(), dir.path()).unwrap();
	let wo = WriteOptions::default();
	let ro = ReadOptions::default();
	let cb = RequireKey(b"key0");

	let mut batch = WriteBatch::new();
	batch.put(b"key1".to_vec(), b"val1".to_vec()).unwrap();
	let err = db.write_with_callback(&wo, batch.clone(), Some(&cb)).unwrap_err();
	assert!(err.is_not_found());
	assert!(db.get(&ro, b"key1").unwrap_err().is_not_found());

	db.put(&wo, "key0", "val0").unwrap();
	db.write_with_callback(&wo, batch, Some(&cb)).unwrap();
	assert_eq!(db.get(&ro, b"key1").unwrap(), b"val1");
	db.close().unwrap();
}

#[test]
fn test_snapshot_reads_pin_blob_values() {
	let dir = TempDir::new().unwrap();
	let db = BlobDb::open(small_options(), dir.path()).unwrap();
	let wo = WriteOptions::default();

	db.put(&wo, "k", vec![b'a'; 400]).unwrap();
	let snapshot = db.get_snapshot();
	db.put(&wo, "k", vec![b'b'; 400]).unwrap();

	let at_snapshot = ReadOptions {
		snapshot: Some(snapshot),
		blob_prefetch: false,
	};
	assert_eq!(db.get(&at_snapshot, b"k").unwrap(), vec![b'a'; 400]);
	assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap(), vec![b'b'; 400]);

	db.release_snapshot(snapshot);
	db.close().unwrap();
}

/// Multiple writers feed a queue that multiple readers drain, every read
/// checked against what was written.
#[test]
fn test_concurrent_writers_and_readers() {
	let dir = TempDir::new().unwrap();
	let db = Arc::new(BlobDb::open(Options::default(), dir.path()).unwrap());

	let n_writers = 4;
	let n_readers = 4;
	let per_writer = 250usize;
	let total = n_writers * per_writer;
	let per_reader = total / n_readers;

	let queue = Arc::new(Mutex::new(VecDeque::<(Vec<u8>, Vec<u8>)>::new()));
	let cv = Arc::new(Condvar::new());

	let mut handles = Vec::new();
	for w in 0..n_writers {
		let db = db.clone();
		let queue = queue.clone();
		let cv = cv.clone();
		handles.push(std::thread::spawn(move || {
			for j in 0..per_writer {
				let key = format!("k{w:02}_{j:05}").into_bytes();
				let mut val = format!("value{w}_{j}").into_bytes();
				val.extend(std::iter::repeat(b'x').take(1024));
				db.put(&WriteOptions::default(), key.clone(), val.clone()).unwrap();
				queue.lock().push_back((key, val));
				cv.notify_all();
			}
		}));
	}

	for _ in 0..n_readers {
		let db = db.clone();
		let queue = queue.clone();
		let cv = cv.clone();
		handles.push(std::thread::spawn(move || {
			for _ in 0..per_reader {
				let (key, expected) = {
					let mut queue = queue.lock();
					while queue.is_empty() {
						cv.wait(&mut queue);
					}
					queue.pop_front().unwrap()
				};
				let got = db.get(&ReadOptions::default(), &key).unwrap();
				assert_eq!(got, expected);
			}
		}));
	}

	for handle in handles {
		handle.join().unwrap();
	}
	db.close().unwrap();
}

#[test]
fn test_open_refuses_missing_store_without_create() {
	let dir = TempDir::new().unwrap();
	let options = Options::default().with_create_if_missing(false);
	let err = BlobDb::open(options, dir.path().join("nope")).unwrap_err();
	assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_second_open_is_refused_while_locked() {
	let dir = TempDir::new().unwrap();
	let db = BlobDb::open(Options::default(), dir.path()).unwrap();
	let err = BlobDb::open(Options::default(), dir.path()).unwrap_err();
	assert!(matches!(err, Error::DatabaseLocked(_)));
	db.close().unwrap();
	drop(db);

	// Released on close: a new holder can come in.
	let db = BlobDb::open(Options::default(), dir.path()).unwrap();
	db.close().unwrap();
}

#[test]
fn test_properties_and_approximate_sizes() {
	let dir = TempDir::new().unwrap();
	let db = BlobDb::open(small_options(), dir.path()).unwrap();
	let wo = WriteOptions::default();

	for i in 0..10 {
		db.put(&wo, format!("key{i}"), vec![b'v'; 300]).unwrap();
	}

	assert_eq!(db.get_property("lsm.num-keys").unwrap(), "10");
	assert!(db.get_property("blobkv.vlog-debug").unwrap().contains("active"));
	assert!(db.get_property("no.such.property").is_none());

	let sizes = db.get_approximate_sizes(&[(b"key0", b"key9"), (b"zz", b"zzz")]);
	assert!(sizes[0] > 0);
	assert_eq!(sizes[1], 0);

	assert!(!db.debug_string().is_empty());
	db.close().unwrap();
}

#[test]
fn test_empty_key_is_rejected() {
	let dir = TempDir::new().unwrap();
	let db = BlobDb::open(Options::default(), dir.path()).unwrap();
	let err = db.put(&WriteOptions::default(), Vec::new(), b"v".to_vec()).unwrap_err();
	assert!(matches!(err, Error::EmptyKey));
	db.close().unwrap();
}

/// The value-log's own insertion-order iterator sees every record in
/// every live file.
#[test]
fn test_value_log_insertion_order_scan() {
	let dir = TempDir::new().unwrap();
	// Force a seal between records so the scan spans sealed + active.
	let options = small_options().with_blob_max_file_size(600);
	let db = BlobDb::open(options, dir.path()).unwrap();
	let wo = WriteOptions::default();

	let values: Vec<Vec<u8>> =
		(0..5).map(|i| format!("payload{i}").into_bytes().repeat(50)).collect();
	for (i, val) in values.iter().enumerate() {
		db.put(&wo, format!("key{i}"), val.clone()).unwrap();
	}

	let mut iter = db.test_vlog().iter().unwrap();
	iter.seek_to_first().unwrap();
	let mut seen = Vec::new();
	let mut last_table = 0;
	while iter.valid() {
		// Files are visited in number order.
		assert!(iter.handle().table >= last_table);
		last_table = iter.handle().table;
		seen.push((iter.key().to_vec(), iter.value().to_vec()));
		iter.next().unwrap();
	}

	assert_eq!(seen.len(), values.len());
	for (i, (key, val)) in seen.iter().enumerate() {
		assert_eq!(key, format!("key{i}").as_bytes());
		assert_eq!(val, &values[i]);
	}
	db.close().unwrap();
}
