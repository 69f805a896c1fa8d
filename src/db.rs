use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::batch::{ValueBatch, WriteBatch};
use crate::error::{Error, Result};
use crate::iter::DbIterator;
use crate::lockfile::LockFile;
use crate::lsm::mem::MemLsm;
use crate::lsm::{LsmEngine, ValueKind, WriteCallback};
use crate::vlog::format::ValueHandle;
use crate::vlog::ValueLog;
use crate::{Options, ReadOptions, WriteOptions};

/// The public store: an LSM engine for keys and small values, a value
/// log for everything over the inlining threshold.
///
/// A write batch is split by value size; large values are appended to
/// the active vlog file and re-enter the batch as encoded handles, then
/// the combined batch lands in the LSM atomically. Reads dereference
/// handles transparently.
pub struct BlobDb {
	options: Arc<Options>,
	dir: PathBuf,
	lsm: Arc<dyn LsmEngine>,
	vlog: Arc<ValueLog>,

	/// Serializes foreground write assembly; reads never take this.
	write_lock: RwLock<()>,

	lock_file: Mutex<LockFile>,
	closed: AtomicBool,
}

impl std::fmt::Debug for BlobDb {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BlobDb").field("dir", &self.dir).finish()
	}
}

impl BlobDb {
	/// Opens (or, with `create_if_missing`, creates) the store at `path`
	/// backed by the bundled [`MemLsm`] engine.
	pub fn open(options: Options, path: impl AsRef<Path>) -> Result<BlobDb> {
		let dir = path.as_ref().to_path_buf();
		if !options.create_if_missing && !dir.join("CURRENT").exists() {
			return Err(Error::InvalidArgument(format!(
				"no blob database at {} and create_if_missing is off",
				dir.display()
			)));
		}
		std::fs::create_dir_all(&dir)?;

		let lsm = Arc::new(MemLsm::open(&dir)?);
		Self::open_with_engine(options, &dir, lsm)
	}

	/// Opens the store on top of a caller-provided LSM engine.
	pub fn open_with_engine(
		options: Options,
		path: impl AsRef<Path>,
		lsm: Arc<dyn LsmEngine>,
	) -> Result<BlobDb> {
		let options = Arc::new(options);
		let dir = path.as_ref().to_path_buf();
		std::fs::create_dir_all(&dir)?;

		let mut lock_file = LockFile::new(&dir);
		lock_file.acquire()?;

		let vlog = ValueLog::open(options.clone(), &dir, lsm.clone())?;
		log::info!("opened blob database at {}", dir.display());

		Ok(BlobDb {
			options,
			dir,
			lsm,
			vlog,
			write_lock: RwLock::new(()),
			lock_file: Mutex::new(lock_file),
			closed: AtomicBool::new(false),
		})
	}

	pub fn put(
		&self,
		options: &WriteOptions,
		key: impl Into<Vec<u8>>,
		value: impl Into<Vec<u8>>,
	) -> Result<()> {
		let mut batch = WriteBatch::new();
		batch.put(key.into(), value.into())?;
		self.write(options, batch)
	}

	pub fn delete(&self, options: &WriteOptions, key: impl Into<Vec<u8>>) -> Result<()> {
		let mut batch = WriteBatch::new();
		batch.delete(key.into())?;
		self.write(options, batch)
	}

	pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
		self.write_with_callback(options, batch, None)
	}

	/// Applies the batch atomically, invoking `callback` under the LSM's
	/// write-group lock.
	pub fn write_with_callback(
		&self,
		options: &WriteOptions,
		batch: WriteBatch,
		callback: Option<&dyn WriteCallback>,
	) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(Error::ShuttingDown);
		}

		let (mut small, mut large) = self.divide_write_batch(batch)?;
		{
			let _guard = self.write_lock.write();
			if !large.is_empty() {
				self.vlog.write(options, &mut large)?;
				for (key, _, handle) in large.iter() {
					small.put_handle(key.to_vec(), &handle)?;
				}
			}
			// Atomicity is the LSM's: the combined batch lands whole or
			// not at all.
			self.lsm.write(options, &small, callback)?;
		}

		self.vlog.remove_obsolete_files_now();
		self.vlog.maybe_schedule_gc();
		Ok(())
	}

	/// Splits a user batch into the inline half and the vlog-bound
	/// values. Deletions always stay inline.
	fn divide_write_batch(&self, batch: WriteBatch) -> Result<(WriteBatch, ValueBatch)> {
		let mut small = WriteBatch::new();
		let mut large = ValueBatch::default();
		for entry in batch.entries {
			if entry.kind == ValueKind::Value
				&& entry.value.len() >= self.options.blob_value_size_threshold
			{
				large.put(entry.key, entry.value);
			} else {
				small.push_entry(entry)?;
			}
		}
		Ok((small, large))
	}

	pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Vec<u8>> {
		let (kind, stored) = self.lsm.get(options, key)?;
		match kind {
			ValueKind::Value => Ok(stored),
			ValueKind::ValueHandle => {
				let handle = ValueHandle::decode(&stored)?;
				self.vlog.get(options, &handle)
			}
			ValueKind::Deletion => Err(Error::NotFound),
		}
	}

	/// Key-ordered iterator; resolves vlog handles on demand, with
	/// read-ahead when `ReadOptions::blob_prefetch` is set.
	pub fn iter(&self, options: &ReadOptions) -> DbIterator {
		DbIterator::new(self.lsm.iter(), self.vlog.clone(), options.clone())
	}

	pub fn get_snapshot(&self) -> u64 {
		self.lsm.get_snapshot()
	}

	pub fn release_snapshot(&self, sequence: u64) {
		self.lsm.release_snapshot(sequence)
	}

	pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
		self.lsm.compact_range(begin, end)
	}

	pub fn get_property(&self, name: &str) -> Option<String> {
		match name {
			"blobkv.vlog-debug" => Some(self.vlog.debug_string()),
			_ => self.lsm.property(name),
		}
	}

	pub fn get_approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
		ranges.iter().map(|(begin, end)| self.lsm.approximate_size(begin, end)).collect()
	}

	/// Forces the LSM's write-ahead log to disk.
	pub fn sync_lsm(&self) -> Result<()> {
		self.lsm.sync()
	}

	/// Requests a GC cycle over the first eligible file numbered at or
	/// above `number`.
	pub fn manual_gc(&self, number: u64) {
		self.vlog.manual_gc(number);
	}

	/// Blocks until the pending GC cycle (if any) finishes.
	pub fn wait_vlog_gc(&self) {
		self.vlog.wait_vlog_gc();
	}

	/// Sticky status of the last background GC run.
	pub fn vlog_bg_error(&self) -> Result<()> {
		self.vlog.bg_error()
	}

	/// Unlinks obsolete vlog files whose snapshot gate has passed;
	/// returns how many were removed.
	pub fn remove_obsolete_blob(&self) -> usize {
		self.vlog.remove_obsolete_files_now()
	}

	pub fn debug_string(&self) -> String {
		let mut out = self.vlog.debug_string();
		if let Some(keys) = self.lsm.property("lsm.num-keys") {
			out.push_str(&format!("lsm keys={keys}\n"));
		}
		out
	}

	pub fn path(&self) -> &Path {
		&self.dir
	}

	#[cfg(test)]
	pub(crate) fn test_vlog(&self) -> &Arc<ValueLog> {
		&self.vlog
	}

	/// Orderly shutdown: stops GC, seals the active vlog file, closes the
	/// LSM and releases the directory lock. Runs implicitly on drop.
	pub fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		self.vlog.close()?;
		self.lsm.close()?;
		self.lock_file.lock().release();
		log::info!("closed blob database at {}", self.dir.display());
		Ok(())
	}
}

impl Drop for BlobDb {
	fn drop(&mut self) {
		if let Err(e) = self.close() {
			log::error!("error closing blob database: {e}");
		}
	}
}
