//! The value log: append-only files holding large values outside the
//! LSM, a versioned manifest tracking their lifecycle, and the garbage
//! collector that reclaims dead space.

pub(crate) mod builder;
pub(crate) mod cache;
pub mod format;
pub(crate) mod gc;
pub(crate) mod reader;
pub(crate) mod rwfile;
pub(crate) mod version;

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::batch::ValueBatch;
use crate::error::{Error, Result};
use crate::lsm::LsmEngine;
use crate::{Options, ReadOptions, WriteOptions};

use self::cache::VLogCache;
use self::format::ValueHandle;
use self::gc::GcShared;
use self::reader::VLogFileIterator;
use self::rwfile::{VLogFileRef, VLogRWFile};
use self::version::{BlobVersion, BlobVersionEdit, VLogFileMeta};
use crate::wal;

pub(crate) const VLOG_FILE_SUFFIX: &str = ".vlog";

pub(crate) fn vlog_file_name(number: u64) -> String {
	format!("{number:06}{VLOG_FILE_SUFFIX}")
}

pub(crate) fn vlog_file_path(dir: &Path, number: u64) -> PathBuf {
	dir.join(vlog_file_name(number))
}

pub(crate) fn manifest_file_path(dir: &Path, number: u64) -> PathBuf {
	dir.join(format!("MANIFEST-{number:06}"))
}

pub(crate) fn parse_vlog_file_name(name: &str) -> Option<u64> {
	name.strip_suffix(VLOG_FILE_SUFFIX).and_then(|stem| stem.parse::<u64>().ok())
}

/// Live file-set state guarded by the value log's reader-writer lock.
pub(crate) struct State {
	pub(crate) version: BlobVersion,
	/// The sole writable file; always present after `open`.
	pub(crate) active: Arc<VLogRWFile>,
	/// Files a GC job is currently building.
	pub(crate) pending_outputs: BTreeSet<u64>,
	/// Round-robin cursor for periodic GC picks.
	pub(crate) gc_pointer: u64,
	manifest: wal::Writer,
	manifest_number: u64,
}

/// Orchestrates vlog writes, reads, recovery, rollover, the manifest and
/// garbage-collection scheduling.
///
/// Thread-safe for one writer and any number of readers; the embedding
/// [`BlobDb`](crate::db::BlobDb) serializes writers.
pub(crate) struct ValueLog {
	pub(crate) dir: PathBuf,
	pub(crate) options: Arc<Options>,
	pub(crate) lsm: Arc<dyn LsmEngine>,
	pub(crate) state: RwLock<State>,
	pub(crate) cache: Arc<VLogCache>,
	pub(crate) shutdown: AtomicBool,

	/// GC scheduling state; see `gc.rs`.
	pub(crate) gc_shared: Mutex<GcShared>,
	pub(crate) gc_cv: Condvar,
}

impl ValueLog {
	/// Opens the value log in `dir`, running recovery: manifest replay,
	/// untracked-file adoption with tail truncation, snapshot manifest
	/// rewrite, and active-file selection.
	pub(crate) fn open(
		options: Arc<Options>,
		dir: &Path,
		lsm: Arc<dyn LsmEngine>,
	) -> Result<Arc<ValueLog>> {
		std::fs::create_dir_all(dir)?;

		let mut version = BlobVersion::default();
		let current = version::read_current(dir)?;
		match current {
			Some(manifest_number) => {
				replay_manifest(dir, manifest_number, &mut version)?;
				version.mark_file_number_used(manifest_number);
			}
			None => {
				if !options.create_if_missing {
					return Err(Error::InvalidArgument(format!(
						"no blob database at {}",
						dir.display()
					)));
				}
				// A fresh store starts with an empty initial manifest so
				// that recovery below always has a CURRENT to come from.
				let number = version.new_file_number();
				write_manifest(dir, number, &version)?;
				version::set_current(dir, number)?;
			}
		}

		// Discover vlog files the manifest does not know about: the active
		// file at crash time, and GC outputs whose edits never landed.
		let mut untracked = Vec::new();
		for entry in std::fs::read_dir(dir)? {
			let entry = entry?;
			let name = entry.file_name();
			let Some(number) = parse_vlog_file_name(&name.to_string_lossy()) else {
				continue;
			};
			version.mark_file_number_used(number);
			if !version.ro_files.contains_key(&number)
				&& !version.obsolete_files.contains_key(&number)
			{
				untracked.push(number);
			}
		}
		untracked.sort_unstable();

		let mut adopted: Vec<VLogFileMeta> = Vec::new();
		for number in untracked {
			let path = vlog_file_path(dir, number);
			let (offset, num_entries) = validate_and_truncate(&path)?;
			if offset == 0 {
				log::warn!("removing untracked vlog {number} with no valid prefix");
				std::fs::remove_file(&path)?;
				continue;
			}
			adopted.push(VLogFileMeta {
				number,
				file_size: offset,
				num_entries,
			});
		}

		// The highest-numbered discovered file resumes as the active
		// writer if it is still below the seal threshold.
		let mut resume: Option<VLogFileMeta> = None;
		if let Some(last) = adopted.last().copied() {
			if (last.file_size as u64) < options.blob_max_file_size {
				resume = Some(last);
				adopted.pop();
			}
		}

		let mut edit = BlobVersionEdit::default();
		for meta in &adopted {
			edit.add_file(meta.number, meta.file_size);
		}
		version.apply(&edit);

		// Bound future replay with a fresh snapshot manifest.
		let manifest_number = version.new_file_number();
		let manifest = write_manifest(dir, manifest_number, &version)?;
		version::set_current(dir, manifest_number)?;
		remove_stale_manifests(dir, manifest_number)?;

		let active = match resume {
			Some(meta) => {
				log::info!(
					"resuming vlog {} as active writer at offset {}",
					meta.number,
					meta.file_size
				);
				Arc::new(VLogRWFile::open(
					&vlog_file_path(dir, meta.number),
					meta.number,
					meta.file_size,
					meta.num_entries,
				)?)
			}
			None => {
				let number = version.new_file_number();
				Arc::new(VLogRWFile::open(&vlog_file_path(dir, number), number, 0, 0)?)
			}
		};

		let cache = Arc::new(VLogCache::new(dir.to_path_buf(), options.blob_vlog_cache_capacity));

		Ok(Arc::new(ValueLog {
			dir: dir.to_path_buf(),
			options,
			lsm,
			state: RwLock::new(State {
				version,
				active,
				pending_outputs: BTreeSet::new(),
				gc_pointer: 0,
				manifest,
				manifest_number,
			}),
			cache,
			shutdown: AtomicBool::new(false),
			gc_shared: Mutex::new(GcShared::new()),
			gc_cv: Condvar::new(),
		}))
	}

	/// Appends one record to the active file, returning its handle.
	///
	/// Concurrent `put` is not supported; the caller serializes writers.
	pub(crate) fn put(
		&self,
		options: &WriteOptions,
		key: &[u8],
		value: &[u8],
	) -> Result<ValueHandle> {
		if self.shutdown.load(Ordering::Acquire) {
			return Err(Error::ShuttingDown);
		}
		let (handle, active) = {
			let state = self.state.write();
			let active = state.active.clone();
			let handle = active.add(key, value)?;
			active.flush()?;
			(handle, active)
		};
		if options.sync {
			active.sync()?;
		}
		self.roll_if_needed()?;
		Ok(handle)
	}

	/// Appends a staged batch, finalizing its handles against the active
	/// file's current offset.
	pub(crate) fn write(&self, options: &WriteOptions, batch: &mut ValueBatch) -> Result<()> {
		if batch.is_empty() {
			return Ok(());
		}
		if self.shutdown.load(Ordering::Acquire) {
			return Err(Error::ShuttingDown);
		}
		let active = {
			let state = self.state.write();
			let active = state.active.clone();
			batch.finalize(active.number(), active.tail());
			active.write_batch(batch)?;
			active.flush()?;
			active
		};
		if options.sync {
			active.sync()?;
		}
		self.roll_if_needed()?;
		Ok(())
	}

	/// Seals the active file once it crosses the size threshold and
	/// installs a fresh one.
	///
	/// The data fsync of the sealed file happens off-lock; its meta is
	/// made visible to readers before the lock is released, and the
	/// `AddFile` edit lands after the fsync.
	fn roll_if_needed(&self) -> Result<()> {
		let sealed = {
			let mut state = self.state.write();
			if (state.active.file_size() as u64) < self.options.blob_max_file_size {
				return Ok(());
			}

			let number = state.version.new_file_number();
			let fresh =
				Arc::new(VLogRWFile::open(&vlog_file_path(&self.dir, number), number, 0, 0)?);
			let old = std::mem::replace(&mut state.active, fresh);

			state.version.ro_files.insert(
				old.number(),
				VLogFileMeta {
					number: old.number(),
					file_size: old.file_size(),
					num_entries: old.num_entries(),
				},
			);
			old
		};

		sealed.finish()?;
		log::info!("sealed vlog {} at {} bytes", sealed.number(), sealed.file_size());

		let mut state = self.state.write();
		let mut edit = BlobVersionEdit::default();
		edit.add_file(sealed.number(), sealed.file_size());
		self.log_and_apply(&mut state, edit)
	}

	/// Resolves a handle to its value.
	///
	/// `NotFound` when the file is absent, or obsolete past the caller's
	/// snapshot; `Corruption` when the record fails validation.
	pub(crate) fn get(&self, options: &ReadOptions, handle: &ValueHandle) -> Result<Vec<u8>> {
		let pin = {
			let state = self.state.read();
			if state.active.number() == handle.table {
				VLogFileRef::Rw(state.active.clone())
			} else if state.version.ro_files.contains_key(&handle.table) {
				VLogFileRef::Ro(self.cache.get(handle.table)?)
			} else if let Some(obsolete_seq) = state.version.obsolete_files.get(&handle.table) {
				// Still readable for snapshots that predate obsolescence.
				match options.snapshot {
					Some(snapshot) if snapshot <= *obsolete_seq => {
						VLogFileRef::Ro(self.cache.get(handle.table)?)
					}
					_ => return Err(Error::NotFound),
				}
			} else {
				return Err(Error::NotFound);
			}
		};
		reader::read_value(&pin, handle)
	}

	/// Sequential iterator over every live record: sealed files in number
	/// order, then the active file up to its current tail.
	pub(crate) fn iter(&self) -> Result<ValueLogIterator> {
		let mut files = Vec::new();
		{
			let state = self.state.read();
			for number in state.version.ro_files.keys() {
				let pin = VLogFileRef::Ro(self.cache.get(*number)?);
				let end = pin.end_offset();
				files.push((pin, end));
			}
			let pin = VLogFileRef::Rw(state.active.clone());
			let end = pin.end_offset();
			files.push((pin, end));
		}
		Ok(ValueLogIterator {
			files,
			index: 0,
			current: None,
		})
	}

	/// Iterator over a single sealed file, pinned through the cache.
	pub(crate) fn file_iter(&self, number: u64) -> Result<VLogFileIterator> {
		let pin = VLogFileRef::Ro(self.cache.get(number)?);
		let end = pin.end_offset();
		Ok(VLogFileIterator::new(pin, end))
	}

	/// Applies an edit in memory, appends it to the manifest and fsyncs.
	///
	/// Crash before the fsync leaves an uncommitted tail that replay
	/// ignores; the in-memory change dies with the process.
	pub(crate) fn log_and_apply(&self, state: &mut State, edit: BlobVersionEdit) -> Result<()> {
		state.version.apply(&edit);
		state.manifest.add_record(&edit.encode())?;
		state.manifest.sync()
	}

	/// Unlinks obsolete files whose sequence gate has passed. Readers
	/// holding pins keep valid descriptors.
	pub(crate) fn remove_obsolete_files(&self, state: &mut State) -> usize {
		let oldest = self.lsm.oldest_live_snapshot();
		let expired: Vec<u64> = state
			.version
			.obsolete_files
			.iter()
			.filter(|(_, seq)| **seq < oldest)
			.map(|(n, _)| *n)
			.collect();

		let mut removed = 0;
		for number in expired {
			self.cache.evict(number);
			match std::fs::remove_file(vlog_file_path(&self.dir, number)) {
				Ok(()) => {
					log::info!("removed obsolete vlog {number}");
					removed += 1;
				}
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(e) => {
					log::warn!("failed to remove obsolete vlog {number}: {e}");
					continue;
				}
			}
			state.version.obsolete_files.remove(&number);
		}
		removed
	}

	pub(crate) fn remove_obsolete_files_now(&self) -> usize {
		if self.state.read().version.obsolete_files.is_empty() {
			return 0;
		}
		let mut state = self.state.write();
		self.remove_obsolete_files(&mut state)
	}

	/// Stops background work and seals the active file. Idempotent.
	pub(crate) fn close(&self) -> Result<()> {
		self.shutdown.store(true, Ordering::Release);
		{
			let mut shared = self.gc_shared.lock();
			while shared.bg_running {
				self.gc_cv.wait(&mut shared);
			}
		}
		let active = self.state.read().active.clone();
		active.finish()?;
		let mut state = self.state.write();
		state.manifest.close()
	}

	pub(crate) fn debug_string(&self) -> String {
		let state = self.state.read();
		let mut out = String::new();
		let _ = writeln!(
			out,
			"vlog dir={} next_file_number={} manifest={}",
			self.dir.display(),
			state.version.last_file_number + 1,
			state.manifest_number
		);
		let _ = writeln!(
			out,
			"active: #{} size={} entries={}",
			state.active.number(),
			state.active.file_size(),
			state.active.num_entries()
		);
		for meta in state.version.ro_files.values() {
			let _ = writeln!(out, "ro: #{} size={}", meta.number, meta.file_size);
		}
		for (number, seq) in &state.version.obsolete_files {
			let _ = writeln!(out, "obsolete: #{number} sequence={seq}");
		}
		if !state.pending_outputs.is_empty() {
			let _ = writeln!(out, "pending outputs: {:?}", state.pending_outputs);
		}
		out
	}
}

fn replay_manifest(dir: &Path, manifest_number: u64, version: &mut BlobVersion) -> Result<()> {
	let path = manifest_file_path(dir, manifest_number);
	let file = std::fs::File::open(&path)?;
	let mut reader = wal::Reader::new(file);
	while let Some(record) = reader.read_record()? {
		let edit = BlobVersionEdit::decode(&record)?;
		version.apply(&edit);
	}
	Ok(())
}

/// Creates a manifest containing a snapshot of `version` and returns its
/// open writer for subsequent edits.
fn write_manifest(dir: &Path, manifest_number: u64, version: &BlobVersion) -> Result<wal::Writer> {
	let path = manifest_file_path(dir, manifest_number);
	// A crash between manifest creation and the CURRENT rename can leave
	// a stale file under this number; truncating is the correct recovery.
	let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
	let mut writer = wal::Writer::new(wal::BufferedFileWriter::new(file, wal::BLOCK_SIZE), 0);
	writer.add_record(&version.snapshot_edit().encode())?;
	writer.sync()?;
	Ok(writer)
}

fn remove_stale_manifests(dir: &Path, keep: u64) -> Result<()> {
	for entry in std::fs::read_dir(dir)? {
		let entry = entry?;
		let name = entry.file_name();
		let name = name.to_string_lossy();
		if let Some(number) = name.strip_prefix("MANIFEST-").and_then(|n| n.parse::<u64>().ok()) {
			if number != keep {
				let _ = std::fs::remove_file(entry.path());
			}
		}
	}
	Ok(())
}

/// Scans a vlog file from offset 0, accepting the longest well-formed
/// prefix and truncating anything behind it. Returns the accepted length
/// and entry count.
pub(crate) fn validate_and_truncate(path: &Path) -> Result<(u32, u32)> {
	let file_len = std::fs::metadata(path)?.len();
	let raw_end = file_len.min(u32::MAX as u64) as u32;

	let ro = rwfile::VLogRoFile::open(path, 0)?;
	let mut iter = VLogFileIterator::new(VLogFileRef::Ro(Arc::new(ro)), raw_end);

	let mut num_entries = 0u32;
	let mut status = iter.seek_to_first();
	while status.is_ok() && iter.valid() {
		num_entries += 1;
		status = iter.next();
	}

	let offset = iter.offset();
	if let Err(e) = status {
		log::warn!("truncating vlog tail at {offset}: {e}");
	}
	if (offset as u64) < file_len {
		let file = OpenOptions::new().write(true).open(path)?;
		file.set_len(offset as u64)?;
		file.sync_all()?;
	}
	Ok((offset, num_entries))
}

/// Insertion-order scan across all vlog files; used by GC diagnostics
/// and tests, not by key-ordered reads.
pub(crate) struct ValueLogIterator {
	files: Vec<(VLogFileRef, u32)>,
	index: usize,
	current: Option<VLogFileIterator>,
}

impl ValueLogIterator {
	pub(crate) fn seek_to_first(&mut self) -> Result<()> {
		self.index = 0;
		self.current = None;
		self.advance_file()
	}

	pub(crate) fn next(&mut self) -> Result<()> {
		if let Some(iter) = self.current.as_mut() {
			iter.next()?;
			if !iter.valid() {
				self.index += 1;
				self.advance_file()?;
			}
		}
		Ok(())
	}

	pub(crate) fn valid(&self) -> bool {
		self.current.as_ref().is_some_and(|i| i.valid())
	}

	pub(crate) fn key(&self) -> &[u8] {
		debug_assert!(self.valid());
		self.current.as_ref().unwrap().key()
	}

	pub(crate) fn value(&self) -> &[u8] {
		debug_assert!(self.valid());
		self.current.as_ref().unwrap().value()
	}

	pub(crate) fn handle(&self) -> ValueHandle {
		debug_assert!(self.valid());
		self.current.as_ref().unwrap().handle()
	}

	/// Positions on the first record of the next non-empty file.
	fn advance_file(&mut self) -> Result<()> {
		while self.index < self.files.len() {
			let (pin, end) = self.files[self.index].clone();
			let mut iter = VLogFileIterator::new(pin, end);
			iter.seek_to_first()?;
			if iter.valid() {
				self.current = Some(iter);
				return Ok(());
			}
			self.index += 1;
		}
		self.current = None;
		Ok(())
	}
}
