//! Garbage collection: pick a read-only vlog file, scan it against the
//! LSM for liveness, rewrite the survivors into a fresh file, re-point
//! the LSM at them through conditional writes, and mark the old file
//! obsolete.
//!
//! There is no scoring policy: periodic runs walk the file set
//! round-robin, manual runs start from a caller-given number.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::batch::WriteBatch;
use crate::error::{Error, Result};
use crate::lsm::{LsmEngine, ValueKind, WriteCallback};
use crate::sync_point;
use crate::vlog::format::ValueHandle;
use crate::vlog::version::{BlobVersionEdit, VLogFileMeta};
use crate::vlog::{builder::VLogBuilder, vlog_file_path, State, ValueLog};
use crate::{ReadOptions, WriteOptions};

/// GC scheduling state, guarded by the value log's GC mutex and signalled
/// through its condvar.
pub(crate) struct GcShared {
	pub(crate) bg_running: bool,
	/// Sticky status of the last background run; `None` is OK.
	pub(crate) bg_error: Option<Error>,
	pub(crate) last_run: Instant,
	/// Pending manual request: start file number.
	pub(crate) manual: Option<u64>,
}

impl GcShared {
	pub(crate) fn new() -> Self {
		Self {
			bg_running: false,
			bg_error: None,
			last_run: Instant::now(),
			manual: None,
		}
	}

	fn fatal_error(&self) -> Option<&Error> {
		self.bg_error.as_ref().filter(|e| !e.is_non_fatal())
	}
}

/// One garbage-collection cycle over a single input file.
struct GcJob {
	number: u64,
	/// Live records staged for the rewrite, in file order.
	value_batch: crate::batch::ValueBatch,
	/// Pre-GC handle of each staged record, parallel to `value_batch`.
	expected: Vec<ValueHandle>,
	total_entries: u32,
	total_size: u32,
	discard_entries: u32,
	discard_size: u32,
}

impl GcJob {
	fn new(number: u64) -> Self {
		Self {
			number,
			value_batch: Default::default(),
			expected: Vec::new(),
			total_entries: 0,
			total_size: 0,
			discard_entries: 0,
			discard_size: 0,
		}
	}
}

/// Accepts the handle-rewrite batch only while the key still points at
/// the pre-GC record; a concurrent overwrite wins and the batch is
/// skipped.
struct GcWriteCallback {
	key: Vec<u8>,
	expected: ValueHandle,
}

impl WriteCallback for GcWriteCallback {
	fn check(&self, db: &dyn LsmEngine) -> Result<()> {
		let (kind, stored) = db.get(&ReadOptions::default(), &self.key)?;
		if kind != ValueKind::ValueHandle {
			return Err(Error::InvalidArgument("value no longer in vlog".into()));
		}
		if ValueHandle::decode(&stored)? != self.expected {
			return Err(Error::InvalidArgument("handle may be overwritten".into()));
		}
		Ok(())
	}

	fn allow_grouping(&self) -> bool {
		false
	}
}

impl ValueLog {
	/// Requests a GC cycle starting at `number` and schedules it.
	pub(crate) fn manual_gc(self: &Arc<Self>, number: u64) {
		self.gc_shared.lock().manual = Some(number);
		self.maybe_schedule_gc();
	}

	/// Starts the background job if one is due and none is running.
	/// Called after foreground writes and at the end of every GC run.
	pub(crate) fn maybe_schedule_gc(self: &Arc<Self>) {
		let mut shared = self.gc_shared.lock();
		if shared.bg_running {
			// only one GC job at a time
			return;
		}
		if self.shutdown.load(Ordering::Acquire) {
			return;
		}
		if let Some(e) = shared.fatal_error() {
			log::error!("GC disabled by background error: {e}");
			return;
		}
		let due = shared.manual.is_some()
			|| shared.last_run.elapsed().as_secs() >= self.options.blob_gc_interval;
		if !due {
			return;
		}

		shared.bg_running = true;
		drop(shared);

		let vlog = Arc::clone(self);
		let spawned = std::thread::Builder::new()
			.name("blobkv-gc".into())
			.spawn(move || vlog.bg_call());
		if let Err(e) = spawned {
			log::error!("failed to spawn GC thread: {e}");
			let mut shared = self.gc_shared.lock();
			shared.bg_running = false;
			shared.bg_error = Some(Error::from(e));
			self.gc_cv.notify_all();
		}
	}

	fn bg_call(self: Arc<Self>) {
		debug_assert!(self.gc_shared.lock().bg_running);
		if self.shutdown.load(Ordering::Acquire) {
			// shutting down, drop the job on the floor
		} else if let Some(e) = self.gc_shared.lock().fatal_error() {
			log::error!("fatal background error, GC stopped: {e}");
		} else {
			self.background_gc();
		}

		self.gc_shared.lock().bg_running = false;
		self.maybe_schedule_gc();
		self.gc_cv.notify_all();
	}

	/// Blocks until the pending GC cycle (if any) has finished.
	pub(crate) fn wait_vlog_gc(&self) {
		let mut shared = self.gc_shared.lock();
		while shared.bg_running
			|| (shared.manual.is_some() && shared.fatal_error().is_none())
		{
			self.gc_cv.wait(&mut shared);
		}
	}

	/// Sticky status of the last background run.
	pub(crate) fn bg_error(&self) -> Result<()> {
		match &self.gc_shared.lock().bg_error {
			Some(e) => Err(e.clone()),
			None => Ok(()),
		}
	}

	fn background_gc(&self) {
		let job = {
			let mut state = self.state.write();
			match self.gc_shared.lock().manual.take() {
				Some(number) => pick_gc(&state, number),
				None => {
					let picked = pick_gc(&state, state.gc_pointer);
					state.gc_pointer = match &picked {
						Some(job) => job.number + 1,
						None => {
							log::debug!("GC pick wrapped, restarting from 0");
							0
						}
					};
					picked
				}
			}
		};

		// One periodic attempt per interval, whatever its outcome.
		self.gc_shared.lock().last_run = Instant::now();

		let Some(mut job) = job else {
			self.record_bg_status(Err(Error::NonFatal("no eligible vlog file, skip".into())));
			return;
		};

		let status = self.collect(&mut job);
		if status.is_err() {
			self.record_bg_status(status);
			return;
		}

		sync_point::hit("GC.AfterCollect");

		let status = self.rewrite(&mut job);
		self.record_bg_status(status);
	}

	fn record_bg_status(&self, status: Result<()>) {
		match &status {
			Ok(()) => {}
			Err(e) if e.is_non_fatal() => log::info!("GC skipped: {e}"),
			Err(e) => log::error!("GC failed: {e}"),
		}
		self.gc_shared.lock().bg_error = status.err();
	}

	/// Scans the picked file off-lock, classifying every record as live
	/// (LSM still resolves the key to this exact handle) or discarded.
	fn collect(&self, job: &mut GcJob) -> Result<()> {
		log::info!("collecting live entries in vlog {}", job.number);

		let mut iter = {
			let state = self.state.read();
			if !state.version.ro_files.contains_key(&job.number) {
				return Err(Error::NonFatal(format!("invalid gc file number {}", job.number)));
			}
			self.file_iter(job.number)?
		};

		iter.seek_to_first()?;
		while iter.valid() {
			let record_handle = iter.handle();
			job.total_entries += 1;
			job.total_size += record_handle.size;

			let live = match self.lsm.get(&ReadOptions::default(), iter.key()) {
				Ok((ValueKind::ValueHandle, stored)) => {
					ValueHandle::decode(&stored).map_or(false, |h| h == record_handle)
				}
				Ok(_) => false,
				Err(Error::NotFound) => false,
				Err(e) => return Err(e),
			};

			if live {
				job.value_batch.put(iter.key().to_vec(), iter.value().to_vec());
				job.expected.push(record_handle);
			} else {
				job.discard_entries += 1;
				job.discard_size += record_handle.size;
			}

			iter.next()?;
		}
		Ok(())
	}

	/// Rewrites the survivors into a new file and re-points the LSM,
	/// marking the input obsolete at the end.
	///
	/// Crash consistency: a crash after the value rewrite leaves an
	/// untracked durable file which recovery re-attaches, while the input
	/// file survives; a crash after the LSM rewrite leaves both files
	/// live and the obsolescence is simply re-derived by a later cycle.
	fn rewrite(&self, job: &mut GcJob) -> Result<()> {
		if job.total_entries == 0 {
			return Err(Error::NonFatal(format!("vlog {} holds no records", job.number)));
		}

		let size_pct = job.discard_size as u64 * 100 / job.total_size as u64;
		let num_pct = job.discard_entries as u64 * 100 / job.total_entries as u64;
		log::info!(
			"[gc #{}] discard ratios: size {}/{} = {size_pct}%, entries {}/{} = {num_pct}%",
			job.number,
			job.discard_size,
			job.total_size,
			job.discard_entries,
			job.total_entries
		);

		if size_pct < self.options.blob_gc_size_discard_threshold as u64
			&& num_pct < self.options.blob_gc_num_discard_threshold as u64
		{
			return Err(Error::NonFatal("discarded entries/size below threshold".into()));
		}

		if job.discard_entries == job.total_entries {
			log::info!("[gc #{}] all entries discarded, removing the entire file", job.number);
			let mut edit = BlobVersionEdit::default();
			edit.delete_file(job.number, self.lsm.latest_sequence());
			let mut state = self.state.write();
			return self.log_and_apply(&mut state, edit);
		}

		let number = {
			let mut state = self.state.write();
			let number = state.version.new_file_number();
			state.pending_outputs.insert(number);
			number
		};
		log::info!("[gc #{}] rewriting {} live records to vlog {number}", job.number, job.expected.len());

		let status = self.rewrite_inner(job, number);

		let mut state = self.state.write();
		state.pending_outputs.remove(&number);
		status
	}

	fn rewrite_inner(&self, job: &mut GcJob, number: u64) -> Result<()> {
		// 1. Rewrite the live values; they were already durable in the old
		//    file, so the new copy must be durable before the LSM learns
		//    any new handle.
		let path = vlog_file_path(&self.dir, number);
		let mut builder = VLogBuilder::open(&path, number, 0, 0)?;
		job.value_batch.finalize(number, 0);
		builder.add_batch(&job.value_batch)?;
		builder.finish()?;

		let meta = VLogFileMeta {
			number,
			file_size: builder.file_size(),
			num_entries: builder.num_entries(),
		};
		drop(builder);

		{
			let mut state = self.state.write();
			state.version.ro_files.insert(number, meta);
		}

		if sync_point::hit("GC.Rewrite.AfterValueRewrite") {
			return Ok(());
		}

		// 2. Re-point the LSM, one guarded batch per key. A refused batch
		//    means the user overwrote the key mid-GC; their write wins and
		//    the staged record is abandoned.
		let write_options = WriteOptions {
			sync: false,
		};
		for ((key, _, new_handle), expected) in job.value_batch.iter().zip(job.expected.iter()) {
			if self.shutdown.load(Ordering::Acquire) {
				return Err(Error::ShuttingDown);
			}

			let mut batch = WriteBatch::new();
			batch.put_handle(key.to_vec(), &new_handle)?;
			let callback = GcWriteCallback {
				key: key.to_vec(),
				expected: *expected,
			};
			match self.lsm.write(&write_options, &batch, Some(&callback)) {
				Ok(()) => {}
				Err(Error::InvalidArgument(_)) | Err(Error::NotFound) => {}
				Err(e) => return Err(e),
			}
		}
		self.lsm.sync()?;

		if sync_point::hit("GC.Rewrite.AfterLSMRewrite") {
			return Ok(());
		}

		// 3. Mark the input obsolete; physical deletion waits for the
		//    snapshot gate.
		let obsolete_sequence = self.lsm.latest_sequence();
		let mut edit = BlobVersionEdit::default();
		edit.add_file(number, meta.file_size);
		edit.delete_file(job.number, obsolete_sequence);
		let mut state = self.state.write();
		self.log_and_apply(&mut state, edit)
	}
}

/// Picks the smallest read-only file number `>= number`, or nothing.
fn pick_gc(state: &State, number: u64) -> Option<GcJob> {
	state.version.ro_files.range(number..).next().map(|(n, _)| GcJob::new(*n))
}
