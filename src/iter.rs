use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::lsm::{LsmIterator, ValueKind};
use crate::vlog::format::ValueHandle;
use crate::vlog::ValueLog;
use crate::ReadOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
	Forward,
	Reverse,
}

/// Key-ordered iterator over the whole store.
///
/// Wraps an LSM iterator and resolves value handles on positioning. With
/// `ReadOptions::blob_prefetch` a small worker pool resolves handles for
/// forthcoming positions into a bounded buffer keyed by handle, hiding
/// vlog read latency; a direction reversal drains the window. The yielded
/// `(key, value)` sequence is identical with and without prefetch.
pub struct DbIterator {
	lsm_iter: Box<dyn LsmIterator>,
	vlog: Arc<ValueLog>,
	options: ReadOptions,
	direction: Direction,
	current_value: Option<Vec<u8>>,
	status: Option<Error>,
	prefetcher: Option<Prefetcher>,
}

impl DbIterator {
	pub(crate) fn new(
		lsm_iter: Box<dyn LsmIterator>,
		vlog: Arc<ValueLog>,
		options: ReadOptions,
	) -> Self {
		let prefetcher = if options.blob_prefetch {
			let threads = vlog.options.blob_background_read_threads;
			Some(Prefetcher::start(vlog.clone(), &options, threads))
		} else {
			None
		};
		Self {
			lsm_iter,
			vlog,
			options,
			direction: Direction::Forward,
			current_value: None,
			status: None,
			prefetcher,
		}
	}

	pub fn seek_to_first(&mut self) {
		self.direction = Direction::Forward;
		self.lsm_iter.seek_to_first();
		self.reposition();
	}

	pub fn seek_to_last(&mut self) {
		self.direction = Direction::Reverse;
		self.lsm_iter.seek_to_last();
		self.reposition();
	}

	pub fn seek(&mut self, key: &[u8]) {
		self.direction = Direction::Forward;
		self.lsm_iter.seek(key);
		self.reposition();
	}

	pub fn next(&mut self) {
		debug_assert!(self.valid());
		if self.direction != Direction::Forward {
			self.direction = Direction::Forward;
			self.drain_prefetch();
		}
		self.lsm_iter.next();
		self.advance_current();
	}

	pub fn prev(&mut self) {
		debug_assert!(self.valid());
		if self.direction != Direction::Reverse {
			self.direction = Direction::Reverse;
			self.drain_prefetch();
		}
		self.lsm_iter.prev();
		self.advance_current();
	}

	pub fn valid(&self) -> bool {
		self.status.is_none() && self.lsm_iter.valid()
	}

	pub fn key(&self) -> &[u8] {
		debug_assert!(self.valid());
		self.lsm_iter.key()
	}

	pub fn value(&self) -> &[u8] {
		debug_assert!(self.valid());
		self.current_value.as_deref().unwrap_or_default()
	}

	/// First error hit while resolving a handle, if any; once set the
	/// iterator reports invalid.
	pub fn status(&self) -> Result<()> {
		match &self.status {
			Some(e) => Err(e.clone()),
			None => Ok(()),
		}
	}

	/// A seek moved the cursor arbitrarily: restart the prefetch window
	/// there, then resolve.
	fn reposition(&mut self) {
		self.drain_prefetch();
		self.advance_current();
	}

	fn drain_prefetch(&mut self) {
		if let Some(p) = self.prefetcher.as_mut() {
			p.drain();
		}
	}

	/// Resolves the record under the cursor and tops the window up.
	fn advance_current(&mut self) {
		self.current_value = None;
		if !self.lsm_iter.valid() {
			return;
		}

		let resolved = match self.lsm_iter.kind() {
			ValueKind::Value => Ok(self.lsm_iter.value().to_vec()),
			ValueKind::ValueHandle => self.resolve_handle(),
			ValueKind::Deletion => Err(Error::Corruption(
				"tombstone surfaced by LSM iterator".into(),
			)),
		};

		match resolved {
			Ok(value) => self.current_value = Some(value),
			Err(e) => self.status = Some(e),
		}

		if let Some(p) = self.prefetcher.as_mut() {
			p.top_up(self.lsm_iter.as_ref(), self.direction);
		}
	}

	fn resolve_handle(&mut self) -> Result<Vec<u8>> {
		let handle = ValueHandle::decode(self.lsm_iter.value())?;
		if let Some(p) = self.prefetcher.as_mut() {
			if let Some(result) = p.take(&handle) {
				return result;
			}
		}
		self.vlog.get(&self.options, &handle)
	}
}

/// Shared prefetch state. `wanted` is the set of handles submitted and
/// not yet consumed; workers only deliver results for handles still in
/// it, so `values` never holds more than the window. The generation
/// stamps let workers discard jobs submitted before the last direction
/// change.
struct ResultBuffer {
	generation: u64,
	values: HashMap<ValueHandle, Result<Vec<u8>>>,
	wanted: HashSet<ValueHandle>,
}

/// Bounded producer/consumer read-ahead over a scout cursor running in
/// front of the iterator.
struct Prefetcher {
	job_tx: Option<Sender<(u64, ValueHandle)>>,
	workers: Vec<JoinHandle<()>>,
	results: Arc<Mutex<ResultBuffer>>,
	/// Scout cursor, positioned up to `window` handles ahead.
	scout: Option<Box<dyn LsmIterator>>,
	window: usize,
}

impl Prefetcher {
	fn start(vlog: Arc<ValueLog>, options: &ReadOptions, threads: usize) -> Self {
		let threads = threads.max(1);
		let window = (threads * 4).max(8);
		let (job_tx, job_rx) = crossbeam_channel::unbounded::<(u64, ValueHandle)>();
		let results = Arc::new(Mutex::new(ResultBuffer {
			generation: 0,
			values: HashMap::new(),
			wanted: HashSet::new(),
		}));

		let mut workers = Vec::with_capacity(threads);
		for _ in 0..threads {
			let rx: Receiver<(u64, ValueHandle)> = job_rx.clone();
			let vlog = vlog.clone();
			let results = results.clone();
			let read_options = ReadOptions {
				snapshot: options.snapshot,
				blob_prefetch: false,
			};
			workers.push(std::thread::spawn(move || {
				while let Ok((generation, handle)) = rx.recv() {
					let value = vlog.get(&read_options, &handle);
					let mut buffer = results.lock();
					// Drop results nobody will ask for: stale generation,
					// or a handle the cursor already resolved directly.
					if buffer.generation == generation && buffer.wanted.contains(&handle) {
						buffer.values.insert(handle, value);
					}
				}
			}));
		}

		Self {
			job_tx: Some(job_tx),
			workers,
			results,
			scout: None,
			window,
		}
	}

	/// Consumes a prefetched result; `None` means not requested yet or
	/// still in flight, and the caller reads directly. Either way the
	/// handle leaves the wanted set, so an in-flight worker discards its
	/// result instead of parking it in the buffer forever.
	fn take(&mut self, handle: &ValueHandle) -> Option<Result<Vec<u8>>> {
		let mut buffer = self.results.lock();
		buffer.wanted.remove(handle);
		buffer.values.remove(handle)
	}

	/// Walks the scout ahead of `cursor` and submits upcoming handles
	/// until the window is full or the keyspace ends.
	fn top_up(&mut self, cursor: &dyn LsmIterator, direction: Direction) {
		if self.scout.is_none() {
			self.scout = Some(cursor.boxed_clone());
		}

		loop {
			if self.results.lock().wanted.len() >= self.window {
				break;
			}
			let Some(scout) = self.scout.as_mut() else {
				break;
			};
			if !scout.valid() {
				break;
			}
			match direction {
				Direction::Forward => scout.next(),
				Direction::Reverse => scout.prev(),
			}
			if !scout.valid() {
				break;
			}
			if scout.kind() != ValueKind::ValueHandle {
				continue;
			}
			let Ok(handle) = ValueHandle::decode(scout.value()) else {
				// The main cursor will surface the decoding error itself.
				continue;
			};
			let generation = {
				let mut buffer = self.results.lock();
				if !buffer.wanted.insert(handle) {
					continue;
				}
				buffer.generation
			};
			if let Some(tx) = &self.job_tx {
				let _ = tx.send((generation, handle));
			}
		}
	}

	/// Direction change or seek: discard the window and outstanding jobs.
	fn drain(&mut self) {
		let mut buffer = self.results.lock();
		buffer.generation += 1;
		buffer.values.clear();
		buffer.wanted.clear();
		drop(buffer);
		self.scout = None;
	}
}

impl Drop for Prefetcher {
	fn drop(&mut self) {
		// Closing the channel stops the workers.
		self.job_tx.take();
		for worker in self.workers.drain(..) {
			let _ = worker.join();
		}
	}
}
