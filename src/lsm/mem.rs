use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::batch::WriteBatch;
use crate::error::Result;
use crate::lsm::{LsmEngine, LsmIterator, ValueKind, WriteCallback};
use crate::wal::{BufferedFileWriter, Reader, Writer, BLOCK_SIZE};
use crate::{Error, Key, ReadOptions, Value, WriteOptions};

const WAL_FILE_NAME: &str = "lsm.wal";

#[derive(Debug, Clone)]
struct VersionedValue {
	sequence: u64,
	kind: ValueKind,
	value: Value,
}

/// The bundled reference LSM engine: a WAL-backed memtable.
///
/// Every batch is framed into `lsm.wal` before being applied to an
/// in-memory map of per-key version chains; opening the engine replays
/// the log, so the contents survive restarts. Writers serialize on a
/// write-group mutex, which is also where conditional-write callbacks
/// run. There is no flushing to tables; the collaborator role and the
/// test suite do not need it.
pub struct MemLsm {
	/// Per-key version chains, newest last.
	map: RwLock<BTreeMap<Key, Vec<VersionedValue>>>,

	/// Write-group lock: serializes writers and callback evaluation.
	wal: Mutex<Writer>,
	wal_path: PathBuf,

	latest_seq: AtomicU64,

	/// Live snapshot sequences with registration counts.
	snapshots: Mutex<BTreeMap<u64, usize>>,
}

impl MemLsm {
	/// Opens the engine in `dir`, replaying any existing WAL.
	pub fn open(dir: &Path) -> Result<Self> {
		std::fs::create_dir_all(dir)?;
		let wal_path = dir.join(WAL_FILE_NAME);

		let mut map = BTreeMap::new();
		let mut latest_seq = 0u64;
		let mut resume_offset = 0u64;

		if wal_path.exists() {
			let mut reader = Reader::new(std::fs::File::open(&wal_path)?);
			while let Some(record) = reader.read_record()? {
				let (batch, starting_seq) = WriteBatch::decode(&record)?;
				latest_seq = latest_seq.max(apply_batch(&mut map, &batch, starting_seq));
			}
			resume_offset = reader.valid_offset();
		}

		// Drop any torn tail before appending behind it.
		let file =
			OpenOptions::new().create(true).read(true).append(true).open(&wal_path)?;
		if file.metadata()?.len() > resume_offset {
			file.set_len(resume_offset)?;
		}
		let writer = Writer::new(
			BufferedFileWriter::new(file, BLOCK_SIZE),
			(resume_offset % BLOCK_SIZE as u64) as usize,
		);

		log::info!(
			"lsm engine opened: {} keys, latest sequence {latest_seq}",
			map.len()
		);

		Ok(Self {
			map: RwLock::new(map),
			wal: Mutex::new(writer),
			wal_path,
			latest_seq: AtomicU64::new(latest_seq),
			snapshots: Mutex::new(BTreeMap::new()),
		})
	}

	pub fn wal_path(&self) -> &Path {
		&self.wal_path
	}
}

fn apply_batch(map: &mut BTreeMap<Key, Vec<VersionedValue>>, batch: &WriteBatch, seq: u64) -> u64 {
	let mut sequence = seq;
	for entry in &batch.entries {
		map.entry(entry.key.clone()).or_default().push(VersionedValue {
			sequence,
			kind: entry.kind,
			value: entry.value.clone(),
		});
		sequence += 1;
	}
	sequence.saturating_sub(1)
}

impl LsmEngine for MemLsm {
	fn write(
		&self,
		options: &WriteOptions,
		batch: &WriteBatch,
		callback: Option<&dyn WriteCallback>,
	) -> Result<()> {
		if batch.is_empty() {
			return Ok(());
		}

		let mut wal = self.wal.lock();

		// The callback runs under the write-group lock so no other writer
		// can slip in between the check and the apply.
		if let Some(cb) = callback {
			cb.check(self)?;
		}

		let starting_seq = self.latest_seq.load(Ordering::Acquire) + 1;
		wal.add_record(&batch.encode(starting_seq))?;
		if options.sync {
			wal.sync()?;
		}

		let highest = {
			let mut map = self.map.write();
			apply_batch(&mut map, batch, starting_seq)
		};
		self.latest_seq.store(highest, Ordering::Release);
		Ok(())
	}

	fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<(ValueKind, Value)> {
		let visible_through = options.snapshot.unwrap_or(u64::MAX);
		let map = self.map.read();
		let chain = map.get(key).ok_or(Error::NotFound)?;
		let newest = chain
			.iter()
			.rev()
			.find(|v| v.sequence <= visible_through)
			.ok_or(Error::NotFound)?;
		match newest.kind {
			ValueKind::Deletion => Err(Error::NotFound),
			kind => Ok((kind, newest.value.clone())),
		}
	}

	fn latest_sequence(&self) -> u64 {
		self.latest_seq.load(Ordering::Acquire)
	}

	fn oldest_live_snapshot(&self) -> u64 {
		let snapshots = self.snapshots.lock();
		snapshots.keys().next().copied().unwrap_or_else(|| self.latest_sequence())
	}

	fn get_snapshot(&self) -> u64 {
		let sequence = self.latest_sequence();
		*self.snapshots.lock().entry(sequence).or_insert(0) += 1;
		sequence
	}

	fn release_snapshot(&self, sequence: u64) {
		let mut snapshots = self.snapshots.lock();
		if let Some(count) = snapshots.get_mut(&sequence) {
			*count -= 1;
			if *count == 0 {
				snapshots.remove(&sequence);
			}
		}
	}

	fn sync(&self) -> Result<()> {
		self.wal.lock().sync()
	}

	fn iter(&self) -> Box<dyn LsmIterator> {
		let map = self.map.read();
		let mut entries = Vec::with_capacity(map.len());
		for (key, chain) in map.iter() {
			if let Some(newest) = chain.last() {
				if newest.kind != ValueKind::Deletion {
					entries.push((key.clone(), newest.kind, newest.value.clone()));
				}
			}
		}
		Box::new(MemIterator {
			entries: Arc::new(entries),
			pos: -1,
		})
	}

	fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
		let floor = self.oldest_live_snapshot();
		let mut map = self.map.write();

		let in_range = |key: &[u8]| {
			begin.map_or(true, |b| key >= b) && end.map_or(true, |e| key <= e)
		};

		let mut emptied = Vec::new();
		for (key, chain) in map.iter_mut() {
			if !in_range(key) {
				continue;
			}
			// Keep the newest version at or below the snapshot floor and
			// everything above it; older versions are unreachable.
			let keep_from = chain
				.iter()
				.rposition(|v| v.sequence <= floor)
				.unwrap_or(0);
			chain.drain(..keep_from);
			// A chain reduced to one settled tombstone can go entirely.
			if chain.len() == 1
				&& chain[0].kind == ValueKind::Deletion
				&& chain[0].sequence <= floor
			{
				emptied.push(key.clone());
			}
		}
		for key in emptied {
			map.remove(&key);
		}
		Ok(())
	}

	fn property(&self, name: &str) -> Option<String> {
		match name {
			"lsm.num-keys" => Some(self.map.read().len().to_string()),
			"lsm.latest-sequence" => Some(self.latest_sequence().to_string()),
			_ => None,
		}
	}

	fn approximate_size(&self, begin: &[u8], end: &[u8]) -> u64 {
		let map = self.map.read();
		map.range::<[u8], _>((Bound::Included(begin), Bound::Included(end)))
			.map(|(k, chain)| {
				let latest = chain.last().map_or(0, |v| v.value.len());
				(k.len() + latest) as u64
			})
			.sum()
	}

	fn close(&self) -> Result<()> {
		self.wal.lock().close()
	}
}

/// Cursor over a consistent view materialized at creation time.
struct MemIterator {
	entries: Arc<Vec<(Key, ValueKind, Value)>>,
	pos: isize,
}

impl MemIterator {
	fn len(&self) -> isize {
		self.entries.len() as isize
	}

	fn entry(&self) -> &(Key, ValueKind, Value) {
		&self.entries[self.pos as usize]
	}
}

impl LsmIterator for MemIterator {
	fn seek_to_first(&mut self) {
		self.pos = if self.entries.is_empty() { -1 } else { 0 };
	}

	fn seek_to_last(&mut self) {
		self.pos = self.len() - 1;
	}

	fn seek(&mut self, key: &[u8]) {
		let idx = self.entries.partition_point(|(k, _, _)| k.as_slice() < key);
		self.pos = if idx == self.entries.len() { self.len() } else { idx as isize };
	}

	fn next(&mut self) {
		debug_assert!(self.valid());
		self.pos += 1;
	}

	fn prev(&mut self) {
		debug_assert!(self.valid());
		self.pos -= 1;
	}

	fn valid(&self) -> bool {
		self.pos >= 0 && self.pos < self.len()
	}

	fn key(&self) -> &[u8] {
		&self.entry().0
	}

	fn kind(&self) -> ValueKind {
		self.entry().1
	}

	fn value(&self) -> &[u8] {
		&self.entry().2
	}

	fn boxed_clone(&self) -> Box<dyn LsmIterator> {
		Box::new(MemIterator {
			entries: self.entries.clone(),
			pos: self.pos,
		})
	}
}
