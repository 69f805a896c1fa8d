use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use fs2::FileExt;

use crate::error::{Error, Result};

/// LockFile prevents multiple processes from accessing the same database
/// directory.
///
/// OS-level file locking (via the `fs2` crate) ensures only one process
/// holds the lock at a time; the file content is the holder's PID, purely
/// informational. A crashed holder's lock is released by the OS, so stale
/// lock files never block a new process. The lock is released explicitly
/// by `release()` or implicitly when the handle drops.
pub(crate) struct LockFile {
	path: PathBuf,
	file: Option<File>,
}

impl LockFile {
	/// Lock file name used in database directories
	pub const LOCK_FILE_NAME: &'static str = "LOCK";

	pub(crate) fn new<P: AsRef<Path>>(dir: P) -> Self {
		Self {
			path: dir.as_ref().join(Self::LOCK_FILE_NAME),
			file: None,
		}
	}

	/// Acquires the lock, failing if the database is already in use.
	pub(crate) fn acquire(&mut self) -> Result<()> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(&self.path)?;

		file.try_lock_exclusive().map_err(|e| match e.kind() {
			ErrorKind::WouldBlock => Error::DatabaseLocked(format!(
				"{} is already locked by another process",
				self.path.display()
			)),
			_ => Error::Io(Arc::new(e)),
		})?;

		let mut file = file;
		let content = format!("{}\n", process::id());
		file.set_len(0)?;
		file.write_all(content.as_bytes())?;

		self.file = Some(file);
		Ok(())
	}

	pub(crate) fn release(&mut self) {
		// Closing the handle drops the OS lock.
		self.file.take();
	}
}

impl Drop for LockFile {
	fn drop(&mut self) {
		self.release();
	}
}
