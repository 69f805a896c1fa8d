use std::{fmt, io, sync::Arc};

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// `Error` covers every failure the store can surface, from filesystem
/// problems to data corruption and soft garbage-collection outcomes.
///
/// The enum is `Clone` so a background error can be recorded once and
/// handed back to every caller of [`vlog_bg_error`](crate::db::BlobDb::vlog_bg_error).
#[derive(Clone, Debug)]
pub enum Error {
	Io(Arc<io::Error>),
	/// A vlog record or manifest record failed structural validation.
	Corruption(String),
	/// The key (or the vlog file a handle points into) does not exist.
	NotFound,
	InvalidArgument(String),
	/// A soft garbage-collection outcome: nothing to pick, thresholds not
	/// met, or an invalid manual file number. Never fatal; future GC runs
	/// are still allowed.
	NonFatal(String),
	/// The value log is shutting down; background work was aborted.
	ShuttingDown,
	/// Another process holds the database LOCK file.
	DatabaseLocked(String),
	InvalidBatchRecord,
	BatchTooLarge,
	EmptyKey,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Io(err) => write!(f, "IO error: {err}"),
			Error::Corruption(msg) => write!(f, "Corruption: {msg}"),
			Error::NotFound => write!(f, "Key not found"),
			Error::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
			Error::NonFatal(msg) => write!(f, "Non-fatal: {msg}"),
			Error::ShuttingDown => write!(f, "Shutting down"),
			Error::DatabaseLocked(msg) => write!(f, "Database locked: {msg}"),
			Error::InvalidBatchRecord => write!(f, "Invalid batch record"),
			Error::BatchTooLarge => write!(f, "Batch too large"),
			Error::EmptyKey => write!(f, "Empty key"),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Io(err) => Some(err.as_ref()),
			_ => None,
		}
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		Error::Io(Arc::new(e))
	}
}

impl Error {
	pub fn is_not_found(&self) -> bool {
		matches!(self, Error::NotFound)
	}

	pub fn is_corruption(&self) -> bool {
		matches!(self, Error::Corruption(_))
	}

	pub fn is_non_fatal(&self) -> bool {
		matches!(self, Error::NonFatal(_))
	}

	pub fn is_io(&self) -> bool {
		matches!(self, Error::Io(_))
	}
}
