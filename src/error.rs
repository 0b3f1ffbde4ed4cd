//! Error types for CachR operations

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Main error type for cache operations
///
/// The absence of a cached result is not an error; lookups express it as
/// `Option::None`. Every variant here maps to an outcome statistic at the
/// top boundary, and most of them fall through to "run the compiler
/// uncached". Only `Fatal` aborts the request.
#[derive(Debug)]
pub enum CacheError {
	/// The command cannot be cached (too-hard option, unknown compiler)
	Unsupported { reason: String },

	/// A filesystem operation failed unexpectedly
	Io { context: String, source: io::Error },

	/// A cache file failed its integrity check
	CorruptEntry { message: String },

	/// A lock could not be acquired within its deadline
	LockTimeout { path: PathBuf },

	/// A remote storage backend failed permanently
	RemoteFailed { message: String },

	/// A remote storage operation exceeded its deadline
	RemoteTimeout,

	/// Misconfiguration or an invariant violation; surfaced to the user
	Fatal { message: String },
}

impl CacheError {
	/// Wrap an I/O error with a short description of what was attempted
	pub fn io(context: impl Into<String>, source: io::Error) -> Self {
		CacheError::Io { context: context.into(), source }
	}

	/// Whether the error may be reported and then ignored (cache miss
	/// with fallback) rather than aborting the request
	pub fn is_recoverable(&self) -> bool {
		!matches!(self, CacheError::Fatal { .. })
	}
}

impl fmt::Display for CacheError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CacheError::Unsupported { reason } => {
				write!(f, "Not cacheable: {}", reason)
			}
			CacheError::Io { context, source } => {
				write!(f, "I/O error while {}: {}", context, source)
			}
			CacheError::CorruptEntry { message } => {
				write!(f, "Corrupt cache entry: {}", message)
			}
			CacheError::LockTimeout { path } => {
				write!(f, "Timed out waiting for lock: {}", path.display())
			}
			CacheError::RemoteFailed { message } => {
				write!(f, "Remote storage error: {}", message)
			}
			CacheError::RemoteTimeout => write!(f, "Remote storage timeout"),
			CacheError::Fatal { message } => write!(f, "{}", message),
		}
	}
}

impl Error for CacheError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			CacheError::Io { source, .. } => Some(source),
			_ => None,
		}
	}
}

impl From<io::Error> for CacheError {
	fn from(e: io::Error) -> Self {
		CacheError::Io { context: "accessing the cache".to_string(), source: e }
	}
}

impl From<String> for CacheError {
	fn from(message: String) -> Self {
		CacheError::Fatal { message }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_display_contains_context() {
		let err = CacheError::io(
			"writing result entry",
			io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
		);
		let text = err.to_string();
		assert!(text.contains("writing result entry"));
		assert!(text.contains("denied"));
	}

	#[test]
	fn test_fatal_is_not_recoverable() {
		assert!(!CacheError::Fatal { message: "bad config".into() }.is_recoverable());
		assert!(CacheError::RemoteTimeout.is_recoverable());
		assert!(CacheError::CorruptEntry { message: "checksum".into() }.is_recoverable());
	}
}

// vim: ts=4
