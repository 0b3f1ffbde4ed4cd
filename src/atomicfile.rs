//! Atomic file writes via write-to-temp-then-rename
//!
//! Readers of a cache path see either the previous file or the new one,
//! never a half-written file. An `AtomicFile` that is dropped without
//! `commit()` removes its temporary file.

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::CacheError;

pub struct AtomicFile {
	tmp: Option<NamedTempFile>,
	path: PathBuf,
}

impl AtomicFile {
	/// Open a temporary file in the same directory as `path` so that the
	/// final rename stays on one filesystem
	pub fn new(path: &Path) -> Result<Self, CacheError> {
		let parent = path.parent().unwrap_or_else(|| Path::new("."));
		let tmp = NamedTempFile::new_in(parent)
			.map_err(|e| CacheError::io(format!("creating temporary file in {}", parent.display()), e))?;
		Ok(AtomicFile { tmp: Some(tmp), path: path.to_path_buf() })
	}

	pub fn write(&mut self, data: &[u8]) -> Result<(), CacheError> {
		let tmp = self.tmp.as_mut().expect("write after commit");
		tmp.as_file_mut()
			.write_all(data)
			.map_err(|e| CacheError::io(format!("writing {}", self.path.display()), e))
	}

	/// Flush and rename the temporary file onto the final path
	pub fn commit(mut self) -> Result<(), CacheError> {
		let tmp = self.tmp.take().expect("commit called twice");
		tmp.as_file().sync_data().ok();
		tmp.persist(&self.path)
			.map(|_| ())
			.map_err(|e| CacheError::io(format!("renaming into {}", self.path.display()), e.error))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::TempDir;

	#[test]
	fn test_commit_writes_file() {
		let dir = TempDir::new().unwrap();
		let target = dir.path().join("entry.R");

		let mut file = AtomicFile::new(&target).unwrap();
		file.write(b"first ").unwrap();
		file.write(b"second").unwrap();
		file.commit().unwrap();

		assert_eq!(fs::read(&target).unwrap(), b"first second");
	}

	#[test]
	fn test_drop_without_commit_leaves_nothing() {
		let dir = TempDir::new().unwrap();
		let target = dir.path().join("entry.R");
		{
			let mut file = AtomicFile::new(&target).unwrap();
			file.write(b"abandoned").unwrap();
		}
		assert!(!target.exists());
		assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
	}

	#[test]
	fn test_old_contents_visible_until_commit() {
		let dir = TempDir::new().unwrap();
		let target = dir.path().join("entry.R");
		fs::write(&target, b"old").unwrap();

		let mut file = AtomicFile::new(&target).unwrap();
		file.write(b"new").unwrap();
		assert_eq!(fs::read(&target).unwrap(), b"old");
		file.commit().unwrap();
		assert_eq!(fs::read(&target).unwrap(), b"new");
	}
}

// vim: ts=4
