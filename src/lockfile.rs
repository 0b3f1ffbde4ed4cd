//! Advisory file locks with stale-holder detection
//!
//! A lock on `path` is represented by a symlink `path.lock` whose target
//! encodes the owner (hostname, pid, random tag) and a sibling regular file
//! `path.alive` whose mtime is the owner's heartbeat. Short-lived locks are
//! held across a small critical section; long-lived locks hand their
//! heartbeat to a manager thread that refreshes the alive marker until
//! release. On Windows the lock is a regular file created with
//! exclusive-create semantics.
//!
//! A holder whose alive marker goes silent past the staleness threshold is
//! presumed dead and its lock is broken by the next acquirer. A blocking
//! acquire that exhausts its deadline reports not-acquired; it never kills
//! a live holder.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use uuid::Uuid;

use crate::error::CacheError;
use crate::logging::*;
use crate::util;

pub const DEFAULT_STALENESS: Duration = Duration::from_secs(10);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(500);
const MIN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

struct ManagerState {
	alive_files: Vec<PathBuf>,
	stop: bool,
}

struct ManagerShared {
	state: Mutex<ManagerState>,
	wakeup: Condvar,
}

/// Refreshes the alive markers of registered long-lived locks from a
/// background thread until dropped
pub struct LongLivedLockFileManager {
	shared: Arc<ManagerShared>,
	thread: Option<thread::JoinHandle<()>>,
}

impl LongLivedLockFileManager {
	pub fn new() -> Self {
		let shared = Arc::new(ManagerShared {
			state: Mutex::new(ManagerState { alive_files: Vec::new(), stop: false }),
			wakeup: Condvar::new(),
		});
		let thread_shared = Arc::clone(&shared);
		let thread = thread::Builder::new()
			.name("lock-heartbeat".to_string())
			.spawn(move || heartbeat_loop(thread_shared))
			.ok();
		LongLivedLockFileManager { shared, thread }
	}

	fn register(&self, alive_path: &Path) {
		let mut state = self.shared.state.lock().unwrap();
		if !state.alive_files.iter().any(|p| p == alive_path) {
			state.alive_files.push(alive_path.to_path_buf());
		}
		self.shared.wakeup.notify_all();
	}

	fn unregister(&self, alive_path: &Path) {
		let mut state = self.shared.state.lock().unwrap();
		state.alive_files.retain(|p| p != alive_path);
	}
}

impl Default for LongLivedLockFileManager {
	fn default() -> Self {
		LongLivedLockFileManager::new()
	}
}

impl Drop for LongLivedLockFileManager {
	fn drop(&mut self) {
		{
			let mut state = self.shared.state.lock().unwrap();
			state.stop = true;
		}
		self.shared.wakeup.notify_all();
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

fn heartbeat_loop(shared: Arc<ManagerShared>) {
	let mut state = shared.state.lock().unwrap();
	loop {
		if state.stop {
			return;
		}
		for path in &state.alive_files {
			let _ = filetime::set_file_mtime(path, filetime::FileTime::now());
		}
		let (next, _) = shared.wakeup.wait_timeout(state, KEEP_ALIVE_INTERVAL).unwrap();
		state = next;
	}
}

/// Mutual exclusion on a named resource
pub struct LockFile<'m> {
	lock_path: PathBuf,
	alive_path: PathBuf,
	staleness: Duration,
	timeout: Duration,
	acquired: bool,
	manager: Option<&'m LongLivedLockFileManager>,
}

impl<'m> LockFile<'m> {
	/// Create an unacquired lock for `path`; the lock artifacts live at
	/// `path.lock` and `path.alive`
	pub fn new(path: &Path) -> Self {
		LockFile {
			lock_path: extend_path(path, ".lock"),
			alive_path: extend_path(path, ".alive"),
			staleness: DEFAULT_STALENESS,
			timeout: DEFAULT_TIMEOUT,
			acquired: false,
			manager: None,
		}
	}

	pub fn with_staleness(mut self, staleness: Duration) -> Self {
		self.staleness = staleness;
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	/// Hand heartbeat refresh to `manager`, keeping the lock alive for the
	/// whole process lifetime
	pub fn make_long_lived(&mut self, manager: &'m LongLivedLockFileManager) {
		self.manager = Some(manager);
		if self.acquired {
			manager.register(&self.alive_path);
		}
	}

	pub fn acquired(&self) -> bool {
		self.acquired
	}

	/// Acquire the lock, sleeping with exponential backoff while another
	/// live process holds it. Returns false when the deadline passes.
	pub fn acquire(&mut self) -> Result<bool, CacheError> {
		self.do_acquire(true)
	}

	/// Acquire the lock without blocking on a live holder
	pub fn try_acquire(&mut self) -> Result<bool, CacheError> {
		self.do_acquire(false)
	}

	/// Release the lock. Idempotent; also called on drop.
	pub fn release(&mut self) {
		if !self.acquired {
			return;
		}
		if let Some(manager) = self.manager {
			manager.unregister(&self.alive_path);
		}
		let _ = fs::remove_file(&self.alive_path);
		let _ = fs::remove_file(&self.lock_path);
		self.acquired = false;
	}

	fn do_acquire(&mut self, blocking: bool) -> Result<bool, CacheError> {
		if self.acquired {
			return Ok(true);
		}
		if let Some(parent) = self.lock_path.parent() {
			if !parent.as_os_str().is_empty() {
				fs::create_dir_all(parent)
					.map_err(|e| CacheError::io(format!("creating {}", parent.display()), e))?;
			}
		}

		let owner = format!(
			"{}:{}:{}",
			util::hostname(),
			std::process::id(),
			Uuid::new_v4().simple()
		);
		let deadline = Instant::now() + self.timeout;
		let mut backoff = MIN_BACKOFF;
		let mut broke_stale = false;

		loop {
			if self.probe(&owner)? {
				let _ = fs::write(&self.alive_path, b"");
				if let Some(manager) = self.manager {
					manager.register(&self.alive_path);
				}
				self.acquired = true;
				trace!("acquired lock {}", self.lock_path.display());
				return Ok(true);
			}

			match self.holder_is_stale() {
				None => continue, // lock vanished between probe and stat
				Some(true) if !broke_stale => {
					info!("breaking stale lock {}", self.lock_path.display());
					let _ = fs::remove_file(&self.alive_path);
					let _ = fs::remove_file(&self.lock_path);
					broke_stale = true;
					continue;
				}
				_ => {}
			}

			if !blocking || Instant::now() >= deadline {
				return Ok(false);
			}
			let remaining = deadline.saturating_duration_since(Instant::now());
			thread::sleep(backoff.min(remaining));
			backoff = (backoff * 2).min(MAX_BACKOFF);
		}
	}

	/// One attempt at creating the lock artifact. Returns whether we now
	/// hold the lock.
	#[cfg(unix)]
	fn probe(&self, owner: &str) -> Result<bool, CacheError> {
		match std::os::unix::fs::symlink(owner, &self.lock_path) {
			Ok(()) => Ok(true),
			Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
			Err(e) => {
				Err(CacheError::io(format!("creating lock {}", self.lock_path.display()), e))
			}
		}
	}

	#[cfg(windows)]
	fn probe(&self, owner: &str) -> Result<bool, CacheError> {
		use std::io::Write;
		match fs::OpenOptions::new().write(true).create_new(true).open(&self.lock_path) {
			Ok(mut file) => {
				let _ = file.write_all(owner.as_bytes());
				Ok(true)
			}
			Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
			Err(e) => {
				Err(CacheError::io(format!("creating lock {}", self.lock_path.display()), e))
			}
		}
	}

	/// Whether the current holder's heartbeat has gone silent. `None`
	/// means the lock disappeared and the caller should retry at once.
	fn holder_is_stale(&self) -> Option<bool> {
		let heartbeat = fs::metadata(&self.alive_path)
			.and_then(|m| m.modified())
			.or_else(|_| fs::symlink_metadata(&self.lock_path).and_then(|m| m.modified()));
		match heartbeat {
			Ok(timestamp) => {
				let age = SystemTime::now()
					.duration_since(timestamp)
					.unwrap_or_else(|_| Duration::from_secs(0));
				Some(age > self.staleness)
			}
			Err(_) => None,
		}
	}
}

impl<'m> Drop for LockFile<'m> {
	fn drop(&mut self) {
		self.release();
	}
}

fn extend_path(path: &Path, suffix: &str) -> PathBuf {
	let mut name = path.as_os_str().to_os_string();
	name.push(suffix);
	PathBuf::from(name)
}


// vim: ts=4
