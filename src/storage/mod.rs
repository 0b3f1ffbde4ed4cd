//! Two-tier storage: the local content-addressed cache plus optional
//! remote backends
//!
//! The framework policy lives here: local entries are verified before use
//! and evicted when corrupt, remote hits are written through to the local
//! tier, and local writes are mirrored to writable remote backends when the
//! entry is self-contained.

pub mod local;
pub mod remote;

use crate::compress::CompressionType;
use crate::config::Config;
use crate::entry::{self, EntryType, Header};
use crate::error::CacheError;
use crate::hash::Digest;
use crate::logging::*;
use crate::stats::Statistic;

pub use local::LocalStorage;
pub use remote::{RemoteEvents, RemoteStorage};

pub struct Storage {
	pub local: LocalStorage,
	remote: Option<RemoteStorage>,
	compression_type: CompressionType,
	compression_level: i8,
	namespace: String,
}

impl Storage {
	pub fn new(config: &Config) -> Result<Self, CacheError> {
		Ok(Storage {
			local: LocalStorage::new(config)?,
			remote: RemoteStorage::from_config(config)?,
			compression_type: config.compression_type(),
			compression_level: config.compression_level,
			namespace: config.namespace.clone(),
		})
	}

	pub fn has_remote(&self) -> bool {
		self.remote.is_some()
	}

	/// Fetch and verify the entry stored under `key`.
	///
	/// A local entry that fails verification is removed and the lookup
	/// falls through to the remote tier; a remote hit is verified and then
	/// written through to the local cache. All failure modes count as a
	/// miss here - the caller only distinguishes hit from miss.
	pub async fn get(
		&self,
		key: &Digest,
		entry_type: EntryType,
	) -> Result<Option<(Header, Vec<u8>)>, CacheError> {
		match self.local.get(key, entry_type)? {
			Some(bytes) => match self.verify(key, entry_type, &bytes) {
				Some(parsed) => {
					self.local.update_stats_for_key(key, |c| {
						c.increment(Statistic::LocalStorageReadHit, 1);
					})?;
					return Ok(Some(parsed));
				}
				None => {
					warn!("removing corrupt {} entry {}", entry_type.suffix(), key);
					self.local.remove(key, entry_type)?;
					self.local.update_stats_for_key(key, |c| {
						c.increment(Statistic::CacheMissDueToCorruption, 1);
					})?;
				}
			},
			None => {
				self.local.update_stats_for_key(key, |c| {
					c.increment(Statistic::LocalStorageReadMiss, 1);
				})?;
			}
		}

		let remote = match &self.remote {
			Some(remote) => remote,
			None => return Ok(None),
		};
		let (value, events) = remote.get(key).await;
		self.record_remote_events(key, events)?;
		match value {
			Some(bytes) => match self.verify(key, entry_type, &bytes) {
				Some(parsed) => {
					self.local.update_stats_for_key(key, |c| {
						c.increment(Statistic::RemoteStorageReadHit, 1);
					})?;
					// Write through so the next lookup is local.
					self.local.put(key, entry_type, &bytes)?;
					Ok(Some(parsed))
				}
				None => {
					warn!("remote entry {} failed verification; ignoring", key);
					Ok(None)
				}
			},
			None => {
				self.local.update_stats_for_key(key, |c| {
					c.increment(Statistic::RemoteStorageReadMiss, 1);
				})?;
				Ok(None)
			}
		}
	}

	/// Serialize `payload` under `key` into the local cache and, when
	/// `share_remote` says the entry is self-contained, mirror it to the
	/// writable remote backends
	pub async fn put(
		&self,
		key: &Digest,
		entry_type: EntryType,
		payload: &[u8],
		share_remote: bool,
	) -> Result<(), CacheError> {
		let bytes = entry::serialize(
			payload,
			entry_type,
			self.compression_type,
			self.compression_level,
			&self.namespace,
		)?;
		self.local.put(key, entry_type, &bytes)?;

		if share_remote {
			if let Some(remote) = &self.remote {
				let events = remote.put(key, &bytes).await;
				self.record_remote_events(key, events)?;
				self.local.update_stats_for_key(key, |c| {
					c.increment(Statistic::RemoteStorageWrite, 1);
				})?;
			}
		}
		Ok(())
	}

	fn verify(
		&self,
		key: &Digest,
		entry_type: EntryType,
		bytes: &[u8],
	) -> Option<(Header, Vec<u8>)> {
		match entry::read(bytes) {
			Ok((header, payload)) if header.entry_type == entry_type => Some((header, payload)),
			Ok((header, _)) => {
				warn!(
					"entry {} has type {:?} instead of {:?}",
					key, header.entry_type, entry_type
				);
				None
			}
			Err(e) => {
				debug!("entry {} failed verification: {}", key, e);
				None
			}
		}
	}

	fn record_remote_events(&self, key: &Digest, events: RemoteEvents) -> Result<(), CacheError> {
		if events.errors == 0 && events.timeouts == 0 {
			return Ok(());
		}
		self.local.update_stats_for_key(key, |c| {
			c.increment(Statistic::RemoteStorageError, events.errors as i64);
			c.increment(Statistic::RemoteStorageTimeout, events.timeouts as i64);
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hash::digest_of;
	use std::fs;
	use tempfile::TempDir;

	fn test_config(dir: &TempDir) -> Config {
		Config { cache_dir: dir.path().join("cache"), ..Config::default() }
	}

	#[tokio::test]
	async fn test_put_get_verifies_roundtrip() {
		let dir = TempDir::new().unwrap();
		let storage = Storage::new(&test_config(&dir)).unwrap();
		let key = digest_of(b"k");

		assert!(storage.get(&key, EntryType::Result).await.unwrap().is_none());
		storage.put(&key, EntryType::Result, b"payload", true).await.unwrap();

		let (header, payload) = storage.get(&key, EntryType::Result).await.unwrap().unwrap();
		assert_eq!(payload, b"payload");
		assert_eq!(header.entry_type, EntryType::Result);
	}

	#[tokio::test]
	async fn test_type_confusion_is_a_miss() {
		let dir = TempDir::new().unwrap();
		let storage = Storage::new(&test_config(&dir)).unwrap();
		let key = digest_of(b"k");

		storage.put(&key, EntryType::Result, b"payload", false).await.unwrap();
		// Copy the result bytes over the manifest path for the same key.
		let result_path = storage.local.entry_path(&key, EntryType::Result);
		let manifest_path = storage.local.entry_path(&key, EntryType::Manifest);
		fs::copy(&result_path, &manifest_path).unwrap();

		assert!(storage.get(&key, EntryType::Manifest).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_corrupt_local_entry_removed_and_counted() {
		let dir = TempDir::new().unwrap();
		let storage = Storage::new(&test_config(&dir)).unwrap();
		let key = digest_of(b"k");

		storage.put(&key, EntryType::Result, b"payload", false).await.unwrap();
		let path = storage.local.entry_path(&key, EntryType::Result);
		let mut bytes = fs::read(&path).unwrap();
		let middle = bytes.len() / 2;
		bytes[middle] ^= 0xff;
		fs::write(&path, &bytes).unwrap();

		assert!(storage.get(&key, EntryType::Result).await.unwrap().is_none());
		assert!(!path.exists());
		assert!(storage.get(&key, EntryType::Result).await.unwrap().is_none());

		let counters = storage.local.read_all_statistics();
		assert_eq!(counters.get(Statistic::CacheMissDueToCorruption), 1);
	}
}

// vim: ts=4
