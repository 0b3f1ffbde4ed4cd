//! Remote (second-tier) storage behind a uniform key/value interface
//!
//! Backends implement a narrow async get/put/remove contract. The
//! framework layer parses backend URLs, recognizes the shared attributes
//! (`read-only`, `shards`, `timeout`), applies deadlines, spreads keys over
//! shard instances with rendezvous hashing, and handles failures: a
//! timeout is logged and treated as a miss for that request, a permanent
//! error disables the backend for the remainder of the process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::Config;
use crate::error::CacheError;
use crate::hash::Digest;
use crate::logging::*;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);
const MIN_TIMEOUT_MS: u64 = 1;
const MAX_TIMEOUT_MS: u64 = 60_000;

/// Failure modes a backend can report
#[derive(Debug)]
pub enum BackendError {
	/// Operation error, e.g. failed connection or authentication
	Failed(String),
	/// Timeout, e.g. due to slow network or server
	Timeout,
}

/// The API a remote storage backend must implement
#[async_trait]
pub trait RemoteStorageBackend: Send + Sync {
	/// Get the value associated with `key`; absence is `Ok(None)`
	async fn get(&self, key: &Digest) -> Result<Option<Vec<u8>>, BackendError>;

	/// Store `value` under `key`. A true `only_if_missing` is a hint that
	/// the value does not have to be written if already present. Returns
	/// whether the entry was actually stored.
	async fn put(
		&self,
		key: &Digest,
		value: &[u8],
		only_if_missing: bool,
	) -> Result<bool, BackendError>;

	/// Remove `key`; returns whether an entry was removed
	async fn remove(&self, key: &Digest) -> Result<bool, BackendError>;
}

/// Framework attributes recognized on any backend URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
	pub read_only: bool,
	pub timeout: Duration,
	pub shards: Vec<String>,
}

impl Default for Attributes {
	fn default() -> Self {
		Attributes { read_only: false, timeout: DEFAULT_TIMEOUT, shards: Vec::new() }
	}
}

/// A backend URL split into scheme, location and attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
	pub scheme: String,
	pub location: String,
	pub attributes: Attributes,
}

/// Parse `scheme://location?attr=val&attr=val`
pub fn parse_url(url: &str) -> Result<RemoteUrl, CacheError> {
	let (scheme, remainder) = url.split_at(url.find("://").ok_or_else(|| CacheError::Fatal {
		message: format!("remote storage URL without scheme: {}", url),
	})?);
	let remainder = &remainder[3..];

	let (location, query) = match remainder.find('?') {
		Some(position) => (&remainder[..position], &remainder[position + 1..]),
		None => (remainder, ""),
	};

	let mut attributes = Attributes::default();
	for pair in query.split('&').filter(|p| !p.is_empty()) {
		let (name, value) = match pair.find('=') {
			Some(position) => (&pair[..position], &pair[position + 1..]),
			None => (pair, ""),
		};
		match name {
			"read-only" => attributes.read_only = value == "true",
			"shards" => {
				attributes.shards =
					value.split(',').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect()
			}
			"timeout" => {
				let ms = value.parse::<u64>().map_err(|_| CacheError::Fatal {
					message: format!("invalid timeout attribute: {}", value),
				})?;
				attributes.timeout =
					Duration::from_millis(ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS));
			}
			other => {
				debug!("ignoring unknown remote storage attribute {}", other);
			}
		}
	}

	Ok(RemoteUrl {
		scheme: scheme.to_string(),
		location: location.to_string(),
		attributes,
	})
}

struct ShardInstance {
	name: String,
	backend: Box<dyn RemoteStorageBackend>,
}

/// One configured backend: its shard instances plus framework state
pub struct RemoteBackendEntry {
	url: String,
	attributes: Attributes,
	instances: Vec<ShardInstance>,
	disabled: AtomicBool,
}

impl RemoteBackendEntry {
	/// Build an entry from already-constructed shard instances; used by
	/// tests and exotic backends
	pub fn from_instances(
		url: String,
		attributes: Attributes,
		instances: Vec<(String, Box<dyn RemoteStorageBackend>)>,
	) -> Self {
		RemoteBackendEntry {
			url,
			attributes,
			instances: instances
				.into_iter()
				.map(|(name, backend)| ShardInstance { name, backend })
				.collect(),
			disabled: AtomicBool::new(false),
		}
	}

	/// Rendezvous hashing: every (shard, key) pair gets a score and the
	/// best shard wins, so adding or removing one shard only moves the
	/// keys of that shard
	fn select_instance(&self, key: &Digest) -> &ShardInstance {
		self.instances
			.iter()
			.max_by_key(|instance| {
				let mut seed = instance.name.clone().into_bytes();
				seed.extend_from_slice(key.as_bytes());
				xxh3_64(&seed)
			})
			.expect("backend entries always have at least one instance")
	}

	fn disable(&self) {
		if !self.disabled.swap(true, Ordering::Relaxed) {
			warn!("disabling remote storage {} for the rest of the process", self.url);
		}
	}

	fn usable(&self) -> bool {
		!self.disabled.load(Ordering::Relaxed)
	}
}

/// Counts of failure events observed during one framework operation,
/// reported to the caller for statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemoteEvents {
	pub errors: u32,
	pub timeouts: u32,
}

/// The framework layer over all configured remote backends
pub struct RemoteStorage {
	backends: Vec<RemoteBackendEntry>,
}

impl RemoteStorage {
	/// Construct backends from the configured URL list; `None` when no
	/// remote storage is configured
	pub fn from_config(config: &Config) -> Result<Option<Self>, CacheError> {
		if config.remote_storage.is_empty() {
			return Ok(None);
		}
		let mut backends = Vec::new();
		for url in &config.remote_storage {
			backends.push(build_backend(url)?);
		}
		Ok(Some(RemoteStorage { backends }))
	}

	pub fn with_backends(backends: Vec<RemoteBackendEntry>) -> Self {
		RemoteStorage { backends }
	}

	/// Query the backends in order; the first hit wins
	pub async fn get(&self, key: &Digest) -> (Option<Vec<u8>>, RemoteEvents) {
		let mut events = RemoteEvents::default();
		for entry in self.backends.iter().filter(|e| e.usable()) {
			let instance = entry.select_instance(key);
			match with_deadline(entry.attributes.timeout, instance.backend.get(key)).await {
				Ok(Some(value)) => {
					debug!("remote hit for {} in {}", key, entry.url);
					return (Some(value), events);
				}
				Ok(None) => {}
				Err(BackendError::Timeout) => {
					warn!("remote storage {} timed out during get", entry.url);
					events.timeouts += 1;
				}
				Err(BackendError::Failed(message)) => {
					warn!("remote storage {} failed during get: {}", entry.url, message);
					events.errors += 1;
					entry.disable();
				}
			}
		}
		(None, events)
	}

	/// Write `value` to every writable backend that does not have it
	pub async fn put(&self, key: &Digest, value: &[u8]) -> RemoteEvents {
		let mut events = RemoteEvents::default();
		for entry in self.backends.iter().filter(|e| e.usable() && !e.attributes.read_only) {
			let instance = entry.select_instance(key);
			match with_deadline(entry.attributes.timeout, instance.backend.put(key, value, true))
				.await
			{
				Ok(stored) => {
					trace!("remote put of {} to {} (stored: {})", key, entry.url, stored);
				}
				Err(BackendError::Timeout) => {
					warn!("remote storage {} timed out during put", entry.url);
					events.timeouts += 1;
				}
				Err(BackendError::Failed(message)) => {
					warn!("remote storage {} failed during put: {}", entry.url, message);
					events.errors += 1;
					entry.disable();
				}
			}
		}
		events
	}

	/// Remove `key` from every writable backend
	pub async fn remove(&self, key: &Digest) -> RemoteEvents {
		let mut events = RemoteEvents::default();
		for entry in self.backends.iter().filter(|e| e.usable() && !e.attributes.read_only) {
			let instance = entry.select_instance(key);
			match with_deadline(entry.attributes.timeout, instance.backend.remove(key)).await {
				Ok(_) => {}
				Err(BackendError::Timeout) => {
					events.timeouts += 1;
				}
				Err(BackendError::Failed(message)) => {
					warn!("remote storage {} failed during remove: {}", entry.url, message);
					events.errors += 1;
					entry.disable();
				}
			}
		}
		events
	}
}

async fn with_deadline<T>(
	timeout: Duration,
	operation: impl std::future::Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
	match tokio::time::timeout(timeout, operation).await {
		Ok(result) => result,
		Err(_) => Err(BackendError::Timeout),
	}
}

fn build_backend(url: &str) -> Result<RemoteBackendEntry, CacheError> {
	let parsed = parse_url(url)?;
	match parsed.scheme.as_str() {
		"file" => {
			let instances: Vec<(String, Box<dyn RemoteStorageBackend>)> =
				if parsed.attributes.shards.is_empty() {
					vec![(
						String::new(),
						Box::new(FileBackend::new(PathBuf::from(&parsed.location)))
							as Box<dyn RemoteStorageBackend>,
					)]
				} else {
					if !parsed.location.contains('*') {
						return Err(CacheError::Fatal {
							message: format!(
								"sharded remote storage URL must contain '*': {}",
								url
							),
						});
					}
					parsed
						.attributes
						.shards
						.iter()
						.map(|shard| {
							let location = parsed.location.replace('*', shard);
							(
								shard.clone(),
								Box::new(FileBackend::new(PathBuf::from(location)))
									as Box<dyn RemoteStorageBackend>,
							)
						})
						.collect()
				};
			Ok(RemoteBackendEntry::from_instances(
				url.to_string(),
				parsed.attributes,
				instances,
			))
		}
		other => Err(CacheError::Fatal {
			message: format!("unknown remote storage scheme: {}", other),
		}),
	}
}

/// Remote backend storing values in a directory tree, sharded like the
/// local cache
pub struct FileBackend {
	root: PathBuf,
}

impl FileBackend {
	pub fn new(root: PathBuf) -> Self {
		FileBackend { root }
	}

	fn value_path(&self, key: &Digest) -> PathBuf {
		let (l1, l2, rest) = key.split_key();
		self.root.join(l1.to_string()).join(l2.to_string()).join(rest)
	}
}

fn io_failed(e: std::io::Error) -> BackendError {
	BackendError::Failed(e.to_string())
}

#[async_trait]
impl RemoteStorageBackend for FileBackend {
	async fn get(&self, key: &Digest) -> Result<Option<Vec<u8>>, BackendError> {
		match tokio::fs::read(self.value_path(key)).await {
			Ok(bytes) => Ok(Some(bytes)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(io_failed(e)),
		}
	}

	async fn put(
		&self,
		key: &Digest,
		value: &[u8],
		only_if_missing: bool,
	) -> Result<bool, BackendError> {
		let path = self.value_path(key);
		if only_if_missing && tokio::fs::metadata(&path).await.is_ok() {
			return Ok(false);
		}
		let parent = path.parent().expect("value paths always have a parent");
		tokio::fs::create_dir_all(parent).await.map_err(io_failed)?;

		// Write-to-temp-then-rename keeps concurrent readers consistent.
		let tmp_path = path.with_extension(format!("tmp{}", std::process::id()));
		tokio::fs::write(&tmp_path, value).await.map_err(io_failed)?;
		tokio::fs::rename(&tmp_path, &path).await.map_err(io_failed)?;
		Ok(true)
	}

	async fn remove(&self, key: &Digest) -> Result<bool, BackendError> {
		match tokio::fs::remove_file(self.value_path(key)).await {
			Ok(()) => Ok(true),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
			Err(e) => Err(io_failed(e)),
		}
	}
}

/// In-memory backend used by tests and benchmarks
#[derive(Default)]
pub struct MemoryBackend {
	values: Mutex<HashMap<Digest, Vec<u8>>>,
}

impl MemoryBackend {
	pub fn new() -> Self {
		MemoryBackend::default()
	}

	pub fn len(&self) -> usize {
		self.values.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait]
impl RemoteStorageBackend for MemoryBackend {
	async fn get(&self, key: &Digest) -> Result<Option<Vec<u8>>, BackendError> {
		Ok(self.values.lock().unwrap().get(key).cloned())
	}

	async fn put(
		&self,
		key: &Digest,
		value: &[u8],
		only_if_missing: bool,
	) -> Result<bool, BackendError> {
		let mut values = self.values.lock().unwrap();
		if only_if_missing && values.contains_key(key) {
			return Ok(false);
		}
		values.insert(*key, value.to_vec());
		Ok(true)
	}

	async fn remove(&self, key: &Digest) -> Result<bool, BackendError> {
		Ok(self.values.lock().unwrap().remove(key).is_some())
	}
}


// vim: ts=4
