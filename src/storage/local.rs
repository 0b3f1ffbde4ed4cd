//! Content-addressed local cache storage
//!
//! Files live under `CACHEDIR/<h0>/<h1>/<rest>.<suffix>` where `<h0><h1>`
//! are the first two hex characters of the key. Suffix `M` marks manifest
//! entries, `R` result entries and `<n>W` raw sidecar files. Writers never
//! mutate an existing key in place; everything goes through
//! write-to-temp-then-rename, so readers always observe a consistent
//! snapshot. Eviction is LRU over per-shard units (an entry plus its
//! sidecars), run under an exclusive shard lock.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;

use crate::atomicfile::AtomicFile;
use crate::config::Config;
use crate::entry::{self, EntryType};
use crate::error::CacheError;
use crate::hash::Digest;
use crate::lockfile::LockFile;
use crate::logging::*;
use crate::stats::{StatsFile, Statistic, StatisticsCounters};
use crate::util::UmaskScope;

pub const CACHEDIR_TAG: &str = "CACHEDIR.TAG";

const CACHEDIR_TAG_CONTENTS: &str = "Signature: 8a477f597d28d172789f06886806bc55\n\
	# This file is a cache directory tag created by cachr.\n\
	# For information about cache directory tags see https://bford.info/cachedir/\n";

// Cleanup stops once a shard is back under this fraction of its limits,
// leaving slack so that every put does not trigger another sweep.
const CLEANUP_KEEP_FRACTION: f64 = 0.9;

const SHARD_COUNT: u64 = 256;

pub struct LocalStorage {
	cache_dir: PathBuf,
	max_size_per_shard: u64,
	max_files_per_shard: u64,
	lock_timeout: Duration,
	lock_staleness: Duration,
	umask: Option<u32>,
}

/// One LRU unit in a shard: an entry file plus its raw sidecars
struct CacheUnit {
	paths: Vec<PathBuf>,
	size_kib: u64,
	lru_time: FileTime,
}

impl LocalStorage {
	pub fn new(config: &Config) -> Result<Self, CacheError> {
		let storage = LocalStorage {
			cache_dir: config.cache_dir.clone(),
			max_size_per_shard: (config.max_size / SHARD_COUNT).max(1),
			max_files_per_shard: (config.max_files / SHARD_COUNT).max(1),
			lock_timeout: Duration::from_secs(config.lock_timeout_secs),
			lock_staleness: Duration::from_secs(config.lock_staleness_secs),
			umask: config.umask,
		};

		let _umask = UmaskScope::new(storage.umask);
		fs::create_dir_all(&storage.cache_dir).map_err(|e| {
			CacheError::io(format!("creating cache directory {}", storage.cache_dir.display()), e)
		})?;
		let tag_path = storage.cache_dir.join(CACHEDIR_TAG);
		if !tag_path.exists() {
			fs::write(&tag_path, CACHEDIR_TAG_CONTENTS)
				.map_err(|e| CacheError::io("writing CACHEDIR.TAG", e))?;
		}
		Ok(storage)
	}

	pub fn cache_dir(&self) -> &Path {
		&self.cache_dir
	}

	fn shard_dir(&self, key: &Digest) -> PathBuf {
		let (l1, l2, _) = key.split_key();
		self.cache_dir.join(l1.to_string()).join(l2.to_string())
	}

	/// A file's on-disk path is fully determined by its key and type
	pub fn entry_path(&self, key: &Digest, entry_type: EntryType) -> PathBuf {
		let (_, _, rest) = key.split_key();
		self.shard_dir(key).join(format!("{}.{}", rest, entry_type.suffix()))
	}

	pub fn raw_path(&self, key: &Digest, sidecar: u8) -> PathBuf {
		let (_, _, rest) = key.split_key();
		self.shard_dir(key).join(format!("{}.{}W", rest, sidecar))
	}

	/// Read the raw on-disk bytes of an entry and refresh its atime (the
	/// LRU clock); mtime is left alone
	pub fn get(&self, key: &Digest, entry_type: EntryType) -> Result<Option<Vec<u8>>, CacheError> {
		self.read_file(&self.entry_path(key, entry_type))
	}

	pub fn get_raw_file(&self, key: &Digest, sidecar: u8) -> Result<Option<Vec<u8>>, CacheError> {
		self.read_file(&self.raw_path(key, sidecar))
	}

	fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, CacheError> {
		match fs::read(path) {
			Ok(bytes) => {
				let _ = filetime::set_file_atime(path, FileTime::now());
				Ok(Some(bytes))
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(CacheError::io(format!("reading {}", path.display()), e)),
		}
	}

	/// Store an entry under its key and update the shard statistics; a
	/// shard that grew past its limit is cleaned afterwards
	pub fn put(
		&self,
		key: &Digest,
		entry_type: EntryType,
		data: &[u8],
	) -> Result<(), CacheError> {
		let path = self.entry_path(key, entry_type);
		self.write_file(&path, data)?;
		self.update_stats_for_key(key, |counters| {
			counters.increment(Statistic::LocalStorageWrite, 1);
		})?;
		self.clean_shard_if_needed(key)?;
		Ok(())
	}

	/// Store a raw sidecar. Callers must store all sidecars before the
	/// result entry that references them so that readers never observe a
	/// result pointing at missing files.
	pub fn put_raw_file(&self, key: &Digest, sidecar: u8, data: &[u8]) -> Result<(), CacheError> {
		self.write_file(&self.raw_path(key, sidecar), data)
	}

	fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), CacheError> {
		let _umask = UmaskScope::new(self.umask);
		let parent = path.parent().expect("cache paths always have a parent");
		fs::create_dir_all(parent)
			.map_err(|e| CacheError::io(format!("creating shard {}", parent.display()), e))?;

		let old_metadata = fs::metadata(path).ok();
		let existed = old_metadata.is_some();
		let old_kib = old_metadata.map(|m| size_kib(m.len())).unwrap_or(0);

		let mut file = AtomicFile::new(path)?;
		file.write(data)?;
		file.commit()?;

		let now = FileTime::now();
		let _ = filetime::set_file_times(path, now, now);

		let new_kib = size_kib(data.len() as u64);
		let stats = self.stats_file_for(path);
		stats.update(self.lock_timeout, |counters| {
			if !existed {
				counters.increment(Statistic::FilesInCache, 1);
			}
			counters.increment(Statistic::CacheSizeKibibyte, new_kib as i64 - old_kib as i64);
		})
	}

	/// Remove an entry and, for results, every sidecar belonging to it
	pub fn remove(&self, key: &Digest, entry_type: EntryType) -> Result<bool, CacheError> {
		let mut paths = vec![self.entry_path(key, entry_type)];
		if entry_type == EntryType::Result {
			for sidecar in 0..=u8::MAX {
				let path = self.raw_path(key, sidecar);
				if path.exists() {
					paths.push(path);
				} else {
					break;
				}
			}
		}

		let mut removed_any = false;
		let mut removed_files = 0i64;
		let mut removed_kib = 0i64;
		for path in &paths {
			if let Ok(metadata) = fs::metadata(path) {
				if fs::remove_file(path).is_ok() {
					removed_any = true;
					removed_files += 1;
					removed_kib += size_kib(metadata.len()) as i64;
				}
			}
		}
		if removed_any {
			self.update_stats_for_key(key, |counters| {
				counters.increment(Statistic::FilesInCache, -removed_files);
				counters.increment(Statistic::CacheSizeKibibyte, -removed_kib);
			})?;
		}
		Ok(removed_any)
	}

	// ---- statistics -----------------------------------------------------

	fn stats_file_for(&self, entry_path: &Path) -> StatsFile {
		let shard = entry_path.parent().expect("entry paths always have a shard");
		StatsFile::new(shard.join("stats"))
	}

	/// Update the level-2 stats file of the shard holding `key`
	pub fn update_stats_for_key<F>(&self, key: &Digest, apply: F) -> Result<(), CacheError>
	where
		F: FnOnce(&mut StatisticsCounters),
	{
		let shard = self.shard_dir(key);
		fs::create_dir_all(&shard)
			.map_err(|e| CacheError::io(format!("creating shard {}", shard.display()), e))?;
		StatsFile::new(shard.join("stats")).update(self.lock_timeout, apply)
	}

	/// Update the cache-global stats file, used for outcomes observed
	/// before any key exists (e.g. uncacheable invocations)
	pub fn update_root_stats<F>(&self, apply: F) -> Result<(), CacheError>
	where
		F: FnOnce(&mut StatisticsCounters),
	{
		StatsFile::new(self.cache_dir.join("stats")).update(self.lock_timeout, apply)
	}

	fn for_each_stats_file<F: FnMut(StatsFile)>(&self, mut visit: F) {
		visit(StatsFile::new(self.cache_dir.join("stats")));
		for l1 in "0123456789abcdef".chars() {
			let l1_dir = self.cache_dir.join(l1.to_string());
			visit(StatsFile::new(l1_dir.join("stats")));
			for l2 in "0123456789abcdef".chars() {
				visit(StatsFile::new(l1_dir.join(l2.to_string()).join("stats")));
			}
		}
	}

	/// Sum the counters of every stats file. `stats_zeroed_timestamp` is
	/// aggregated as the maximum across shards rather than the sum.
	pub fn read_all_statistics(&self) -> StatisticsCounters {
		let mut total = StatisticsCounters::new();
		let mut zero_timestamp = 0;
		self.for_each_stats_file(|stats| {
			let mut counters = stats.read();
			zero_timestamp = zero_timestamp.max(counters.get(Statistic::StatsZeroedTimestamp));
			counters.set(Statistic::StatsZeroedTimestamp, 0);
			total.increment_counters(&counters);
		});
		total.set(Statistic::StatsZeroedTimestamp, zero_timestamp);
		total
	}

	/// Zero all statistics counters except those tracking cache size and
	/// number of files in the cache
	pub fn zero_all_statistics(&self) -> Result<(), CacheError> {
		let now = epoch_seconds();
		let mut failed = None;
		self.for_each_stats_file(|stats| {
			if !stats.path().exists() {
				return;
			}
			let result = stats.update(self.lock_timeout, |counters| {
				for index in 0..counters.size() {
					// Unknown positions written by a newer version are
					// preserved.
					if Statistic::from_index(index).map(|s| s.is_zeroable()).unwrap_or(false) {
						counters.set_raw(index, 0);
					}
				}
				counters.set(Statistic::StatsZeroedTimestamp, now);
			});
			if let Err(e) = result {
				failed.get_or_insert(e);
			}
		});
		match failed {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	// ---- cleanup --------------------------------------------------------

	fn clean_shard_if_needed(&self, key: &Digest) -> Result<(), CacheError> {
		let shard = self.shard_dir(key);
		let counters = StatsFile::new(shard.join("stats")).read();
		if counters.get(Statistic::CacheSizeKibibyte) * 1024 > self.max_size_per_shard
			|| counters.get(Statistic::FilesInCache) > self.max_files_per_shard
		{
			let (l1, l2, _) = key.split_key();
			self.clean_shard(l1, l2)?;
		}
		Ok(())
	}

	/// Evict least-recently-used units from one shard until it is back
	/// under its limits, with slack to avoid thrashing
	pub fn clean_shard(&self, l1: char, l2: char) -> Result<(), CacheError> {
		let shard = self.cache_dir.join(l1.to_string()).join(l2.to_string());
		if !shard.exists() {
			return Ok(());
		}

		let mut lock = LockFile::new(&shard.join("cleanup"))
			.with_timeout(self.lock_timeout)
			.with_staleness(self.lock_staleness);
		if !lock.try_acquire()? {
			debug!("shard {}/{} is being cleaned by another process", l1, l2);
			return Ok(());
		}

		let mut units = collect_units(&shard)?;
		units.sort_by_key(|unit| unit.lru_time);

		let total_kib: u64 = units.iter().map(|u| u.size_kib).sum();
		let total_files: u64 = units.iter().map(|u| u.paths.len() as u64).sum();
		let keep_kib = (self.max_size_per_shard as f64 * CLEANUP_KEEP_FRACTION / 1024.0) as u64;
		let keep_files = (self.max_files_per_shard as f64 * CLEANUP_KEEP_FRACTION) as u64;

		let mut remaining_kib = total_kib;
		let mut remaining_files = total_files;
		let mut removed = 0usize;
		for unit in &units {
			if remaining_kib <= keep_kib && remaining_files <= keep_files {
				break;
			}
			for path in &unit.paths {
				let _ = fs::remove_file(path);
			}
			remaining_kib -= unit.size_kib;
			remaining_files -= unit.paths.len() as u64;
			removed += 1;
		}

		if removed > 0 {
			info!("cleaned {} unit(s) from shard {}/{}", removed, l1, l2);
		}
		StatsFile::new(shard.join("stats")).update(self.lock_timeout, |counters| {
			counters.set(Statistic::FilesInCache, remaining_files);
			counters.set(Statistic::CacheSizeKibibyte, remaining_kib);
			counters.increment(Statistic::CleanupsPerformed, 1);
		})?;
		lock.release();
		Ok(())
	}

	/// Clean every shard
	pub fn clean_all(&self) -> Result<(), CacheError> {
		for l1 in "0123456789abcdef".chars() {
			for l2 in "0123456789abcdef".chars() {
				self.clean_shard(l1, l2)?;
			}
		}
		Ok(())
	}

	// ---- recompression --------------------------------------------------

	/// Rewrite every entry with `level`, preserving each file's mtime and
	/// atime so that LRU order is undisturbed. Returns (bytes before,
	/// bytes after).
	pub fn recompress(&self, level: i8, namespace: &str) -> Result<(u64, u64), CacheError> {
		let mut old_total = 0u64;
		let mut new_total = 0u64;
		for l1 in "0123456789abcdef".chars() {
			for l2 in "0123456789abcdef".chars() {
				let shard = self.cache_dir.join(l1.to_string()).join(l2.to_string());
				if !shard.exists() {
					continue;
				}
				for file in list_cache_files(&shard)? {
					let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("");
					if !name.ends_with('M') && !name.ends_with('R') {
						old_total += fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
						new_total += fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
						continue;
					}
					match self.recompress_file(&file, level, namespace) {
						Ok((old_size, new_size)) => {
							old_total += old_size;
							new_total += new_size;
						}
						Err(e) => {
							warn!("skipping {} during recompression: {}", file.display(), e);
						}
					}
				}
			}
		}
		Ok((old_total, new_total))
	}

	fn recompress_file(
		&self,
		path: &Path,
		level: i8,
		namespace: &str,
	) -> Result<(u64, u64), CacheError> {
		let metadata = fs::metadata(path)
			.map_err(|e| CacheError::io(format!("reading {}", path.display()), e))?;
		let atime = FileTime::from_last_access_time(&metadata);
		let mtime = FileTime::from_last_modification_time(&metadata);
		let old_size = metadata.len();

		let bytes = fs::read(path)
			.map_err(|e| CacheError::io(format!("reading {}", path.display()), e))?;
		let (header, payload) = entry::read(&bytes)?;
		if header.compression_level == level
			&& header.compression_type == crate::compress::CompressionType::Zstd
		{
			return Ok((old_size, old_size));
		}

		let recoded = entry::serialize_at(
			&payload,
			header.entry_type,
			crate::compress::CompressionType::Zstd,
			level,
			namespace,
			header.creation_time,
		)?;
		let new_size = recoded.len() as u64;

		let mut file = AtomicFile::new(path)?;
		file.write(&recoded)?;
		file.commit()?;
		let _ = filetime::set_file_times(path, atime, mtime);

		let stats = self.stats_file_for(path);
		stats.update(self.lock_timeout, |counters| {
			counters.increment(
				Statistic::CacheSizeKibibyte,
				size_kib(new_size) as i64 - size_kib(old_size) as i64,
			);
		})?;
		Ok((old_size, new_size))
	}
}

fn size_kib(len: u64) -> u64 {
	(len + 1023) / 1024
}

fn epoch_seconds() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Files in a shard that participate in eviction: everything except the
/// marker file, stats, lock artifacts, temp files and NFS remnants
fn list_cache_files(shard: &Path) -> Result<Vec<PathBuf>, CacheError> {
	let mut files = Vec::new();
	let entries = fs::read_dir(shard)
		.map_err(|e| CacheError::io(format!("listing {}", shard.display()), e))?;
	for dir_entry in entries {
		let dir_entry =
			dir_entry.map_err(|e| CacheError::io(format!("listing {}", shard.display()), e))?;
		let name = dir_entry.file_name();
		let name = name.to_string_lossy();
		if name == CACHEDIR_TAG
			|| name == "stats"
			|| name.starts_with('.')
			|| name.ends_with(".lock")
			|| name.ends_with(".alive")
		{
			continue;
		}
		if dir_entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
			files.push(dir_entry.path());
		}
	}
	Ok(files)
}

/// Group a shard's files into LRU units: a unit is all files sharing one
/// key stem (the entry plus its sidecars)
fn collect_units(shard: &Path) -> Result<Vec<CacheUnit>, CacheError> {
	use std::collections::HashMap;

	let mut units: HashMap<String, CacheUnit> = HashMap::new();
	for path in list_cache_files(shard)? {
		let metadata = match fs::metadata(&path) {
			Ok(m) => m,
			Err(_) => continue, // raced with a concurrent removal
		};
		let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
		let stem = name.split('.').next().unwrap_or(&name).to_string();

		// A unit is as recent as its most recently touched member.
		let atime = FileTime::from_last_access_time(&metadata);
		let mtime = FileTime::from_last_modification_time(&metadata);
		let timestamp = atime.max(mtime);

		let unit = units.entry(stem).or_insert_with(|| CacheUnit {
			paths: Vec::new(),
			size_kib: 0,
			lru_time: FileTime::zero(),
		});
		unit.paths.push(path);
		unit.size_kib += size_kib(metadata.len());
		unit.lru_time = unit.lru_time.max(timestamp);
	}
	Ok(units.into_iter().map(|(_, unit)| unit).collect())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::compress::CompressionType;
	use crate::hash::digest_of;
	use tempfile::TempDir;

	fn test_config(dir: &TempDir) -> Config {
		Config { cache_dir: dir.path().join("cache"), ..Config::default() }
	}

	#[test]
	fn test_layout() {
		let dir = TempDir::new().unwrap();
		let storage = LocalStorage::new(&test_config(&dir)).unwrap();
		let key =
			Digest::from_hex("0123456789abcdef0123456789abcdef01234567").unwrap();

		let path = storage.entry_path(&key, EntryType::Result);
		assert!(path
			.to_string_lossy()
			.ends_with("cache/0/1/23456789abcdef0123456789abcdef01234567.R"));
		let raw = storage.raw_path(&key, 0);
		assert!(raw
			.to_string_lossy()
			.ends_with("cache/0/1/23456789abcdef0123456789abcdef01234567.0W"));
		assert!(dir.path().join("cache").join(CACHEDIR_TAG).exists());
	}

	#[test]
	fn test_put_get_roundtrip_and_stats() {
		let dir = TempDir::new().unwrap();
		let storage = LocalStorage::new(&test_config(&dir)).unwrap();
		let key = digest_of(b"some key");

		assert_eq!(storage.get(&key, EntryType::Result).unwrap(), None);
		storage.put(&key, EntryType::Result, b"entry bytes").unwrap();
		assert_eq!(
			storage.get(&key, EntryType::Result).unwrap(),
			Some(b"entry bytes".to_vec())
		);

		let counters = storage.read_all_statistics();
		assert_eq!(counters.get(Statistic::FilesInCache), 1);
		assert_eq!(counters.get(Statistic::CacheSizeKibibyte), 1);
		assert_eq!(counters.get(Statistic::LocalStorageWrite), 1);
	}

	#[test]
	fn test_overwrite_does_not_double_count() {
		let dir = TempDir::new().unwrap();
		let storage = LocalStorage::new(&test_config(&dir)).unwrap();
		let key = digest_of(b"some key");

		storage.put(&key, EntryType::Result, &[0u8; 100]).unwrap();
		storage.put(&key, EntryType::Result, &[0u8; 5000]).unwrap();

		let counters = storage.read_all_statistics();
		assert_eq!(counters.get(Statistic::FilesInCache), 1);
		assert_eq!(counters.get(Statistic::CacheSizeKibibyte), size_kib(5000));
	}

	#[test]
	fn test_remove_takes_sidecars_along() {
		let dir = TempDir::new().unwrap();
		let storage = LocalStorage::new(&test_config(&dir)).unwrap();
		let key = digest_of(b"with sidecars");

		storage.put_raw_file(&key, 0, &[1u8; 2048]).unwrap();
		storage.put_raw_file(&key, 1, &[2u8; 1024]).unwrap();
		storage.put(&key, EntryType::Result, b"the entry").unwrap();

		assert!(storage.remove(&key, EntryType::Result).unwrap());
		assert!(!storage.raw_path(&key, 0).exists());
		assert!(!storage.raw_path(&key, 1).exists());
		assert_eq!(storage.get(&key, EntryType::Result).unwrap(), None);

		let counters = storage.read_all_statistics();
		assert_eq!(counters.get(Statistic::FilesInCache), 0);
		assert_eq!(counters.get(Statistic::CacheSizeKibibyte), 0);
		assert!(!storage.remove(&key, EntryType::Result).unwrap());
	}

	#[test]
	fn test_get_refreshes_atime_not_mtime() {
		let dir = TempDir::new().unwrap();
		let storage = LocalStorage::new(&test_config(&dir)).unwrap();
		let key = digest_of(b"atime");
		storage.put(&key, EntryType::Manifest, b"m").unwrap();

		let path = storage.entry_path(&key, EntryType::Manifest);
		let old = FileTime::from_unix_time(1_000_000, 0);
		filetime::set_file_times(&path, old, old).unwrap();

		storage.get(&key, EntryType::Manifest).unwrap();
		let metadata = fs::metadata(&path).unwrap();
		assert!(FileTime::from_last_access_time(&metadata) > old);
		assert_eq!(FileTime::from_last_modification_time(&metadata), old);
	}

	#[test]
	fn test_cleanup_is_lru() {
		let dir = TempDir::new().unwrap();
		// Populate with roomy limits so no cleanup fires along the way.
		let storage = LocalStorage::new(&test_config(&dir)).unwrap();

		// Keys sharing one shard, 1 KiB each, with increasing atimes.
		let mut keys = Vec::new();
		let mut bytes = [0u8; crate::hash::DIGEST_SIZE];
		for i in 0..8u8 {
			bytes[19] = i;
			keys.push(Digest::from_bytes(bytes));
		}
		for (i, key) in keys.iter().enumerate() {
			storage.put(key, EntryType::Result, &[i as u8; 1024]).unwrap();
			let stamp = FileTime::from_unix_time(1_000_000 + i as i64 * 100, 0);
			filetime::set_file_times(
				storage.entry_path(key, EntryType::Result),
				stamp,
				stamp,
			)
			.unwrap();
		}

		// Per-shard limits for the sweep: 4 KiB, 4 files.
		let mut config = test_config(&dir);
		config.max_size = 4 * 1024 * SHARD_COUNT;
		config.max_files = 4 * SHARD_COUNT;
		let storage = LocalStorage::new(&config).unwrap();
		storage.clean_shard('0', '0').unwrap();

		// The oldest keys are gone, the newest survive (within slack:
		// keep fraction of 4 KiB is 3 files plus change).
		assert!(!storage.entry_path(&keys[0], EntryType::Result).exists());
		assert!(!storage.entry_path(&keys[1], EntryType::Result).exists());
		assert!(storage.entry_path(&keys[6], EntryType::Result).exists());
		assert!(storage.entry_path(&keys[7], EntryType::Result).exists());

		let counters = storage.read_all_statistics();
		assert_eq!(counters.get(Statistic::CleanupsPerformed), 1);
		let survivors = keys
			.iter()
			.filter(|k| storage.entry_path(k, EntryType::Result).exists())
			.count() as u64;
		assert_eq!(counters.get(Statistic::FilesInCache), survivors);
	}

	#[test]
	fn test_recompress_preserves_times() {
		let dir = TempDir::new().unwrap();
		let storage = LocalStorage::new(&test_config(&dir)).unwrap();
		let key = digest_of(b"recompress");

		let payload = b"compressible payload ".repeat(200);
		let bytes =
			entry::serialize(&payload, EntryType::Result, CompressionType::None, 0, "").unwrap();
		storage.put(&key, EntryType::Result, &bytes).unwrap();

		let path = storage.entry_path(&key, EntryType::Result);
		let stamp = FileTime::from_unix_time(1_000_000, 0);
		filetime::set_file_times(&path, stamp, stamp).unwrap();

		let (old_size, new_size) = storage.recompress(19, "").unwrap();
		assert!(new_size < old_size);

		let metadata = fs::metadata(&path).unwrap();
		assert_eq!(FileTime::from_last_modification_time(&metadata), stamp);
		assert_eq!(FileTime::from_last_access_time(&metadata), stamp);

		let (_, reread) = entry::read(&fs::read(&path).unwrap()).unwrap();
		assert_eq!(reread, payload);
	}
}

// vim: ts=4
