//! Statistics counters and their on-disk representation
//!
//! Counters live in per-shard `stats` files to avoid write contention; the
//! file format is one unsigned integer per line, indexed by the
//! `Statistic` enumeration. Unknown trailing indices written by newer
//! versions are preserved across read-modify-write cycles.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::atomicfile::AtomicFile;
use crate::error::CacheError;
use crate::lockfile::LockFile;
use crate::logging::*;

/// Closed enumeration of counters. The discriminants are file positions
/// and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Statistic {
	None = 0,
	CompilerProducedStdout = 1,
	CompileFailed = 2,
	InternalError = 3,
	CacheMiss = 4,
	PreprocessorError = 5,
	CouldNotFindCompiler = 6,
	MissingCacheFile = 7,
	PreprocessedCacheHit = 8,
	BadCompilerArguments = 9,
	CalledForLink = 10,
	FilesInCache = 11,
	CacheSizeKibibyte = 12,
	UnsupportedSourceLanguage = 13,
	BadOutputFile = 14,
	NoInputFile = 15,
	MultipleSourceFiles = 16,
	UnsupportedCompilerOption = 17,
	OutputToStdout = 18,
	DirectCacheHit = 19,
	CompilerProducedNoOutput = 20,
	CompilerProducedEmptyOutput = 21,
	ErrorHashingExtraFile = 22,
	CalledForPreprocessing = 23,
	CleanupsPerformed = 24,
	UnsupportedCodeDirective = 25,
	StatsZeroedTimestamp = 26,
	DirectCacheMiss = 27,
	PreprocessedCacheMiss = 28,
	LocalStorageReadHit = 29,
	LocalStorageReadMiss = 30,
	LocalStorageWrite = 31,
	LocalStorageError = 32,
	RemoteStorageReadHit = 33,
	RemoteStorageReadMiss = 34,
	RemoteStorageWrite = 35,
	RemoteStorageError = 36,
	RemoteStorageTimeout = 37,
	CacheMissDueToCorruption = 38,
	LockTimeout = 39,
}

const ALL_STATISTICS: &[(Statistic, &str)] = &[
	(Statistic::None, "none"),
	(Statistic::CompilerProducedStdout, "compiler_produced_stdout"),
	(Statistic::CompileFailed, "compile_failed"),
	(Statistic::InternalError, "internal_error"),
	(Statistic::CacheMiss, "cache_miss"),
	(Statistic::PreprocessorError, "preprocessor_error"),
	(Statistic::CouldNotFindCompiler, "could_not_find_compiler"),
	(Statistic::MissingCacheFile, "missing_cache_file"),
	(Statistic::PreprocessedCacheHit, "preprocessed_cache_hit"),
	(Statistic::BadCompilerArguments, "bad_compiler_arguments"),
	(Statistic::CalledForLink, "called_for_link"),
	(Statistic::FilesInCache, "files_in_cache"),
	(Statistic::CacheSizeKibibyte, "cache_size_kibibyte"),
	(Statistic::UnsupportedSourceLanguage, "unsupported_source_language"),
	(Statistic::BadOutputFile, "bad_output_file"),
	(Statistic::NoInputFile, "no_input_file"),
	(Statistic::MultipleSourceFiles, "multiple_source_files"),
	(Statistic::UnsupportedCompilerOption, "unsupported_compiler_option"),
	(Statistic::OutputToStdout, "output_to_stdout"),
	(Statistic::DirectCacheHit, "direct_cache_hit"),
	(Statistic::CompilerProducedNoOutput, "compiler_produced_no_output"),
	(Statistic::CompilerProducedEmptyOutput, "compiler_produced_empty_output"),
	(Statistic::ErrorHashingExtraFile, "error_hashing_extra_file"),
	(Statistic::CalledForPreprocessing, "called_for_preprocessing"),
	(Statistic::CleanupsPerformed, "cleanups_performed"),
	(Statistic::UnsupportedCodeDirective, "unsupported_code_directive"),
	(Statistic::StatsZeroedTimestamp, "stats_zeroed_timestamp"),
	(Statistic::DirectCacheMiss, "direct_cache_miss"),
	(Statistic::PreprocessedCacheMiss, "preprocessed_cache_miss"),
	(Statistic::LocalStorageReadHit, "local_storage_read_hit"),
	(Statistic::LocalStorageReadMiss, "local_storage_read_miss"),
	(Statistic::LocalStorageWrite, "local_storage_write"),
	(Statistic::LocalStorageError, "local_storage_error"),
	(Statistic::RemoteStorageReadHit, "remote_storage_read_hit"),
	(Statistic::RemoteStorageReadMiss, "remote_storage_read_miss"),
	(Statistic::RemoteStorageWrite, "remote_storage_write"),
	(Statistic::RemoteStorageError, "remote_storage_error"),
	(Statistic::RemoteStorageTimeout, "remote_storage_timeout"),
	(Statistic::CacheMissDueToCorruption, "cache_miss_due_to_corruption"),
	(Statistic::LockTimeout, "lock_timeout"),
];

impl Statistic {
	pub fn id(&self) -> &'static str {
		ALL_STATISTICS[*self as usize].1
	}

	pub fn from_id(id: &str) -> Option<Statistic> {
		ALL_STATISTICS.iter().find(|(_, name)| *name == id).map(|(statistic, _)| *statistic)
	}

	/// The statistic at a file position, if this version knows it
	pub fn from_index(index: usize) -> Option<Statistic> {
		ALL_STATISTICS.get(index).map(|(statistic, _)| *statistic)
	}

	/// Counters reset by "zero statistics"; size bookkeeping and the zero
	/// timestamp itself survive
	pub fn is_zeroable(&self) -> bool {
		!matches!(
			self,
			Statistic::FilesInCache
				| Statistic::CacheSizeKibibyte
				| Statistic::StatsZeroedTimestamp
		)
	}
}

/// Sparse vector of u64 counters indexed by `Statistic`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatisticsCounters {
	counters: Vec<u64>,
}

impl StatisticsCounters {
	pub fn new() -> Self {
		StatisticsCounters::default()
	}

	pub fn size(&self) -> usize {
		self.counters.len()
	}

	pub fn get(&self, statistic: Statistic) -> u64 {
		self.get_raw(statistic as usize)
	}

	pub fn get_raw(&self, index: usize) -> u64 {
		self.counters.get(index).copied().unwrap_or(0)
	}

	pub fn set(&mut self, statistic: Statistic, value: u64) {
		self.set_raw(statistic as usize, value)
	}

	pub fn set_raw(&mut self, index: usize, value: u64) {
		if index >= self.counters.len() {
			self.counters.resize(index + 1, 0);
		}
		self.counters[index] = value;
	}

	/// Add `value` to a counter, saturating at zero so counters never go
	/// negative
	pub fn increment(&mut self, statistic: Statistic, value: i64) {
		if value == 0 {
			return;
		}
		let index = statistic as usize;
		let current = self.get_raw(index) as i64;
		self.set_raw(index, current.saturating_add(value).max(0) as u64);
	}

	/// Add every counter of `other` to this set
	pub fn increment_counters(&mut self, other: &StatisticsCounters) {
		for index in 0..other.size() {
			let current = self.get_raw(index) as i64;
			self.set_raw(index, current.saturating_add(other.get_raw(index) as i64).max(0) as u64);
		}
	}

	pub fn all_zero(&self) -> bool {
		self.counters.iter().all(|&v| v == 0)
	}

	/// Parse the line-oriented text format; unparseable lines read as zero
	pub fn from_text(text: &str) -> Self {
		let counters = text
			.lines()
			.map(|line| line.trim().parse::<u64>().unwrap_or(0))
			.collect();
		StatisticsCounters { counters }
	}

	pub fn to_text(&self) -> String {
		let mut out = String::new();
		for value in &self.counters {
			out.push_str(&value.to_string());
			out.push('\n');
		}
		out
	}
}

/// One shard's counters file, updated under an exclusive file lock
pub struct StatsFile {
	path: PathBuf,
}

impl StatsFile {
	pub fn new(path: PathBuf) -> Self {
		StatsFile { path }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Read the counters; a missing or unreadable file reads as all-zero
	pub fn read(&self) -> StatisticsCounters {
		match fs::read_to_string(&self.path) {
			Ok(text) => StatisticsCounters::from_text(&text),
			Err(_) => StatisticsCounters::new(),
		}
	}

	/// Read-modify-write the counters under the stats file lock
	pub fn update<F>(&self, lock_timeout: Duration, apply: F) -> Result<(), CacheError>
	where
		F: FnOnce(&mut StatisticsCounters),
	{
		let mut lock = LockFile::new(&self.path).with_timeout(lock_timeout);
		if !lock.acquire()? {
			warn!("could not lock stats file {}", self.path.display());
			return Err(CacheError::LockTimeout { path: self.path.clone() });
		}

		let mut counters = self.read();
		apply(&mut counters);

		let mut file = AtomicFile::new(&self.path)?;
		file.write(counters.to_text().as_bytes())?;
		file.commit()
	}
}

/// Append-only log of which counters each input file produced
pub struct StatsLog {
	path: PathBuf,
}

impl StatsLog {
	pub fn new(path: PathBuf) -> Self {
		StatsLog { path }
	}

	/// Record one request: a `# <input path>` line followed by one counter
	/// id per line
	pub fn log_result(&self, input_file: &Path, result_ids: &[&str]) {
		let mut file = match fs::OpenOptions::new().create(true).append(true).open(&self.path) {
			Ok(file) => file,
			Err(e) => {
				warn!("failed to open {}: {}", self.path.display(), e);
				return;
			}
		};
		let mut text = format!("# {}\n", input_file.display());
		for id in result_ids {
			text.push_str(id);
			text.push('\n');
		}
		if let Err(e) = file.write_all(text.as_bytes()) {
			warn!("failed to append to {}: {}", self.path.display(), e);
		}
	}

	/// Tally the logged counter ids, skipping comment lines and ids this
	/// version does not know
	pub fn read(&self) -> StatisticsCounters {
		let mut counters = StatisticsCounters::new();
		let text = match fs::read_to_string(&self.path) {
			Ok(text) => text,
			Err(_) => return counters,
		};
		for line in text.lines() {
			if line.starts_with('#') || line.is_empty() {
				continue;
			}
			match Statistic::from_id(line.trim()) {
				Some(statistic) => counters.increment(statistic, 1),
				None => debug!("unknown statistic: {}", line),
			}
		}
		counters
	}
}


// vim: ts=4
