//! One compilation request through the cache
//!
//! The flow mirrors the two lookup modes: derive the common hash, try the
//! manifest under the direct-mode key, fall back to preprocessing and the
//! preprocessor-mode key, and finally run the real compiler and store what
//! it produced. Child processes run behind the narrow `Invoker` trait;
//! everything observable (outputs, diagnostics, exit code) round-trips
//! through the result entry.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::args::{CompilerKind, ParsedArguments};
use crate::compopt;
use crate::config::Config;
use crate::entry::EntryType;
use crate::error::CacheError;
use crate::hash::Digest;
use crate::hasher::{self, CompilerInfo, EnvProvider};
use crate::includes;
use crate::lockfile::LockFile;
use crate::logging::*;
use crate::manifest::{fingerprint_file, FileFingerprint, Manifest};
use crate::result::{FileData, FileType, ResultData};
use crate::showincludes;
use crate::sloppiness::Sloppy;
use crate::stats::{Statistic, StatsLog};
use crate::storage::Storage;

/// Exit code, stdout and stderr of one child process run
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
	pub exit_code: i32,
	pub stdout: Vec<u8>,
	pub stderr: Vec<u8>,
}

impl ProcessOutput {
	pub fn success(&self) -> bool {
		self.exit_code == 0
	}
}

/// Runs child processes (compiler, preprocessor); supplied by the caller
pub trait Invoker {
	fn run(
		&mut self,
		program: &Path,
		arguments: &[String],
		cwd: &Path,
	) -> std::io::Result<ProcessOutput>;
}

/// One parsed compilation to look up or store
pub struct CompileRequest<'a> {
	pub args: ParsedArguments,
	pub compiler: CompilerInfo,
	pub cwd: PathBuf,
	pub env: &'a dyn EnvProvider,
}

/// How the request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	DirectCacheHit,
	PreprocessedCacheHit,
	CacheMiss,
	Unsupported,
}

impl Outcome {
	fn statistic(&self) -> Statistic {
		match self {
			Outcome::DirectCacheHit => Statistic::DirectCacheHit,
			Outcome::PreprocessedCacheHit => Statistic::PreprocessedCacheHit,
			Outcome::CacheMiss => Statistic::CacheMiss,
			Outcome::Unsupported => Statistic::UnsupportedCompilerOption,
		}
	}
}

/// What the caller forwards to its own caller: the outcome plus the
/// compiler-observable behavior (exit code and diagnostics)
#[derive(Debug)]
pub struct CompileResponse {
	pub outcome: Outcome,
	pub exit_code: i32,
	pub stdout: Vec<u8>,
	pub stderr: Vec<u8>,
}

pub struct Cache {
	config: Config,
	storage: Storage,
}

impl Cache {
	pub fn new(config: Config) -> Result<Self, CacheError> {
		config.validate()?;
		let storage = Storage::new(&config)?;
		Ok(Cache { config, storage })
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn storage(&self) -> &Storage {
		&self.storage
	}

	/// Drive one compilation through the cache.
	///
	/// Recoverable failures (I/O trouble, corrupt entries, lock timeouts,
	/// remote outages) degrade to running the compiler uncached; only
	/// `Fatal` is surfaced to the caller as an error.
	pub async fn run(
		&self,
		request: &CompileRequest<'_>,
		invoker: &mut dyn Invoker,
	) -> Result<CompileResponse, CacheError> {
		match self.run_cached(request, invoker).await {
			Ok((response, outcome_key)) => {
				self.record_outcome(request, response.outcome, outcome_key.as_ref());
				Ok(response)
			}
			Err(e) if e.is_recoverable() => {
				warn!("falling back to uncached compilation: {}", e);
				self.record_failure(request, &e);
				let output = self.compile(request, invoker)?;
				Ok(CompileResponse {
					outcome: Outcome::CacheMiss,
					exit_code: output.exit_code,
					stdout: output.stdout,
					stderr: output.stderr,
				})
			}
			Err(fatal) => Err(fatal),
		}
	}

	async fn run_cached(
		&self,
		request: &CompileRequest<'_>,
		invoker: &mut dyn Invoker,
	) -> Result<(CompileResponse, Option<Digest>), CacheError> {
		let compile_started = epoch_seconds();

		if let Some(reason) = uncacheable_argument(&request.args) {
			debug!("not cacheable: {}", reason);
			let output = self.compile(request, invoker)?;
			return Ok((
				CompileResponse {
					outcome: Outcome::Unsupported,
					exit_code: output.exit_code,
					stdout: output.stdout,
					stderr: output.stderr,
				},
				None,
			));
		}
		if request.args.language.is_none() {
			self.bump_root(Statistic::UnsupportedSourceLanguage);
			let output = self.compile(request, invoker)?;
			return Ok((
				CompileResponse {
					outcome: Outcome::Unsupported,
					exit_code: output.exit_code,
					stdout: output.stdout,
					stderr: output.stderr,
				},
				None,
			));
		}

		let source_bytes = fs::read(&request.args.input).map_err(|e| {
			CacheError::io(format!("reading {}", request.args.input.display()), e)
		})?;
		if uses_time_macros(&source_bytes)
			&& !self.config.sloppiness.is_enabled(Sloppy::TimeMacros)
		{
			debug!("source uses __TIME__/__DATE__; not cacheable without time_macros sloppiness");
			self.bump_root(Statistic::UnsupportedCodeDirective);
			let output = self.compile(request, invoker)?;
			return Ok((
				CompileResponse {
					outcome: Outcome::Unsupported,
					exit_code: output.exit_code,
					stdout: output.stdout,
					stderr: output.stderr,
				},
				None,
			));
		}

		let common = hasher::common_hash(
			&self.config,
			&request.compiler,
			&request.args,
			request.env,
			&request.cwd,
		);

		// Direct mode: decide from the command line alone whether a cached
		// result is valid, without running the preprocessor.
		let direct_mode = self.config.direct_mode && !direct_mode_disqualified(&request.args);
		let direct_key = if direct_mode {
			let key = hasher::direct_mode_key(
				&common,
				&self.config,
				&request.args,
				request.env,
				&source_bytes,
			);
			trace!("direct mode key: {}", key);
			if let Some(response) = self.try_direct(&key, request).await? {
				return Ok((response, Some(key)));
			}
			self.storage.local.update_stats_for_key(&key, |c| {
				c.increment(Statistic::DirectCacheMiss, 1);
			})?;
			Some(key)
		} else {
			None
		};

		// Preprocessor mode.
		let cpp = self.preprocess(request, invoker)?;
		if !cpp.success() {
			self.bump_root(Statistic::PreprocessorError);
			let output = self.compile(request, invoker)?;
			return Ok((
				CompileResponse {
					outcome: Outcome::CacheMiss,
					exit_code: output.exit_code,
					stdout: output.stdout,
					stderr: output.stderr,
				},
				None,
			));
		}
		let cpp_key = hasher::preprocessor_mode_key(&common, &request.args, &cpp.stdout);
		trace!("preprocessor mode key: {}", cpp_key);

		let included_files = self.collect_includes(request, &cpp);

		if let Some((_, payload)) = self.storage.get(&cpp_key, EntryType::Result).await? {
			match ResultData::read(&payload) {
				Ok(result) => {
					let stderr = self.restore_result(&cpp_key, &result, &request.args)?;
					// Remember the include set so the next build hits in
					// direct mode without preprocessing.
					if let Some(direct_key) = &direct_key {
						self.update_manifest(
							direct_key,
							&cpp_key,
							&included_files,
							compile_started,
						)
						.await;
					}
					return Ok((
						CompileResponse {
							outcome: Outcome::PreprocessedCacheHit,
							exit_code: 0,
							stdout: Vec::new(),
							stderr,
						},
						Some(cpp_key),
					));
				}
				Err(e) => {
					warn!("result entry {} is unreadable: {}", cpp_key, e);
					self.storage.local.remove(&cpp_key, EntryType::Result)?;
				}
			}
		}
		self.storage.local.update_stats_for_key(&cpp_key, |c| {
			c.increment(Statistic::PreprocessedCacheMiss, 1);
		})?;

		// Real compilation.
		let output = self.compile(request, invoker)?;
		if !output.success() {
			self.bump_root(Statistic::CompileFailed);
			return Ok((
				CompileResponse {
					outcome: Outcome::CacheMiss,
					exit_code: output.exit_code,
					stdout: output.stdout,
					stderr: output.stderr,
				},
				None,
			));
		}
		if request.compiler.kind != CompilerKind::Msvc && !output.stdout.is_empty() {
			// Unexpected stdout cannot be attributed to a file type we can
			// replay faithfully; leave such invocations uncached.
			self.bump_root(Statistic::CompilerProducedStdout);
			return Ok((
				CompileResponse {
					outcome: Outcome::CacheMiss,
					exit_code: output.exit_code,
					stdout: output.stdout,
					stderr: output.stderr,
				},
				None,
			));
		}

		if !self.store_result(&cpp_key, request, &output).await? {
			return Ok((
				CompileResponse {
					outcome: Outcome::CacheMiss,
					exit_code: output.exit_code,
					stdout: output.stdout,
					stderr: output.stderr,
				},
				None,
			));
		}

		if let Some(direct_key) = &direct_key {
			self.update_manifest(direct_key, &cpp_key, &included_files, compile_started).await;
		}

		Ok((
			CompileResponse {
				outcome: Outcome::CacheMiss,
				exit_code: output.exit_code,
				stdout: strip_msvc_includes(&self.config, request, output.stdout),
				stderr: output.stderr,
			},
			Some(cpp_key),
		))
	}

	/// Manifest lookup under the direct-mode key
	async fn try_direct(
		&self,
		direct_key: &Digest,
		request: &CompileRequest<'_>,
	) -> Result<Option<CompileResponse>, CacheError> {
		let payload = match self.storage.get(direct_key, EntryType::Manifest).await? {
			Some((_, payload)) => payload,
			None => return Ok(None),
		};
		let manifest = match Manifest::read(&payload) {
			Ok(manifest) => manifest,
			Err(e) => {
				warn!("manifest {} is unreadable: {}", direct_key, e);
				self.storage.local.remove(direct_key, EntryType::Manifest)?;
				return Ok(None);
			}
		};
		let result_key = match manifest.look_up_result(self.config.sloppiness) {
			Some(key) => key,
			None => return Ok(None),
		};
		let payload = match self.storage.get(&result_key, EntryType::Result).await? {
			Some((_, payload)) => payload,
			None => {
				self.storage.local.update_stats_for_key(&result_key, |c| {
					c.increment(Statistic::MissingCacheFile, 1);
				})?;
				return Ok(None);
			}
		};
		let result = match ResultData::read(&payload) {
			Ok(result) => result,
			Err(e) => {
				warn!("result entry {} is unreadable: {}", result_key, e);
				self.storage.local.remove(&result_key, EntryType::Result)?;
				return Ok(None);
			}
		};
		let stderr = self.restore_result(&result_key, &result, &request.args)?;
		Ok(Some(CompileResponse {
			outcome: Outcome::DirectCacheHit,
			exit_code: 0,
			stdout: Vec::new(),
			stderr,
		}))
	}

	/// Write the produced outputs into a result entry under `result_key`.
	/// Returns false when the compiler left nothing cacheable behind.
	async fn store_result(
		&self,
		result_key: &Digest,
		request: &CompileRequest<'_>,
		output: &ProcessOutput,
	) -> Result<bool, CacheError> {
		let object = match fs::read(&request.args.output_obj) {
			Ok(bytes) => bytes,
			Err(_) => {
				self.bump_root(Statistic::CompilerProducedNoOutput);
				return Ok(false);
			}
		};
		if object.is_empty() {
			self.bump_root(Statistic::CompilerProducedEmptyOutput);
			return Ok(false);
		}

		let mut result = ResultData::new();
		let mut sidecars: Vec<(u8, Vec<u8>)> = Vec::new();
		let mut next_sidecar = 0u8;

		let mut add_file = |result: &mut ResultData, file_type: FileType, bytes: Vec<u8>| {
			if bytes.len() as u64 > self.config.inline_threshold {
				result.add(
					file_type,
					FileData::Raw { sidecar: next_sidecar, size: bytes.len() as u64 },
				);
				sidecars.push((next_sidecar, bytes));
				next_sidecar += 1;
			} else {
				result.add(file_type, FileData::Embedded(bytes));
			}
		};

		add_file(&mut result, FileType::Object, object);
		if !output.stderr.is_empty() {
			add_file(&mut result, FileType::Stderr, output.stderr.clone());
		}
		if let Some(depfile) = &request.args.depfile {
			if let Ok(bytes) = fs::read(depfile) {
				add_file(&mut result, FileType::Dependency, bytes);
			}
		}
		for (file_type, path) in &request.args.extra_outputs {
			if let Ok(bytes) = fs::read(path) {
				add_file(&mut result, *file_type, bytes);
			}
		}

		// Sidecars land on disk before the entry that references them.
		let self_contained = sidecars.is_empty();
		for (number, bytes) in &sidecars {
			self.storage.local.put_raw_file(result_key, *number, bytes)?;
		}
		self.storage
			.put(result_key, EntryType::Result, &result.serialize(), self_contained)
			.await?;
		Ok(true)
	}

	/// Write the cached outputs back into the build tree; returns the
	/// stderr bytes to replay
	fn restore_result(
		&self,
		result_key: &Digest,
		result: &ResultData,
		args: &ParsedArguments,
	) -> Result<Vec<u8>, CacheError> {
		let mut stderr = Vec::new();
		for file in result.files() {
			let bytes = match &file.data {
				FileData::Embedded(bytes) => bytes.clone(),
				FileData::Raw { sidecar, size } => {
					match self.storage.local.get_raw_file(result_key, *sidecar)? {
						Some(bytes) if bytes.len() as u64 == *size => bytes,
						_ => {
							// The unit is unusable without its sidecar.
							self.storage.local.remove(result_key, EntryType::Result)?;
							return Err(CacheError::CorruptEntry {
								message: format!(
									"result {} references missing sidecar {}",
									result_key, sidecar
								),
							});
						}
					}
				}
			};
			let destination = match file.file_type {
				FileType::Object => Some(args.output_obj.clone()),
				FileType::Dependency => args.depfile.clone(),
				FileType::Stderr => {
					stderr = bytes;
					continue;
				}
				other => args.extra_outputs.get(&other).cloned(),
			};
			if let Some(destination) = destination {
				fs::write(&destination, &bytes).map_err(|e| {
					CacheError::io(format!("writing {}", destination.display()), e)
				})?;
			}
		}
		Ok(stderr)
	}

	/// Append (include fingerprints -> result key) under the direct-mode
	/// key. Failures here never fail the request; the worst case is a
	/// direct-mode miss next time.
	async fn update_manifest(
		&self,
		direct_key: &Digest,
		result_key: &Digest,
		included_files: &BTreeSet<PathBuf>,
		compile_started: u64,
	) {
		let mut fingerprints: Vec<(String, FileFingerprint)> = Vec::new();
		for path in included_files {
			if self.config.sloppiness.is_enabled(Sloppy::SystemHeaders) && is_system_header(path)
			{
				continue;
			}
			let fingerprint = match fingerprint_file(path) {
				Ok(fingerprint) => fingerprint,
				Err(e) => {
					debug!("not recording manifest entry: {}", e);
					return;
				}
			};
			// A header modified while we compiled may not match what the
			// compiler read; skip the manifest rather than record a lie.
			if fingerprint.mtime >= compile_started as i64
				&& !self.config.sloppiness.is_enabled(Sloppy::IncludeFileMtime)
			{
				debug!("{} is too new; skipping manifest entry", path.display());
				return;
			}
			if fingerprint.ctime >= compile_started as i64
				&& !self.config.sloppiness.is_enabled(Sloppy::IncludeFileCtime)
				&& cfg!(unix)
			{
				debug!("{} has a too new ctime; skipping manifest entry", path.display());
				return;
			}
			fingerprints.push((path.to_string_lossy().into_owned(), fingerprint));
		}

		// Concurrent writers of the same manifest append under its lock.
		let manifest_path = self.storage.local.entry_path(direct_key, EntryType::Manifest);
		let mut lock = LockFile::new(&manifest_path)
			.with_timeout(std::time::Duration::from_secs(self.config.lock_timeout_secs))
			.with_staleness(std::time::Duration::from_secs(self.config.lock_staleness_secs));
		match lock.acquire() {
			Ok(true) => {}
			Ok(false) => {
				warn!("timed out locking manifest {}; not recording entry", direct_key);
				self.bump_root(Statistic::LockTimeout);
				return;
			}
			Err(e) => {
				warn!("failed to lock manifest {}: {}", direct_key, e);
				return;
			}
		}

		let mut manifest = match self.storage.get(direct_key, EntryType::Manifest).await {
			Ok(Some((_, payload))) => Manifest::read(&payload).unwrap_or_default(),
			_ => Manifest::new(),
		};
		manifest.add_entry_bounded(
			*result_key,
			self.config.sloppiness,
			&fingerprints,
			self.config.manifest_max_entries,
		);
		if let Err(e) = self
			.storage
			.put(direct_key, EntryType::Manifest, &manifest.serialize(), true)
			.await
		{
			warn!("failed to store manifest {}: {}", direct_key, e);
		}
		lock.release();
	}

	fn preprocess(
		&self,
		request: &CompileRequest<'_>,
		invoker: &mut dyn Invoker,
	) -> Result<ProcessOutput, CacheError> {
		let mut arguments = Vec::new();
		match request.compiler.kind {
			CompilerKind::Msvc => {
				arguments.push("/EP".to_string());
				arguments.push("/showIncludes".to_string());
			}
			_ => arguments.push("-E".to_string()),
		}
		arguments.extend(request.args.preprocessor_args.iter().cloned());
		arguments.extend(request.args.common_args.iter().cloned());
		arguments.push(request.args.input.to_string_lossy().into_owned());

		invoker
			.run(&request.compiler.path, &arguments, &request.cwd)
			.map_err(|e| CacheError::io("running the preprocessor", e))
	}

	fn compile(
		&self,
		request: &CompileRequest<'_>,
		invoker: &mut dyn Invoker,
	) -> Result<ProcessOutput, CacheError> {
		let mut arguments = Vec::new();
		arguments.extend(request.args.preprocessor_args.iter().cloned());
		arguments.extend(request.args.common_args.iter().cloned());
		arguments.extend(request.args.compiler_args.iter().cloned());
		match request.compiler.kind {
			CompilerKind::Msvc => {
				arguments.push("/c".to_string());
				arguments.push(request.args.input.to_string_lossy().into_owned());
				arguments
					.push(format!("/Fo{}", request.args.output_obj.to_string_lossy()));
			}
			_ => {
				arguments.push("-c".to_string());
				arguments.push(request.args.input.to_string_lossy().into_owned());
				arguments.push("-o".to_string());
				arguments.push(request.args.output_obj.to_string_lossy().into_owned());
			}
		}

		invoker
			.run(&request.compiler.path, &arguments, &request.cwd)
			.map_err(|e| CacheError::io("running the compiler", e))
	}

	/// The include set the compiler read: preprocessor line markers plus,
	/// for MSVC, the /showIncludes lines
	fn collect_includes(
		&self,
		request: &CompileRequest<'_>,
		cpp: &ProcessOutput,
	) -> BTreeSet<PathBuf> {
		let source =
			crate::util::normalize_path(&request.args.input, &request.cwd);
		let mut included =
			includes::scan_line_markers(&cpp.stdout, &request.cwd, &source);
		if request.compiler.kind == CompilerKind::Msvc {
			for path in showincludes::parse(&cpp.stderr, &self.config.msvc_dep_prefix) {
				included.insert(crate::util::normalize_path(Path::new(path), &request.cwd));
			}
			for path in showincludes::parse(&cpp.stdout, &self.config.msvc_dep_prefix) {
				included.insert(crate::util::normalize_path(Path::new(path), &request.cwd));
			}
		}
		included
	}

	fn record_outcome(
		&self,
		request: &CompileRequest<'_>,
		outcome: Outcome,
		key: Option<&Digest>,
	) {
		let statistic = outcome.statistic();
		let result = match key {
			Some(key) => self.storage.local.update_stats_for_key(key, |c| {
				c.increment(statistic, 1);
			}),
			None => self.storage.local.update_root_stats(|c| {
				c.increment(statistic, 1);
			}),
		};
		if let Err(e) = result {
			warn!("failed to update statistics: {}", e);
		}

		if let Some(stats_log) = &self.config.stats_log {
			StatsLog::new(stats_log.clone())
				.log_result(&request.args.input, &[statistic.id()]);
		}
	}

	fn record_failure(&self, request: &CompileRequest<'_>, error: &CacheError) {
		let statistic = match error {
			CacheError::Unsupported { .. } => Statistic::UnsupportedCompilerOption,
			CacheError::Io { .. } => Statistic::InternalError,
			CacheError::CorruptEntry { .. } => Statistic::CacheMissDueToCorruption,
			CacheError::LockTimeout { .. } => Statistic::LockTimeout,
			CacheError::RemoteFailed { .. } => Statistic::RemoteStorageError,
			CacheError::RemoteTimeout => Statistic::RemoteStorageTimeout,
			CacheError::Fatal { .. } => Statistic::InternalError,
		};
		self.bump_root(statistic);
		if let Some(stats_log) = &self.config.stats_log {
			StatsLog::new(stats_log.clone())
				.log_result(&request.args.input, &[statistic.id(), Statistic::CacheMiss.id()]);
		}
	}

	fn bump_root(&self, statistic: Statistic) {
		if let Err(e) = self.storage.local.update_root_stats(|c| c.increment(statistic, 1)) {
			warn!("failed to update statistics: {}", e);
		}
	}
}

/// The first argument that makes this invocation impossible to cache
/// correctly, if any
fn uncacheable_argument(args: &ParsedArguments) -> Option<String> {
	for argument in
		args.common_args.iter().chain(args.compiler_args.iter()).chain(args.preprocessor_args.iter())
	{
		let option = match compopt::split_concat(argument) {
			Some((option, _)) => option,
			None => argument.as_str(),
		};
		if compopt::too_hard(option) {
			return Some(argument.clone());
		}
	}
	None
}

/// Whether any argument forces the preprocessor to run (direct mode off)
fn direct_mode_disqualified(args: &ParsedArguments) -> bool {
	args.common_args
		.iter()
		.chain(args.compiler_args.iter())
		.chain(args.preprocessor_args.iter())
		.any(|argument| {
			compopt::too_hard_for_direct_mode(argument)
				|| compopt::prefix_too_hard_for_direct_mode(argument)
		})
}

/// Whether the source expands macros whose value changes between runs
fn uses_time_macros(source: &[u8]) -> bool {
	contains(source, b"__TIME__") || contains(source, b"__DATE__")
		|| contains(source, b"__TIMESTAMP__")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
	haystack.windows(needle.len()).any(|window| window == needle)
}

fn is_system_header(path: &Path) -> bool {
	path.starts_with("/usr/include")
		|| path.starts_with("/usr/local/include")
		|| path.starts_with("/usr/lib")
}

fn strip_msvc_includes(config: &Config, request: &CompileRequest<'_>, stdout: Vec<u8>) -> Vec<u8> {
	if request.compiler.kind == CompilerKind::Msvc {
		showincludes::strip(&stdout, &config.msvc_dep_prefix)
	} else {
		stdout
	}
}

fn epoch_seconds() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}


// vim: ts=4
