//! Unified configuration for CachR
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (Config::default())
//! 2. Config file (~/.config/cachr/config.toml or config.json)
//! 3. Environment variables (CACHR_* prefix)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::compress::{CompressionType, DEFAULT_COMPRESSION_LEVEL};
use crate::error::CacheError;
use crate::sloppiness::Sloppiness;
use crate::util;

/// How the compiler binary is folded into the hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilerCheck {
	/// Hash the compiler binary's contents (the default)
	Content,
	/// Hash only the compiler's absolute path
	Path,
}

/// Unified configuration for cache operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	/// Root directory of the local cache (~/.cache/cachr)
	pub cache_dir: PathBuf,

	/// Maximum total cache size in bytes; enforced per shard with slack
	pub max_size: u64,

	/// Maximum number of files in the cache; enforced per shard
	pub max_files: u64,

	/// Use direct mode (manifest lookup without running the preprocessor)
	pub direct_mode: bool,

	/// Compress stored entries with Zstandard
	pub compression: bool,

	/// Zstandard level used when compression is enabled
	pub compression_level: i8,

	/// Inline threshold: result files up to this many bytes are embedded
	/// in the entry, larger ones become raw sidecar files
	pub inline_threshold: u64,

	/// Opt-in exactness relaxations
	pub sloppiness: Sloppiness,

	/// How to fold the compiler binary into the hash
	pub compiler_check: CompilerCheck,

	/// Hash the working directory when relative paths make the build
	/// sensitive to it
	pub hash_dir: bool,

	/// Caller-supplied namespace isolating unrelated caches sharing a
	/// directory
	pub namespace: String,

	/// Bound on entries per manifest
	pub manifest_max_entries: usize,

	/// Seconds after which a lock holder with a silent heartbeat is
	/// presumed dead
	pub lock_staleness_secs: u64,

	/// Seconds a blocking lock acquisition waits before giving up
	pub lock_timeout_secs: u64,

	/// Remote storage backend URLs, tried in order
	pub remote_storage: Vec<String>,

	/// Append each request's outcome counters to this file
	pub stats_log: Option<PathBuf>,

	/// Prefix of /showIncludes lines in the active MSVC locale
	pub msvc_dep_prefix: String,

	/// Restore the umask while writing shared cache files
	pub umask: Option<u32>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			cache_dir: std::env::var("HOME")
				.ok()
				.map(|home| PathBuf::from(home).join(".cache").join("cachr"))
				.unwrap_or_else(|| PathBuf::from(".cachr")),
			max_size: 5 * 1024 * 1024 * 1024,
			max_files: 1_000_000,
			direct_mode: true,
			compression: true,
			compression_level: DEFAULT_COMPRESSION_LEVEL,
			inline_threshold: 8 * 1024,
			sloppiness: Sloppiness::new(),
			compiler_check: CompilerCheck::Content,
			hash_dir: true,
			namespace: String::new(),
			manifest_max_entries: crate::manifest::DEFAULT_MAX_ENTRIES,
			lock_staleness_secs: 10,
			lock_timeout_secs: 30,
			remote_storage: Vec::new(),
			stats_log: None,
			msvc_dep_prefix: crate::showincludes::DEFAULT_PREFIX.to_string(),
			umask: None,
		}
	}
}

impl Config {
	/// Load configuration through the full priority chain
	pub fn load() -> Result<Self, CacheError> {
		let mut config = Config::default();
		if let Some(path) = Self::config_file_path() {
			if path.exists() {
				config = Self::load_file(&path)?;
			}
		}
		config.apply_env();
		config.validate()?;
		Ok(config)
	}

	fn config_file_path() -> Option<PathBuf> {
		if let Ok(path) = std::env::var("CACHR_CONFIG") {
			return Some(PathBuf::from(path));
		}
		let home = std::env::var("HOME").ok()?;
		let base = PathBuf::from(home).join(".config").join("cachr");
		let toml_path = base.join("config.toml");
		if toml_path.exists() {
			return Some(toml_path);
		}
		let json_path = base.join("config.json");
		if json_path.exists() {
			return Some(json_path);
		}
		None
	}

	/// Parse a config file; the format is chosen by extension
	pub fn load_file(path: &Path) -> Result<Self, CacheError> {
		let contents = std::fs::read_to_string(path)
			.map_err(|e| CacheError::io(format!("reading config {}", path.display()), e))?;
		if path.extension().map(|e| e == "json").unwrap_or(false) {
			serde_json::from_str(&contents).map_err(|e| CacheError::Fatal {
				message: format!("invalid config {}: {}", path.display(), e),
			})
		} else {
			toml::from_str(&contents).map_err(|e| CacheError::Fatal {
				message: format!("invalid config {}: {}", path.display(), e),
			})
		}
	}

	/// Apply CACHR_* environment variable overrides
	pub fn apply_env(&mut self) {
		if let Ok(dir) = std::env::var("CACHR_DIR") {
			self.cache_dir = PathBuf::from(dir);
		}
		if let Some(size) = std::env::var("CACHR_MAXSIZE").ok().and_then(|v| util::parse_size(&v))
		{
			self.max_size = size;
		}
		if let Some(files) =
			std::env::var("CACHR_MAXFILES").ok().and_then(|v| v.parse::<u64>().ok())
		{
			self.max_files = files;
		}
		if let Ok(value) = std::env::var("CACHR_DIRECT") {
			self.direct_mode = parse_bool(&value);
		}
		if let Ok(value) = std::env::var("CACHR_COMPRESS") {
			self.compression = parse_bool(&value);
		}
		if let Some(level) =
			std::env::var("CACHR_COMPRESSLEVEL").ok().and_then(|v| v.parse::<i8>().ok())
		{
			self.compression_level = level;
		}
		if let Some(threshold) =
			std::env::var("CACHR_INLINE_THRESHOLD").ok().and_then(|v| util::parse_size(&v))
		{
			self.inline_threshold = threshold;
		}
		if let Ok(value) = std::env::var("CACHR_SLOPPINESS") {
			if let Ok(sloppiness) = Sloppiness::parse(&value) {
				self.sloppiness = sloppiness;
			}
		}
		if let Ok(value) = std::env::var("CACHR_COMPILERCHECK") {
			self.compiler_check = if value.eq_ignore_ascii_case("path") {
				CompilerCheck::Path
			} else {
				CompilerCheck::Content
			};
		}
		if let Ok(value) = std::env::var("CACHR_HASHDIR") {
			self.hash_dir = parse_bool(&value);
		}
		if let Ok(value) = std::env::var("CACHR_NAMESPACE") {
			self.namespace = value;
		}
		if let Ok(value) = std::env::var("CACHR_REMOTE_STORAGE") {
			self.remote_storage =
				value.split_whitespace().map(|s| s.to_string()).collect();
		}
		if let Ok(value) = std::env::var("CACHR_STATSLOG") {
			self.stats_log = Some(PathBuf::from(value));
		}
		if let Ok(value) = std::env::var("CACHR_MSVC_DEP_PREFIX") {
			self.msvc_dep_prefix = value;
		}
	}

	pub fn validate(&self) -> Result<(), CacheError> {
		if self.cache_dir.as_os_str().is_empty() {
			return Err(CacheError::Fatal { message: "cache directory must be set".to_string() });
		}
		if self.namespace.len() > 255 {
			return Err(CacheError::Fatal {
				message: "namespace must fit in 255 bytes".to_string(),
			});
		}
		if self.manifest_max_entries == 0 {
			return Err(CacheError::Fatal {
				message: "manifestMaxEntries must be at least 1".to_string(),
			});
		}
		Ok(())
	}

	/// The codec stored entries are written with
	pub fn compression_type(&self) -> CompressionType {
		if self.compression {
			CompressionType::Zstd
		} else {
			CompressionType::None
		}
	}
}

fn parse_bool(value: &str) -> bool {
	matches!(value.trim(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn test_defaults() {
		let config = Config::default();
		assert!(config.direct_mode);
		assert!(config.compression);
		assert_eq!(config.compression_type(), CompressionType::Zstd);
		assert_eq!(config.compiler_check, CompilerCheck::Content);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_toml_roundtrip() {
		let config = Config::default();
		let text = toml::to_string(&config).unwrap();
		let reread: Config = toml::from_str(&text).unwrap();
		assert_eq!(reread.max_size, config.max_size);
		assert_eq!(reread.sloppiness, config.sloppiness);
	}

	#[test]
	fn test_load_toml_file() {
		let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		writeln!(
			file,
			"cacheDir = \"/var/cache/cachr\"\nmaxSize = 1024\nsloppiness = \"time_macros\"\ncompression = false"
		)
		.unwrap();
		file.flush().unwrap();

		let config = Config::load_file(file.path()).unwrap();
		assert_eq!(config.cache_dir, PathBuf::from("/var/cache/cachr"));
		assert_eq!(config.max_size, 1024);
		assert!(!config.compression);
		assert_eq!(config.compression_type(), CompressionType::None);
		assert!(config.sloppiness.is_enabled(crate::sloppiness::Sloppy::TimeMacros));
		// Unset fields keep their defaults.
		assert!(config.direct_mode);
	}

	#[test]
	fn test_load_json_file() {
		let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
		writeln!(file, "{{\"maxFiles\": 42, \"namespace\": \"ci\"}}").unwrap();
		file.flush().unwrap();

		let config = Config::load_file(file.path()).unwrap();
		assert_eq!(config.max_files, 42);
		assert_eq!(config.namespace, "ci");
	}

	#[test]
	fn test_invalid_file_is_fatal() {
		let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		writeln!(file, "maxSize = \"not a size").unwrap();
		file.flush().unwrap();
		assert!(matches!(Config::load_file(file.path()), Err(CacheError::Fatal { .. })));
	}

	#[test]
	fn test_parse_bool() {
		assert!(parse_bool("1"));
		assert!(parse_bool("true"));
		assert!(!parse_bool("0"));
		assert!(!parse_bool("false"));
		assert!(!parse_bool("maybe"));
	}
}

// vim: ts=4
