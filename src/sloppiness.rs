//! Opt-in relaxations of the cache's exactness requirements

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A single relaxation flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Sloppy {
	IncludeFileMtime = 1 << 0,
	IncludeFileCtime = 1 << 1,
	TimeMacros = 1 << 2,
	PchDefines = 1 << 3,
	/// Match include files on their stats (size, mtime, ctime) without
	/// looking at their contents
	FileStatMatches = 1 << 4,
	/// Leave system headers out of the manifest include files, similar to
	/// -MM versus -M for dependencies
	SystemHeaders = 1 << 5,
	/// Ignore ctimes when comparing file stats, so mtimes can be faked
	FileStatMatchesCtime = 1 << 6,
	/// Leave the -index-store-path option out of the manifest hash
	ClangIndexStore = 1 << 7,
	/// Ignore locale settings
	Locale = 1 << 8,
	/// Allow caching even if -fmodules is used
	Modules = 1 << 9,
	/// Ignore virtual file system (VFS) overlay file
	Ivfsoverlay = 1 << 10,
	/// Accept an incorrect working directory in .gcno files
	GcnoCwd = 1 << 11,
	/// Ignore -frandom-seed=*string*
	RandomSeed = 1 << 12,
	/// Sloppy handling of incbin directives
	Incbin = 1 << 13,
}

const ALL_FLAGS: &[(Sloppy, &str)] = &[
	(Sloppy::IncludeFileMtime, "include_file_mtime"),
	(Sloppy::IncludeFileCtime, "include_file_ctime"),
	(Sloppy::TimeMacros, "time_macros"),
	(Sloppy::PchDefines, "pch_defines"),
	(Sloppy::FileStatMatches, "file_stat_matches"),
	(Sloppy::SystemHeaders, "system_headers"),
	(Sloppy::FileStatMatchesCtime, "file_stat_matches_ctime"),
	(Sloppy::ClangIndexStore, "clang_index_store"),
	(Sloppy::Locale, "locale"),
	(Sloppy::Modules, "modules"),
	(Sloppy::Ivfsoverlay, "ivfsoverlay"),
	(Sloppy::GcnoCwd, "gcno_cwd"),
	(Sloppy::RandomSeed, "random_seed"),
	(Sloppy::Incbin, "incbin"),
];

/// Bitset of `Sloppy` flags in effect for a build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sloppiness(u32);

impl Sloppiness {
	pub fn new() -> Self {
		Sloppiness(0)
	}

	pub fn from_bitmask(mask: u32) -> Self {
		Sloppiness(mask)
	}

	pub fn to_bitmask(self) -> u32 {
		self.0
	}

	pub fn enable(&mut self, flag: Sloppy) {
		self.0 |= flag as u32;
	}

	pub fn is_enabled(self, flag: Sloppy) -> bool {
		self.0 & flag as u32 != 0
	}

	/// Whether this set is a superset of `other` — a manifest entry written
	/// under sloppiness `other` may only be matched when the current set
	/// covers every relaxation that was in effect at write time
	pub fn covers(self, other: Sloppiness) -> bool {
		self.0 & other.0 == other.0
	}

	/// Parse a comma- or space-separated flag list like
	/// "file_stat_matches,time_macros"
	pub fn parse(text: &str) -> Result<Self, String> {
		let mut result = Sloppiness::new();
		for word in text.split(|c: char| c == ',' || c.is_whitespace()) {
			let word = word.trim();
			if word.is_empty() {
				continue;
			}
			match ALL_FLAGS.iter().find(|(_, name)| *name == word) {
				Some((flag, _)) => result.enable(*flag),
				None => return Err(format!("unknown sloppiness: {}", word)),
			}
		}
		Ok(result)
	}
}

impl fmt::Display for Sloppiness {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut first = true;
		for (flag, name) in ALL_FLAGS {
			if self.is_enabled(*flag) {
				if !first {
					write!(f, ",")?;
				}
				write!(f, "{}", name)?;
				first = false;
			}
		}
		Ok(())
	}
}

impl Serialize for Sloppiness {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for Sloppiness {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let text = String::deserialize(deserializer)?;
		Sloppiness::parse(&text).map_err(D::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_enable_and_query() {
		let mut sloppiness = Sloppiness::new();
		assert!(!sloppiness.is_enabled(Sloppy::TimeMacros));
		sloppiness.enable(Sloppy::TimeMacros);
		assert!(sloppiness.is_enabled(Sloppy::TimeMacros));
		assert!(!sloppiness.is_enabled(Sloppy::Locale));
	}

	#[test]
	fn test_parse_and_format_roundtrip() {
		let parsed = Sloppiness::parse("file_stat_matches, time_macros").unwrap();
		assert!(parsed.is_enabled(Sloppy::FileStatMatches));
		assert!(parsed.is_enabled(Sloppy::TimeMacros));
		assert_eq!(Sloppiness::parse(&parsed.to_string()).unwrap(), parsed);
	}

	#[test]
	fn test_parse_unknown_flag() {
		assert!(Sloppiness::parse("no_such_flag").is_err());
	}

	#[test]
	fn test_subset_rule() {
		let written = Sloppiness::parse("file_stat_matches").unwrap();
		let wider = Sloppiness::parse("file_stat_matches,time_macros").unwrap();
		let disjoint = Sloppiness::parse("time_macros").unwrap();

		assert!(wider.covers(written));
		assert!(written.covers(written));
		assert!(!disjoint.covers(written));
		assert!(!written.covers(wider));
	}

	#[test]
	fn test_bitmask_roundtrip() {
		let sloppiness = Sloppiness::parse("pch_defines,incbin").unwrap();
		assert_eq!(Sloppiness::from_bitmask(sloppiness.to_bitmask()), sloppiness);
	}
}

// vim: ts=4
