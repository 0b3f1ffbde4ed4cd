//! Manifest entries: the bridge from a direct-mode key to a result key
//!
//! A manifest remembers which include files the compiler read when a result
//! was produced, together with a fingerprint of each file. A later lookup
//! with the same direct-mode key walks the entries in order and returns the
//! result key of the first entry whose fingerprints still match the
//! filesystem.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::CacheError;
use crate::hash::{self, Digest, DIGEST_SIZE};
use crate::logging::*;
use crate::sloppiness::{Sloppiness, Sloppy};
use crate::util::{ByteReader, ByteWriter};

pub const MANIFEST_VERSION: u8 = 1;

/// Default bound on entries per manifest; the oldest entry is dropped when
/// the bound is reached
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Fingerprint data for one include file as observed at store time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
	pub digest: Digest,
	pub fsize: u64,
	pub mtime: i64,
	pub ctime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileInfo {
	path_index: u32,
	fingerprint: FileFingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ManifestEntry {
	sloppiness: u32,
	file_info_indexes: Vec<u32>,
	result_key: Digest,
}

/// One manifest: an append-only, bounded list of fingerprint sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
	files: Vec<String>,
	file_infos: Vec<FileInfo>,
	entries: Vec<ManifestEntry>,
}

impl Manifest {
	pub fn new() -> Self {
		Manifest::default()
	}

	pub fn entry_count(&self) -> usize {
		self.entries.len()
	}

	/// Walk the entries in order and return the result key of the first
	/// entry whose include files all still match the filesystem.
	///
	/// An entry only qualifies when the current sloppiness set covers the
	/// set the entry was written under. Stat or read errors on an include
	/// file count as a mismatch for that entry, never as a cache error.
	pub fn look_up_result(&self, sloppiness: Sloppiness) -> Option<Digest> {
		// Files are commonly shared between entries; remember per-file
		// verdicts so each file is examined once per lookup.
		let mut verdicts: HashMap<u32, bool> = HashMap::new();

		for entry in &self.entries {
			if !sloppiness.covers(Sloppiness::from_bitmask(entry.sloppiness)) {
				continue;
			}
			let all_match = entry.file_info_indexes.iter().all(|&index| {
				let info = &self.file_infos[index as usize];
				*verdicts
					.entry(index)
					.or_insert_with(|| fingerprint_matches(&self.files[info.path_index as usize], &info.fingerprint, sloppiness))
			});
			if all_match {
				return Some(entry.result_key);
			}
		}
		None
	}

	/// Append an entry mapping the given include files to `result_key`.
	///
	/// Duplicate paths within the new entry collapse to one fingerprint
	/// (last wins). When the manifest exceeds `max_entries` the oldest
	/// entry is dropped and unreferenced file infos are garbage collected.
	pub fn add_entry(
		&mut self,
		result_key: Digest,
		sloppiness: Sloppiness,
		files: &[(String, FileFingerprint)],
	) {
		self.add_entry_bounded(result_key, sloppiness, files, DEFAULT_MAX_ENTRIES)
	}

	pub fn add_entry_bounded(
		&mut self,
		result_key: Digest,
		sloppiness: Sloppiness,
		files: &[(String, FileFingerprint)],
		max_entries: usize,
	) {
		let mut path_to_info: HashMap<&str, u32> = HashMap::new();
		for (path, fingerprint) in files {
			let index = self.intern_file_info(path, *fingerprint);
			path_to_info.insert(path.as_str(), index);
		}
		let mut file_info_indexes: Vec<u32> = path_to_info.values().copied().collect();
		file_info_indexes.sort_unstable();

		self.entries.push(ManifestEntry {
			sloppiness: sloppiness.to_bitmask(),
			file_info_indexes,
			result_key,
		});

		while self.entries.len() > max_entries.max(1) {
			self.entries.remove(0);
		}
		self.compact();
	}

	fn intern_file_info(&mut self, path: &str, fingerprint: FileFingerprint) -> u32 {
		if let Some(path_index) = self.files.iter().position(|p| p == path) {
			let path_index = path_index as u32;
			if let Some(index) = self
				.file_infos
				.iter()
				.position(|info| info.path_index == path_index && info.fingerprint == fingerprint)
			{
				return index as u32;
			}
			self.file_infos.push(FileInfo { path_index, fingerprint });
		} else {
			self.files.push(path.to_string());
			let path_index = (self.files.len() - 1) as u32;
			self.file_infos.push(FileInfo { path_index, fingerprint });
		}
		(self.file_infos.len() - 1) as u32
	}

	/// Drop file infos and paths no longer referenced by any entry,
	/// remapping indices
	fn compact(&mut self) {
		let old_files = std::mem::take(&mut self.files);
		let old_infos = std::mem::take(&mut self.file_infos);
		let mut info_map: HashMap<u32, u32> = HashMap::new();
		let mut path_map: HashMap<u32, u32> = HashMap::new();

		for entry in &mut self.entries {
			for index in &mut entry.file_info_indexes {
				let new_index = match info_map.get(index) {
					Some(mapped) => *mapped,
					None => {
						let info = &old_infos[*index as usize];
						let new_path_index = match path_map.get(&info.path_index) {
							Some(mapped) => *mapped,
							None => {
								self.files.push(old_files[info.path_index as usize].clone());
								let mapped = (self.files.len() - 1) as u32;
								path_map.insert(info.path_index, mapped);
								mapped
							}
						};
						self.file_infos.push(FileInfo {
							path_index: new_path_index,
							fingerprint: info.fingerprint,
						});
						let mapped = (self.file_infos.len() - 1) as u32;
						info_map.insert(*index, mapped);
						mapped
					}
				};
				*index = new_index;
			}
		}
	}

	pub fn serialize(&self) -> Vec<u8> {
		let mut out = Vec::new();
		let mut writer = ByteWriter::new(&mut out);
		writer.write_u8(MANIFEST_VERSION);

		writer.write_u32(self.files.len() as u32);
		for path in &self.files {
			writer.write_u16(path.len() as u16);
			writer.write_str(path);
		}

		writer.write_u32(self.file_infos.len() as u32);
		for info in &self.file_infos {
			writer.write_u32(info.path_index);
			writer.write_bytes(info.fingerprint.digest.as_bytes());
			writer.write_u64(info.fingerprint.fsize);
			writer.write_i64(info.fingerprint.mtime);
			writer.write_i64(info.fingerprint.ctime);
		}

		writer.write_u32(self.entries.len() as u32);
		for entry in &self.entries {
			writer.write_u32(entry.sloppiness);
			writer.write_u32(entry.file_info_indexes.len() as u32);
			for index in &entry.file_info_indexes {
				writer.write_u32(*index);
			}
			writer.write_bytes(entry.result_key.as_bytes());
		}
		out
	}

	pub fn read(payload: &[u8]) -> Result<Self, CacheError> {
		let mut reader = ByteReader::new(payload);
		let version = reader.read_u8()?;
		if version != MANIFEST_VERSION {
			return Err(CacheError::CorruptEntry {
				message: format!("unknown manifest format version {}", version),
			});
		}

		let file_count = reader.read_u32()? as usize;
		let mut files = Vec::with_capacity(file_count.min(1024));
		for _ in 0..file_count {
			let length = reader.read_u16()? as usize;
			files.push(reader.read_str(length)?);
		}

		let info_count = reader.read_u32()? as usize;
		let mut file_infos = Vec::with_capacity(info_count.min(1024));
		for _ in 0..info_count {
			let path_index = reader.read_u32()?;
			if path_index as usize >= files.len() {
				return Err(CacheError::CorruptEntry {
					message: format!("file info references path {} of {}", path_index, files.len()),
				});
			}
			let mut digest = [0u8; DIGEST_SIZE];
			digest.copy_from_slice(reader.read_bytes(DIGEST_SIZE)?);
			let fsize = reader.read_u64()?;
			let mtime = reader.read_i64()?;
			let ctime = reader.read_i64()?;
			file_infos.push(FileInfo {
				path_index,
				fingerprint: FileFingerprint {
					digest: Digest::from_bytes(digest),
					fsize,
					mtime,
					ctime,
				},
			});
		}

		let entry_count = reader.read_u32()? as usize;
		let mut entries = Vec::with_capacity(entry_count.min(1024));
		for _ in 0..entry_count {
			let sloppiness = reader.read_u32()?;
			let index_count = reader.read_u32()? as usize;
			let mut file_info_indexes = Vec::with_capacity(index_count.min(1024));
			for _ in 0..index_count {
				let index = reader.read_u32()?;
				if index as usize >= file_infos.len() {
					return Err(CacheError::CorruptEntry {
						message: format!(
							"entry references file info {} of {}",
							index,
							file_infos.len()
						),
					});
				}
				file_info_indexes.push(index);
			}
			let mut key = [0u8; DIGEST_SIZE];
			key.copy_from_slice(reader.read_bytes(DIGEST_SIZE)?);
			entries.push(ManifestEntry {
				sloppiness,
				file_info_indexes,
				result_key: Digest::from_bytes(key),
			});
		}

		if reader.remaining() != 0 {
			return Err(CacheError::CorruptEntry {
				message: format!("{} trailing bytes after manifest payload", reader.remaining()),
			});
		}

		Ok(Manifest { files, file_infos, entries })
	}
}

/// Take the fingerprint of a file as it exists right now
pub fn fingerprint_file(path: &Path) -> Result<FileFingerprint, CacheError> {
	let metadata = fs::metadata(path)
		.map_err(|e| CacheError::io(format!("fingerprinting {}", path.display()), e))?;
	let digest = hash::digest_of_file(path)
		.map_err(|e| CacheError::io(format!("hashing {}", path.display()), e))?;
	Ok(FileFingerprint {
		digest,
		fsize: metadata.len(),
		mtime: mtime_of(&metadata),
		ctime: ctime_of(&metadata),
	})
}

fn mtime_of(metadata: &fs::Metadata) -> i64 {
	filetime::FileTime::from_last_modification_time(metadata).unix_seconds()
}

#[cfg(unix)]
fn ctime_of(metadata: &fs::Metadata) -> i64 {
	use std::os::unix::fs::MetadataExt;
	metadata.ctime()
}

#[cfg(not(unix))]
fn ctime_of(_metadata: &fs::Metadata) -> i64 {
	0
}

fn fingerprint_matches(path: &str, stored: &FileFingerprint, sloppiness: Sloppiness) -> bool {
	let metadata = match fs::metadata(path) {
		Ok(m) => m,
		Err(e) => {
			debug!("stat of {} failed during manifest lookup: {}", path, e);
			return false;
		}
	};
	if metadata.len() != stored.fsize {
		return false;
	}
	if sloppiness.is_enabled(Sloppy::FileStatMatches) {
		if mtime_of(&metadata) != stored.mtime {
			return false;
		}
		if !sloppiness.is_enabled(Sloppy::FileStatMatchesCtime) && ctime_of(&metadata) != stored.ctime
		{
			return false;
		}
		return true;
	}
	match hash::digest_of_file(Path::new(path)) {
		Ok(digest) => digest == stored.digest,
		Err(e) => {
			debug!("hashing {} failed during manifest lookup: {}", path, e);
			false
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::TempDir;

	fn key(byte: u8) -> Digest {
		Digest::from_bytes([byte; DIGEST_SIZE])
	}

	fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> String {
		let path = dir.path().join(name);
		let mut file = fs::File::create(&path).unwrap();
		file.write_all(contents).unwrap();
		path.to_string_lossy().into_owned()
	}

	#[test]
	fn test_serialize_roundtrip() {
		let dir = TempDir::new().unwrap();
		let first = write_file(&dir, "a.h", b"#define A 1\n");
		let second = write_file(&dir, "b.h", b"#define B 2\n");

		let mut manifest = Manifest::new();
		manifest.add_entry(
			key(1),
			Sloppiness::new(),
			&[
				(first.clone(), fingerprint_file(Path::new(&first)).unwrap()),
				(second.clone(), fingerprint_file(Path::new(&second)).unwrap()),
			],
		);
		manifest.add_entry(
			key(2),
			Sloppiness::parse("file_stat_matches").unwrap(),
			&[(first.clone(), fingerprint_file(Path::new(&first)).unwrap())],
		);

		let reread = Manifest::read(&manifest.serialize()).unwrap();
		assert_eq!(reread, manifest);
	}

	#[test]
	fn test_lookup_content_match() {
		let dir = TempDir::new().unwrap();
		let header = write_file(&dir, "a.h", b"#define A 1\n");
		let fingerprint = fingerprint_file(Path::new(&header)).unwrap();

		let mut manifest = Manifest::new();
		manifest.add_entry(key(1), Sloppiness::new(), &[(header.clone(), fingerprint)]);

		assert_eq!(manifest.look_up_result(Sloppiness::new()), Some(key(1)));

		// Same size, different contents: digest comparison must miss.
		fs::write(&header, b"#define A 2\n").unwrap();
		assert_eq!(manifest.look_up_result(Sloppiness::new()), None);
	}

	#[test]
	fn test_lookup_missing_file_is_mismatch_not_error() {
		let dir = TempDir::new().unwrap();
		let header = write_file(&dir, "gone.h", b"x");
		let fingerprint = fingerprint_file(Path::new(&header)).unwrap();

		let mut manifest = Manifest::new();
		manifest.add_entry(key(1), Sloppiness::new(), &[(header.clone(), fingerprint)]);
		fs::remove_file(&header).unwrap();

		assert_eq!(manifest.look_up_result(Sloppiness::new()), None);
	}

	#[test]
	fn test_lookup_stat_mode() {
		let dir = TempDir::new().unwrap();
		let header = write_file(&dir, "a.h", b"#define A 1\n");
		let fingerprint = fingerprint_file(Path::new(&header)).unwrap();
		let stat_sloppiness = Sloppiness::parse("file_stat_matches,file_stat_matches_ctime").unwrap();

		let mut manifest = Manifest::new();
		manifest.add_entry(key(1), stat_sloppiness, &[(header.clone(), fingerprint)]);

		assert_eq!(manifest.look_up_result(stat_sloppiness), Some(key(1)));

		// Same size and contents but a different mtime: stat mode must miss.
		filetime::set_file_mtime(&header, filetime::FileTime::from_unix_time(1000, 0)).unwrap();
		assert_eq!(manifest.look_up_result(stat_sloppiness), None);
	}

	#[test]
	fn test_sloppiness_subset_rule() {
		let dir = TempDir::new().unwrap();
		let header = write_file(&dir, "a.h", b"contents");
		let fingerprint = fingerprint_file(Path::new(&header)).unwrap();
		let written_under = Sloppiness::parse("time_macros").unwrap();

		let mut manifest = Manifest::new();
		manifest.add_entry(key(1), written_under, &[(header, fingerprint)]);

		// Current set covers the written set: eligible.
		assert_eq!(manifest.look_up_result(written_under), Some(key(1)));
		let wider = Sloppiness::parse("time_macros,locale").unwrap();
		assert_eq!(manifest.look_up_result(wider), Some(key(1)));

		// Current set does not cover the written set: entry skipped.
		assert_eq!(manifest.look_up_result(Sloppiness::new()), None);
	}

	#[test]
	fn test_first_matching_entry_wins() {
		let dir = TempDir::new().unwrap();
		let stable = write_file(&dir, "stable.h", b"stable");
		let changing = write_file(&dir, "changing.h", b"before");
		let stable_fp = fingerprint_file(Path::new(&stable)).unwrap();
		let changing_fp = fingerprint_file(Path::new(&changing)).unwrap();

		let mut manifest = Manifest::new();
		manifest.add_entry(key(1), Sloppiness::new(), &[(changing.clone(), changing_fp)]);
		manifest.add_entry(key(2), Sloppiness::new(), &[(stable.clone(), stable_fp)]);

		assert_eq!(manifest.look_up_result(Sloppiness::new()), Some(key(1)));

		fs::write(&changing, b"after!").unwrap();
		assert_eq!(manifest.look_up_result(Sloppiness::new()), Some(key(2)));
	}

	#[test]
	fn test_oldest_entry_dropped_at_bound() {
		let dir = TempDir::new().unwrap();
		let header = write_file(&dir, "a.h", b"contents");
		let fingerprint = fingerprint_file(Path::new(&header)).unwrap();

		let mut manifest = Manifest::new();
		for i in 0..5 {
			manifest.add_entry_bounded(
				key(i),
				Sloppiness::new(),
				&[(header.clone(), fingerprint)],
				3,
			);
		}
		assert_eq!(manifest.entry_count(), 3);
		// Entries 0 and 1 were dropped; the first remaining entry is 2.
		assert_eq!(manifest.look_up_result(Sloppiness::new()), Some(key(2)));
	}

	#[test]
	fn test_duplicate_paths_collapse_within_entry() {
		let dir = TempDir::new().unwrap();
		let header = write_file(&dir, "a.h", b"contents");
		let fingerprint = fingerprint_file(Path::new(&header)).unwrap();

		let mut manifest = Manifest::new();
		manifest.add_entry(
			key(1),
			Sloppiness::new(),
			&[(header.clone(), fingerprint), (header.clone(), fingerprint)],
		);

		let reread = Manifest::read(&manifest.serialize()).unwrap();
		assert_eq!(reread.entries[0].file_info_indexes.len(), 1);
	}

	#[test]
	fn test_corrupt_index_rejected() {
		let dir = TempDir::new().unwrap();
		let header = write_file(&dir, "a.h", b"contents");
		let fingerprint = fingerprint_file(Path::new(&header)).unwrap();

		let mut manifest = Manifest::new();
		manifest.add_entry(key(1), Sloppiness::new(), &[(header, fingerprint)]);
		let mut bytes = manifest.serialize();
		// The path-index field of the single file info directly follows the
		// path table; point it out of range.
		let path_table_len = 1 + 4 + 2 + manifest.files[0].len() + 4;
		bytes[path_table_len] = 0xff;
		assert!(Manifest::read(&bytes).is_err());
	}
}

// vim: ts=4
