//! Result entry payload: the set of files one compilation produced
//!
//! A result is an ordered list of (file type, payload) pairs. Small
//! payloads are embedded in the entry itself; large ones are stored as raw
//! sidecar files next to the entry so they can be hard-linked into the
//! build tree.

use std::convert::TryFrom;
use std::fmt;

use crate::error::CacheError;
use crate::util::{ByteReader, ByteWriter};

pub const RESULT_VERSION: u8 = 1;

const MARKER_EMBEDDED: u8 = 0;
const MARKER_RAW: u8 = 1;

/// Kinds of files a compiler invocation can produce, at most one of each
/// per result
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FileType {
	Object = 0,
	Dependency = 1,
	Stderr = 2,
	CoverageNotes = 3,
	StackUsage = 4,
	Diagnostic = 5,
	DwarfObject = 6,
	AssemblerListing = 7,
	IncludedPchFile = 8,
}

impl FileType {
	pub fn as_str(&self) -> &'static str {
		match self {
			FileType::Object => "object",
			FileType::Dependency => "dependency",
			FileType::Stderr => "stderr",
			FileType::CoverageNotes => "coverage notes",
			FileType::StackUsage => "stack usage",
			FileType::Diagnostic => "diagnostic",
			FileType::DwarfObject => "DWARF object",
			FileType::AssemblerListing => "assembler listing",
			FileType::IncludedPchFile => "included PCH file",
		}
	}
}

impl TryFrom<u8> for FileType {
	type Error = CacheError;

	fn try_from(value: u8) -> Result<Self, CacheError> {
		match value {
			0 => Ok(FileType::Object),
			1 => Ok(FileType::Dependency),
			2 => Ok(FileType::Stderr),
			3 => Ok(FileType::CoverageNotes),
			4 => Ok(FileType::StackUsage),
			5 => Ok(FileType::Diagnostic),
			6 => Ok(FileType::DwarfObject),
			7 => Ok(FileType::AssemblerListing),
			8 => Ok(FileType::IncludedPchFile),
			other => Err(CacheError::CorruptEntry {
				message: format!("unknown result file type {}", other),
			}),
		}
	}
}

impl fmt::Display for FileType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// Where a file's bytes live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileData {
	/// Bytes inlined in the result entry
	Embedded(Vec<u8>),

	/// Reference to sidecar file number `sidecar` holding `size` bytes
	Raw { sidecar: u8, size: u64 },
}

impl FileData {
	pub fn size(&self) -> u64 {
		match self {
			FileData::Embedded(bytes) => bytes.len() as u64,
			FileData::Raw { size, .. } => *size,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFile {
	pub file_type: FileType,
	pub data: FileData,
}

/// In-memory form of a result entry payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultData {
	files: Vec<ResultFile>,
}

impl ResultData {
	pub fn new() -> Self {
		ResultData { files: Vec::new() }
	}

	pub fn files(&self) -> &[ResultFile] {
		&self.files
	}

	pub fn get(&self, file_type: FileType) -> Option<&ResultFile> {
		self.files.iter().find(|f| f.file_type == file_type)
	}

	/// Add a file, replacing any previous file of the same type so that
	/// each type appears at most once
	pub fn add(&mut self, file_type: FileType, data: FileData) {
		self.files.retain(|f| f.file_type != file_type);
		self.files.push(ResultFile { file_type, data });
	}

	/// Sidecar numbers referenced by raw files, in payload order
	pub fn raw_sidecars(&self) -> Vec<u8> {
		self.files
			.iter()
			.filter_map(|f| match f.data {
				FileData::Raw { sidecar, .. } => Some(sidecar),
				FileData::Embedded(_) => None,
			})
			.collect()
	}

	pub fn serialize(&self) -> Vec<u8> {
		let mut out = Vec::new();
		let mut writer = ByteWriter::new(&mut out);
		writer.write_u8(RESULT_VERSION);
		writer.write_u8(self.files.len() as u8);
		for file in &self.files {
			match &file.data {
				FileData::Embedded(bytes) => {
					writer.write_u8(MARKER_EMBEDDED);
					writer.write_u8(file.file_type as u8);
					writer.write_u64(bytes.len() as u64);
					writer.write_bytes(bytes);
				}
				FileData::Raw { sidecar, size } => {
					writer.write_u8(MARKER_RAW);
					writer.write_u8(file.file_type as u8);
					writer.write_u64(*size);
					writer.write_u8(*sidecar);
				}
			}
		}
		out
	}

	pub fn read(payload: &[u8]) -> Result<Self, CacheError> {
		let mut reader = ByteReader::new(payload);
		let version = reader.read_u8()?;
		if version != RESULT_VERSION {
			return Err(CacheError::CorruptEntry {
				message: format!("unknown result format version {}", version),
			});
		}
		let count = reader.read_u8()?;
		let mut result = ResultData::new();
		for _ in 0..count {
			let marker = reader.read_u8()?;
			let file_type = FileType::try_from(reader.read_u8()?)?;
			let size = reader.read_u64()?;
			let data = match marker {
				MARKER_EMBEDDED => FileData::Embedded(reader.read_bytes(size as usize)?.to_vec()),
				MARKER_RAW => FileData::Raw { sidecar: reader.read_u8()?, size },
				other => {
					return Err(CacheError::CorruptEntry {
						message: format!("unknown result file marker {}", other),
					})
				}
			};
			if result.get(file_type).is_some() {
				return Err(CacheError::CorruptEntry {
					message: format!("duplicate {} file in result", file_type),
				});
			}
			result.files.push(ResultFile { file_type, data });
		}
		if reader.remaining() != 0 {
			return Err(CacheError::CorruptEntry {
				message: format!("{} trailing bytes after result payload", reader.remaining()),
			});
		}
		Ok(result)
	}
}


// vim: ts=4
