//! On-disk cache entry framing shared by manifests and results
//!
//! Every cache file starts with a self-describing header, followed by the
//! (possibly compressed) payload and a 16-byte XXH3-128 checksum of the
//! uncompressed header+payload bytes. The header itself is never
//! compressed so that inspection tools can classify entries cheaply.

use std::convert::TryFrom;
use std::time::{SystemTime, UNIX_EPOCH};
use xxhash_rust::xxh3::Xxh3;

use crate::compress::{self, CompressionType, Compressor};
use crate::error::CacheError;
use crate::util::{ByteReader, ByteWriter};

pub const MAGIC: [u8; 4] = *b"cChR";
pub const FORMAT_VERSION: u8 = 1;

const CHECKSUM_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
	Manifest = 0,
	Result = 1,
}

impl EntryType {
	/// Filename suffix of entries of this type
	pub fn suffix(&self) -> char {
		match self {
			EntryType::Manifest => 'M',
			EntryType::Result => 'R',
		}
	}
}

impl TryFrom<u8> for EntryType {
	type Error = CacheError;

	fn try_from(value: u8) -> Result<Self, CacheError> {
		match value {
			0 => Ok(EntryType::Manifest),
			1 => Ok(EntryType::Result),
			other => {
				Err(CacheError::CorruptEntry { message: format!("unknown entry type {}", other) })
			}
		}
	}
}

/// Parsed form of the fixed entry header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
	pub entry_type: EntryType,
	pub compression_type: CompressionType,
	pub compression_level: i8,
	pub creation_time: u64,
	pub producer_version: String,
	pub namespace: String,
	pub entry_size: u64,
}

impl Header {
	fn serialize(&self) -> Vec<u8> {
		let mut out = Vec::new();
		let mut writer = ByteWriter::new(&mut out);
		writer.write_bytes(&MAGIC);
		writer.write_u8(FORMAT_VERSION);
		writer.write_u8(self.entry_type as u8);
		writer.write_u8(self.compression_type as u8);
		writer.write_i8(self.compression_level);
		writer.write_u64(self.creation_time);
		writer.write_u8(self.producer_version.len() as u8);
		writer.write_str(&self.producer_version);
		writer.write_u8(self.namespace.len() as u8);
		writer.write_str(&self.namespace);
		writer.write_u64(self.entry_size);
		out
	}
}

fn now_epoch_seconds() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Serialize `payload` into the full on-disk byte stream
pub fn serialize(
	payload: &[u8],
	entry_type: EntryType,
	compression_type: CompressionType,
	compression_level: i8,
	namespace: &str,
) -> Result<Vec<u8>, CacheError> {
	serialize_at(payload, entry_type, compression_type, compression_level, namespace, now_epoch_seconds())
}

/// Like `serialize` but with an explicit creation time, used by the
/// recompression walk to preserve the original header timestamp
pub fn serialize_at(
	payload: &[u8],
	entry_type: EntryType,
	compression_type: CompressionType,
	compression_level: i8,
	namespace: &str,
	creation_time: u64,
) -> Result<Vec<u8>, CacheError> {
	let header = Header {
		entry_type,
		compression_type,
		compression_level,
		creation_time,
		producer_version: env!("CARGO_PKG_VERSION").to_string(),
		namespace: namespace.to_string(),
		entry_size: payload.len() as u64,
	};
	let header_bytes = header.serialize();

	// The checksum observes the bytes before compression.
	let mut checksum = Xxh3::new();
	checksum.update(&header_bytes);
	checksum.update(payload);

	let mut compressor = Compressor::new(compression_type, compression_level)?;
	compressor.write(payload)?;
	let compressed = compressor.finalize()?;

	let mut out = header_bytes;
	out.extend_from_slice(&compressed);
	out.extend_from_slice(&checksum.digest128().to_be_bytes());
	Ok(out)
}

/// Parse and verify an on-disk entry, returning its header and payload
///
/// The checksum is verified before the payload is handed to any caller;
/// a mismatch is reported as `CorruptEntry` and the caller is expected to
/// evict the file.
pub fn read(data: &[u8]) -> Result<(Header, Vec<u8>), CacheError> {
	let mut reader = ByteReader::new(data);

	let magic = reader.read_bytes(4)?;
	if magic != MAGIC {
		return Err(CacheError::CorruptEntry { message: "bad magic bytes".to_string() });
	}
	let format_version = reader.read_u8()?;
	if format_version != FORMAT_VERSION {
		return Err(CacheError::CorruptEntry {
			message: format!("unknown entry format version {}", format_version),
		});
	}
	let entry_type = EntryType::try_from(reader.read_u8()?)?;
	let compression_type = CompressionType::try_from(reader.read_u8()?)?;
	let compression_level = reader.read_i8()?;
	let creation_time = reader.read_u64()?;
	let version_length = reader.read_u8()? as usize;
	let producer_version = reader.read_str(version_length)?;
	let namespace_length = reader.read_u8()? as usize;
	let namespace = reader.read_str(namespace_length)?;
	let entry_size = reader.read_u64()?;

	let header = Header {
		entry_type,
		compression_type,
		compression_level,
		creation_time,
		producer_version,
		namespace,
		entry_size,
	};

	let header_len = data.len() - reader.remaining();
	if reader.remaining() < CHECKSUM_SIZE {
		return Err(CacheError::CorruptEntry { message: "entry truncated".to_string() });
	}
	let compressed = reader.read_bytes(reader.remaining() - CHECKSUM_SIZE)?;
	let mut stored_checksum = [0u8; CHECKSUM_SIZE];
	stored_checksum.copy_from_slice(reader.read_bytes(CHECKSUM_SIZE)?);

	let payload = compress::decompress(compressed, header.compression_type, header.entry_size)?;

	let mut checksum = Xxh3::new();
	checksum.update(&data[..header_len]);
	checksum.update(&payload);
	if checksum.digest128().to_be_bytes() != stored_checksum {
		return Err(CacheError::CorruptEntry { message: "checksum mismatch".to_string() });
	}

	Ok((header, payload))
}


// vim: ts=4
