//! Compression codecs for cache entries
//!
//! Two codecs exist: a pass-through and Zstandard. They share a minimal
//! capability set (write bytes, finalize) and are dispatched by tagged
//! variant; the codec in effect is recorded in each entry's header.

use std::convert::TryFrom;
use std::io::Write;

use crate::error::CacheError;

/// Default Zstandard level used when the configuration does not override it
pub const DEFAULT_COMPRESSION_LEVEL: i8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
	None = 0,
	Zstd = 1,
}

impl TryFrom<u8> for CompressionType {
	type Error = CacheError;

	fn try_from(value: u8) -> Result<Self, CacheError> {
		match value {
			0 => Ok(CompressionType::None),
			1 => Ok(CompressionType::Zstd),
			other => Err(CacheError::CorruptEntry {
				message: format!("unknown compression type {}", other),
			}),
		}
	}
}

/// Streaming compressor writing into an in-memory buffer
pub enum Compressor {
	None(Vec<u8>),
	Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

impl Compressor {
	pub fn new(compression_type: CompressionType, level: i8) -> Result<Self, CacheError> {
		match compression_type {
			CompressionType::None => Ok(Compressor::None(Vec::new())),
			CompressionType::Zstd => {
				let encoder = zstd::stream::write::Encoder::new(Vec::new(), level as i32)
					.map_err(|e| CacheError::io("initializing zstd encoder", e))?;
				Ok(Compressor::Zstd(encoder))
			}
		}
	}

	pub fn write(&mut self, data: &[u8]) -> Result<(), CacheError> {
		match self {
			Compressor::None(buf) => {
				buf.extend_from_slice(data);
				Ok(())
			}
			Compressor::Zstd(encoder) => encoder
				.write_all(data)
				.map_err(|e| CacheError::io("compressing cache entry", e)),
		}
	}

	pub fn finalize(self) -> Result<Vec<u8>, CacheError> {
		match self {
			Compressor::None(buf) => Ok(buf),
			Compressor::Zstd(encoder) => {
				encoder.finish().map_err(|e| CacheError::io("finishing zstd stream", e))
			}
		}
	}
}

/// Decompress `data`, verifying that exactly `expected_size` bytes come out
pub fn decompress(
	data: &[u8],
	compression_type: CompressionType,
	expected_size: u64,
) -> Result<Vec<u8>, CacheError> {
	let payload = match compression_type {
		CompressionType::None => data.to_vec(),
		CompressionType::Zstd => zstd::stream::decode_all(data).map_err(|e| {
			CacheError::CorruptEntry { message: format!("zstd decompression failed: {}", e) }
		})?,
	};
	if payload.len() as u64 != expected_size {
		return Err(CacheError::CorruptEntry {
			message: format!(
				"unexpected payload size: {} bytes instead of {}",
				payload.len(),
				expected_size
			),
		});
	}
	Ok(payload)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip(compression_type: CompressionType, level: i8, data: &[u8]) {
		let mut compressor = Compressor::new(compression_type, level).unwrap();
		compressor.write(data).unwrap();
		let compressed = compressor.finalize().unwrap();
		let restored = decompress(&compressed, compression_type, data.len() as u64).unwrap();
		assert_eq!(restored, data);
	}

	#[test]
	fn test_roundtrip_all_codecs_and_levels() {
		let compressible: Vec<u8> =
			b"The quick brown fox jumps over the lazy dog".repeat(100).to_vec();
		let mut uncompressible = Vec::with_capacity(10000);
		let mut state = 0x2545f4914f6cdd1du64;
		for _ in 0..10000 {
			state ^= state << 13;
			state ^= state >> 7;
			state ^= state << 17;
			uncompressible.push(state as u8);
		}

		for payload in [&compressible, &uncompressible, &Vec::new()] {
			roundtrip(CompressionType::None, 0, payload);
			for level in [-1i8, 1, 3, 9, 19] {
				roundtrip(CompressionType::Zstd, level, payload);
			}
		}
	}

	#[test]
	fn test_split_writes() {
		let mut compressor = Compressor::new(CompressionType::Zstd, 1).unwrap();
		compressor.write(b"foo").unwrap();
		compressor.write(b"bar").unwrap();
		let compressed = compressor.finalize().unwrap();
		assert_eq!(decompress(&compressed, CompressionType::Zstd, 6).unwrap(), b"foobar");
	}

	#[test]
	fn test_size_mismatch_is_corrupt() {
		let mut compressor = Compressor::new(CompressionType::Zstd, 1).unwrap();
		compressor.write(b"foobar").unwrap();
		let compressed = compressor.finalize().unwrap();
		assert!(matches!(
			decompress(&compressed, CompressionType::Zstd, 7),
			Err(CacheError::CorruptEntry { .. })
		));
	}

	#[test]
	fn test_garbage_zstd_is_corrupt() {
		assert!(matches!(
			decompress(b"not a zstd frame", CompressionType::Zstd, 16),
			Err(CacheError::CorruptEntry { .. })
		));
	}

	#[test]
	fn test_unknown_compression_type() {
		assert!(CompressionType::try_from(7).is_err());
		assert_eq!(CompressionType::try_from(1).unwrap(), CompressionType::Zstd);
	}
}

// vim: ts=4
