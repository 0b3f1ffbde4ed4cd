//! Streaming hash primitives and the digest type used for cache keys
//!
//! Keys are derived from an absorbing XXH3-128 state. The state can be
//! forked (cloned) so that the direct-mode and preprocessor-mode keys both
//! start from the common hash without re-absorbing the command line.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

/// Number of bytes in a digest; rendered as twice as many hex characters
pub const DIGEST_SIZE: usize = 20;

/// Separator absorbed between logical hash fields so that adjacent fields
/// cannot alias (e.g. "ab" + "c" vs "a" + "bc")
const HASH_DELIMITER: &[u8] = b"\x00cachr\x00";

/// A 20-byte content digest, rendered as 40 lowercase hex characters
///
/// The first 16 bytes are the big-endian XXH3-128 value of the absorbed
/// stream; the remaining 4 bytes extend it with the leading bytes of the
/// XXH3-64 value of those 16 bytes. Two digests compare byte-equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
	pub fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
		Digest(bytes)
	}

	/// Parse a digest from its 40-character hex rendering
	pub fn from_hex(text: &str) -> Result<Self, String> {
		let bytes = hex::decode(text).map_err(|e| format!("invalid digest '{}': {}", text, e))?;
		if bytes.len() != DIGEST_SIZE {
			return Err(format!("invalid digest length: {} bytes", bytes.len()));
		}
		let mut out = [0u8; DIGEST_SIZE];
		out.copy_from_slice(&bytes);
		Ok(Digest(out))
	}

	pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	/// The filesystem key: first two hex characters select the two shard
	/// levels, the rest names the file inside the shard
	pub fn split_key(&self) -> (char, char, String) {
		let hex = self.to_hex();
		let mut chars = hex.chars();
		let l1 = chars.next().unwrap();
		let l2 = chars.next().unwrap();
		(l1, l2, chars.collect())
	}
}

impl fmt::Display for Digest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl fmt::Debug for Digest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Digest({})", self.to_hex())
	}
}

/// Append-only absorbing state of the streaming hash
///
/// `digest()` is idempotent: it observes the current state without
/// consuming or altering it.
#[derive(Clone, Default)]
pub struct Hasher {
	state: Xxh3,
}

impl Hasher {
	pub fn new() -> Self {
		Hasher { state: Xxh3::new() }
	}

	/// Absorb raw bytes
	pub fn update(&mut self, data: &[u8]) -> &mut Self {
		self.state.update(data);
		self
	}

	/// Absorb a UTF-8 string's bytes
	pub fn update_str(&mut self, data: &str) -> &mut Self {
		self.update(data.as_bytes())
	}

	/// Absorb a field separator plus a short tag naming the next field
	pub fn delimiter(&mut self, tag: &str) -> &mut Self {
		self.state.update(HASH_DELIMITER);
		self.state.update(tag.as_bytes());
		self.state.update(&[0]);
		self
	}

	/// Absorb the contents of a file; returns the number of bytes hashed
	pub fn update_from_file(&mut self, path: &Path) -> io::Result<u64> {
		let mut file = File::open(path)?;
		let mut buf = [0u8; 64 * 1024];
		let mut total = 0u64;
		loop {
			let n = file.read(&mut buf)?;
			if n == 0 {
				break;
			}
			self.state.update(&buf[..n]);
			total += n as u64;
		}
		Ok(total)
	}

	/// Produce the digest of everything absorbed so far
	pub fn digest(&self) -> Digest {
		let wide = self.state.digest128().to_be_bytes();
		let tail = xxh3_64(&wide).to_be_bytes();
		let mut out = [0u8; DIGEST_SIZE];
		out[..16].copy_from_slice(&wide);
		out[16..].copy_from_slice(&tail[..4]);
		Digest(out)
	}
}

/// One-shot digest of a byte buffer
pub fn digest_of(data: &[u8]) -> Digest {
	let mut hasher = Hasher::new();
	hasher.update(data);
	hasher.digest()
}

/// One-shot digest of a file's contents
pub fn digest_of_file(path: &Path) -> io::Result<Digest> {
	let mut hasher = Hasher::new();
	hasher.update_from_file(path)?;
	Ok(hasher.digest())
}


// vim: ts=4
