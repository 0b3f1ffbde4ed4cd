//! Parsing of MSVC /showIncludes output
//!
//! /showIncludes output is written to stdout together with other messages.
//! Every line of it is "<prefix> <spaces> <file>" where the prefix is
//! "Note: including file:" in English but can be localized.

/// The prefix cl.exe emits in an English locale
pub const DEFAULT_PREFIX: &str = "Note: including file:";

/// Extract the include paths from `stdout_data`
///
/// Lines are split on both \r and \n; empty fragments are skipped. The
/// prefix is stripped, then leading whitespace, and whatever remains is the
/// path. Non-UTF-8 output yields no includes.
pub fn parse<'a>(stdout_data: &'a [u8], prefix: &str) -> Vec<&'a str> {
	let text = match std::str::from_utf8(stdout_data) {
		Ok(text) => text,
		Err(_) => return Vec::new(),
	};
	let mut result = Vec::new();
	for line in text.split(|c| c == '\r' || c == '\n') {
		if let Some(rest) = line.strip_prefix(prefix) {
			let include = rest.trim_start();
			if !include.is_empty() {
				result.push(include);
			}
		}
	}
	result
}

/// Remove the /showIncludes lines from captured stdout so that only real
/// compiler messages are forwarded to the caller
pub fn strip(stdout_data: &[u8], prefix: &str) -> Vec<u8> {
	let text = match std::str::from_utf8(stdout_data) {
		Ok(text) => text,
		Err(_) => return stdout_data.to_vec(),
	};
	let mut out = Vec::with_capacity(stdout_data.len());
	for line in text.split_inclusive('\n') {
		if !line.starts_with(prefix) {
			out.extend_from_slice(line.as_bytes());
		}
	}
	out
}


// vim: ts=4
