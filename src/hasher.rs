//! Derivation of cache keys from a parsed compiler invocation
//!
//! All keys grow from the common hash: compiler identity, namespace,
//! format version, output-affecting arguments in canonical order and the
//! allow-listed environment. The direct-mode key extends it with the raw
//! source bytes and everything that influences preprocessing; the
//! preprocessor-mode key extends it with the preprocessed output instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::args::{CompilerKind, ParsedArguments};
use crate::compopt;
use crate::config::{CompilerCheck, Config};
use crate::entry::FORMAT_VERSION;
use crate::error::CacheError;
use crate::hash::{digest_of, digest_of_file, Digest, Hasher};
use crate::sloppiness::Sloppy;

/// Environment variables that may change compiler output regardless of the
/// command line
const OUTPUT_ENV: &[&str] = &["SOURCE_DATE_EPOCH", "GCC_COLORS"];

/// Locale variables; skipped under the locale sloppiness
const LOCALE_ENV: &[&str] = &["LANG", "LC_ALL", "LC_CTYPE", "LC_MESSAGES"];

/// Variables that add include search paths, folded into the direct key
const CPP_ENV: &[&str] = &["CPATH", "C_INCLUDE_PATH", "CPLUS_INCLUDE_PATH", "OBJC_INCLUDE_PATH"];

/// Read-only view of the environment, supplied by the caller
pub trait EnvProvider {
	fn var(&self, name: &str) -> Option<String>;
}

/// The real process environment
pub struct SystemEnv;

impl EnvProvider for SystemEnv {
	fn var(&self, name: &str) -> Option<String> {
		std::env::var(name).ok()
	}
}

impl EnvProvider for HashMap<String, String> {
	fn var(&self, name: &str) -> Option<String> {
		self.get(name).cloned()
	}
}

/// Identity of the compiler binary driving the request
#[derive(Debug, Clone)]
pub struct CompilerInfo {
	pub path: PathBuf,
	pub kind: CompilerKind,
	pub digest: Digest,
}

impl CompilerInfo {
	/// Fingerprint the compiler either by content or, when the user opted
	/// into path checking, by its absolute path
	pub fn discover(path: &Path, kind: CompilerKind, check: CompilerCheck) -> Result<Self, CacheError> {
		let digest = match check {
			CompilerCheck::Content => digest_of_file(path).map_err(|e| {
				CacheError::io(format!("hashing compiler {}", path.display()), e)
			})?,
			CompilerCheck::Path => digest_of(path.to_string_lossy().as_bytes()),
		};
		Ok(CompilerInfo { path: path.to_path_buf(), kind, digest })
	}
}

/// Compute the common hash shared by both lookup modes
pub fn common_hash(
	config: &Config,
	compiler: &CompilerInfo,
	args: &ParsedArguments,
	env: &dyn EnvProvider,
	cwd: &Path,
) -> Hasher {
	let mut hasher = Hasher::new();

	hasher.delimiter("compiler");
	hasher.update(compiler.digest.as_bytes());
	hasher.delimiter("compiler kind");
	hasher.update_str(compiler.kind.as_str());
	hasher.delimiter("namespace");
	hasher.update_str(&config.namespace);
	hasher.delimiter("format");
	hasher.update(&[FORMAT_VERSION]);

	// Output-affecting arguments sorted into canonical table order. An
	// option and its separate value argument travel as one unit; the sort
	// is stable so unknown options keep their command-line order.
	let arguments: Vec<&String> = args.output_affecting_args().collect();
	let mut units: Vec<(usize, usize, &String, Option<&String>)> = Vec::new();
	let mut position = 0;
	while position < arguments.len() {
		let argument = arguments[position];
		let value = if compopt::takes_arg(argument) && position + 1 < arguments.len() {
			position += 1;
			Some(arguments[position])
		} else {
			None
		};
		units.push((compopt::canonical_rank(option_name(argument)), units.len(), argument, value));
		position += 1;
	}
	units.sort();

	for (_, _, argument, value) in units {
		if config.sloppiness.is_enabled(Sloppy::RandomSeed)
			&& argument.starts_with("-frandom-seed=")
		{
			continue;
		}
		hash_argument(&mut hasher, argument, value, cwd);
	}

	hasher.delimiter("env");
	for name in OUTPUT_ENV {
		if let Some(value) = env.var(name) {
			hasher.update_str(name);
			hasher.update_str("=");
			hasher.update_str(&value);
			hasher.update(&[0]);
		}
	}
	if !config.sloppiness.is_enabled(Sloppy::Locale) {
		for name in LOCALE_ENV {
			if let Some(value) = env.var(name) {
				hasher.update_str(name);
				hasher.update_str("=");
				hasher.update_str(&value);
				hasher.update(&[0]);
			}
		}
	}

	if config.hash_dir && args.uses_relative_paths() {
		hasher.delimiter("cwd");
		hasher.update_str(&cwd.to_string_lossy());
	}

	hasher
}

/// Derive the direct-mode key: common state plus the raw source bytes,
/// everything that affects preprocessing and the sloppiness in effect
pub fn direct_mode_key(
	common: &Hasher,
	config: &Config,
	args: &ParsedArguments,
	env: &dyn EnvProvider,
	source_bytes: &[u8],
) -> Digest {
	let mut hasher = common.clone();

	hasher.delimiter("source");
	hasher.update(source_bytes);

	for argument in &args.preprocessor_args {
		hasher.delimiter("cpp arg");
		hasher.update_str(argument);
	}
	for name in CPP_ENV {
		if let Some(value) = env.var(name) {
			hasher.delimiter("cpp env");
			hasher.update_str(name);
			hasher.update_str("=");
			hasher.update_str(&value);
		}
	}

	hasher.delimiter("sloppiness");
	hasher.update(&config.sloppiness.to_bitmask().to_be_bytes());

	hasher.digest()
}

/// Derive the preprocessor-mode key: common state plus the preprocessed
/// source and the compiler-only arguments
pub fn preprocessor_mode_key(
	common: &Hasher,
	args: &ParsedArguments,
	cpp_output: &[u8],
) -> Digest {
	let mut hasher = common.clone();

	hasher.delimiter("cpp output");
	hasher.update(cpp_output);

	for argument in &args.compiler_args {
		hasher.delimiter("compiler arg");
		hasher.update_str(argument);
	}

	hasher.digest()
}

/// The option part of an argument, with concatenated values split off
fn option_name(argument: &str) -> &str {
	match compopt::split_concat(argument) {
		Some((option, _)) => option,
		None => argument,
	}
}

/// Absorb one argument unit. Path-valued options contribute the option
/// name and the path's normalized form, so equal spellings of a path hash
/// equally; everything else is hashed verbatim.
fn hash_argument(hasher: &mut Hasher, argument: &str, value: Option<&String>, cwd: &Path) {
	if let Some((option, concat_value)) = compopt::split_concat(argument) {
		hasher.delimiter("arg");
		hasher.update_str(option);
		if compopt::takes_path(option) {
			hasher.delimiter("path");
			hasher.update_str(
				&crate::util::normalize_path(Path::new(concat_value), cwd).to_string_lossy(),
			);
		} else {
			hasher.delimiter("value");
			hasher.update_str(concat_value);
		}
		return;
	}

	if let Some(path) = compopt::prefix_takes_path(argument) {
		hasher.delimiter("arg");
		hasher.update_str(&argument[..argument.len() - path.len()]);
		hasher.delimiter("path");
		hasher.update_str(&crate::util::normalize_path(Path::new(path), cwd).to_string_lossy());
		return;
	}

	hasher.delimiter("arg");
	hasher.update_str(argument);

	if let Some(value) = value {
		if compopt::takes_path(argument) {
			hasher.delimiter("path");
			hasher.update_str(&crate::util::normalize_path(Path::new(value), cwd).to_string_lossy());
		} else {
			hasher.delimiter("value");
			hasher.update_str(value);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::args::Language;

	fn test_args() -> ParsedArguments {
		ParsedArguments {
			input: PathBuf::from("/src/a.c"),
			language: Some(Language::C),
			output_obj: PathBuf::from("/src/a.o"),
			common_args: vec!["-O2".to_string(), "-g".to_string()],
			preprocessor_args: vec!["-DFOO=1".to_string(), "-I/usr/include/x".to_string()],
			..Default::default()
		}
	}

	fn test_compiler() -> CompilerInfo {
		CompilerInfo {
			path: PathBuf::from("/usr/bin/cc"),
			kind: CompilerKind::Gcc,
			digest: digest_of(b"fake compiler binary"),
		}
	}

	fn test_env() -> HashMap<String, String> {
		let mut env = HashMap::new();
		env.insert("LANG".to_string(), "en_US.UTF-8".to_string());
		env.insert("PATH".to_string(), "/usr/bin".to_string());
		env
	}

	fn keys_for(
		config: &Config,
		args: &ParsedArguments,
		env: &HashMap<String, String>,
	) -> (Digest, Digest, Digest) {
		let common = common_hash(config, &test_compiler(), args, env, Path::new("/src"));
		let direct = direct_mode_key(&common, config, args, env, b"int main(){return 0;}");
		let cpp = preprocessor_mode_key(&common, args, b"# 1 \"a.c\"\nint main(){return 0;}");
		(common.digest(), direct, cpp)
	}

	#[test]
	fn test_keys_are_stable_across_runs() {
		let config = Config::default();
		let (common1, direct1, cpp1) = keys_for(&config, &test_args(), &test_env());
		let (common2, direct2, cpp2) = keys_for(&config, &test_args(), &test_env());
		assert_eq!(common1, common2);
		assert_eq!(direct1, direct2);
		assert_eq!(cpp1, cpp2);
		// The three keys are distinct from each other.
		assert_ne!(direct1, cpp1);
		assert_ne!(common1, direct1);
	}

	#[test]
	fn test_compiler_identity_changes_common_hash() {
		let config = Config::default();
		let args = test_args();
		let env = test_env();
		let (common, _, _) = keys_for(&config, &args, &env);

		let mut other_compiler = test_compiler();
		other_compiler.digest = digest_of(b"different binary");
		let other =
			common_hash(&config, &other_compiler, &args, &env, Path::new("/src")).digest();
		assert_ne!(common, other);
	}

	#[test]
	fn test_output_affecting_arg_changes_keys() {
		let config = Config::default();
		let env = test_env();
		let (_, direct1, cpp1) = keys_for(&config, &test_args(), &env);

		let mut args = test_args();
		args.common_args.push("-fno-inline".to_string());
		let (_, direct2, cpp2) = keys_for(&config, &args, &env);
		assert_ne!(direct1, direct2);
		assert_ne!(cpp1, cpp2);
	}

	#[test]
	fn test_macro_definition_changes_direct_key() {
		let config = Config::default();
		let env = test_env();
		let (_, direct1, _) = keys_for(&config, &test_args(), &env);

		let mut args = test_args();
		args.preprocessor_args.push("-DBAR=2".to_string());
		let (_, direct2, _) = keys_for(&config, &args, &env);
		assert_ne!(direct1, direct2);
	}

	#[test]
	fn test_unlisted_env_is_ignored() {
		let config = Config::default();
		let args = test_args();
		let mut env = test_env();
		let (common1, _, _) = keys_for(&config, &args, &env);

		env.insert("UNRELATED".to_string(), "value".to_string());
		env.insert("PATH".to_string(), "/other".to_string());
		let (common2, _, _) = keys_for(&config, &args, &env);
		assert_eq!(common1, common2);
	}

	#[test]
	fn test_locale_env_respects_sloppiness() {
		let config = Config::default();
		let args = test_args();
		let mut env = test_env();
		let (common1, _, _) = keys_for(&config, &args, &env);

		env.insert("LANG".to_string(), "de_DE.UTF-8".to_string());
		let (common2, _, _) = keys_for(&config, &args, &env);
		assert_ne!(common1, common2);

		let mut sloppy_config = Config::default();
		sloppy_config.sloppiness = crate::sloppiness::Sloppiness::parse("locale").unwrap();
		let (sloppy1, _, _) = keys_for(&sloppy_config, &args, &env);
		env.insert("LANG".to_string(), "fr_FR.UTF-8".to_string());
		let (sloppy2, _, _) = keys_for(&sloppy_config, &args, &env);
		assert_eq!(sloppy1, sloppy2);
	}

	#[test]
	fn test_sloppiness_is_part_of_direct_key() {
		let args = test_args();
		let env = test_env();
		let config = Config::default();
		let (_, direct1, _) = keys_for(&config, &args, &env);

		let mut other = Config::default();
		other.sloppiness = crate::sloppiness::Sloppiness::parse("file_stat_matches").unwrap();
		let (_, direct2, _) = keys_for(&other, &args, &env);
		assert_ne!(direct1, direct2);
	}

	#[test]
	fn test_cwd_hashed_only_for_relative_builds() {
		let config = Config::default();
		let args = test_args();
		let env = test_env();

		// All paths absolute: cwd does not matter.
		let compiler = test_compiler();
		let one = common_hash(&config, &compiler, &args, &env, Path::new("/build/a")).digest();
		let two = common_hash(&config, &compiler, &args, &env, Path::new("/build/b")).digest();
		assert_eq!(one, two);

		// A relative output path makes the build cwd-sensitive.
		let mut relative = args.clone();
		relative.output_obj = PathBuf::from("a.o");
		let one = common_hash(&config, &compiler, &relative, &env, Path::new("/build/a")).digest();
		let two = common_hash(&config, &compiler, &relative, &env, Path::new("/build/b")).digest();
		assert_ne!(one, two);
	}

	#[test]
	fn test_argument_order_is_canonicalized() {
		let config = Config::default();
		let env = test_env();
		let compiler = test_compiler();

		let mut forward = test_args();
		forward.common_args = vec!["-O2".to_string(), "-g".to_string()];
		let mut reverse = test_args();
		reverse.common_args = vec!["-g".to_string(), "-O2".to_string()];

		// Both are unknown to the table, so their relative order is
		// preserved and the hashes differ...
		let one = common_hash(&config, &compiler, &forward, &env, Path::new("/src")).digest();
		let two = common_hash(&config, &compiler, &reverse, &env, Path::new("/src")).digest();
		assert_ne!(one, two);

		// ...while table-ranked options sort to their canonical place
		// regardless of where the caller put them.
		let mut early = test_args();
		early.compiler_args = vec!["-arch".to_string(), "x86_64".to_string()];
		early.common_args = vec!["-O2".to_string()];
		let mut late = test_args();
		late.compiler_args = vec![];
		late.common_args = vec!["-arch".to_string(), "x86_64".to_string(), "-O2".to_string()];
		let one = common_hash(&config, &compiler, &early, &env, Path::new("/src")).digest();
		let two = common_hash(&config, &compiler, &late, &env, Path::new("/src")).digest();
		assert_eq!(one, two);
	}

	#[test]
	fn test_include_path_normalization() {
		let config = Config::default();
		let env = test_env();
		let compiler = test_compiler();

		let mut plain = test_args();
		plain.compiler_args = vec!["-B/tool/dir".to_string()];
		let mut dotted = test_args();
		dotted.compiler_args = vec!["-B/tool/./dir".to_string()];

		let one = common_hash(&config, &compiler, &plain, &env, Path::new("/src")).digest();
		let two = common_hash(&config, &compiler, &dotted, &env, Path::new("/src")).digest();
		assert_eq!(one, two);
	}
}

// vim: ts=4
