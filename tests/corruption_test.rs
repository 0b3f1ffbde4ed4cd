//! Checksum poisoning: a corrupted entry is detected, evicted and counted

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cachr::args::{CompilerKind, Language, ParsedArguments};
use cachr::cache::{Cache, CompileRequest, Invoker, Outcome, ProcessOutput};
use cachr::config::Config;
use cachr::hash::digest_of;
use cachr::hasher::CompilerInfo;
use cachr::stats::Statistic;
use tempfile::TempDir;

struct OneShotCompiler;

impl Invoker for OneShotCompiler {
	fn run(
		&mut self,
		_program: &Path,
		arguments: &[String],
		cwd: &Path,
	) -> io::Result<ProcessOutput> {
		if arguments.first().map(|a| a == "-E").unwrap_or(false) {
			let input = cwd.join(arguments.last().unwrap());
			let mut stdout = format!("# 1 \"{}\"\n", input.display()).into_bytes();
			stdout.extend_from_slice(&fs::read(&input)?);
			return Ok(ProcessOutput { exit_code: 0, stdout, stderr: Vec::new() });
		}
		let output = arguments[arguments.iter().position(|a| a == "-o").unwrap() + 1].clone();
		fs::write(cwd.join(&output), b"OBJECT-BYTES")?;
		Ok(ProcessOutput { exit_code: 0, stdout: Vec::new(), stderr: Vec::new() })
	}
}

fn request_for<'a>(dir: &TempDir, env: &'a HashMap<String, String>) -> CompileRequest<'a> {
	CompileRequest {
		args: ParsedArguments {
			input: dir.path().join("a.c"),
			language: Some(Language::C),
			output_obj: dir.path().join("a.o"),
			..Default::default()
		},
		compiler: CompilerInfo {
			path: PathBuf::from("/usr/bin/fakecc"),
			kind: CompilerKind::Gcc,
			digest: digest_of(b"fakecc 1.0"),
		},
		cwd: dir.path().to_path_buf(),
		env,
	}
}

fn find_result_entries(root: &Path) -> Vec<PathBuf> {
	let mut found = Vec::new();
	let entries = match fs::read_dir(root) {
		Ok(entries) => entries,
		Err(_) => return found,
	};
	for entry in entries.flatten() {
		let path = entry.path();
		if path.is_dir() {
			found.extend(find_result_entries(&path));
		} else if path.extension().map(|e| e == "R").unwrap_or(false) {
			found.push(path);
		}
	}
	found
}

#[tokio::test]
async fn test_corrupt_result_entry_is_evicted_and_recompiled() {
	let dir = TempDir::new().unwrap();
	fs::write(dir.path().join("a.c"), "int main() { return 0; }\n").unwrap();
	let config = Config { cache_dir: dir.path().join("cache"), ..Config::default() };
	let cache = Cache::new(config).unwrap();
	let env = HashMap::new();
	let mut invoker = OneShotCompiler;

	let request = request_for(&dir, &env);
	assert_eq!(cache.run(&request, &mut invoker).await.unwrap().outcome, Outcome::CacheMiss);

	// Flip one byte in the middle of the stored result entry.
	let results = find_result_entries(&dir.path().join("cache"));
	assert_eq!(results.len(), 1);
	let mut bytes = fs::read(&results[0]).unwrap();
	let middle = bytes.len() / 2;
	bytes[middle] ^= 0x20;
	fs::write(&results[0], &bytes).unwrap();

	// The poisoned entry must be treated as a miss, removed from disk and
	// counted; the rebuild recompiles and restores the object.
	fs::remove_file(dir.path().join("a.o")).unwrap();
	let second = cache.run(&request, &mut invoker).await.unwrap();
	assert_eq!(second.outcome, Outcome::CacheMiss);
	assert_eq!(fs::read(dir.path().join("a.o")).unwrap(), b"OBJECT-BYTES");

	let counters = cache.storage().local.read_all_statistics();
	assert!(counters.get(Statistic::CacheMissDueToCorruption) >= 1);

	// The freshly stored replacement entry reads back fine.
	fs::remove_file(dir.path().join("a.o")).unwrap();
	let third = cache.run(&request, &mut invoker).await.unwrap();
	assert!(matches!(
		third.outcome,
		Outcome::DirectCacheHit | Outcome::PreprocessedCacheHit
	));
	assert_eq!(fs::read(dir.path().join("a.o")).unwrap(), b"OBJECT-BYTES");
}

// vim: ts=4
