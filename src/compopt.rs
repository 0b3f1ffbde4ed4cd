//! Compiler option classification table
//!
//! Drives three decisions: whether an option disqualifies the invocation
//! from caching ("too hard"), whether it changes the preprocessed output,
//! and how its value is absorbed into the hash (plain, separate argument,
//! concatenated argument, path). Prefix lookups resolve ties by taking the
//! longest matching table entry.

pub const AFFECTS_CPP: u32 = 1 << 0;
pub const AFFECTS_COMP: u32 = 1 << 1;
pub const TOO_HARD: u32 = 1 << 2;
pub const TOO_HARD_DIRECT: u32 = 1 << 3;
pub const TAKES_ARG: u32 = 1 << 4;
pub const TAKES_CONCAT_ARG: u32 = 1 << 5;
pub const TAKES_PATH: u32 = 1 << 6;

struct CompOpt {
	name: &'static str,
	flags: u32,
}

// Sorted by name; looked up with binary search.
const COMPOPTS: &[CompOpt] = &[
	CompOpt { name: "--analyze", flags: TOO_HARD },
	CompOpt { name: "--param", flags: TAKES_ARG },
	CompOpt { name: "--save-temps", flags: TOO_HARD },
	CompOpt { name: "--serialize-diagnostics", flags: TAKES_ARG | TAKES_PATH },
	CompOpt { name: "--sysroot", flags: AFFECTS_CPP | TAKES_ARG | TAKES_PATH },
	CompOpt { name: "-A", flags: AFFECTS_CPP | TAKES_ARG },
	CompOpt { name: "-B", flags: TAKES_ARG | TAKES_CONCAT_ARG | TAKES_PATH },
	CompOpt { name: "-D", flags: AFFECTS_CPP | TAKES_ARG | TAKES_CONCAT_ARG },
	CompOpt { name: "-E", flags: TOO_HARD },
	CompOpt { name: "-F", flags: AFFECTS_CPP | TAKES_ARG | TAKES_CONCAT_ARG | TAKES_PATH },
	CompOpt { name: "-G", flags: TAKES_ARG },
	CompOpt { name: "-I", flags: AFFECTS_CPP | TAKES_ARG | TAKES_CONCAT_ARG | TAKES_PATH },
	CompOpt { name: "-L", flags: TAKES_ARG },
	CompOpt { name: "-M", flags: TOO_HARD },
	CompOpt { name: "-MF", flags: TAKES_ARG | TAKES_CONCAT_ARG | TAKES_PATH },
	CompOpt { name: "-MM", flags: TOO_HARD },
	CompOpt { name: "-MQ", flags: TAKES_ARG | TAKES_CONCAT_ARG },
	CompOpt { name: "-MT", flags: TAKES_ARG | TAKES_CONCAT_ARG },
	CompOpt { name: "-P", flags: AFFECTS_CPP | TOO_HARD_DIRECT },
	CompOpt { name: "-U", flags: AFFECTS_CPP | TAKES_ARG | TAKES_CONCAT_ARG },
	CompOpt { name: "-V", flags: TAKES_ARG },
	CompOpt { name: "-Xassembler", flags: AFFECTS_COMP | TAKES_ARG },
	CompOpt { name: "-Xclang", flags: AFFECTS_COMP | TAKES_ARG },
	CompOpt { name: "-Xlinker", flags: TAKES_ARG },
	CompOpt { name: "-Xpreprocessor", flags: AFFECTS_CPP | TOO_HARD_DIRECT | TAKES_ARG },
	CompOpt { name: "-arch", flags: AFFECTS_COMP | TAKES_ARG },
	CompOpt { name: "-aux-info", flags: TAKES_ARG },
	CompOpt { name: "-b", flags: TAKES_ARG },
	CompOpt { name: "-fmodules", flags: TOO_HARD },
	CompOpt { name: "-fno-working-directory", flags: AFFECTS_CPP },
	CompOpt { name: "-fplugin=libcc1plugin", flags: TOO_HARD },
	CompOpt { name: "-fsyntax-only", flags: TOO_HARD },
	CompOpt { name: "-fworking-directory", flags: AFFECTS_CPP },
	CompOpt { name: "-gtoggle", flags: TOO_HARD },
	CompOpt { name: "-idirafter", flags: AFFECTS_CPP | TAKES_ARG | TAKES_CONCAT_ARG | TAKES_PATH },
	CompOpt { name: "-iframework", flags: AFFECTS_CPP | TAKES_ARG | TAKES_PATH },
	CompOpt { name: "-imacros", flags: AFFECTS_CPP | TAKES_ARG | TAKES_PATH },
	CompOpt { name: "-imultilib", flags: AFFECTS_CPP | TAKES_ARG | TAKES_PATH },
	CompOpt { name: "-include", flags: AFFECTS_CPP | TAKES_ARG | TAKES_PATH },
	CompOpt { name: "-include-pch", flags: AFFECTS_CPP | TAKES_ARG | TAKES_PATH },
	CompOpt { name: "-install_name", flags: TAKES_ARG },
	CompOpt { name: "-iprefix", flags: AFFECTS_CPP | TAKES_ARG | TAKES_PATH },
	CompOpt { name: "-iquote", flags: AFFECTS_CPP | TAKES_ARG | TAKES_PATH },
	CompOpt { name: "-isysroot", flags: AFFECTS_CPP | TAKES_ARG | TAKES_PATH },
	CompOpt { name: "-isystem", flags: AFFECTS_CPP | TAKES_ARG | TAKES_PATH },
	CompOpt { name: "-iwithprefix", flags: AFFECTS_CPP | TAKES_ARG | TAKES_PATH },
	CompOpt { name: "-iwithprefixbefore", flags: AFFECTS_CPP | TAKES_ARG | TAKES_PATH },
	CompOpt { name: "-nostdinc", flags: AFFECTS_CPP },
	CompOpt { name: "-nostdinc++", flags: AFFECTS_CPP },
	CompOpt { name: "-remap", flags: AFFECTS_CPP },
	CompOpt { name: "-save-temps", flags: TOO_HARD },
	CompOpt { name: "-trigraphs", flags: AFFECTS_CPP },
	CompOpt { name: "-u", flags: TAKES_ARG },
];

// Options recognized by prefix rather than exact name. Kept separate from
// the exact table; the longest matching prefix wins.
const PREFIX_COMPOPTS: &[CompOpt] = &[
	CompOpt { name: "--specs=", flags: AFFECTS_COMP | TAKES_PATH },
	CompOpt { name: "--sysroot=", flags: AFFECTS_CPP | TAKES_PATH },
	CompOpt { name: "-MF", flags: TAKES_PATH },
	CompOpt { name: "-Wa,", flags: AFFECTS_COMP },
	CompOpt { name: "-Wp,", flags: AFFECTS_CPP | TOO_HARD_DIRECT },
	CompOpt { name: "-frandom-seed=", flags: AFFECTS_COMP },
	CompOpt { name: "-fsanitize-blacklist=", flags: AFFECTS_CPP | TAKES_PATH },
	CompOpt { name: "-specs=", flags: AFFECTS_COMP | TAKES_PATH },
	CompOpt { name: "-stdlib=", flags: AFFECTS_CPP },
];

fn find(option: &str) -> Option<&'static CompOpt> {
	COMPOPTS
		.binary_search_by(|probe| probe.name.cmp(option))
		.ok()
		.map(|index| &COMPOPTS[index])
}

/// Longest prefix-table entry that is a prefix of `option`
fn find_prefix(option: &str) -> Option<&'static CompOpt> {
	PREFIX_COMPOPTS
		.iter()
		.filter(|entry| option.starts_with(entry.name))
		.max_by_key(|entry| entry.name.len())
}

fn has_flag(option: &str, flag: u32) -> bool {
	find(option).map(|entry| entry.flags & flag != 0).unwrap_or(false)
}

pub fn affects_cpp_output(option: &str) -> bool {
	has_flag(option, AFFECTS_CPP)
}

pub fn affects_compiler_output(option: &str) -> bool {
	has_flag(option, AFFECTS_COMP)
}

pub fn too_hard(option: &str) -> bool {
	has_flag(option, TOO_HARD)
}

pub fn too_hard_for_direct_mode(option: &str) -> bool {
	has_flag(option, TOO_HARD_DIRECT)
}

pub fn takes_arg(option: &str) -> bool {
	has_flag(option, TAKES_ARG)
}

pub fn takes_concat_arg(option: &str) -> bool {
	has_flag(option, TAKES_CONCAT_ARG)
}

pub fn takes_path(option: &str) -> bool {
	has_flag(option, TAKES_PATH)
}

pub fn prefix_affects_cpp_output(option: &str) -> bool {
	find_prefix(option).map(|entry| entry.flags & AFFECTS_CPP != 0).unwrap_or(false)
}

pub fn prefix_too_hard_for_direct_mode(option: &str) -> bool {
	find_prefix(option).map(|entry| entry.flags & TOO_HARD_DIRECT != 0).unwrap_or(false)
}

/// For a prefix option carrying a concatenated path (e.g. `--sysroot=/x`),
/// return the path part
pub fn prefix_takes_path(option: &str) -> Option<&str> {
	find_prefix(option)
		.filter(|entry| entry.flags & TAKES_PATH != 0)
		.map(|entry| &option[entry.name.len()..])
}

/// Split an argument written in concatenated form (`-DFOO=1`,
/// `-Iinclude`) into its option name and value. The longest matching
/// option wins so that `-include` is not read as `-i nclude`.
pub fn split_concat(argument: &str) -> Option<(&'static str, &str)> {
	COMPOPTS
		.iter()
		.filter(|entry| {
			entry.flags & TAKES_CONCAT_ARG != 0
				&& argument.starts_with(entry.name)
				&& argument.len() > entry.name.len()
		})
		.max_by_key(|entry| entry.name.len())
		.map(|entry| (entry.name, &argument[entry.name.len()..]))
}

/// Stable sort rank for canonical argument ordering: table position for
/// known options, past-the-end for everything else so unknown options keep
/// their relative command-line order
pub fn canonical_rank(option: &str) -> usize {
	if let Ok(index) = COMPOPTS.binary_search_by(|probe| probe.name.cmp(option)) {
		return index;
	}
	if let Some(entry) = find_prefix(option) {
		if let Some(position) = PREFIX_COMPOPTS.iter().position(|e| e.name == entry.name) {
			return COMPOPTS.len() + position;
		}
	}
	COMPOPTS.len() + PREFIX_COMPOPTS.len()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_table_is_sorted() {
		for pair in COMPOPTS.windows(2) {
			assert!(pair[0].name < pair[1].name, "{} >= {}", pair[0].name, pair[1].name);
		}
	}

	#[test]
	fn test_exact_lookups() {
		assert!(affects_cpp_output("-I"));
		assert!(affects_cpp_output("-D"));
		assert!(affects_cpp_output("-include"));
		assert!(!affects_cpp_output("-L"));
		assert!(takes_path("-isystem"));
		assert!(takes_arg("-MT"));
		assert!(takes_concat_arg("-D"));
		assert!(!takes_concat_arg("-include"));
	}

	#[test]
	fn test_too_hard_options() {
		assert!(too_hard("-save-temps"));
		assert!(too_hard("--analyze"));
		assert!(too_hard("-MM"));
		assert!(too_hard("-M"));
		assert!(!too_hard("-MF"));
		assert!(too_hard_for_direct_mode("-Xpreprocessor"));
		assert!(!too_hard_for_direct_mode("-I"));
	}

	#[test]
	fn test_unknown_option() {
		assert!(!too_hard("-O2"));
		assert!(!affects_cpp_output("-O2"));
		assert!(!takes_arg("-c"));
	}

	#[test]
	fn test_longest_prefix_wins() {
		// "--sysroot=/x" must match "--sysroot=" (concatenated path), not
		// be mistaken for the two-argument "--sysroot" form.
		assert_eq!(prefix_takes_path("--sysroot=/opt/sdk"), Some("/opt/sdk"));
		assert!(prefix_affects_cpp_output("--sysroot=/opt/sdk"));
		assert!(prefix_affects_cpp_output("-Wp,-DX=1"));
		assert!(prefix_too_hard_for_direct_mode("-Wp,-DX=1"));
		assert_eq!(prefix_takes_path("-O2"), None);
	}

	#[test]
	fn test_split_concat() {
		assert_eq!(split_concat("-DFOO=1"), Some(("-D", "FOO=1")));
		assert_eq!(split_concat("-Iinclude"), Some(("-I", "include")));
		assert_eq!(split_concat("-idirafter/x"), Some(("-idirafter", "/x")));
		assert_eq!(split_concat("-D"), None);
		assert_eq!(split_concat("-O2"), None);
		// "-include" must not be read as a concatenated "-i nclude".
		assert_eq!(split_concat("-include"), None);
	}

	#[test]
	fn test_canonical_rank_is_stable() {
		let rank_d = canonical_rank("-D");
		let rank_i = canonical_rank("-I");
		assert!(rank_d < rank_i, "table order defines the canonical order");
		assert_eq!(canonical_rank("-unknown"), canonical_rank("-also-unknown"));
		assert!(canonical_rank("-D") < canonical_rank("-unknown"));
	}
}

// vim: ts=4
