//! The shape of a parsed compiler command line
//!
//! Command-line parsing itself happens outside the cache core; the parser
//! hands over its result in these bucketed types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::result::FileType;

/// Source language of the input file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
	C,
	Cxx,
	ObjectiveC,
	ObjectiveCxx,
	Cuda,
}

impl Language {
	pub fn as_str(&self) -> &'static str {
		match self {
			Language::C => "c",
			Language::Cxx => "c++",
			Language::ObjectiveC => "objective-c",
			Language::ObjectiveCxx => "objective-c++",
			Language::Cuda => "cuda",
		}
	}
}

/// Identity tag of the compiler family driving this invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerKind {
	Gcc,
	Clang,
	Msvc,
	Nvcc,
	Other,
}

impl CompilerKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			CompilerKind::Gcc => "gcc",
			CompilerKind::Clang => "clang",
			CompilerKind::Msvc => "msvc",
			CompilerKind::Nvcc => "nvcc",
			CompilerKind::Other => "other",
		}
	}
}

/// The results of parsing a compiler command line, bucketed by what each
/// argument influences
///
/// Paths are kept exactly as the user wrote them; normalization happens at
/// hash time so that the stored manifest can reproduce the original view.
#[derive(Debug, Clone, Default)]
pub struct ParsedArguments {
	/// The input source file
	pub input: PathBuf,

	/// The type of language used in the input source file
	pub language: Option<Language>,

	/// The file in which to generate dependencies, if requested
	pub depfile: Option<PathBuf>,

	/// The object file the compiler was asked to produce
	pub output_obj: PathBuf,

	/// Additional output files keyed by their kind (coverage notes,
	/// serialized diagnostics, split DWARF, ...)
	pub extra_outputs: BTreeMap<FileType, PathBuf>,

	/// Arguments that change the preprocessed output (include paths,
	/// macro definitions, ...)
	pub preprocessor_args: Vec<String>,

	/// Arguments that change the compiled output but not the
	/// preprocessed output
	pub compiler_args: Vec<String>,

	/// Arguments passed to both preprocessing and compilation
	pub common_args: Vec<String>,
}

impl ParsedArguments {
	/// All arguments that affect the final object, in the order the
	/// caller supplied them
	pub fn output_affecting_args(&self) -> impl Iterator<Item = &String> {
		self.common_args.iter().chain(self.compiler_args.iter())
	}

	/// Whether any argument or the input/output paths are relative, which
	/// makes the build sensitive to the working directory
	pub fn uses_relative_paths(&self) -> bool {
		let relative = |p: &PathBuf| !p.as_os_str().is_empty() && p.is_relative();
		relative(&self.input)
			|| relative(&self.output_obj)
			|| self.depfile.as_ref().map(|p| p.is_relative()).unwrap_or(false)
	}
}


// vim: ts=4
