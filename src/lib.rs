//! # CachR - Compiler Result Cache
//!
//! CachR wraps C/C++/CUDA compiler invocations, fingerprints each one and
//! restores previously observed outputs instead of compiling again. Two
//! lookup modes exist: direct mode decides from the command line plus a
//! manifest of include fingerprints, preprocessor mode keys on the
//! expanded source. Results live in a two-level sharded local cache with
//! LRU eviction and optional remote backends behind it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cachr::cache::{Cache, CompileRequest};
//! use cachr::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = Cache::new(Config::load()?)?;
//!     let response = cache.run(&request, &mut invoker).await?;
//!     std::process::exit(response.exit_code);
//! }
//! ```
//!
//! Command-line parsing into buckets, child process plumbing and the
//! wrapper binary itself live outside this crate; see
//! `cache::CompileRequest` and `cache::Invoker` for the boundary.

#![deny(unsafe_code)]

pub mod args;
pub mod atomicfile;
pub mod cache;
pub mod compopt;
pub mod compress;
pub mod config;
pub mod entry;
pub mod error;
pub mod hash;
pub mod hasher;
pub mod includes;
pub mod lockfile;
pub mod logging;
pub mod manifest;
pub mod result;
pub mod showincludes;
pub mod sloppiness;
pub mod stats;
pub mod storage;
pub mod util;

// Re-export commonly used types and functions
pub use args::{CompilerKind, Language, ParsedArguments};
pub use cache::{Cache, CompileRequest, CompileResponse, Invoker, Outcome, ProcessOutput};
pub use config::Config;
pub use error::CacheError;
pub use hash::{Digest, Hasher};
pub use hasher::{CompilerInfo, EnvProvider, SystemEnv};
pub use sloppiness::{Sloppiness, Sloppy};
pub use stats::{Statistic, StatisticsCounters};
pub use storage::{LocalStorage, RemoteStorage, Storage};

// vim: ts=4
