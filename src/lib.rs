//! Blocksync: content-defined delta synchronization in Rust.
//!
//! One side (the *target*) holds an old copy of an object and hashes it into
//! fixed-length blocks. The other side (the *source*) rolls a weak checksum
//! over its copy, confirms candidates with a strong hash, and emits a stream
//! of `equal` records (reuse a target block) and `diff` records (literal
//! bytes). Replaying that stream against the target rebuilds the source.
//!
//! The crate provides:
//! - Rolling and strong block hashing plus the lookup index (`hash`)
//! - Event-stream traits shared by every producer and consumer (`stream`)
//! - Multi-round refinement over shrinking block lengths (`multiround`)
//! - In-place ordering of a delta so the target can be rewritten without a
//!   second copy (`inplace`)
//! - A minimal framed wire format for hash and delta streams (`wire`)
//! - File-oriented helpers (`io`)
//! - An optional CLI (`cli` feature)
//!
//! # Quick Start
//!
//! ```
//! use blocksync::engine::{self, SyncOptions};
//!
//! let target = vec![7u8; 4096];
//! let mut source = target.clone();
//! source[1000..1010].copy_from_slice(b"0123456789");
//!
//! let opts = SyncOptions::default();
//! let script = engine::diff(&target, &source, &opts).unwrap();
//! let rebuilt = engine::patch(&target, &script).unwrap();
//! assert_eq!(rebuilt, source);
//! ```

pub mod engine;
pub mod error;
pub mod hash;
pub mod hole;
pub mod inplace;
pub mod io;
pub mod multiround;
pub mod reconstruct;
pub mod script;
pub mod source;
pub mod stream;
pub mod wire;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{Result, SyncError};
