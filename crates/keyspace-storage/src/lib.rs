//! The KV-store contract and its in-memory backend.
//!
//! - [`kvstore`]: the `KvStore`/`Transaction` traits (§6), the sole
//!   external dependency of the rest of the system.
//! - [`memory`]: `MemoryStore`, an in-process backend for tests, local
//!   development, and embedding keyspace into a single process.
//! - [`directory`]: the directory layer (§4.C), mapping path segments to
//!   stable byte prefixes.

#![warn(missing_docs)]

pub mod directory;
pub mod kvstore;
pub mod memory;

pub use directory::DirectoryLayer;
pub use kvstore::{KvStore, MutationType, StreamingMode, Transaction};
pub use memory::MemoryStore;
