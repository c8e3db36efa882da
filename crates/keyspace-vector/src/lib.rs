//! Flat and HNSW vector indexes.
//!
//! - [`flat`]: linear-scan exact search over vectors stored in the
//!   key-value store (§4.G).
//! - [`hnsw`]: a graph index persisted to the key-value store, with
//!   ACORN-style predicate-filtered search (§4.H).
//! - [`metric`]: the distance metrics both indexes share.
//! - [`handle`]: a type-erased handle over either index kind, opened from
//!   a record type's declared [`keyspace_core::VectorIndexKind`].

#![warn(missing_docs)]

pub mod flat;
pub mod handle;
pub mod hnsw;
pub mod metric;

pub use flat::FlatVectorIndex;
pub use handle::VectorIndexHandle;
pub use hnsw::{HnswConfig, HnswVectorIndex};
pub use metric::DistanceMetric;
