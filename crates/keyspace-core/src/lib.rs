//! Core types and codecs shared by every keyspace crate.
//!
//! This crate defines the vocabulary the rest of the system builds on:
//! - [`tuple`]: the order-preserving tuple codec (§4.A)
//! - [`record`]: the inline-vs-external-blob record storage plan (§4.B)
//! - [`persistable`]: the `Persistable`/`PolymorphicProtocol` traits record
//!   types implement
//! - [`types`]: tuple elements, ids, directory paths, partition bindings
//! - [`error`]: the unified error type and its retry-classification taxonomy
//! - [`limits`]: key/value size limits enforced by the codecs

#![warn(missing_docs)]

pub mod error;
pub mod limits;
pub mod persistable;
pub mod record;
pub mod tuple;
pub mod types;

pub use error::{Error, ErrorCategory, Result};
pub use limits::{LimitError, Limits};
pub use persistable::{
    DistanceMetric, HnswConfig, IndexDescriptor, IndexKind, Persistable, PolymorphicMember, PolymorphicProtocol,
    VectorIndexDescriptor, VectorIndexKind,
};
pub use record::{plan_storage, reassemble, BlobSentinel, StoragePlan};
pub use types::{DirectoryPathSegment, Id, PartitionBinding, TupleValue, TypeCode};
