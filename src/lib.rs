//! # Keyspace
//!
//! A typed object-persistence and indexing layer over an ordered key-value
//! store that provides serializable multi-key transactions (modeled on
//! FoundationDB: a sorted byte-keyed store with snapshot reads, read/write
//! conflict ranges, atomic mutations, and range scans).
//!
//! Application code declares record types ("persistables") with a directory
//! path, a primary key, and secondary indexes. Keyspace serializes records,
//! places them in hierarchical key subspaces, maintains indexes, and exposes
//! a unit-of-work API for reads, writes, transactions, and nearest-neighbor
//! vector search.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use keyspace::{Container, ContainerConfig, MemoryStore, PartitionBinding};
//!
//! # fn main() -> keyspace_core::Result<()> {
//! let container = Container::new(Arc::new(MemoryStore::new()), ContainerConfig::default());
//! // let session = container.new_session::<User>(&PartitionBinding::new(), None)?;
//! // session.insert(User { id: "u1".into(), ... })?;
//! // session.save()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! | Layer | Crate | Responsibility |
//! |---|---|---|
//! | Tuple/record codecs, directory resolver | [`keyspace_core`] | Order-preserving encoding, subspace resolution |
//! | KV store contract | [`keyspace_storage`] | Transactional byte-keyed store, directory layer |
//! | Transaction driver, read-version cache | [`keyspace_concurrency`] | Retry/backoff, staleness policies |
//! | Scalar/unique indexes | [`keyspace_index`] | In-transaction index maintenance |
//! | Vector indexes | [`keyspace_vector`] | Flat and HNSW/ACORN nearest-neighbor search |
//! | Session, query executor, polymorphism | [`keyspace_session`] | Unit-of-work, queries, dual-write |
//! | Container | [`keyspace_engine`] | Wires the layers together |

pub use keyspace_core::{
    DirectoryPathSegment, Error, ErrorCategory, Id, IndexDescriptor, IndexKind, Persistable,
    PartitionBinding, PolymorphicMember, PolymorphicProtocol, Result, TupleValue, TypeCode,
};
pub use keyspace_concurrency::{CachePolicy, ReadVersionCache, RetryConfig, TransactionDriver};
pub use keyspace_engine::{Container, ContainerConfig};
pub use keyspace_index::{IndexMaintainer, IndexState};
pub use keyspace_session::{IndexHint, ProtocolSubspace, Query, Session};
pub use keyspace_storage::{DirectoryLayer, KvStore, MemoryStore, Transaction};
pub use keyspace_vector::{DistanceMetric, FlatVectorIndex, HnswConfig, HnswVectorIndex};
