//! The `Persistable` trait: the declarative contract application record
//! types implement so the session, index maintainers, and query executor
//! can serialize, place, and index them without reflection (§3, §9).
//!
//! Per the design notes, dynamic field lookup is an explicit
//! `field_by_name` callback rather than runtime reflection, and index
//! key-expressions are plain function pointers rather than an expression
//! tree — both fast-path-friendly and trivially `Send + Sync`.

use crate::error::Result;
use crate::types::{DirectoryPathSegment, Id, TupleValue, TypeCode};

/// An application-defined record type with a directory path, a primary
/// key, and zero or more secondary indexes.
pub trait Persistable: Send + Sync + Sized + 'static {
    /// The name used in item-subspace keys (`S/i/<type-name>/<id>`) and in
    /// error messages.
    fn type_name() -> &'static str;

    /// The statically-declared directory path: literals and `Field`
    /// references resolved per instance or via a `PartitionBinding`.
    fn directory_path_components() -> Vec<DirectoryPathSegment>;

    /// The type's declared secondary indexes, in declaration order.
    fn index_descriptors() -> Vec<IndexDescriptor<Self>>;

    /// The type's declared vector indexes (§4.G, §4.H), in declaration
    /// order. Most record types declare none; the default is empty so
    /// existing implementers don't need to change.
    fn vector_index_descriptors() -> Vec<VectorIndexDescriptor<Self>> {
        Vec::new()
    }

    /// This instance's primary key.
    fn id(&self) -> Id;

    /// Look up a field's value by name; used to resolve dynamic directory
    /// segments and index key-expressions against a concrete record.
    fn field_by_name(&self, name: &str) -> Option<TupleValue>;

    /// Serialize this record to its wire form (§4.B).
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Deserialize a record previously produced by `serialize`.
    fn deserialize(bytes: &[u8]) -> Result<Self>;
}

/// One declared secondary index: a name, a key-expression over the
/// record's fields, and whether duplicate keys are forbidden (§4.F).
pub struct IndexDescriptor<T> {
    pub name: String,
    pub unique: bool,
    /// Computes the index key-expression tuple for a record. Returns
    /// `None` when the expression is sparse (nil input), per §4.F.
    pub key_fn: fn(&T) -> Option<Vec<TupleValue>>,
}

impl<T> IndexDescriptor<T> {
    pub fn new(
        name: impl Into<String>,
        unique: bool,
        key_fn: fn(&T) -> Option<Vec<TupleValue>>,
    ) -> Self {
        IndexDescriptor {
            name: name.into(),
            unique,
            key_fn,
        }
    }
}

impl<T> Clone for IndexDescriptor<T> {
    fn clone(&self) -> Self {
        IndexDescriptor {
            name: self.name.clone(),
            unique: self.unique,
            key_fn: self.key_fn,
        }
    }
}

/// The kind of a declared index, used by the query executor to decide
/// whether an index can satisfy a predicate's leading prefix (§4.F, §4.J).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Scalar,
    Unique,
}

/// A vector similarity metric, normalized so a smaller distance is always
/// a closer match. Mirrored by `keyspace-vector`'s own metric enum (which
/// does the actual distance math); declared here too so a record type can
/// name a metric in its [`VectorIndexDescriptor`] without this crate
/// depending on `keyspace-vector`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Euclidean,
    Cosine,
    DotProduct,
}

/// Tuning parameters for a declared HNSW index (§4.H). Mirrors
/// `keyspace-vector::HnswConfig` for the same reason as [`DistanceMetric`].
#[derive(Debug, Clone, Copy)]
pub struct HnswConfig {
    pub m: usize,
    pub m_max0: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_inline_nodes: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        let m = 16;
        HnswConfig {
            m,
            m_max0: 2 * m,
            ef_construction: 200,
            ef_search: 64,
            max_inline_nodes: 100_000,
        }
    }
}

/// Which kind of vector index a [`VectorIndexDescriptor`] declares (§4.G,
/// §4.H).
#[derive(Debug, Clone, Copy)]
pub enum VectorIndexKind {
    Flat {
        dim: usize,
        metric: DistanceMetric,
    },
    Hnsw {
        dim: usize,
        metric: DistanceMetric,
        config: HnswConfig,
    },
}

/// One declared vector index: a name and the vector-valued field to
/// index. `vector_fn` returns `None` for a record with no vector, which
/// the index treats as a sparse entry (no row written).
pub struct VectorIndexDescriptor<T> {
    pub name: String,
    pub kind: VectorIndexKind,
    pub vector_fn: fn(&T) -> Option<Vec<f32>>,
}

impl<T> VectorIndexDescriptor<T> {
    pub fn new(name: impl Into<String>, kind: VectorIndexKind, vector_fn: fn(&T) -> Option<Vec<f32>>) -> Self {
        VectorIndexDescriptor {
            name: name.into(),
            kind,
            vector_fn,
        }
    }
}

impl<T> Clone for VectorIndexDescriptor<T> {
    fn clone(&self) -> Self {
        VectorIndexDescriptor {
            name: self.name.clone(),
            kind: self.kind,
            vector_fn: self.vector_fn,
        }
    }
}

/// Declares a shared directory and a `type_code` assignment across a
/// closed or open set of conforming concrete types (§4.K, §9).
///
/// Polymorphic declarations may use only static path segments; a `Field`
/// segment here is a configuration error (§4.C).
pub trait PolymorphicProtocol: Send + Sync + Sized + 'static {
    fn protocol_name() -> &'static str;
    fn directory_path_components() -> Vec<DirectoryPathSegment>;
    /// Every concrete type name known to conform, with its assigned code.
    fn known_type_codes() -> Vec<(TypeCode, &'static str)>;
}

/// Marks a concrete `Persistable` type as conforming to a polymorphic
/// protocol and supplies its `type_code`.
pub trait PolymorphicMember<P: PolymorphicProtocol>: Persistable {
    fn type_code() -> TypeCode;
}
