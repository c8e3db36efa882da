//! A type-erased handle over either vector index kind, so callers that
//! only know a [`VectorIndexKind`] declaration (the session's apply path,
//! an ad-hoc container-level search) don't need to match on it themselves.

use keyspace_core::{DistanceMetric, HnswConfig, Id, Result, VectorIndexKind};
use keyspace_storage::Transaction;

use crate::flat::FlatVectorIndex;
use crate::hnsw::HnswVectorIndex;

/// Either vector index kind, opened at a subspace root.
pub enum VectorIndexHandle {
    Flat(FlatVectorIndex),
    Hnsw(HnswVectorIndex),
}

impl VectorIndexHandle {
    /// Open the index `kind` describes, rooted at `root`.
    pub fn open(root: Vec<u8>, kind: &VectorIndexKind) -> Self {
        match *kind {
            VectorIndexKind::Flat { dim, metric } => {
                VectorIndexHandle::Flat(FlatVectorIndex::new(root, dim, into_metric(metric)))
            }
            VectorIndexKind::Hnsw { dim, metric, config } => VectorIndexHandle::Hnsw(HnswVectorIndex::new(
                root,
                into_hnsw_config(config),
                into_metric(metric),
                dim,
            )),
        }
    }

    /// Write (or, on `None`, clear) one id's vector.
    pub fn put(&self, tx: &dyn Transaction, id: &Id, vector: Option<&[f32]>) -> Result<()> {
        match self {
            VectorIndexHandle::Flat(idx) => idx.put(tx, id, vector),
            VectorIndexHandle::Hnsw(idx) => match vector {
                Some(v) => idx.insert(tx, id.clone(), v.to_vec()),
                None => idx.delete(tx, id),
            },
        }
    }

    /// Top-`k` nearest neighbors of `query`.
    pub fn search(&self, tx: &dyn Transaction, query: &[f32], k: usize) -> Result<Vec<(Id, f32)>> {
        match self {
            VectorIndexHandle::Flat(idx) => idx.search(tx, query, k),
            VectorIndexHandle::Hnsw(idx) => idx.search(tx, query, k),
        }
    }
}

fn into_metric(metric: DistanceMetric) -> crate::metric::DistanceMetric {
    match metric {
        DistanceMetric::Euclidean => crate::metric::DistanceMetric::Euclidean,
        DistanceMetric::Cosine => crate::metric::DistanceMetric::Cosine,
        DistanceMetric::DotProduct => crate::metric::DistanceMetric::DotProduct,
    }
}

fn into_hnsw_config(config: keyspace_core::HnswConfig) -> HnswConfig {
    HnswConfig {
        m: config.m,
        m_max0: config.m_max0,
        ef_construction: config.ef_construction,
        ef_search: config.ef_search,
        max_inline_nodes: config.max_inline_nodes,
    }
}
