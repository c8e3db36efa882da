//! The directory layer (§4.C): resolves a path of static and dynamic
//! segments to a stable byte-string prefix ("subspace"), caching the
//! resolution for the life of the process.
//!
//! A static segment (`DirectoryPathSegment::Static`) always resolves to
//! the same prefix. A dynamic segment (`Field(name)`) resolves
//! per-partition: the caller must supply a [`PartitionBinding`] carrying
//! a value for `name`, and distinct values get distinct subspaces. This
//! mirrors FoundationDB's directory layer, minus the HCA node metadata —
//! here the mapping is allocated in-process and never needs to survive a
//! restart of the store itself, since the store *is* the process.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use keyspace_core::{DirectoryPathSegment, Error, PartitionBinding, Result, TupleValue};

use crate::kvstore::{KvStore, Transaction};

const DIRECTORY_SUBSPACE_PREFIX: &[u8] = b"\xfe/d/";

/// A resolved path: static segments verbatim, dynamic segments resolved
/// against the caller's partition binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResolvedPathKey(Vec<u8>);

fn path_lookup_key(
    segments: &[DirectoryPathSegment],
    binding: &PartitionBinding,
) -> Result<ResolvedPathKey> {
    let mut elements = Vec::with_capacity(segments.len());
    for segment in segments {
        match segment {
            DirectoryPathSegment::Static(name) => {
                elements.push(TupleValue::String(format!("s:{name}")));
            }
            DirectoryPathSegment::Field(name) => {
                let value = binding.get(name).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "dynamic path segment `{name}` requires a partition binding"
                    ))
                })?;
                elements.push(TupleValue::String(format!("f:{name}")));
                elements.push(value.clone());
            }
        }
    }
    let bytes = keyspace_core::tuple::encode(&elements)?;
    Ok(ResolvedPathKey(bytes))
}

/// Maps directory paths to stable byte-prefixes, caching resolutions for
/// the life of the process. One instance is shared by every session
/// opened against a [`Container`](../../keyspace_engine/struct.Container.html).
pub struct DirectoryLayer {
    cache: DashMap<ResolvedPathKey, Vec<u8>>,
    next_prefix_id: AtomicU64,
}

impl Default for DirectoryLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryLayer {
    pub fn new() -> Self {
        DirectoryLayer {
            cache: DashMap::new(),
            next_prefix_id: AtomicU64::new(0),
        }
    }

    /// Resolve `segments` (with `binding` supplying any dynamic values) to
    /// a subspace prefix, allocating a fresh prefix id on first use. The
    /// allocation itself is committed to `store` so the mapping survives
    /// process restarts for a persistent backend; the in-process cache
    /// just avoids a round trip on every call.
    pub fn resolve(
        &self,
        store: &dyn KvStore,
        segments: &[DirectoryPathSegment],
        binding: &PartitionBinding,
    ) -> Result<Vec<u8>> {
        let lookup_key = path_lookup_key(segments, binding)?;
        if let Some(prefix) = self.cache.get(&lookup_key) {
            return Ok(prefix.clone());
        }

        let mut meta_key = DIRECTORY_SUBSPACE_PREFIX.to_vec();
        meta_key.extend_from_slice(&lookup_key.0);

        let txn = store.begin(None);
        let prefix = match txn.get(&meta_key)? {
            Some(existing) => existing,
            None => {
                let id = self.next_prefix_id.fetch_add(1, Ordering::SeqCst);
                let prefix = keyspace_core::tuple::encode(&[TupleValue::Int(id as i64)])?;
                txn.set(&meta_key, prefix.clone());
                txn.commit()?;
                prefix
            }
        };

        self.cache.insert(lookup_key, prefix.clone());
        Ok(prefix)
    }

    /// Forget every cached resolution. Used by tests and by container
    /// reconfiguration; normal operation never needs this since path →
    /// prefix mappings are immutable once allocated.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
