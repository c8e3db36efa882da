//! Flat vector index (§4.G): an O(n·d) linear scan over every vector
//! stored under a subspace, keeping a bounded max-heap of the k closest
//! candidates seen so far.
//!
//! Vectors are tuple-encoded (`Double` per component) so they sit in the
//! same key-value store as everything else; a row a caller didn't write
//! through this index (or that fails to decode) is skipped rather than
//! treated as a hard error, matching the sparse/corrupt-tolerant scan
//! semantics used elsewhere in the system.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use keyspace_core::{tuple, Error, Id, Result, TupleValue};
use keyspace_storage::Transaction;

pub use crate::metric::DistanceMetric;

struct Candidate {
    distance: f32,
    id: Id,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.distance.total_cmp(&other.distance)
    }
}

/// A flat vector index rooted at a subspace prefix. Each entry's key is
/// `<root>/<id-tuple>`; its value is the tuple-encoded vector.
pub struct FlatVectorIndex {
    root: Vec<u8>,
    dim: usize,
    metric: DistanceMetric,
}

impl FlatVectorIndex {
    pub fn new(root: Vec<u8>, dim: usize, metric: DistanceMetric) -> Self {
        FlatVectorIndex { root, dim, metric }
    }

    fn entry_key(&self, id: &Id) -> Result<Vec<u8>> {
        let mut key = self.root.clone();
        key.extend(tuple::encode(id.elements())?);
        Ok(key)
    }

    fn encode_vector(vector: &[f32]) -> Result<Vec<u8>> {
        let elements: Vec<TupleValue> = vector.iter().map(|v| TupleValue::Double(*v as f64)).collect();
        tuple::encode(&elements)
    }

    fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
        let elements = tuple::decode(bytes)?;
        elements
            .into_iter()
            .map(|e| match e {
                TupleValue::Double(d) => Ok(d as f32),
                other => Err(Error::TupleDecodingError(format!(
                    "expected double vector component, found {}",
                    other.type_name()
                ))),
            })
            .collect()
    }

    /// Write (or sparsely skip, on `None`) one id's vector.
    pub fn put(&self, tx: &dyn Transaction, id: &Id, vector: Option<&[f32]>) -> Result<()> {
        let key = self.entry_key(id)?;
        match vector {
            None => {
                tx.clear(&key);
                Ok(())
            }
            Some(v) => {
                if v.len() != self.dim {
                    return Err(Error::DimensionMismatch {
                        expected: self.dim,
                        actual: v.len(),
                    });
                }
                tx.set(&key, Self::encode_vector(v)?);
                Ok(())
            }
        }
    }

    pub fn get(&self, tx: &dyn Transaction, id: &Id) -> Result<Option<Vec<f32>>> {
        let key = self.entry_key(id)?;
        match tx.get(&key)? {
            Some(bytes) => Ok(Some(Self::decode_vector(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Top-`k` closest ids to `query`, nearest first. Rows that fail to
    /// decode (wrong dimension, corrupt bytes) are skipped rather than
    /// aborting the scan.
    pub fn search(&self, tx: &dyn Transaction, query: &[f32], k: usize) -> Result<Vec<(Id, f32)>> {
        if query.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let (begin, end) = tuple::range(&self.root);
        let rows = tx.get_range(&begin, &end, None, true, Default::default())?;

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        for (key, value) in rows {
            if key.len() < self.root.len() {
                continue;
            }
            let id_elements = match tuple::decode(&key[self.root.len()..]) {
                Ok(e) => e,
                Err(_) => continue,
            };
            let vector = match Self::decode_vector(&value) {
                Ok(v) if v.len() == self.dim => v,
                _ => continue,
            };
            let distance = crate::metric::distance(query, &vector, self.metric);
            heap.push(Candidate {
                distance,
                id: Id::new(id_elements),
            });
            if heap.len() > k {
                heap.pop();
            }
        }

        let mut results: Vec<(Id, f32)> = heap.into_sorted_vec().into_iter().map(|c| (c.id, c.distance)).collect();
        results.reverse();
        Ok(results)
    }
}
