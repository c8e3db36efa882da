//! HNSW vector index (§4.H): a hierarchical navigable small-world graph
//! persisted to the key-value store, with an ACORN-style
//! predicate-filtered search for queries that must also satisfy a scalar
//! condition.
//!
//! The graph's topology (per-node levels, per-level adjacency lists, the
//! entry point, and the max level) is kept in one serialized blob at
//! `<root>graph`, read and rewritten whole by every mutating call inside
//! the caller's transaction. Vectors live one-per-row under `<root>v/`,
//! indexed by an internally assigned `label`; the `label <-> id` mapping
//! lives under `<root>l/` (id to label) and `<root>p/` (label to id) so a
//! search can resolve a node back to a caller id without touching the
//! topology blob. `<root>_next_label` and `<root>_node_count` are
//! plain counters: the former is read-modify-written to hand out a fresh
//! label, the latter is maintained with `MutationType::Add` and is what
//! `max_inline_nodes` is checked against, so the cap reflects what is
//! actually durable rather than what happens to be resident in memory.
//!
//! A per-call [`VectorCache`] memoizes decoded vectors so a search or
//! insert that revisits the same node doesn't re-fetch and re-decode it.

use std::cell::RefCell;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use keyspace_core::{tuple, Error, Id, Result, TupleValue};
use keyspace_storage::{MutationType, Transaction};

pub use crate::metric::DistanceMetric;

/// Internal dense node handle; distinct from the caller-facing [`Id`].
type NodeId = u64;

/// Tuning parameters for an [`HnswVectorIndex`].
#[derive(Debug, Clone, Copy)]
pub struct HnswConfig {
    /// Neighbors maintained per node above level 0.
    pub m: usize,
    /// Neighbors maintained per node at level 0 (conventionally `2*m`).
    pub m_max0: usize,
    /// Candidate list size used while inserting.
    pub ef_construction: usize,
    /// Candidate list size used while searching.
    pub ef_search: usize,
    /// Hard cap on the on-store node count; exceeding it is `GraphTooLarge`.
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

struct ScoredNode {
    distance: f32,
    node: NodeId,
}
impl PartialEq for ScoredNode {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}
impl Eq for ScoredNode {}
impl PartialOrd for ScoredNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScoredNode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance.total_cmp(&other.distance)
    }
}

/// A max-heap ordering inverted, so `BinaryHeap<MinScoredNode>` pops the
/// *smallest* distance first — used for the greedy frontier, where we
/// always want to expand the closest unvisited candidate next.
struct MinScoredNode(ScoredNode);
impl PartialEq for MinScoredNode {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for MinScoredNode {}
impl PartialOrd for MinScoredNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MinScoredNode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.0.cmp(&self.0)
    }
}

/// The graph's topology, serialized whole into `<root>graph`. Vectors and
/// the id/label mappings are stored as separate rows, not in this blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GraphTopology {
    levels: HashMap<NodeId, usize>,
    neighbors: HashMap<(NodeId, usize), Vec<NodeId>>,
    entry_point: Option<NodeId>,
    max_level: usize,
}

impl GraphTopology {
    fn neighbors_at(&self, node: NodeId, level: usize) -> &[NodeId] {
        self.neighbors
            .get(&(node, level))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Memoizes vectors decoded from the store during one call, keyed by
/// node label.
struct VectorCache<'a> {
    tx: &'a dyn Transaction,
    index: &'a HnswVectorIndex,
    cache: RefCell<HashMap<NodeId, Vec<f32>>>,
}

impl<'a> VectorCache<'a> {
    fn new(tx: &'a dyn Transaction, index: &'a HnswVectorIndex) -> Self {
        VectorCache {
            tx,
            index,
            cache: RefCell::new(HashMap::new()),
        }
    }

    fn get(&self, node: NodeId) -> Result<Vec<f32>> {
        if let Some(v) = self.cache.borrow().get(&node) {
            return Ok(v.clone());
        }
        let bytes = self
            .tx
            .get(&self.index.vector_key(node))?
            .ok_or_else(|| Error::Invariant(format!("hnsw node {node} has no stored vector")))?;
        let v = HnswVectorIndex::decode_vector(&bytes)?;
        self.cache.borrow_mut().insert(node, v.clone());
        Ok(v)
    }

    fn put(&self, node: NodeId, v: Vec<f32>) {
        self.cache.borrow_mut().insert(node, v);
    }
}

/// An HNSW graph rooted at a subspace prefix, persisted to the
/// key-value store.
pub struct HnswVectorIndex {
    root: Vec<u8>,
    config: HnswConfig,
    metric: DistanceMetric,
    dim: usize,
}

impl HnswVectorIndex {
    pub fn new(root: Vec<u8>, config: HnswConfig, metric: DistanceMetric, dim: usize) -> Self {
        HnswVectorIndex {
            root,
            config,
            metric,
            dim,
        }
    }

    fn graph_key(&self) -> Vec<u8> {
        let mut key = self.root.clone();
        key.extend_from_slice(b"graph");
        key
    }

    fn node_count_key(&self) -> Vec<u8> {
        let mut key = self.root.clone();
        key.extend_from_slice(b"_node_count");
        key
    }

    fn next_label_key(&self) -> Vec<u8> {
        let mut key = self.root.clone();
        key.extend_from_slice(b"_next_label");
        key
    }

    fn vector_key(&self, label: NodeId) -> Vec<u8> {
        let mut key = self.root.clone();
        key.extend_from_slice(b"v/");
        key.extend(label.to_be_bytes());
        key
    }

    fn label_key_for_id(&self, id: &Id) -> Result<Vec<u8>> {
        let mut key = self.root.clone();
        key.extend_from_slice(b"l/");
        key.extend(tuple::encode(id.elements())?);
        Ok(key)
    }

    fn id_key_for_label(&self, label: NodeId) -> Vec<u8> {
        let mut key = self.root.clone();
        key.extend_from_slice(b"p/");
        key.extend(label.to_be_bytes());
        key
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

    fn load_topology(&self, tx: &dyn Transaction) -> Result<GraphTopology> {
        match tx.get(&self.graph_key())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(GraphTopology::default()),
        }
    }

    fn save_topology(&self, tx: &dyn Transaction, topo: &GraphTopology) -> Result<()> {
        tx.set(&self.graph_key(), bincode::serialize(topo)?);
        Ok(())
    }

    fn lookup_label(&self, tx: &dyn Transaction, id: &Id) -> Result<Option<NodeId>> {
        match tx.get(&self.label_key_for_id(id)?)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Serialization("corrupt hnsw label entry".into()))?;
                Ok(Some(NodeId::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn label_to_id(&self, tx: &dyn Transaction, label: NodeId) -> Result<Option<Id>> {
        match tx.get(&self.id_key_for_label(label))? {
            Some(bytes) => Ok(Some(Id::new(tuple::decode(&bytes)?))),
            None => Ok(None),
        }
    }

    fn allocate_label(&self, tx: &dyn Transaction) -> Result<NodeId> {
        let key = self.next_label_key();
        let current = match tx.get(&key)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Serialization("corrupt hnsw next-label counter".into()))?;
                NodeId::from_be_bytes(raw)
            }
            None => 0,
        };
        tx.set(&key, (current + 1).to_be_bytes().to_vec());
        Ok(current)
    }

    fn read_node_count(&self, tx: &dyn Transaction) -> Result<i64> {
        match tx.get(&self.node_count_key())? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Serialization("corrupt hnsw node-count counter".into()))?;
                Ok(i64::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn check_dim(&self, v: &[f32]) -> Result<()> {
        if v.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: v.len(),
            });
        }
        Ok(())
    }

    /// Sample an insertion level the standard HNSW way:
    /// `floor(-ln(U) / ln(m))` for `U` uniform in `(0, 1]`.
    fn sample_level(&self) -> usize {
        let u: f64 = rand::thread_rng().gen_range(f64::MIN_POSITIVE..1.0);
        let m = self.config.m.max(2) as f64;
        (-u.ln() / m.ln()).floor() as usize
    }

    fn distance_to(&self, cache: &VectorCache, query: &[f32], node: NodeId) -> Result<f32> {
        let v = cache.get(node)?;
        Ok(crate::metric::distance(query, &v, self.metric))
    }

    /// Insert or replace `id`'s vector. Replacing an existing id first
    /// removes it (and its edges) before reinserting at a fresh level.
    pub fn insert(&self, tx: &dyn Transaction, id: Id, vector: Vec<f32>) -> Result<()> {
        self.check_dim(&vector)?;
        let mut topo = self.load_topology(tx)?;

        if let Some(existing) = self.lookup_label(tx, &id)? {
            self.remove_node(tx, &mut topo, existing)?;
        }

        if self.read_node_count(tx)? >= self.config.max_inline_nodes as i64 {
            warn!(max = self.config.max_inline_nodes, "hnsw graph at capacity, rejecting insert");
            return Err(Error::GraphTooLarge {
                max: self.config.max_inline_nodes,
            });
        }

        let cache = VectorCache::new(tx, self);
        let label = self.allocate_label(tx)?;
        let level = self.sample_level();

        tx.set(&self.vector_key(label), Self::encode_vector(&vector)?);
        cache.put(label, vector.clone());
        tx.set(&self.label_key_for_id(&id)?, label.to_be_bytes().to_vec());
        tx.set(&self.id_key_for_label(label), tuple::encode(id.elements())?);
        tx.atomic_op(&self.node_count_key(), &1i64.to_le_bytes(), MutationType::Add);
        topo.levels.insert(label, level);

        if topo.entry_point.is_none() {
            topo.entry_point = Some(label);
            topo.max_level = level;
            self.save_topology(tx, &topo)?;
            return Ok(());
        }

        let mut entry = topo.entry_point.unwrap();
        let top_level = topo.max_level;

        // Greedy descend from the top to just above the insertion level.
        for lc in (level + 1..=top_level).rev() {
            entry = self.greedy_closest(&cache, &topo, &vector, entry, lc)?;
        }

        // At each level from min(level, top_level) down to 0, find
        // ef_construction candidates and connect bidirectionally.
        for lc in (0..=level.min(top_level)).rev() {
            let candidates = self.search_layer(&cache, &topo, &vector, entry, self.config.ef_construction, lc)?;
            let max_neighbors = if lc == 0 { self.config.m_max0 } else { self.config.m };
            let selected = Self::select_neighbors(&candidates, max_neighbors);

            for &neighbor in &selected {
                topo.neighbors.entry((label, lc)).or_default().push(neighbor);

                let exceeds = {
                    let back = topo.neighbors.entry((neighbor, lc)).or_default();
                    back.push(label);
                    back.len() > max_neighbors
                };
                if exceeds {
                    let neighbor_vector = cache.get(neighbor)?;
                    let mut scored = Vec::new();
                    for &n in &topo.neighbors[&(neighbor, lc)] {
                        scored.push(ScoredNode {
                            distance: crate::metric::distance(&neighbor_vector, &cache.get(n)?, self.metric),
                            node: n,
                        });
                    }
                    scored.sort();
                    scored.truncate(max_neighbors);
                    topo.neighbors
                        .insert((neighbor, lc), scored.into_iter().map(|s| s.node).collect());
                }
            }
            if !candidates.is_empty() {
                entry = candidates[0].node;
            }
        }

        if level > top_level {
            topo.entry_point = Some(label);
            topo.max_level = level;
        }

        self.save_topology(tx, &topo)?;
        Ok(())
    }

    /// Remove `id` from the graph if present; a no-op otherwise.
    pub fn delete(&self, tx: &dyn Transaction, id: &Id) -> Result<()> {
        let mut topo = self.load_topology(tx)?;
        if let Some(label) = self.lookup_label(tx, id)? {
            self.remove_node(tx, &mut topo, label)?;
            self.save_topology(tx, &topo)?;
        }
        Ok(())
    }

    fn remove_node(&self, tx: &dyn Transaction, topo: &mut GraphTopology, label: NodeId) -> Result<()> {
        let level = topo.levels.remove(&label).unwrap_or(0);

        if let Some(id) = self.label_to_id(tx, label)? {
            tx.clear(&self.label_key_for_id(&id)?);
        }
        tx.clear(&self.id_key_for_label(label));
        tx.clear(&self.vector_key(label));
        tx.atomic_op(&self.node_count_key(), &(-1i64).to_le_bytes(), MutationType::Add);

        for lc in 0..=level {
            if let Some(neighbors) = topo.neighbors.remove(&(label, lc)) {
                for neighbor in neighbors {
                    if let Some(back) = topo.neighbors.get_mut(&(neighbor, lc)) {
                        back.retain(|&n| n != label);
                    }
                }
            }
        }

        if topo.entry_point == Some(label) {
            topo.entry_point = topo.levels.keys().next().copied();
            topo.max_level = topo
                .entry_point
                .and_then(|n| topo.levels.get(&n).copied())
                .unwrap_or(0);
        }
        Ok(())
    }

    fn greedy_closest(
        &self,
        cache: &VectorCache,
        topo: &GraphTopology,
        query: &[f32],
        from: NodeId,
        level: usize,
    ) -> Result<NodeId> {
        let mut current = from;
        let mut current_distance = self.distance_to(cache, query, current)?;
        loop {
            let mut improved = false;
            for &neighbor in topo.neighbors_at(current, level) {
                let d = self.distance_to(cache, query, neighbor)?;
                if d < current_distance {
                    current_distance = d;
                    current = neighbor;
                    improved = true;
                }
            }
            if !improved {
                return Ok(current);
            }
        }
    }

    /// Bounded best-first search at one layer, returning up to `ef`
    /// candidates sorted nearest-first.
    fn search_layer(
        &self,
        cache: &VectorCache,
        topo: &GraphTopology,
        query: &[f32],
        entry: NodeId,
        ef: usize,
        level: usize,
    ) -> Result<Vec<ScoredNode>> {
        let mut visited = HashSet::new();
        visited.insert(entry);

        let entry_distance = self.distance_to(cache, query, entry)?;
        let mut candidates = BinaryHeap::new();
        candidates.push(MinScoredNode(ScoredNode {
            distance: entry_distance,
            node: entry,
        }));

        let mut results: Vec<ScoredNode> = vec![ScoredNode {
            distance: entry_distance,
            node: entry,
        }];

        while let Some(MinScoredNode(current)) = candidates.pop() {
            let worst = results.iter().map(|s| s.distance).fold(f32::MIN, f32::max);
            if current.distance > worst && results.len() >= ef {
                break;
            }
            for &neighbor in topo.neighbors_at(current.node, level) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = self.distance_to(cache, query, neighbor)?;
                candidates.push(MinScoredNode(ScoredNode { distance: d, node: neighbor }));
                results.push(ScoredNode { distance: d, node: neighbor });
            }
        }

        results.sort();
        results.truncate(ef.max(1));
        Ok(results)
    }

    fn select_neighbors(candidates: &[ScoredNode], max: usize) -> Vec<NodeId> {
        candidates.iter().take(max).map(|c| c.node).collect()
    }

    /// Top-`k` nearest neighbors of `query`.
    pub fn search(&self, tx: &dyn Transaction, query: &[f32], k: usize) -> Result<Vec<(Id, f32)>> {
        self.search_filtered(tx, query, k, |_| true)
    }

    /// ACORN-style predicate-filtered search: expands the candidate
    /// budget geometrically until `k` matches are found or the graph is
    /// exhausted, so a highly selective predicate doesn't starve the
    /// result set the way a naive post-filter would.
    pub fn search_filtered(
        &self,
        tx: &dyn Transaction,
        query: &[f32],
        k: usize,
        predicate: impl Fn(&Id) -> bool,
    ) -> Result<Vec<(Id, f32)>> {
        self.check_dim(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let topo = self.load_topology(tx)?;
        let Some(mut entry) = topo.entry_point else {
            return Ok(Vec::new());
        };
        let cache = VectorCache::new(tx, self);

        for lc in (1..=topo.max_level).rev() {
            entry = self.greedy_closest(&cache, &topo, query, entry, lc)?;
        }

        let node_count = self.read_node_count(tx)?.max(0) as usize;
        let mut ef = self.config.ef_search.max(k);
        let max_ef = node_count.max(1);
        loop {
            let candidates = self.search_layer(&cache, &topo, query, entry, ef, 0)?;
            let mut matches = Vec::new();
            for c in candidates {
                if let Some(id) = self.label_to_id(tx, c.node)? {
                    if predicate(&id) {
                        matches.push((id, c.distance));
                        if matches.len() >= k {
                            break;
                        }
                    }
                }
            }

            if matches.len() >= k || ef >= max_ef {
                return Ok(matches);
            }
            ef = (ef * 2).min(max_ef);
        }
    }

    /// Number of nodes durably recorded in the graph.
    pub fn len(&self, tx: &dyn Transaction) -> Result<usize> {
        Ok(self.read_node_count(tx)?.max(0) as usize)
    }

    pub fn is_empty(&self, tx: &dyn Transaction) -> Result<bool> {
        Ok(self.len(tx)? == 0)
    }
}
