//! `MemoryStore`: an in-process implementation of the KV-store contract.
//!
//! Modeled on a classic MVP backend — `BTreeMap` under a `RwLock`, an
//! `AtomicU64` version counter — extended with an optimistic-concurrency
//! commit log so that [`Transaction::commit`] can detect read/write
//! conflicts the way a real FoundationDB cluster would, rather than
//! silently serializing every commit.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use keyspace_core::{Error, Result};

use crate::kvstore::{KvStore, MutationType, StreamingMode, Transaction};

/// One past commit's write footprint, retained long enough to validate
/// transactions that started before it. Entries older than every live
/// transaction's start version are pruned on commit.
struct CommitRecord {
    version: u64,
    touched_keys: HashSet<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// In-memory, process-local `KvStore`.
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    version: Arc<AtomicU64>,
    commit_log: Arc<Mutex<Vec<CommitRecord>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(RwLock::new(Inner::default())),
            version: Arc::new(AtomicU64::new(0)),
            commit_log: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl KvStore for MemoryStore {
    fn begin(&self, read_version: Option<u64>) -> Box<dyn Transaction> {
        let start_version = read_version.unwrap_or_else(|| self.version.load(Ordering::Acquire));
        let snapshot = self.inner.read().data.clone();
        Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            version: self.version.clone(),
            commit_log: self.commit_log.clone(),
            snapshot,
            start_version: Mutex::new(start_version),
            state: Mutex::new(TxnState::default()),
        })
    }

    fn current_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct TxnState {
    writes: BTreeMap<Vec<u8>, Vec<u8>>,
    deletes: HashSet<Vec<u8>>,
    clear_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    read_keys: HashSet<Vec<u8>>,
    read_ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

/// A transaction against [`MemoryStore`]. Reads are served from a
/// snapshot taken at `begin()` time, overlaid with this transaction's own
/// pending writes (read-your-writes). Commit validates the read set
/// against every commit since `start_version`.
struct MemoryTransaction {
    inner: Arc<RwLock<Inner>>,
    version: Arc<AtomicU64>,
    commit_log: Arc<Mutex<Vec<CommitRecord>>>,
    snapshot: BTreeMap<Vec<u8>, Vec<u8>>,
    start_version: Mutex<u64>,
    state: Mutex<TxnState>,
}

impl MemoryTransaction {
    fn read_local(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        let state = self.state.lock();
        if state.deletes.contains(key) {
            return Some(None);
        }
        if let Some(v) = state.writes.get(key) {
            return Some(Some(v.clone()));
        }
        None
    }
}

impl Transaction for MemoryTransaction {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(local) = self.read_local(key) {
            return Ok(local);
        }
        self.state.lock().read_keys.insert(key.to_vec());
        Ok(self.snapshot.get(key).cloned())
    }

    fn get_snapshot(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshot.get(key).cloned())
    }

    fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: Option<usize>,
        snapshot: bool,
        _streaming_mode: StreamingMode,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let state = self.state.lock();
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .snapshot
            .range(begin.to_vec()..end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in state.writes.range(begin.to_vec()..end.to_vec()) {
            merged.insert(k.clone(), v.clone());
        }
        for k in &state.deletes {
            if k.as_slice() >= begin && k.as_slice() < end {
                merged.remove(k);
            }
        }
        drop(state);
        if !snapshot {
            self.state
                .lock()
                .read_ranges
                .push((begin.to_vec(), end.to_vec()));
        }
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = merged.into_iter().collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn set(&self, key: &[u8], value: Vec<u8>) {
        let mut state = self.state.lock();
        state.deletes.remove(key);
        state.writes.insert(key.to_vec(), value);
    }

    fn clear(&self, key: &[u8]) {
        let mut state = self.state.lock();
        state.writes.remove(key);
        state.deletes.insert(key.to_vec());
    }

    fn clear_range(&self, begin: &[u8], end: &[u8]) {
        let mut state = self.state.lock();
        let to_delete: Vec<Vec<u8>> = state
            .writes
            .range(begin.to_vec()..end.to_vec())
            .map(|(k, _)| k.clone())
            .collect();
        for k in to_delete {
            state.writes.remove(&k);
        }
        state
            .clear_ranges
            .push((begin.to_vec(), end.to_vec()));
    }

    fn atomic_op(&self, key: &[u8], operand: &[u8], op: MutationType) {
        match op {
            MutationType::Add => {
                let existing = self
                    .read_local(key)
                    .unwrap_or_else(|| self.snapshot.get(key).cloned());
                let existing_val = existing
                    .flatten()
                    .and_then(|b| b.try_into().ok())
                    .map(i64::from_le_bytes)
                    .unwrap_or(0);
                let delta = i64::from_le_bytes(operand.try_into().unwrap_or([0; 8]));
                let sum = existing_val.wrapping_add(delta);
                self.set(key, sum.to_le_bytes().to_vec());
            }
        }
    }

    fn get_approximate_size(&self) -> usize {
        let state = self.state.lock();
        state
            .writes
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
            + state.deletes.iter().map(|k| k.len()).sum::<usize>()
    }

    fn get_read_version(&self) -> u64 {
        *self.start_version.lock()
    }

    fn set_read_version(&self, version: u64) {
        *self.start_version.lock() = version;
    }

    fn commit(&self) -> Result<u64> {
        let start_version = *self.start_version.lock();
        let state = self.state.lock();
        if state.writes.is_empty() && state.deletes.is_empty() && state.clear_ranges.is_empty() {
            return Ok(start_version);
        }

        {
            let log = self.commit_log.lock();
            for record in log.iter().filter(|r| r.version > start_version) {
                for k in &state.read_keys {
                    if record.touched_keys.contains(k) {
                        return Err(Error::Conflict(format!(
                            "read-write conflict on key touched by commit {}",
                            record.version
                        )));
                    }
                }
                for (begin, end) in &state.read_ranges {
                    if record
                        .touched_keys
                        .iter()
                        .any(|k| k.as_slice() >= begin.as_slice() && k.as_slice() < end.as_slice())
                    {
                        return Err(Error::Conflict(format!(
                            "read-write conflict on range touched by commit {}",
                            record.version
                        )));
                    }
                }
            }
        }

        let commit_version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut touched = HashSet::new();
        {
            let mut inner = self.inner.write();
            for (k, v) in state.writes.iter() {
                inner.data.insert(k.clone(), v.clone());
                touched.insert(k.clone());
            }
            for k in state.deletes.iter() {
                inner.data.remove(k);
                touched.insert(k.clone());
            }
            for (begin, end) in state.clear_ranges.iter() {
                let to_remove: Vec<Vec<u8>> = inner
                    .data
                    .range(begin.clone()..end.clone())
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in to_remove {
                    inner.data.remove(&k);
                    touched.insert(k);
                }
            }
        }
        self.commit_log.lock().push(CommitRecord {
            version: commit_version,
            touched_keys: touched,
        });
        Ok(commit_version)
    }
}
