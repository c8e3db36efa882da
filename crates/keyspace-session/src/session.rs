//! The unit-of-work session (§4.I): stages inserts and deletes across any
//! number of registered record types in memory, then applies every
//! type's change-set as a single grouped commit routed through the
//! [`TransactionDriver`](keyspace_concurrency::TransactionDriver).
//!
//! A [`Session`] never talks to the store until [`Session::save`] (or
//! the coalesced autosave) runs. Until then, [`Session::fetch_by_id`] and
//! [`Session::fetch_all`] answer from the staged changes first, so a
//! caller always reads its own writes regardless of whether they've been
//! persisted yet. A session is not scoped to one type: `insert::<User>`
//! and `insert::<Order>` followed by one `save()` commit atomically in
//! the same driver transaction.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use keyspace_concurrency::TransactionDriver;
use keyspace_core::record::{plan_storage, reassemble, BlobSentinel, StoragePlan};
use keyspace_core::{
    tuple, Error, Id, Limits, Persistable, PolymorphicMember, PolymorphicProtocol, Result, TupleValue,
};
use keyspace_index::IndexMaintainer;
use keyspace_storage::{KvStore, Transaction};
use keyspace_vector::VectorIndexHandle;

use crate::polymorphic::ProtocolSubspace;

enum PendingOp<T> {
    Insert(T),
    Delete,
}

/// Where a registered type's four subspaces live: items, their declared
/// scalar indexes, overflow blob chunks for oversized payloads, and
/// declared vector indexes. Resolved once (typically by a container) via
/// the directory layer and handed to the session at registration.
#[derive(Debug, Clone)]
pub struct SessionSubspaces {
    pub item_root: Vec<u8>,
    pub index_root: Vec<u8>,
    pub blob_root: Vec<u8>,
    pub vector_root: Vec<u8>,
}

/// A polymorphic dual-write callback: `Some(bytes)` mirrors an insert's
/// raw item bytes, `None` clears the mirror. Bound to one concrete type
/// and protocol at registration, so the apply path can call it without
/// re-naming the generics at every commit.
type MirrorFn = dyn Fn(&dyn Transaction, &Id, Option<Vec<u8>>) -> Result<()> + Send + Sync;

fn vector_index_root(vector_root: &[u8], name: &str) -> Result<Vec<u8>> {
    let mut root = vector_root.to_vec();
    root.extend(tuple::encode(&[TupleValue::String(name.to_string())])?);
    Ok(root)
}

struct VectorMaintainer<T: Persistable> {
    descriptor: keyspace_core::VectorIndexDescriptor<T>,
    handle: VectorIndexHandle,
}

impl<T: Persistable> VectorMaintainer<T> {
    fn apply(&self, tx: &dyn Transaction, id: &Id, record: Option<&T>) -> Result<()> {
        let vector = record.and_then(|r| (self.descriptor.vector_fn)(r));
        self.handle.put(tx, id, vector.as_deref())
    }
}

/// One registered type's subspaces, maintainers, and pending change-set.
/// Owns nothing the session itself needs to know the shape of — the
/// session only ever talks to it through [`ErasedTypeState`].
struct TypeState<T: Persistable> {
    store: Arc<dyn KvStore>,
    driver: Arc<TransactionDriver>,
    subspaces: SessionSubspaces,
    limits: Limits,
    index_maintainer: IndexMaintainer<T>,
    vector_maintainers: Vec<VectorMaintainer<T>>,
    mirror: Option<Arc<MirrorFn>>,
    pending: Mutex<BTreeMap<Vec<u8>, PendingOp<T>>>,
    staging: Mutex<Option<BTreeMap<Vec<u8>, PendingOp<T>>>>,
}

impl<T: Persistable> TypeState<T> {
    fn new(
        store: Arc<dyn KvStore>,
        driver: Arc<TransactionDriver>,
        subspaces: SessionSubspaces,
        limits: Limits,
        mirror: Option<Arc<MirrorFn>>,
    ) -> Result<Self> {
        let index_maintainer = IndexMaintainer::new(subspaces.index_root.clone());
        let vector_maintainers = T::vector_index_descriptors()
            .into_iter()
            .map(|descriptor| {
                let root = vector_index_root(&subspaces.vector_root, &descriptor.name)?;
                let handle = VectorIndexHandle::open(root, &descriptor.kind);
                Ok(VectorMaintainer { descriptor, handle })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(TypeState {
            store,
            driver,
            subspaces,
            limits,
            index_maintainer,
            vector_maintainers,
            mirror,
            pending: Mutex::new(BTreeMap::new()),
            staging: Mutex::new(None),
        })
    }

    fn pack_id(id: &Id) -> Result<Vec<u8>> {
        tuple::encode(id.elements())
    }

    fn item_key(&self, id: &Id) -> Result<Vec<u8>> {
        let mut key = self.subspaces.item_root.clone();
        key.extend(tuple::encode(id.elements())?);
        Ok(key)
    }

    fn blob_chunk_key(&self, blob_id: &Uuid, chunk: u32) -> Result<Vec<u8>> {
        let mut key = self.subspaces.blob_root.clone();
        key.extend(tuple::encode(&[
            TupleValue::Uuid(*blob_id),
            TupleValue::Int(chunk as i64),
        ])?);
        Ok(key)
    }

    fn read_item(&self, tx: &dyn Transaction, id: &Id) -> Result<Option<Vec<u8>>> {
        let key = self.item_key(id)?;
        let Some(bytes) = tx.get(&key)? else {
            return Ok(None);
        };
        let (tag, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::Invariant("empty item record".into()))?;
        match tag {
            0 => Ok(Some(rest.to_vec())),
            1 => {
                let sentinel = BlobSentinel::from_bytes(rest)?;
                let mut chunks = Vec::with_capacity(sentinel.chunk_count as usize);
                for n in 0..sentinel.chunk_count {
                    let chunk_key = self.blob_chunk_key(&sentinel.blob_id, n)?;
                    let chunk = tx.get(&chunk_key)?.ok_or_else(|| {
                        Error::Invariant(format!("missing blob chunk {n} of {}", sentinel.blob_id))
                    })?;
                    chunks.push((n, chunk));
                }
                Ok(Some(reassemble(chunks)?))
            }
            other => Err(Error::Invariant(format!("unrecognized item tag {other}"))),
        }
    }

    fn clear_old_blob_chunks(&self, tx: &dyn Transaction, id: &Id) -> Result<()> {
        let key = self.item_key(id)?;
        if let Some(bytes) = tx.get(&key)? {
            if bytes.first() == Some(&1) {
                let sentinel = BlobSentinel::from_bytes(&bytes[1..])?;
                for n in 0..sentinel.chunk_count {
                    tx.clear(&self.blob_chunk_key(&sentinel.blob_id, n)?);
                }
            }
        }
        Ok(())
    }

    /// Write `payload` (plan inline vs. blob-chunked per the session's
    /// limits) and return the exact tagged bytes stored at the item key,
    /// so a polymorphic mirror write can reuse them verbatim.
    fn write_item(&self, tx: &dyn Transaction, id: &Id, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.clear_old_blob_chunks(tx, id)?;
        let key = self.item_key(id)?;
        let value = match plan_storage(payload, &self.limits, Uuid::new_v4()) {
            StoragePlan::Inline(bytes) => {
                let mut value = Vec::with_capacity(bytes.len() + 1);
                value.push(0);
                value.extend(bytes);
                value
            }
            StoragePlan::External { sentinel, chunks } => {
                let mut value = vec![1u8];
                value.extend(sentinel.to_bytes()?);
                for (n, chunk) in chunks {
                    tx.set(&self.blob_chunk_key(&sentinel.blob_id, n)?, chunk);
                }
                value
            }
        };
        tx.set(&key, value.clone());
        Ok(value)
    }

    fn clear_item(&self, tx: &dyn Transaction, id: &Id) -> Result<()> {
        self.clear_old_blob_chunks(tx, id)?;
        tx.clear(&self.item_key(id)?);
        Ok(())
    }

    fn insert(&self, record: T) -> Result<()> {
        let key = Self::pack_id(&record.id())?;
        self.pending.lock().insert(key, PendingOp::Insert(record));
        Ok(())
    }

    fn delete(&self, id: &Id) -> Result<()> {
        let key = Self::pack_id(id)?;
        self.pending.lock().insert(key, PendingOp::Delete);
        Ok(())
    }

    fn fetch_by_id(&self, id: &Id) -> Result<Option<T>> {
        let key = Self::pack_id(id)?;
        {
            let pending = self.pending.lock();
            match pending.get(&key) {
                Some(PendingOp::Insert(record)) => {
                    return Ok(Some(T::deserialize(&record.serialize()?)?));
                }
                Some(PendingOp::Delete) => return Ok(None),
                None => {}
            }
        }
        self.driver.run(self.store.as_ref(), |tx| match self.read_item(tx, id)? {
            Some(payload) => Ok(Some(T::deserialize(&payload)?)),
            None => Ok(None),
        })
    }

    fn fetch_all(&self) -> Result<Vec<T>> {
        let item_root = self.subspaces.item_root.clone();
        let mut results: BTreeMap<Vec<u8>, T> = self.driver.run(self.store.as_ref(), |tx| {
            let (begin, end) = tuple::range(&item_root);
            let rows = tx.get_range(&begin, &end, None, true, Default::default())?;
            let mut results = BTreeMap::new();
            for (key, _) in rows {
                if key.len() < item_root.len() {
                    continue;
                }
                let id_bytes = key[item_root.len()..].to_vec();
                let Ok(id_elements) = tuple::decode(&id_bytes) else {
                    continue;
                };
                let id = Id::new(id_elements);
                if let Ok(Some(payload)) = self.read_item(tx, &id) {
                    if let Ok(record) = T::deserialize(&payload) {
                        results.insert(id_bytes, record);
                    }
                }
            }
            Ok(results)
        })?;

        for (id_bytes, op) in self.pending.lock().iter() {
            match op {
                PendingOp::Insert(record) => {
                    let cloned = T::deserialize(&record.serialize()?)?;
                    results.insert(id_bytes.clone(), cloned);
                }
                PendingOp::Delete => {
                    results.remove(id_bytes);
                }
            }
        }
        Ok(results.into_values().collect())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.fetch_all()?.len())
    }

    fn vector_search(&self, index_name: &str, query: &[f32], k: usize) -> Result<Vec<(Id, f32)>> {
        let maintainer = self
            .vector_maintainers
            .iter()
            .find(|vm| vm.descriptor.name == index_name)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "no vector index named {index_name} on {}",
                    T::type_name()
                ))
            })?;
        self.driver
            .run(self.store.as_ref(), |tx| maintainer.handle.search(tx, query, k))
    }

    /// Apply one staged change-set: item write/clear, every declared
    /// scalar index (F), every declared vector index (G, H), and the
    /// polymorphic mirror (K) if registered.
    fn apply(&self, tx: &dyn Transaction, ops: &BTreeMap<Vec<u8>, PendingOp<T>>) -> Result<()> {
        let descriptors = T::index_descriptors();
        for (id_bytes, op) in ops.iter() {
            let id = Id::new(tuple::decode(id_bytes)?);
            let old = match self.read_item(tx, &id)? {
                Some(payload) => Some(T::deserialize(&payload)?),
                None => None,
            };
            match op {
                PendingOp::Insert(record) => {
                    let raw = self.write_item(tx, &id, record.serialize()?)?;
                    for descriptor in &descriptors {
                        self.index_maintainer
                            .update(tx, descriptor, old.as_ref(), Some(record), &id)?;
                    }
                    for vm in &self.vector_maintainers {
                        vm.apply(tx, &id, Some(record))?;
                    }
                    if let Some(mirror) = &self.mirror {
                        mirror(tx, &id, Some(raw))?;
                    }
                }
                PendingOp::Delete => {
                    self.clear_item(tx, &id)?;
                    for descriptor in &descriptors {
                        self.index_maintainer
                            .update(tx, descriptor, old.as_ref(), None, &id)?;
                    }
                    for vm in &self.vector_maintainers {
                        vm.apply(tx, &id, None)?;
                    }
                    if let Some(mirror) = &self.mirror {
                        mirror(tx, &id, None)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn stage(&self) -> bool {
        let ops = std::mem::take(&mut *self.pending.lock());
        if ops.is_empty() {
            return false;
        }
        *self.staging.lock() = Some(ops);
        true
    }

    fn apply_staged(&self, tx: &dyn Transaction) -> Result<()> {
        match self.staging.lock().as_ref() {
            Some(ops) => self.apply(tx, ops),
            None => Ok(()),
        }
    }

    /// On success, drop the staged snapshot. On failure, merge it back
    /// into pending, preferring anything a concurrent mutation already
    /// added under the same key over the stale staged value.
    fn finish(&self, success: bool) {
        let mut staging = self.staging.lock();
        if success {
            *staging = None;
        } else if let Some(ops) = staging.take() {
            let mut pending = self.pending.lock();
            for (key, op) in ops {
                pending.entry(key).or_insert(op);
            }
        }
    }

    fn rollback(&self) {
        self.pending.lock().clear();
        *self.staging.lock() = None;
    }
}

/// Type-erased access to one [`TypeState<T>`], so the session can hold a
/// heterogeneous registry keyed by [`TypeId`] without a enum of every
/// possible record type.
trait ErasedTypeState: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
    fn stage(&self) -> bool;
    fn apply(&self, tx: &dyn Transaction) -> Result<()>;
    fn finish(&self, success: bool);
    fn rollback(&self);
}

impl<T: Persistable> ErasedTypeState for TypeState<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn type_name(&self) -> &'static str {
        T::type_name()
    }
    fn stage(&self) -> bool {
        TypeState::stage(self)
    }
    fn apply(&self, tx: &dyn Transaction) -> Result<()> {
        self.apply_staged(tx)
    }
    fn finish(&self, success: bool) {
        TypeState::finish(self, success)
    }
    fn rollback(&self) {
        TypeState::rollback(self)
    }
}

struct SessionCore {
    store: Arc<dyn KvStore>,
    driver: Arc<TransactionDriver>,
    types: Mutex<Vec<(TypeId, Arc<dyn ErasedTypeState>)>>,
    committing: AtomicBool,
    autosave_interval: Option<Duration>,
    autosave_scheduled: AtomicBool,
    autosave_enabled: AtomicBool,
    on_autosave_error: Mutex<Option<Box<dyn Fn(&Error) + Send + Sync>>>,
}

/// A unit-of-work session spanning any number of registered record
/// types. Cheap to clone — every clone shares the same pending
/// change-sets and the same in-flight commit guard, which is what lets
/// the coalesced autosave task hold its own handle.
#[derive(Clone)]
pub struct Session(Arc<SessionCore>);

impl Session {
    pub fn new(store: Arc<dyn KvStore>, driver: Arc<TransactionDriver>, autosave_interval: Option<Duration>) -> Self {
        Session(Arc::new(SessionCore {
            store,
            driver,
            types: Mutex::new(Vec::new()),
            committing: AtomicBool::new(false),
            autosave_interval,
            autosave_scheduled: AtomicBool::new(false),
            autosave_enabled: AtomicBool::new(true),
            on_autosave_error: Mutex::new(None),
        }))
    }

    /// Install a callback invoked when a coalesced autosave attempt
    /// fails; autosave is disabled (but explicit `save` calls still
    /// work) immediately before the callback runs.
    pub fn on_autosave_error(&self, callback: impl Fn(&Error) + Send + Sync + 'static) {
        *self.0.on_autosave_error.lock() = Some(Box::new(callback));
    }

    /// Register `T`, scoped to the subspaces resolved for one partition.
    /// Each type may be registered only once per session.
    pub fn register<T: Persistable>(&self, subspaces: SessionSubspaces, limits: Limits) -> Result<()> {
        let state = TypeState::<T>::new(self.0.store.clone(), self.0.driver.clone(), subspaces, limits, None)?;
        self.register_state::<T>(state)
    }

    /// Register `T` as a member of polymorphic protocol `P`: every
    /// insert/delete in this session also mirrors into `protocol`'s
    /// shared directory with the same serialized bytes (§4.K).
    pub fn register_polymorphic<T, P>(
        &self,
        subspaces: SessionSubspaces,
        limits: Limits,
        protocol: ProtocolSubspace,
    ) -> Result<()>
    where
        T: PolymorphicMember<P>,
        P: PolymorphicProtocol,
    {
        let mirror: Arc<MirrorFn> = Arc::new(move |tx, id, raw| match raw {
            Some(bytes) => protocol.mirror_write::<T, P>(tx, id, bytes),
            None => protocol.mirror_clear::<T, P>(tx, id),
        });
        let state = TypeState::<T>::new(
            self.0.store.clone(),
            self.0.driver.clone(),
            subspaces,
            limits,
            Some(mirror),
        )?;
        self.register_state::<T>(state)
    }

    fn register_state<T: Persistable>(&self, state: TypeState<T>) -> Result<()> {
        let mut types = self.0.types.lock();
        if types.iter().any(|(id, _)| *id == TypeId::of::<T>()) {
            return Err(Error::InvalidArgument(format!(
                "type {} is already registered with this session",
                T::type_name()
            )));
        }
        types.push((TypeId::of::<T>(), Arc::new(state)));
        Ok(())
    }

    fn with_type_state<T: Persistable, R>(&self, f: impl FnOnce(&TypeState<T>) -> R) -> Result<R> {
        let erased = {
            let types = self.0.types.lock();
            types
                .iter()
                .find(|(id, _)| *id == TypeId::of::<T>())
                .map(|(_, state)| state.clone())
        };
        let erased = erased.ok_or_else(|| {
            Error::InvalidArgument(format!("type {} is not registered with this session", T::type_name()))
        })?;
        let state = erased
            .as_any()
            .downcast_ref::<TypeState<T>>()
            .expect("type registry invariant violated: TypeId matched but downcast failed");
        Ok(f(state))
    }

    /// Stage an insert (or overwrite) of `record`. Not visible to other
    /// sessions until [`Session::save`].
    pub fn insert<T: Persistable>(&self, record: T) -> Result<()> {
        self.with_type_state::<T, _>(|state| state.insert(record))??;
        self.maybe_schedule_autosave();
        Ok(())
    }

    /// Stage a delete of `id`. Not visible to other sessions until
    /// [`Session::save`].
    pub fn delete<T: Persistable>(&self, id: &Id) -> Result<()> {
        self.with_type_state::<T, _>(|state| state.delete(id))??;
        self.maybe_schedule_autosave();
        Ok(())
    }

    /// Fetch by id, answering from staged changes first, then the store.
    pub fn fetch_by_id<T: Persistable>(&self, id: &Id) -> Result<Option<T>> {
        self.with_type_state::<T, _>(|state| state.fetch_by_id(id))?
    }

    /// Every record of `T`, staged changes overlaid on the store's
    /// committed state.
    pub fn fetch_all<T: Persistable>(&self) -> Result<Vec<T>> {
        self.with_type_state::<T, _>(|state| state.fetch_all())?
    }

    /// Number of records of `T`, staged changes included.
    pub fn count<T: Persistable>(&self) -> Result<usize> {
        self.with_type_state::<T, _>(|state| state.count())?
    }

    /// Top-`k` nearest neighbors of `query` under `T`'s vector index
    /// named `index_name` (E2E nearest-neighbor entry point, §4.G/§4.H).
    pub fn vector_search<T: Persistable>(&self, index_name: &str, query: &[f32], k: usize) -> Result<Vec<(Id, f32)>> {
        self.with_type_state::<T, _>(|state| state.vector_search(index_name, query, k))?
    }

    /// Apply every registered type's staged changes as one grouped
    /// commit through the transaction driver (E), clearing the pending
    /// sets on success. Only one `save` may be in flight per session at
    /// a time; a concurrent call fails fast with
    /// [`Error::ConcurrentSaveNotAllowed`] rather than interleaving.
    pub fn save(&self) -> Result<()> {
        if self.0.committing.swap(true, Ordering::AcqRel) {
            warn!("rejecting concurrent save");
            return Err(Error::ConcurrentSaveNotAllowed);
        }
        let result = self.save_inner();
        self.0.committing.store(false, Ordering::Release);
        if let Err(err) = &result {
            warn!(error = %err, "save failed, pending changes restored");
        }
        result
    }

    fn save_inner(&self) -> Result<()> {
        let types: Vec<(TypeId, Arc<dyn ErasedTypeState>)> = self.0.types.lock().clone();
        let staged: Vec<&Arc<dyn ErasedTypeState>> = types
            .iter()
            .map(|(_, state)| state)
            .filter(|state| state.stage())
            .collect();
        if staged.is_empty() {
            return Ok(());
        }
        debug!(types = staged.len(), "saving session change-set");

        let result = self.0.driver.run(self.0.store.as_ref(), |tx| {
            for state in &staged {
                state.apply(tx)?;
            }
            Ok(())
        });
        for state in &staged {
            state.finish(result.is_ok());
        }
        result
    }

    /// Discard every registered type's staged changes without
    /// persisting them.
    pub fn rollback(&self) {
        for (_, state) in self.0.types.lock().iter() {
            state.rollback();
        }
    }

    /// Run `body` against this session and save on success. On failure,
    /// staged changes accumulated by `body` remain pending (not rolled
    /// back), so the caller can inspect and retry.
    pub fn perform_and_save(&self, body: impl FnOnce(&Self) -> Result<()>) -> Result<()> {
        body(self)?;
        self.save()
    }

    /// On any mutation, schedule a single coalesced `save` ~10 ms out if
    /// one isn't already pending. Further mutations arriving before that
    /// task fires ride along with it for free, since it reads whatever
    /// is pending at fire time rather than a snapshot taken now; a
    /// mutation that lands after the snapshot (while the driver
    /// transaction is in flight) waits for the next mutation to
    /// reschedule. On failure the task disables autosave and, if one is
    /// installed, invokes the `autosave-error` callback.
    fn maybe_schedule_autosave(&self) {
        const AUTOSAVE_DEFER: Duration = Duration::from_millis(10);
        if self.0.autosave_interval.is_none() {
            return;
        }
        if !self.0.autosave_enabled.load(Ordering::Acquire) {
            return;
        }
        if self.0.autosave_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = self.clone();
        thread::spawn(move || {
            thread::sleep(AUTOSAVE_DEFER);
            let result = handle.save();
            handle.0.autosave_scheduled.store(false, Ordering::Release);
            if let Err(err) = result {
                warn!(error = %err, "autosave failed, disabling further autosaves");
                handle.0.autosave_enabled.store(false, Ordering::Release);
                if let Some(callback) = handle.0.on_autosave_error.lock().as_ref() {
                    callback(&err);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyspace_concurrency::RetryConfig;
    use keyspace_core::{DirectoryPathSegment, IndexDescriptor, VectorIndexDescriptor, VectorIndexKind};
    use keyspace_storage::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        id: String,
        body: String,
        embedding: Vec<f32>,
    }

    impl Persistable for Note {
        fn type_name() -> &'static str {
            "Note"
        }
        fn directory_path_components() -> Vec<DirectoryPathSegment> {
            vec![]
        }
        fn index_descriptors() -> Vec<IndexDescriptor<Self>> {
            vec![IndexDescriptor::new("by_body", false, |n: &Note| {
                Some(vec![TupleValue::String(n.body.clone())])
            })]
        }
        fn vector_index_descriptors() -> Vec<VectorIndexDescriptor<Self>> {
            vec![VectorIndexDescriptor::new(
                "by_embedding",
                VectorIndexKind::Flat {
                    dim: 2,
                    metric: keyspace_core::DistanceMetric::Euclidean,
                },
                |n: &Note| if n.embedding.is_empty() { None } else { Some(n.embedding.clone()) },
            )]
        }
        fn id(&self) -> Id {
            Id::single(self.id.clone())
        }
        fn field_by_name(&self, name: &str) -> Option<TupleValue> {
            match name {
                "id" => Some(TupleValue::String(self.id.clone())),
                "body" => Some(TupleValue::String(self.body.clone())),
                _ => None,
            }
        }
        fn serialize(&self) -> Result<Vec<u8>> {
            let mut out = format!("{}\0{}\0", self.id, self.body).into_bytes();
            for v in &self.embedding {
                out.extend(v.to_le_bytes());
            }
            Ok(out)
        }
        fn deserialize(bytes: &[u8]) -> Result<Self> {
            let nul = bytes.iter().position(|&b| b == 0).unwrap();
            let id = String::from_utf8(bytes[..nul].to_vec()).unwrap();
            let rest = &bytes[nul + 1..];
            let nul2 = rest.iter().position(|&b| b == 0).unwrap();
            let body = String::from_utf8(rest[..nul2].to_vec()).unwrap();
            let tail = &rest[nul2 + 1..];
            let embedding = tail.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect();
            Ok(Note { id, body, embedding })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Tag {
        id: String,
        label: String,
    }

    impl Persistable for Tag {
        fn type_name() -> &'static str {
            "Tag"
        }
        fn directory_path_components() -> Vec<DirectoryPathSegment> {
            vec![]
        }
        fn index_descriptors() -> Vec<IndexDescriptor<Self>> {
            vec![]
        }
        fn id(&self) -> Id {
            Id::single(self.id.clone())
        }
        fn field_by_name(&self, name: &str) -> Option<TupleValue> {
            match name {
                "id" => Some(TupleValue::String(self.id.clone())),
                "label" => Some(TupleValue::String(self.label.clone())),
                _ => None,
            }
        }
        fn serialize(&self) -> Result<Vec<u8>> {
            Ok(format!("{}\0{}", self.id, self.label).into_bytes())
        }
        fn deserialize(bytes: &[u8]) -> Result<Self> {
            let s = String::from_utf8(bytes.to_vec()).unwrap();
            let mut parts = s.splitn(2, '\0');
            Ok(Tag {
                id: parts.next().unwrap().to_string(),
                label: parts.next().unwrap().to_string(),
            })
        }
    }

    fn note_subspaces() -> SessionSubspaces {
        SessionSubspaces {
            item_root: b"i/Note/".to_vec(),
            index_root: b"x/Note/".to_vec(),
            blob_root: b"b/Note/".to_vec(),
            vector_root: b"v/Note/".to_vec(),
        }
    }

    fn tag_subspaces() -> SessionSubspaces {
        SessionSubspaces {
            item_root: b"i/Tag/".to_vec(),
            index_root: b"x/Tag/".to_vec(),
            blob_root: b"b/Tag/".to_vec(),
            vector_root: b"v/Tag/".to_vec(),
        }
    }

    fn driver() -> Arc<TransactionDriver> {
        Arc::new(TransactionDriver::new(RetryConfig::default()))
    }

    fn note_session(store: Arc<dyn KvStore>) -> Session {
        let session = Session::new(store, driver(), None);
        session.register::<Note>(note_subspaces(), Limits::with_small_limits()).unwrap();
        session
    }

    #[test]
    fn fetch_by_id_sees_staged_insert_before_save() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = note_session(store);
        let note = Note {
            id: "n1".into(),
            body: "hello".into(),
            embedding: vec![],
        };
        session.insert(note.clone()).unwrap();
        assert_eq!(session.fetch_by_id::<Note>(&note.id()).unwrap(), Some(note));
    }

    #[test]
    fn save_persists_and_clears_pending() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = note_session(store.clone());
        let note = Note {
            id: "n1".into(),
            body: "hello".into(),
            embedding: vec![],
        };
        session.insert(note.clone()).unwrap();
        session.save().unwrap();

        let other_session = note_session(store);
        assert_eq!(other_session.fetch_by_id::<Note>(&note.id()).unwrap(), Some(note));
    }

    #[test]
    fn rollback_discards_staged_changes() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = note_session(store);
        session
            .insert(Note {
                id: "n1".into(),
                body: "hello".into(),
                embedding: vec![],
            })
            .unwrap();
        session.rollback();
        assert_eq!(session.fetch_all::<Note>().unwrap().len(), 0);
    }

    #[test]
    fn delete_after_save_removes_record() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = note_session(store);
        let note = Note {
            id: "n1".into(),
            body: "hello".into(),
            embedding: vec![],
        };
        session.insert(note.clone()).unwrap();
        session.save().unwrap();

        session.delete::<Note>(&note.id()).unwrap();
        session.save().unwrap();

        assert_eq!(session.fetch_by_id::<Note>(&note.id()).unwrap(), None);
    }

    #[test]
    fn oversized_payload_round_trips_through_blob_chunks() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = note_session(store);
        let note = Note {
            id: "n1".into(),
            body: "x".repeat(1000),
            embedding: vec![],
        };
        session.insert(note.clone()).unwrap();
        session.save().unwrap();
        assert_eq!(session.fetch_by_id::<Note>(&note.id()).unwrap(), Some(note));
    }

    #[test]
    fn perform_and_save_saves_after_body_runs() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = note_session(store.clone());
        session
            .perform_and_save(|s| {
                s.insert(Note {
                    id: "n1".into(),
                    body: "hello".into(),
                    embedding: vec![],
                })
            })
            .unwrap();

        let other = note_session(store);
        assert_eq!(other.count::<Note>().unwrap(), 1);
    }

    #[test]
    fn save_with_no_pending_changes_is_a_no_op() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = note_session(store);
        assert!(session.save().is_ok());
    }

    #[test]
    fn vector_search_finds_nearest_neighbor_after_save() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = note_session(store);
        session
            .insert(Note {
                id: "n1".into(),
                body: "close".into(),
                embedding: vec![0.0, 0.0],
            })
            .unwrap();
        session
            .insert(Note {
                id: "n2".into(),
                body: "far".into(),
                embedding: vec![10.0, 10.0],
            })
            .unwrap();
        session.save().unwrap();

        let hits = session.vector_search::<Note>("by_embedding", &[0.1, 0.1], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, Id::single("n1"));
    }

    #[test]
    fn two_types_commit_atomically_in_one_save() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = Session::new(store.clone(), driver(), None);
        session.register::<Note>(note_subspaces(), Limits::with_small_limits()).unwrap();
        session.register::<Tag>(tag_subspaces(), Limits::with_small_limits()).unwrap();

        session
            .insert(Note {
                id: "n1".into(),
                body: "hello".into(),
                embedding: vec![],
            })
            .unwrap();
        session
            .insert(Tag {
                id: "t1".into(),
                label: "urgent".into(),
            })
            .unwrap();
        session.save().unwrap();

        let other = Session::new(store, driver(), None);
        other.register::<Note>(note_subspaces(), Limits::with_small_limits()).unwrap();
        other.register::<Tag>(tag_subspaces(), Limits::with_small_limits()).unwrap();
        assert_eq!(other.count::<Note>().unwrap(), 1);
        assert_eq!(other.count::<Tag>().unwrap(), 1);
    }

    #[test]
    fn fetch_by_id_on_unregistered_type_is_rejected() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = Session::new(store, driver(), None);
        let err = session.fetch_by_id::<Tag>(&Id::single("x")).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn registering_the_same_type_twice_is_rejected() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = Session::new(store, driver(), None);
        session.register::<Tag>(tag_subspaces(), Limits::with_small_limits()).unwrap();
        assert!(session.register::<Tag>(tag_subspaces(), Limits::with_small_limits()).is_err());
    }

    #[test]
    fn autosave_flushes_without_an_explicit_save_call() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = Session::new(store.clone(), driver(), Some(Duration::from_millis(10)));
        session.register::<Tag>(tag_subspaces(), Limits::with_small_limits()).unwrap();

        session
            .insert(Tag {
                id: "t1".into(),
                label: "auto".into(),
            })
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let other = Session::new(store, driver(), None);
        other.register::<Tag>(tag_subspaces(), Limits::with_small_limits()).unwrap();
        loop {
            if other.count::<Tag>().unwrap() == 1 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "autosave never flushed");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn autosave_error_callback_fires_and_disables_autosave() {
        // Note's declared vector index is fixed at dim 2; staging an
        // embedding of the wrong length fails inside the flat index's
        // own dimension check when autosave applies it, giving a real
        // failure to drive the callback with.
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let session = Session::new(store, driver(), Some(Duration::from_millis(10)));
        session.register::<Note>(note_subspaces(), Limits::with_small_limits()).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            session.on_autosave_error(move |_err| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        session
            .insert(Note {
                id: "n1".into(),
                body: "bad".into(),
                embedding: vec![1.0, 2.0, 3.0],
            })
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "autosave error callback never fired");
            thread::sleep(Duration::from_millis(20));
        }
    }
}
