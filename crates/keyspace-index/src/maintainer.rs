//! Scalar and unique secondary index maintenance (§4.F).
//!
//! An [`IndexMaintainer`] keeps one declared [`IndexDescriptor`] in sync
//! with its owning record type inside a single transaction: on insert,
//! update, or delete it removes the stale index entry (if any) and writes
//! the fresh one (if any), enforcing uniqueness for `unique` indexes.
//!
//! Index entries live under a subspace scoped to one descriptor:
//! `<index_root>/<name>/<key...>` for unique indexes (value: the id
//! tuple), or `<index_root>/<name>/<key...>/<id...>` for scalar indexes
//! (value: empty, multiplicity encoded in the key itself). A key
//! expression that evaluates to `None` (the sparse/nil case) contributes
//! no entry at all.
//!
//! Each index also carries a one-byte state flag, `Disabled` →
//! `WriteOnly` → `Readable`, so a newly declared index can be built in
//! the background (admitting writes, tracking — but not rejecting —
//! uniqueness violations) before being promoted to serve reads.

use std::marker::PhantomData;

use keyspace_core::{Error, Id, IndexDescriptor, Persistable, Result, TupleValue};
use keyspace_storage::Transaction;

const STATE_MARKER: &str = "__state__";
const VIOLATIONS_MARKER: &str = "__violations__";

/// An index's position in its build lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Not maintained at all; `update` is a no-op.
    Disabled,
    /// Maintained, but uniqueness violations are tracked rather than
    /// rejected, and queries must not rely on the index being complete.
    WriteOnly,
    /// Fully built and enforced; the query executor may select it.
    Readable,
}

impl IndexState {
    fn to_byte(self) -> u8 {
        match self {
            IndexState::Disabled => 0,
            IndexState::WriteOnly => 1,
            IndexState::Readable => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(IndexState::Disabled),
            1 => Ok(IndexState::WriteOnly),
            2 => Ok(IndexState::Readable),
            other => Err(Error::Invariant(format!(
                "unrecognized index state byte {other}"
            ))),
        }
    }
}

fn encode_elements(elements: &[TupleValue]) -> Result<Vec<u8>> {
    keyspace_core::tuple::encode(elements)
}

/// Maintains every declared index for one record type, rooted at a
/// subspace prefix resolved by the directory layer.
pub struct IndexMaintainer<T: Persistable> {
    index_root: Vec<u8>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Persistable> IndexMaintainer<T> {
    pub fn new(index_root: Vec<u8>) -> Self {
        IndexMaintainer {
            index_root,
            _marker: PhantomData,
        }
    }

    fn descriptor_prefix(&self, name: &str) -> Result<Vec<u8>> {
        let mut prefix = self.index_root.clone();
        prefix.extend(encode_elements(&[TupleValue::String(name.to_string())])?);
        Ok(prefix)
    }

    fn state_key(&self, name: &str) -> Result<Vec<u8>> {
        let mut key = self.index_root.clone();
        key.extend(encode_elements(&[
            TupleValue::String(STATE_MARKER.to_string()),
            TupleValue::String(name.to_string()),
        ])?);
        Ok(key)
    }

    fn violations_prefix(&self, name: &str) -> Result<Vec<u8>> {
        let mut key = self.index_root.clone();
        key.extend(encode_elements(&[
            TupleValue::String(VIOLATIONS_MARKER.to_string()),
            TupleValue::String(name.to_string()),
        ])?);
        Ok(key)
    }

    /// Read this index's build state. Absent state defaults to `Readable`
    /// — an index declared on a type with no prior data needs no
    /// background build, and most tests never call `set_state` at all.
    pub fn get_state(&self, tx: &dyn Transaction, name: &str) -> Result<IndexState> {
        let key = self.state_key(name)?;
        match tx.get(&key)? {
            Some(bytes) => {
                let byte = *bytes
                    .first()
                    .ok_or_else(|| Error::Invariant("empty index state record".into()))?;
                IndexState::from_byte(byte)
            }
            None => Ok(IndexState::Readable),
        }
    }

    pub fn set_state(&self, tx: &dyn Transaction, name: &str, state: IndexState) -> Result<()> {
        let key = self.state_key(name)?;
        tx.set(&key, vec![state.to_byte()]);
        Ok(())
    }

    /// Whether any uniqueness violation was recorded while this index was
    /// `WriteOnly`. A caller must resolve (or accept) these before
    /// promoting the index to `Readable`.
    pub fn has_violations(&self, tx: &dyn Transaction, name: &str) -> Result<bool> {
        let prefix = self.violations_prefix(name)?;
        let (begin, end) = keyspace_core::tuple::range(&prefix);
        let rows = tx.get_range(&begin, &end, Some(1), true, Default::default())?;
        Ok(!rows.is_empty())
    }

    /// Apply the effect of replacing `old` with `new` (either may be
    /// `None`, for insert/delete respectively) on one declared index.
    pub fn update(
        &self,
        tx: &dyn Transaction,
        descriptor: &IndexDescriptor<T>,
        old: Option<&T>,
        new: Option<&T>,
        id: &Id,
    ) -> Result<()> {
        let state = self.get_state(tx, &descriptor.name)?;
        if state == IndexState::Disabled {
            return Ok(());
        }

        let old_key = old.and_then(|o| (descriptor.key_fn)(o));
        let new_key = new.and_then(|n| (descriptor.key_fn)(n));
        if old_key == new_key {
            return Ok(());
        }

        if let Some(old_key) = old_key {
            self.remove_entry(tx, descriptor, &old_key, id)?;
        }
        if let Some(new_key) = new_key {
            self.insert_entry(tx, descriptor, &new_key, id, state)?;
        }
        Ok(())
    }

    fn remove_entry(
        &self,
        tx: &dyn Transaction,
        descriptor: &IndexDescriptor<T>,
        key_elements: &[TupleValue],
        id: &Id,
    ) -> Result<()> {
        let prefix = self.descriptor_prefix(&descriptor.name)?;
        if descriptor.unique {
            let mut entry_key = prefix;
            entry_key.extend(encode_elements(key_elements)?);
            tx.clear(&entry_key);
        } else {
            let mut entry_key = prefix;
            entry_key.extend(encode_elements(key_elements)?);
            entry_key.extend(encode_elements(id.elements())?);
            tx.clear(&entry_key);
        }
        Ok(())
    }

    fn insert_entry(
        &self,
        tx: &dyn Transaction,
        descriptor: &IndexDescriptor<T>,
        key_elements: &[TupleValue],
        id: &Id,
        state: IndexState,
    ) -> Result<()> {
        let prefix = self.descriptor_prefix(&descriptor.name)?;
        let id_bytes = encode_elements(id.elements())?;

        if descriptor.unique {
            let mut entry_key = prefix;
            entry_key.extend(encode_elements(key_elements)?);
            if let Some(existing) = tx.get(&entry_key)? {
                if existing != id_bytes {
                    if state == IndexState::Readable {
                        return Err(Error::UniquenessViolation {
                            index_name: descriptor.name.clone(),
                            key: format!("{key_elements:?}"),
                        });
                    }
                    self.record_violation(tx, &descriptor.name, key_elements, id)?;
                }
            }
            tx.set(&entry_key, id_bytes);
        } else {
            let mut entry_key = prefix;
            entry_key.extend(encode_elements(key_elements)?);
            entry_key.extend(&id_bytes);
            tx.set(&entry_key, Vec::new());
        }
        Ok(())
    }

    fn record_violation(
        &self,
        tx: &dyn Transaction,
        name: &str,
        key_elements: &[TupleValue],
        id: &Id,
    ) -> Result<()> {
        let mut key = self.violations_prefix(name)?;
        key.extend(encode_elements(key_elements)?);
        key.extend(encode_elements(id.elements())?);
        tx.set(&key, Vec::new());
        Ok(())
    }

    /// Every `(key, id)` pair currently recorded for `descriptor`, used to
    /// rebuild an index from scratch or to back the query executor's
    /// index-scan path. Scalar and unique indexes decode identically from
    /// the caller's perspective; only the on-disk shape differs.
    pub fn scan(
        &self,
        tx: &dyn Transaction,
        descriptor: &IndexDescriptor<T>,
    ) -> Result<Vec<(Vec<TupleValue>, Id)>> {
        let prefix = self.descriptor_prefix(&descriptor.name)?;
        let (begin, end) = keyspace_core::tuple::range(&prefix);
        let rows = tx.get_range(&begin, &end, None, true, Default::default())?;

        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            if key.len() < prefix.len() {
                continue;
            }
            if descriptor.unique {
                let key_elements = keyspace_core::tuple::decode(&key[prefix.len()..])?;
                let id_elements = keyspace_core::tuple::decode(&value)?;
                out.push((key_elements, Id::new(id_elements)));
            } else {
                let suffix = keyspace_core::tuple::decode(&key[prefix.len()..])?;
                // The key expression's own arity is unknown here; callers
                // that need to split key vs. id elements must do so from
                // `descriptor`-specific knowledge. For the common single
                // element key used throughout this codebase, the id is
                // everything after the first element.
                if suffix.is_empty() {
                    continue;
                }
                let (key_elements, id_elements) = suffix.split_at(1);
                out.push((key_elements.to_vec(), Id::new(id_elements.to_vec())));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyspace_storage::{KvStore, MemoryStore};

    #[derive(Debug, Clone, PartialEq)]
    struct User {
        id: String,
        email: String,
        age: i64,
    }

    impl Persistable for User {
        fn type_name() -> &'static str {
            "User"
        }
        fn directory_path_components() -> Vec<keyspace_core::DirectoryPathSegment> {
            vec![]
        }
        fn index_descriptors() -> Vec<IndexDescriptor<Self>> {
            vec![
                IndexDescriptor::new("by_email", true, |u: &User| {
                    Some(vec![TupleValue::String(u.email.clone())])
                }),
                IndexDescriptor::new("by_age", false, |u: &User| {
                    Some(vec![TupleValue::Int(u.age)])
                }),
            ]
        }
        fn id(&self) -> Id {
            Id::single(self.id.clone())
        }
        fn field_by_name(&self, _name: &str) -> Option<TupleValue> {
            None
        }
        fn serialize(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn deserialize(_bytes: &[u8]) -> Result<Self> {
            unimplemented!()
        }
    }

    fn descriptors() -> (IndexDescriptor<User>, IndexDescriptor<User>) {
        let mut all = User::index_descriptors();
        let age = all.pop().unwrap();
        let email = all.pop().unwrap();
        (email, age)
    }

    #[test]
    fn insert_then_scan_unique_index() {
        let store = MemoryStore::new();
        let tx = store.begin(None);
        let maintainer: IndexMaintainer<User> = IndexMaintainer::new(b"idx/".to_vec());
        let (email_idx, _) = descriptors();

        let u = User {
            id: "u1".into(),
            email: "a@b.com".into(),
            age: 30,
        };
        maintainer
            .update(tx.as_ref(), &email_idx, None, Some(&u), &u.id())
            .unwrap();

        let rows = maintainer.scan(tx.as_ref(), &email_idx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, vec![TupleValue::String("a@b.com".into())]);
    }

    #[test]
    fn readable_unique_index_rejects_duplicate() {
        let store = MemoryStore::new();
        let tx = store.begin(None);
        let maintainer: IndexMaintainer<User> = IndexMaintainer::new(b"idx/".to_vec());
        let (email_idx, _) = descriptors();

        let u1 = User {
            id: "u1".into(),
            email: "a@b.com".into(),
            age: 30,
        };
        let u2 = User {
            id: "u2".into(),
            email: "a@b.com".into(),
            age: 31,
        };
        maintainer
            .update(tx.as_ref(), &email_idx, None, Some(&u1), &u1.id())
            .unwrap();
        let result = maintainer.update(tx.as_ref(), &email_idx, None, Some(&u2), &u2.id());
        assert!(result.is_err());
    }

    #[test]
    fn write_only_index_admits_duplicate_and_tracks_violation() {
        let store = MemoryStore::new();
        let tx = store.begin(None);
        let maintainer: IndexMaintainer<User> = IndexMaintainer::new(b"idx/".to_vec());
        let (email_idx, _) = descriptors();
        maintainer
            .set_state(tx.as_ref(), &email_idx.name, IndexState::WriteOnly)
            .unwrap();

        let u1 = User {
            id: "u1".into(),
            email: "a@b.com".into(),
            age: 30,
        };
        let u2 = User {
            id: "u2".into(),
            email: "a@b.com".into(),
            age: 31,
        };
        maintainer
            .update(tx.as_ref(), &email_idx, None, Some(&u1), &u1.id())
            .unwrap();
        maintainer
            .update(tx.as_ref(), &email_idx, None, Some(&u2), &u2.id())
            .unwrap();

        assert!(maintainer
            .has_violations(tx.as_ref(), &email_idx.name)
            .unwrap());
    }

    #[test]
    fn disabled_index_is_a_no_op() {
        let store = MemoryStore::new();
        let tx = store.begin(None);
        let maintainer: IndexMaintainer<User> = IndexMaintainer::new(b"idx/".to_vec());
        let (email_idx, _) = descriptors();
        maintainer
            .set_state(tx.as_ref(), &email_idx.name, IndexState::Disabled)
            .unwrap();

        let u = User {
            id: "u1".into(),
            email: "a@b.com".into(),
            age: 30,
        };
        maintainer
            .update(tx.as_ref(), &email_idx, None, Some(&u), &u.id())
            .unwrap();
        let rows = maintainer.scan(tx.as_ref(), &email_idx).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn sparse_key_expression_contributes_no_entry() {
        let store = MemoryStore::new();
        let tx = store.begin(None);
        let maintainer: IndexMaintainer<User> = IndexMaintainer::new(b"idx/".to_vec());
        let sparse_idx: IndexDescriptor<User> =
            IndexDescriptor::new("maybe", false, |_u: &User| None);

        let u = User {
            id: "u1".into(),
            email: "a@b.com".into(),
            age: 30,
        };
        maintainer
            .update(tx.as_ref(), &sparse_idx, None, Some(&u), &u.id())
            .unwrap();
        let rows = maintainer.scan(tx.as_ref(), &sparse_idx).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn update_removes_stale_entry_and_writes_fresh_one() {
        let store = MemoryStore::new();
        let tx = store.begin(None);
        let maintainer: IndexMaintainer<User> = IndexMaintainer::new(b"idx/".to_vec());
        let (_, age_idx) = descriptors();

        let before = User {
            id: "u1".into(),
            email: "a@b.com".into(),
            age: 30,
        };
        let after = User {
            id: "u1".into(),
            email: "a@b.com".into(),
            age: 31,
        };
        maintainer
            .update(tx.as_ref(), &age_idx, None, Some(&before), &before.id())
            .unwrap();
        maintainer
            .update(
                tx.as_ref(),
                &age_idx,
                Some(&before),
                Some(&after),
                &after.id(),
            )
            .unwrap();

        let rows = maintainer.scan(tx.as_ref(), &age_idx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, vec![TupleValue::Int(31)]);
    }

    #[test]
    fn delete_removes_entry() {
        let store = MemoryStore::new();
        let tx = store.begin(None);
        let maintainer: IndexMaintainer<User> = IndexMaintainer::new(b"idx/".to_vec());
        let (email_idx, _) = descriptors();

        let u = User {
            id: "u1".into(),
            email: "a@b.com".into(),
            age: 30,
        };
        maintainer
            .update(tx.as_ref(), &email_idx, None, Some(&u), &u.id())
            .unwrap();
        maintainer
            .update(tx.as_ref(), &email_idx, Some(&u), None, &u.id())
            .unwrap();

        let rows = maintainer.scan(tx.as_ref(), &email_idx).unwrap();
        assert!(rows.is_empty());
    }
}
