//! Polymorphic directory & dual-write (§4.K): mirrors a conforming
//! concrete type's writes into a shared protocol-level directory keyed
//! by `type_code`, and answers protocol-wide reads by fanning out across
//! every known conforming type.
//!
//! A concrete type only needs mirroring when its own directory differs
//! from the protocol's; when they're the same directory, the "mirror" is
//! the primary copy and no dual-write is needed. This module assumes the
//! caller (the session, at save time) has already decided the two
//! differ, since only it knows both subspace roots.

use keyspace_core::{tuple, Id, PolymorphicMember, PolymorphicProtocol, Result, TupleValue};
use keyspace_storage::Transaction;

/// The shared subspace a [`PolymorphicProtocol`] resolves to, rooted the
/// same way a concrete type's item subspace is (`P/i/<type-code>/<id>`).
#[derive(Debug, Clone)]
pub struct ProtocolSubspace {
    pub item_root: Vec<u8>,
}

impl ProtocolSubspace {
    fn entry_key(&self, type_code: u16, id: &Id) -> Result<Vec<u8>> {
        let mut key = self.item_root.clone();
        key.extend(tuple::encode(&[TupleValue::Int(type_code as i64)])?);
        key.extend(tuple::encode(id.elements())?);
        Ok(key)
    }

    /// Mirror a concrete record's raw item-slot bytes (tag byte included)
    /// into the protocol's shared directory. Called by the session at
    /// save time alongside the concrete type's own item write, with the
    /// same bytes, so no re-encode happens.
    pub fn mirror_write<T, P>(
        &self,
        tx: &dyn Transaction,
        id: &Id,
        raw_item_bytes: Vec<u8>,
    ) -> Result<()>
    where
        T: PolymorphicMember<P>,
        P: PolymorphicProtocol,
    {
        let key = self.entry_key(T::type_code().0, id)?;
        tx.set(&key, raw_item_bytes);
        Ok(())
    }

    /// Clear a concrete record's mirror entry. Called by the session
    /// alongside the concrete type's own item clear.
    pub fn mirror_clear<T, P>(&self, tx: &dyn Transaction, id: &Id) -> Result<()>
    where
        T: PolymorphicMember<P>,
        P: PolymorphicProtocol,
    {
        let key = self.entry_key(T::type_code().0, id)?;
        tx.clear(&key);
        Ok(())
    }

    /// Search every known conforming type's slice of the shared directory
    /// for `id`, returning the first match's raw bytes and the
    /// `type_code` it was found under. The protocol doesn't know which
    /// concrete type an id belongs to ahead of time, so every known code
    /// is probed; callers with a `type_code` already in hand should read
    /// `entry_key` directly instead.
    pub fn fetch_by_id<P: PolymorphicProtocol>(
        &self,
        tx: &dyn Transaction,
        id: &Id,
    ) -> Result<Option<(u16, Vec<u8>)>> {
        for (type_code, _name) in P::known_type_codes() {
            let key = self.entry_key(type_code.0, id)?;
            if let Some(bytes) = tx.get(&key)? {
                return Ok(Some((type_code.0, bytes)));
            }
        }
        Ok(None)
    }

    /// Every entry in the shared directory, grouped by the `type_code` it
    /// was written under. Decoding into concrete types is left to the
    /// caller, which knows the `type_code → concrete type` mapping.
    pub fn fetch_all_raw(&self, tx: &dyn Transaction) -> Result<Vec<(u16, Id, Vec<u8>)>> {
        let (begin, end) = tuple::range(&self.item_root);
        let rows = tx.get_range(&begin, &end, None, true, Default::default())?;

        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            if key.len() < self.item_root.len() {
                continue;
            }
            let Ok(elements) = tuple::decode(&key[self.item_root.len()..]) else {
                continue;
            };
            let Some((TupleValue::Int(type_code), rest)) = elements.split_first() else {
                continue;
            };
            let id = Id::new(rest.to_vec());
            out.push((*type_code as u16, id, value));
        }
        Ok(out)
    }
}
