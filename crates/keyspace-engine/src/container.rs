//! The container (§4.L): wires the directory layer, the read-version
//! cache, and a [`ContainerConfig`] together into the one entry point
//! applications construct a [`Session`] or [`Query`] from.
//!
//! A `Container` owns no data of its own beyond these shared, process-
//! lifetime services; every byte lives in the [`KvStore`] it was built
//! around. Opening a session or a query just resolves the caller's
//! record type to its subspaces and hands them, along with the shared
//! store handle and driver, to the session/query constructors.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use keyspace_concurrency::TransactionDriver;
use keyspace_core::{
    DirectoryPathSegment, Error, Limits, PartitionBinding, Persistable, PolymorphicMember,
    PolymorphicProtocol, Result, TupleValue,
};
use keyspace_index::{IndexMaintainer, IndexState};
use keyspace_session::{ProtocolSubspace, Query, QuerySubspaces, Session, SessionSubspaces};
use keyspace_storage::{DirectoryLayer, KvStore};

use crate::config::ContainerConfig;

/// The shared services every session and query opened against one store
/// draw on: the directory layer's path-to-prefix cache, the read-version
/// cache, and the transaction driver every session and query routes its
/// commits and reads through. One `Container` is typically constructed
/// per process and shared across every record type it serves.
pub struct Container {
    store: Arc<dyn KvStore>,
    directory: Arc<DirectoryLayer>,
    read_version_cache: Arc<keyspace_concurrency::ReadVersionCache>,
    driver: Arc<TransactionDriver>,
    config: ContainerConfig,
}

impl Container {
    pub fn new(store: Arc<dyn KvStore>, config: ContainerConfig) -> Self {
        info!("opening container");
        let driver = Arc::new(TransactionDriver::new(config.retry_config()));
        Container {
            store,
            directory: Arc::new(DirectoryLayer::new()),
            read_version_cache: Arc::new(keyspace_concurrency::ReadVersionCache::new()),
            driver,
            config,
        }
    }

    /// Resolve `T`'s declared directory path against `binding`, raising
    /// [`Error::DynamicFieldsRequired`] up front if any `Field` segment
    /// lacks a bound value rather than letting the directory layer's
    /// generic `InvalidArgument` surface instead.
    pub fn resolve_directory<T: Persistable>(&self, binding: &PartitionBinding) -> Result<Vec<u8>> {
        let segments = T::directory_path_components();
        let missing: Vec<String> = segments
            .iter()
            .filter_map(|segment| match segment {
                DirectoryPathSegment::Field(name) if binding.get(name).is_none() => {
                    Some(name.clone())
                }
                _ => None,
            })
            .collect();
        if !missing.is_empty() {
            return Err(Error::DynamicFieldsRequired {
                type_name: T::type_name().to_string(),
                fields: missing,
            });
        }
        self.directory.resolve(self.store.as_ref(), &segments, binding)
    }

    /// Resolve a [`PolymorphicProtocol`]'s shared directory path. A
    /// dynamic segment here is a configuration error, not a missing
    /// binding, since polymorphic declarations may only use static path
    /// segments.
    pub fn resolve_polymorphic_directory<P: PolymorphicProtocol>(&self) -> Result<Vec<u8>> {
        let segments = P::directory_path_components();
        if segments.iter().any(DirectoryPathSegment::is_dynamic) {
            return Err(Error::InvalidArgument(format!(
                "polymorphic protocol {} declares a dynamic path segment",
                P::protocol_name()
            )));
        }
        self.directory
            .resolve(self.store.as_ref(), &segments, &PartitionBinding::new())
    }

    fn subspace_roots<T: Persistable>(
        &self,
        binding: &PartitionBinding,
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>)> {
        let base = self.resolve_directory::<T>(binding)?;
        let item_root = append_segment(&base, "i")?;
        let index_root = append_segment(&base, "x")?;
        let blob_root = append_segment(&base, "b")?;
        let vector_root = append_segment(&base, "v")?;
        Ok((item_root, index_root, blob_root, vector_root))
    }

    /// Build the four subspaces a [`Session`] or [`Query`] over `T`
    /// needs, resolving `T`'s directory path against `binding`.
    pub fn session_subspaces<T: Persistable>(
        &self,
        binding: &PartitionBinding,
    ) -> Result<SessionSubspaces> {
        let (item_root, index_root, blob_root, vector_root) = self.subspace_roots::<T>(binding)?;
        Ok(SessionSubspaces {
            item_root,
            index_root,
            blob_root,
            vector_root,
        })
    }

    /// Open a [`Session`] scoped to `binding`'s partition with `T`
    /// registered. Further types (from the same partition's directory
    /// tree) can be registered on the returned session before its first
    /// `save`, so several record types commit atomically together.
    pub fn new_session<T: Persistable>(
        &self,
        binding: &PartitionBinding,
        autosave_interval: Option<Duration>,
    ) -> Result<Session> {
        let subspaces = self.session_subspaces::<T>(binding)?;
        let session = Session::new(self.store.clone(), self.driver.clone(), autosave_interval);
        session.register::<T>(subspaces, self.config.limits)?;
        Ok(session)
    }

    /// Register `T` as a polymorphic member of `P` on an existing
    /// session, wiring its dual-write mirror into `P`'s shared directory.
    pub fn register_polymorphic<T, P>(&self, session: &Session, binding: &PartitionBinding) -> Result<()>
    where
        T: PolymorphicMember<P>,
        P: PolymorphicProtocol,
    {
        let subspaces = self.session_subspaces::<T>(binding)?;
        let protocol = self.protocol_subspace::<P>()?;
        session.register_polymorphic::<T, P>(subspaces, self.config.limits, protocol)
    }

    /// Open a [`Query<T>`] builder for `binding`'s partition.
    pub fn query<T: Persistable>(&self, binding: &PartitionBinding) -> Result<Query<T>> {
        let (item_root, index_root, blob_root, _vector_root) = self.subspace_roots::<T>(binding)?;
        Ok(Query::new(
            self.store.clone(),
            self.driver.clone(),
            QuerySubspaces {
                item_root,
                index_root,
                blob_root,
            },
            self.read_version_cache.clone(),
        ))
    }

    /// Open a [`ProtocolSubspace`] for polymorphic mirrored writes.
    pub fn protocol_subspace<P: PolymorphicProtocol>(&self) -> Result<ProtocolSubspace> {
        let item_root = self.resolve_polymorphic_directory::<P>()?;
        Ok(ProtocolSubspace { item_root })
    }

    /// Transition every declared index on `T` to [`IndexState::Readable`]
    /// in a single transaction. There is no runtime type registry, so a
    /// caller reconciles each known type explicitly at startup rather
    /// than this sweeping over every type ever declared.
    pub fn reconcile_index_states<T: Persistable>(&self, binding: &PartitionBinding) -> Result<()> {
        let (_, index_root, _, _) = self.subspace_roots::<T>(binding)?;
        let maintainer: IndexMaintainer<T> = IndexMaintainer::new(index_root);
        let tx = self.store.begin(None);
        for descriptor in T::index_descriptors() {
            maintainer.set_state(tx.as_ref(), &descriptor.name, IndexState::Readable)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Whether `index_name` on `T` has any uniqueness violation recorded
    /// while it was `WriteOnly`. Callers resolve (or accept) these before
    /// calling [`Container::reconcile_index_states`].
    pub fn scan_violations<T: Persistable>(
        &self,
        binding: &PartitionBinding,
        index_name: &str,
    ) -> Result<bool> {
        let (_, index_root, _, _) = self.subspace_roots::<T>(binding)?;
        let maintainer: IndexMaintainer<T> = IndexMaintainer::new(index_root);
        let tx = self.store.begin(None);
        maintainer.has_violations(tx.as_ref(), index_name)
    }

    /// `(cached_version, times_refreshed)`, for diagnostics.
    pub fn read_version_cache_info(&self) -> (Option<u64>, u64) {
        self.read_version_cache.info()
    }

    pub fn clear_read_version_cache(&self) {
        self.read_version_cache.clear();
    }

    /// Forget every resolved directory path. Normal operation never
    /// needs this since path-to-prefix mappings are immutable once
    /// allocated; tests use it to simulate a fresh process.
    pub fn clear_directory_cache(&self) {
        self.directory.clear_cache();
    }
}

fn append_segment(root: &[u8], tag: &str) -> Result<Vec<u8>> {
    let mut key = root.to_vec();
    key.extend(keyspace_core::tuple::encode(&[TupleValue::String(
        tag.to_string(),
    )])?);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyspace_core::{Id, IndexDescriptor};
    use keyspace_storage::MemoryStore;

    #[derive(Debug, Clone, PartialEq)]
    struct Order {
        id: String,
        tenant: String,
        status: String,
    }

    impl Persistable for Order {
        fn type_name() -> &'static str {
            "Order"
        }
        fn directory_path_components() -> Vec<DirectoryPathSegment> {
            vec![
                DirectoryPathSegment::static_("app"),
                DirectoryPathSegment::field("tenant"),
                DirectoryPathSegment::static_("orders"),
            ]
        }
        fn index_descriptors() -> Vec<IndexDescriptor<Self>> {
            vec![IndexDescriptor::new("by_status", false, |o: &Order| {
                Some(vec![TupleValue::String(o.status.clone())])
            })]
        }
        fn id(&self) -> Id {
            Id::single(self.id.clone())
        }
        fn field_by_name(&self, name: &str) -> Option<TupleValue> {
            match name {
                "id" => Some(TupleValue::String(self.id.clone())),
                "tenant" => Some(TupleValue::String(self.tenant.clone())),
                "status" => Some(TupleValue::String(self.status.clone())),
                _ => None,
            }
        }
        fn serialize(&self) -> Result<Vec<u8>> {
            Ok(format!("{}\0{}\0{}", self.id, self.tenant, self.status).into_bytes())
        }
        fn deserialize(bytes: &[u8]) -> Result<Self> {
            let s = String::from_utf8(bytes.to_vec()).unwrap();
            let mut parts = s.splitn(3, '\0');
            Ok(Order {
                id: parts.next().unwrap().to_string(),
                tenant: parts.next().unwrap().to_string(),
                status: parts.next().unwrap().to_string(),
            })
        }
    }

    fn container() -> Container {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        Container::new(store, ContainerConfig::default())
    }

    #[test]
    fn missing_dynamic_binding_reports_the_field_name() {
        let c = container();
        let err = c
            .resolve_directory::<Order>(&PartitionBinding::new())
            .unwrap_err();
        match err {
            Error::DynamicFieldsRequired { fields, .. } => {
                assert_eq!(fields, vec!["tenant".to_string()]);
            }
            other => panic!("expected DynamicFieldsRequired, got {other:?}"),
        }
    }

    #[test]
    fn distinct_tenant_bindings_resolve_to_distinct_subspaces() {
        let c = container();
        let a = c
            .session_subspaces::<Order>(&PartitionBinding::new().with("tenant", "acme"))
            .unwrap();
        let b = c
            .session_subspaces::<Order>(&PartitionBinding::new().with("tenant", "globex"))
            .unwrap();
        assert_ne!(a.item_root, b.item_root);
    }

    #[test]
    fn session_round_trips_through_container() {
        let c = container();
        let binding = PartitionBinding::new().with("tenant", "acme");
        let session = c.new_session::<Order>(&binding, None).unwrap();
        let order = Order {
            id: "o1".into(),
            tenant: "acme".into(),
            status: "pending".into(),
        };
        session.insert(order.clone()).unwrap();
        session.save().unwrap();

        let found = c
            .new_session::<Order>(&binding, None)
            .unwrap()
            .fetch_by_id::<Order>(&order.id())
            .unwrap();
        assert_eq!(found, Some(order));
    }

    #[test]
    fn query_sees_records_written_by_a_session() {
        let c = container();
        let binding = PartitionBinding::new().with("tenant", "acme");
        let session = c.new_session::<Order>(&binding, None).unwrap();
        session
            .insert(Order {
                id: "o1".into(),
                tenant: "acme".into(),
                status: "pending".into(),
            })
            .unwrap();
        session.save().unwrap();

        let results = c.query::<Order>(&binding).unwrap().execute().unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn reconcile_index_states_promotes_every_declared_index() {
        let c = container();
        let binding = PartitionBinding::new().with("tenant", "acme");
        c.reconcile_index_states::<Order>(&binding).unwrap();
        assert!(!c.scan_violations::<Order>(&binding, "by_status").unwrap());
    }

    #[test]
    fn polymorphic_directory_rejects_dynamic_segments() {
        struct BadProtocol;
        impl PolymorphicProtocol for BadProtocol {
            fn protocol_name() -> &'static str {
                "Bad"
            }
            fn directory_path_components() -> Vec<DirectoryPathSegment> {
                vec![DirectoryPathSegment::field("tenant")]
            }
            fn known_type_codes() -> Vec<(keyspace_core::TypeCode, &'static str)> {
                vec![]
            }
        }
        let c = container();
        assert!(c.resolve_polymorphic_directory::<BadProtocol>().is_err());
    }
}
