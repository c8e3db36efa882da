//! The KV-store contract (§6): the single external dependency of the
//! whole system. Keys and values are byte strings, ordering is strictly
//! lexicographic, and transactions provide snapshot reads with read/write
//! conflict tracking, atomic mutations, and range scans.
//!
//! Everything above this trait — the tuple codec, directories, indexes,
//! sessions — is written against `KvStore`/`Transaction` alone, so a real
//! FoundationDB client can replace [`crate::memory::MemoryStore`] without
//! touching any other crate.

use keyspace_core::Result;

/// An atomic mutation applied directly by the store, without a
/// read-modify-write round trip. Only `Add` is needed by this system (the
/// HNSW node/label counters in §3 are maintained via atomic-add).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationType {
    /// Interpret both the existing value and the operand as little-endian
    /// i64s and store their sum (zero-extending a missing existing value).
    Add,
}

/// How a range scan should stream its results. `WantAll` reads the whole
/// range before returning; `Iterator` is free to paginate. The in-memory
/// backend treats both identically since it never round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamingMode {
    #[default]
    Iterator,
    WantAll,
}

/// A live transaction handle. All mutating calls buffer into the
/// transaction's local write/delete sets; nothing is visible to other
/// transactions until [`Transaction::commit`] succeeds.
pub trait Transaction: Send {
    /// Snapshot read: does not add `key` to the read-conflict set.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Snapshot read: does not add `key` to the read-conflict set, and
    /// does not observe this transaction's own pending writes.
    fn get_snapshot(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Half-open range scan `[begin, end)`, merging this transaction's
    /// pending writes over the underlying snapshot. `snapshot` selects
    /// whether the scanned keys are added to the read-conflict set.
    fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: Option<usize>,
        snapshot: bool,
        streaming_mode: StreamingMode,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn set(&self, key: &[u8], value: Vec<u8>);

    fn clear(&self, key: &[u8]);

    fn clear_range(&self, begin: &[u8], end: &[u8]);

    fn atomic_op(&self, key: &[u8], operand: &[u8], op: MutationType);

    /// Approximate size in bytes of this transaction's buffered mutations,
    /// used to enforce `TransactionTooLarge` before commit.
    fn get_approximate_size(&self) -> usize;

    fn get_read_version(&self) -> u64;

    fn set_read_version(&self, version: u64);

    /// Commit the buffered mutations. On success, returns the assigned
    /// commit version. On conflict, returns a retryable `Error::Conflict`.
    fn commit(&self) -> Result<u64>;
}

/// A KV-store handle: thread-safe, shared across sessions, process-long.
pub trait KvStore: Send + Sync {
    /// Begin a new transaction. If `read_version` is `Some`, the
    /// transaction's initial read version is pinned to it (used by the
    /// transaction driver's read-version cache, §4.D); otherwise the store
    /// assigns the current version.
    fn begin(&self, read_version: Option<u64>) -> Box<dyn Transaction>;

    /// The highest commit version observed so far; used to seed a fresh
    /// read-version cache entry.
    fn current_version(&self) -> u64;
}
