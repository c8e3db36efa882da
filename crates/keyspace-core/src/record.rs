//! Record codec: the inline-vs-external-blob storage plan for a record's
//! serialized payload (§4.B, §3, §6).
//!
//! `Persistable::serialize`/`deserialize` produce and consume the record's
//! wire bytes; this module decides *where* those bytes live. A payload at
//! or under [`Limits::inline_value_threshold`] is stored directly in the
//! item slot. A larger payload is split into fixed-size chunks written to
//! the blob subspace, and the item slot instead holds a small sentinel —
//! `(blob_id, chunk_count, uncompressed_size)` — that reads reassemble
//! transparently.

use crate::error::{Error, Result};
use crate::limits::Limits;
use crate::tuple::{decode, encode};
use crate::types::TupleValue;
use uuid::Uuid;

/// A reference to a payload chunked into the blob subspace.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobSentinel {
    pub blob_id: Uuid,
    pub chunk_count: u32,
    pub uncompressed_size: u64,
}

impl BlobSentinel {
    /// Encode as a small tuple so it can live in the item slot
    /// indistinguishably from any other tuple-encoded value.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(&[
            TupleValue::Uuid(self.blob_id),
            TupleValue::Int(self.chunk_count as i64),
            TupleValue::Int(self.uncompressed_size as i64),
        ])
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let elements = decode(bytes)?;
        match elements.as_slice() {
            [TupleValue::Uuid(blob_id), TupleValue::Int(chunk_count), TupleValue::Int(uncompressed_size)] =>
            {
                Ok(BlobSentinel {
                    blob_id: *blob_id,
                    chunk_count: *chunk_count as u32,
                    uncompressed_size: *uncompressed_size as u64,
                })
            }
            _ => Err(Error::TupleDecodingError(
                "malformed blob sentinel".into(),
            )),
        }
    }
}

/// Where a serialized record payload will live.
#[derive(Debug, Clone, PartialEq)]
pub enum StoragePlan {
    /// Store `bytes` directly at the item key.
    Inline(Vec<u8>),
    /// Store the sentinel at the item key; the chunks (returned alongside)
    /// go to `S/b/<blob-id>/<chunk-n>`.
    External {
        sentinel: BlobSentinel,
        chunks: Vec<(u32, Vec<u8>)>,
    },
}

/// Decide whether `payload` fits inline or must be chunked externally,
/// and produce the chunks if so. `blob_id` is supplied by the caller
/// (allocated fresh per insert) so chunking stays a pure function.
pub fn plan_storage(payload: Vec<u8>, limits: &Limits, blob_id: Uuid) -> StoragePlan {
    if !limits.requires_external_storage(payload.len()) {
        return StoragePlan::Inline(payload);
    }
    let uncompressed_size = payload.len() as u64;
    let chunks: Vec<(u32, Vec<u8>)> = payload
        .chunks(limits.blob_chunk_size)
        .enumerate()
        .map(|(i, c)| (i as u32, c.to_vec()))
        .collect();
    let sentinel = BlobSentinel {
        blob_id,
        chunk_count: chunks.len() as u32,
        uncompressed_size,
    };
    StoragePlan::External { sentinel, chunks }
}

/// Reassemble a payload from its chunks, in chunk-number order. The
/// caller is responsible for fetching every chunk `0..chunk_count`;
/// a short read is a structural error, not a validation one.
pub fn reassemble(mut chunks: Vec<(u32, Vec<u8>)>) -> Result<Vec<u8>> {
    chunks.sort_by_key(|(n, _)| *n);
    let mut out = Vec::new();
    for (expected, (n, bytes)) in chunks.into_iter().enumerate() {
        if n != expected as u32 {
            return Err(Error::Invariant(format!(
                "missing blob chunk {expected}, found {n} instead"
            )));
        }
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}
