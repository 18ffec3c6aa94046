//! The fingerprint index: occurrences, hash statistics and the source
//! lifecycle, behind an abstract RPC surface.
//!
//! [`postgres::PgIndex`] is the production implementation; candidate search
//! and claiming run server-side as stored functions.
//! [`memory::MemoryIndex`] implements the same contract in-process and backs
//! the test suite.

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::SearchConfig;
use crate::dsp::Fingerprint;
use crate::error::Result;

pub mod memory;
pub mod models;
pub mod postgres;

use models::{Candidate, ClaimBatch, ClaimCursor, SourceStatus};

#[async_trait]
pub trait FingerprintIndex: Send + Sync {
    /// Claim up to `limit` unclaimed sources, longest first, strictly after
    /// `cursor`. Claimed sources atomically become `pending`; no two callers
    /// ever receive the same source.
    async fn claim_next(&self, limit: i64, cursor: Option<ClaimCursor>) -> Result<ClaimBatch>;

    /// Find `(source, delta)` buckets sharing hashes with `query`, with
    /// stop-word suppression, per-hash hit caps, a minimum bucket size and
    /// per-source delta smoothing applied. Ranked by matched count
    /// descending. An empty index or an all-stop-word query returns an empty
    /// list, never an error.
    async fn find_candidates(
        &self,
        query: &[Fingerprint],
        params: &SearchConfig,
    ) -> Result<Vec<Candidate>>;

    /// Persist occurrences for one source in chunks of `chunk_size` rows,
    /// idempotently on `(hash, source_id, t_ref)`. Hash statistics are
    /// updated in the same transaction as each chunk, counting only rows
    /// actually inserted. Returns the number of new rows.
    async fn insert_occurrences(
        &self,
        source_id: Uuid,
        rows: &[Fingerprint],
        chunk_size: usize,
    ) -> Result<u64>;

    /// Apply a monotonic status transition. `original_ref` is required for
    /// `Matched` and normalized to its root so originals never chain.
    async fn set_status(
        &self,
        source_id: Uuid,
        status: SourceStatus,
        original_ref: Option<Uuid>,
    ) -> Result<()>;

    /// Remove a source and all its occurrences, decrementing hash
    /// statistics symmetrically. Returns the number of occurrence rows
    /// removed.
    async fn delete_source(&self, source_id: Uuid) -> Result<u64>;
}
