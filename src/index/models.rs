//! Index entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dsp::HashToken;

/// Lifecycle of a source. `Unclaimed -> Pending -> one terminal`; terminal
/// states are never revised by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Unclaimed,
    Pending,
    Fingerprinted,
    Matched,
    TooShort,
    Flagged,
}

impl SourceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SourceStatus::Fingerprinted
                | SourceStatus::Matched
                | SourceStatus::TooShort
                | SourceStatus::Flagged
        )
    }

    /// Transitions the engine is allowed to make.
    pub fn can_become(self, next: SourceStatus) -> bool {
        match self {
            SourceStatus::Unclaimed => next == SourceStatus::Pending,
            SourceStatus::Pending => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceStatus::Unclaimed => "unclaimed",
            SourceStatus::Pending => "pending",
            SourceStatus::Fingerprinted => "fingerprinted",
            SourceStatus::Matched => "matched",
            SourceStatus::TooShort => "too_short",
            SourceStatus::Flagged => "flagged",
        }
    }

    pub fn parse(s: &str) -> Option<SourceStatus> {
        Some(match s {
            "unclaimed" => SourceStatus::Unclaimed,
            "pending" => SourceStatus::Pending,
            "fingerprinted" => SourceStatus::Fingerprinted,
            "matched" => SourceStatus::Matched,
            "too_short" => SourceStatus::TooShort,
            "flagged" => SourceStatus::Flagged,
            _ => return None,
        })
    }
}

/// One canonical audio asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    /// YouTube video id; unique across sources.
    pub external_id: String,
    pub title: String,
    pub duration_ms: i64,
    /// The canonical source this one duplicates. Always points at a root:
    /// originals do not chain.
    pub original_ref: Option<Uuid>,
    pub status: SourceStatus,
    pub created_at: DateTime<Utc>,
}

/// Aggregate statistics for one hash across the whole index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashStat {
    pub hash: HashToken,
    pub total_count: i64,
    pub source_count: i64,
}

/// One `(source, delta)` bucket surviving candidate search, ranked by
/// `matched_count` descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub source_id: Uuid,
    /// `t_ref_in_index - t_ref_in_query`; constant across true-match hashes.
    pub delta: i64,
    pub matched_count: i64,
}

/// Keyset cursor for `claim_next`: position strictly after
/// `(duration_ms, id)` in `duration_ms DESC, id DESC` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCursor {
    pub duration_ms: i64,
    pub id: Uuid,
}

/// One batch of claimed sources plus the cursor for the next call.
#[derive(Debug, Clone)]
pub struct ClaimBatch {
    pub sources: Vec<Source>,
    pub cursor: Option<ClaimCursor>,
}
