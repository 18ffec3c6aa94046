//! Match decision.
//!
//! Candidate search returns `(source, delta)` buckets ranked by matched
//! count; the decision applies the length-aware threshold and converts the
//! winning delta into a millisecond offset.

use serde::Serialize;
use uuid::Uuid;

use crate::config::{AudioConfig, SearchConfig};
use crate::index::models::Candidate;

#[derive(Debug, Clone, Serialize)]
pub struct MatchDecision {
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_ms: Option<i64>,
    /// `matched_count / query_len` of the best candidate, 0 when there is
    /// none.
    pub score: f64,
}

impl MatchDecision {
    pub fn no_match(score: f64) -> Self {
        Self {
            matched: false,
            source_id: None,
            offset_ms: None,
            score,
        }
    }
}

/// Apply the match threshold to ranked candidates.
///
/// The query time base is frames, so the winning delta converts to
/// milliseconds through `delta * hop * 1000 / sample_rate`. Negative deltas
/// (the clip starts before the indexed original) survive the conversion.
pub fn decide(
    candidates: &[Candidate],
    query_len: usize,
    search: &SearchConfig,
    audio: &AudioConfig,
) -> MatchDecision {
    let Some(best) = candidates.first() else {
        return MatchDecision::no_match(0.0);
    };
    if query_len == 0 {
        return MatchDecision::no_match(0.0);
    }

    let score = best.matched_count as f64 / query_len as f64;
    if score < search.match_threshold {
        return MatchDecision::no_match(score);
    }

    let offset_ms = best.delta * audio.hop as i64 * 1000 / i64::from(audio.sample_rate);
    MatchDecision {
        matched: true,
        source_id: Some(best.source_id),
        offset_ms: Some(offset_ms),
        score,
    }
}
