//! In-process index implementation.
//!
//! Mirrors the Postgres index contract exactly (claiming, idempotent ingest
//! with stat maintenance, candidate search, monotonic status), backed by a
//! mutex-guarded map. Used by the test suite and useful for local
//! experiments without a database.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::config::SearchConfig;
use crate::dsp::{Fingerprint, HashToken};
use crate::error::{EngineError, Result};
use crate::index::models::{
    Candidate, ClaimBatch, ClaimCursor, HashStat, Source, SourceStatus,
};
use crate::index::FingerprintIndex;

#[derive(Default)]
struct State {
    sources: HashMap<Uuid, Source>,
    /// Per hash, occurrences ordered by `(source_id, t_ref)`.
    occurrences: HashMap<HashToken, BTreeSet<(Uuid, u32)>>,
    /// `(total_count, source_count)` per hash, maintained alongside every
    /// occurrence mutation.
    stats: HashMap<HashToken, (i64, i64)>,
}

#[derive(Default)]
pub struct MemoryIndex {
    state: Mutex<State>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unclaimed source. Metadata ingestion is outside the
    /// engine; tests and local tools seed sources through this.
    pub fn register_source(&self, external_id: &str, title: &str, duration_ms: i64) -> Source {
        let source = Source {
            id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            title: title.to_string(),
            duration_ms,
            original_ref: None,
            status: SourceStatus::Unclaimed,
            created_at: Utc::now(),
        };
        self.state
            .lock()
            .expect("index lock poisoned")
            .sources
            .insert(source.id, source.clone());
        source
    }

    pub fn source(&self, id: Uuid) -> Option<Source> {
        self.state
            .lock()
            .expect("index lock poisoned")
            .sources
            .get(&id)
            .cloned()
    }

    pub fn hash_stat(&self, hash: HashToken) -> Option<HashStat> {
        self.state
            .lock()
            .expect("index lock poisoned")
            .stats
            .get(&hash)
            .map(|&(total_count, source_count)| HashStat {
                hash,
                total_count,
                source_count,
            })
    }

    pub fn all_stats(&self) -> Vec<HashStat> {
        let mut stats: Vec<HashStat> = self
            .state
            .lock()
            .expect("index lock poisoned")
            .stats
            .iter()
            .map(|(&hash, &(total_count, source_count))| HashStat {
                hash,
                total_count,
                source_count,
            })
            .collect();
        stats.sort_by_key(|s| s.hash);
        stats
    }

    /// Recompute stats from the occurrence sets. Test oracle for the
    /// maintained counters.
    pub fn recounted_stats(&self) -> Vec<HashStat> {
        let state = self.state.lock().expect("index lock poisoned");
        let mut stats: Vec<HashStat> = state
            .occurrences
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(&hash, set)| {
                let source_count = set
                    .iter()
                    .map(|(source_id, _)| *source_id)
                    .collect::<HashSet<_>>()
                    .len() as i64;
                HashStat {
                    hash,
                    total_count: set.len() as i64,
                    source_count,
                }
            })
            .collect();
        stats.sort_by_key(|s| s.hash);
        stats
    }
}

#[async_trait]
impl FingerprintIndex for MemoryIndex {
    async fn claim_next(&self, limit: i64, cursor: Option<ClaimCursor>) -> Result<ClaimBatch> {
        let mut state = self.state.lock().expect("index lock poisoned");

        let mut eligible: Vec<(i64, Uuid)> = state
            .sources
            .values()
            .filter(|s| s.status == SourceStatus::Unclaimed)
            .map(|s| (s.duration_ms, s.id))
            .collect();
        // Longest first; id breaks duration ties.
        eligible.sort_by(|a, b| b.cmp(a));

        let after = |key: &(i64, Uuid)| match cursor {
            None => true,
            Some(c) => *key < (c.duration_ms, c.id),
        };

        let mut sources = Vec::new();
        for (_, id) in eligible.into_iter().filter(after).take(limit.max(0) as usize) {
            let source = state
                .sources
                .get_mut(&id)
                .expect("eligible source disappeared");
            source.status = SourceStatus::Pending;
            sources.push(source.clone());
        }

        let next_cursor = sources.last().map(|s| ClaimCursor {
            duration_ms: s.duration_ms,
            id: s.id,
        });
        Ok(ClaimBatch {
            sources,
            cursor: next_cursor,
        })
    }

    async fn find_candidates(
        &self,
        query: &[Fingerprint],
        params: &SearchConfig,
    ) -> Result<Vec<Candidate>> {
        let state = self.state.lock().expect("index lock poisoned");

        // Stop words: top ignore_fraction of distinct hashes by total count,
        // ties broken by hash value.
        let stop_count = (params.ignore_fraction * state.stats.len() as f64).ceil() as usize;
        let stop_words: HashSet<HashToken> = if stop_count == 0 {
            HashSet::new()
        } else {
            let mut ranked: Vec<(i64, HashToken)> = state
                .stats
                .iter()
                .map(|(&hash, &(total, _))| (total, hash))
                .collect();
            ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            ranked.into_iter().take(stop_count).map(|(_, h)| h).collect()
        };

        // Probe each distinct query hash once; cap hits per hash in
        // (source_id, t_ref) order.
        let mut capped: HashMap<HashToken, Vec<(Uuid, u32)>> = HashMap::new();
        for fp in query {
            if stop_words.contains(&fp.hash) || capped.contains_key(&fp.hash) {
                continue;
            }
            if let Some(set) = state.occurrences.get(&fp.hash) {
                let hits: Vec<(Uuid, u32)> = set
                    .iter()
                    .take(params.max_hits_per_hash.max(0) as usize)
                    .copied()
                    .collect();
                capped.insert(fp.hash, hits);
            }
        }

        // Bucket on (source, delta); a query hash counts once per bucket.
        let mut buckets: HashMap<(Uuid, i64), HashSet<HashToken>> = HashMap::new();
        for fp in query {
            let Some(hits) = capped.get(&fp.hash) else { continue };
            for &(source_id, t_ref) in hits {
                let delta = i64::from(t_ref) - i64::from(fp.t_ref);
                buckets
                    .entry((source_id, delta))
                    .or_default()
                    .insert(fp.hash);
            }
        }

        let mut per_source: HashMap<Uuid, Vec<(i64, i64)>> = HashMap::new();
        for ((source_id, delta), hashes) in buckets {
            let count = hashes.len() as i64;
            if count < params.min_matches {
                continue;
            }
            per_source.entry(source_id).or_default().push((delta, count));
        }

        // Delta smoothing: fold buckets within the tolerance of the
        // source's best delta into it.
        let mut candidates: Vec<Candidate> = per_source
            .into_iter()
            .map(|(source_id, buckets)| {
                let &(best_delta, _) = buckets
                    .iter()
                    .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
                    .expect("non-empty bucket list");
                let matched_count = buckets
                    .iter()
                    .filter(|(delta, _)| (delta - best_delta).abs() <= params.delta_tolerance)
                    .map(|&(_, count)| count)
                    .sum();
                Candidate {
                    source_id,
                    delta: best_delta,
                    matched_count,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.matched_count
                .cmp(&a.matched_count)
                .then(a.source_id.cmp(&b.source_id))
        });
        candidates.truncate(params.limit_candidates.max(0) as usize);
        Ok(candidates)
    }

    async fn insert_occurrences(
        &self,
        source_id: Uuid,
        rows: &[Fingerprint],
        chunk_size: usize,
    ) -> Result<u64> {
        let mut state = self.state.lock().expect("index lock poisoned");
        if !state.sources.contains_key(&source_id) {
            return Err(EngineError::SourceNotFound(source_id));
        }

        let chunk_size = chunk_size.max(1);
        let mut inserted = 0u64;

        for chunk in rows.chunks(chunk_size) {
            // One chunk is one transaction: occurrences and their stat
            // increments land together.
            let State {
                occurrences, stats, ..
            } = &mut *state;
            for fp in chunk {
                let set = occurrences.entry(fp.hash).or_default();
                if !set.insert((source_id, fp.t_ref)) {
                    continue;
                }
                inserted += 1;

                let first_for_source = set
                    .range((source_id, u32::MIN)..=(source_id, u32::MAX))
                    .nth(1)
                    .is_none();
                let stat = stats.entry(fp.hash).or_insert((0, 0));
                stat.0 += 1;
                if first_for_source {
                    stat.1 += 1;
                }
            }
        }
        Ok(inserted)
    }

    async fn set_status(
        &self,
        source_id: Uuid,
        status: SourceStatus,
        original_ref: Option<Uuid>,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("index lock poisoned");

        let normalized_ref = if status == SourceStatus::Matched {
            let target = original_ref.ok_or(EngineError::MissingOriginalRef(source_id))?;
            // Originals never chain: resolve the target to its root.
            let root = state
                .sources
                .get(&target)
                .and_then(|s| s.original_ref)
                .unwrap_or(target);
            Some(root)
        } else {
            None
        };

        let source = state
            .sources
            .get_mut(&source_id)
            .ok_or(EngineError::SourceNotFound(source_id))?;
        if !source.status.can_become(status) {
            return Err(EngineError::InvalidTransition {
                source_id,
                from: source.status,
                to: status,
            });
        }

        source.status = status;
        source.original_ref = normalized_ref;
        Ok(())
    }

    async fn delete_source(&self, source_id: Uuid) -> Result<u64> {
        let mut state = self.state.lock().expect("index lock poisoned");
        if state.sources.remove(&source_id).is_none() {
            return Ok(0);
        }
        for other in state.sources.values_mut() {
            if other.original_ref == Some(source_id) {
                other.original_ref = None;
            }
        }

        let State {
            occurrences, stats, ..
        } = &mut *state;
        let mut removed_total = 0u64;
        occurrences.retain(|hash, set| {
            let removed: Vec<(Uuid, u32)> = set
                .range((source_id, u32::MIN)..=(source_id, u32::MAX))
                .copied()
                .collect();
            if !removed.is_empty() {
                for key in &removed {
                    set.remove(key);
                }
                removed_total += removed.len() as u64;

                if let Some(stat) = stats.get_mut(hash) {
                    stat.0 -= removed.len() as i64;
                    stat.1 -= 1;
                    if stat.0 <= 0 || stat.1 <= 0 {
                        stats.remove(hash);
                    }
                }
            }
            !set.is_empty()
        });
        Ok(removed_total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(f_anchor: usize, f_target: usize, dt: u32, t_ref: u32) -> Fingerprint {
        Fingerprint {
            hash: HashToken::pack(f_anchor, f_target, dt),
            t_ref,
        }
    }

    /// A deterministic fingerprint unique to `tag`, long enough to clear
    /// `min_matches` when re-queried.
    fn unique_fingerprint(tag: usize, len: usize) -> Vec<Fingerprint> {
        (0..len)
            .map(|i| fp(tag % 1024, (tag * 31 + i) % 1024, (i % 199 + 1) as u32, i as u32))
            .collect()
    }

    #[tokio::test]
    async fn stats_match_recount_after_overlapping_ingests() {
        let index = MemoryIndex::new();
        let a = index.register_source("vid-a", "A", 60_000);
        let b = index.register_source("vid-b", "B", 50_000);

        let shared: Vec<Fingerprint> = (0..40).map(|i| fp(10, 20, 5, i)).collect();
        index.insert_occurrences(a.id, &shared, 16).await.unwrap();
        index.insert_occurrences(b.id, &shared, 16).await.unwrap();
        index
            .insert_occurrences(a.id, &unique_fingerprint(3, 25), 16)
            .await
            .unwrap();

        assert_eq!(index.all_stats(), index.recounted_stats());

        let shared_stat = index.hash_stat(HashToken::pack(10, 20, 5)).unwrap();
        assert_eq!(shared_stat.total_count, 80);
        assert_eq!(shared_stat.source_count, 2);
    }

    #[tokio::test]
    async fn ingest_is_idempotent() {
        let index = MemoryIndex::new();
        let a = index.register_source("vid-a", "A", 60_000);
        let rows = unique_fingerprint(1, 50);

        let first = index.insert_occurrences(a.id, &rows, 7).await.unwrap();
        let stats_after_first = index.all_stats();
        let second = index.insert_occurrences(a.id, &rows, 7).await.unwrap();

        assert_eq!(first, 50);
        assert_eq!(second, 0);
        assert_eq!(index.all_stats(), stats_after_first);
    }

    #[tokio::test]
    async fn duplicate_rows_within_one_call_coalesce() {
        let index = MemoryIndex::new();
        let a = index.register_source("vid-a", "A", 60_000);
        let row = fp(1, 2, 3, 4);

        let inserted = index
            .insert_occurrences(a.id, &[row, row, row], 10)
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(index.hash_stat(row.hash).unwrap().total_count, 1);
    }

    #[tokio::test]
    async fn deleting_a_source_restores_prior_stats() {
        let index = MemoryIndex::new();
        let a = index.register_source("vid-a", "A", 60_000);
        let b = index.register_source("vid-b", "B", 50_000);

        index
            .insert_occurrences(a.id, &unique_fingerprint(1, 60), 32)
            .await
            .unwrap();
        let before = index.all_stats();

        let rows = unique_fingerprint(2, 45);
        index.insert_occurrences(b.id, &rows, 32).await.unwrap();
        let removed = index.delete_source(b.id).await.unwrap();

        assert_eq!(removed, 45);
        assert_eq!(index.all_stats(), before);
        assert!(index.source(b.id).is_none());
    }

    #[tokio::test]
    async fn claim_orders_longest_first_and_is_exclusive() {
        let index = MemoryIndex::new();
        let long = index.register_source("long", "L", 90_000);
        let mid = index.register_source("mid", "M", 60_000);
        let short = index.register_source("short", "S", 30_000);

        let batch = index.claim_next(2, None).await.unwrap();
        let ids: Vec<Uuid> = batch.sources.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![long.id, mid.id]);
        assert!(batch
            .sources
            .iter()
            .all(|s| s.status == SourceStatus::Pending));

        // The cursor continues past the claimed keyset; claimed sources are
        // never handed out twice.
        let rest = index.claim_next(2, batch.cursor).await.unwrap();
        let ids: Vec<Uuid> = rest.sources.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![short.id]);

        let empty = index.claim_next(2, rest.cursor).await.unwrap();
        assert!(empty.sources.is_empty());
        assert!(empty.cursor.is_none());

        let fresh = index.claim_next(10, None).await.unwrap();
        assert!(fresh.sources.is_empty());
    }

    #[tokio::test]
    async fn terminal_status_is_immutable() {
        let index = MemoryIndex::new();
        let a = index.register_source("vid-a", "A", 60_000);

        index
            .set_status(a.id, SourceStatus::Pending, None)
            .await
            .unwrap();
        index
            .set_status(a.id, SourceStatus::TooShort, None)
            .await
            .unwrap();

        let err = index
            .set_status(a.id, SourceStatus::Flagged, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(index.source(a.id).unwrap().status, SourceStatus::TooShort);
    }

    #[tokio::test]
    async fn matched_ref_normalizes_to_root() {
        let index = MemoryIndex::new();
        let root = index.register_source("root", "R", 60_000);
        let dup = index.register_source("dup", "D", 60_000);
        let dup2 = index.register_source("dup2", "D2", 60_000);

        for s in [dup.id, dup2.id] {
            index.set_status(s, SourceStatus::Pending, None).await.unwrap();
        }
        index
            .set_status(dup.id, SourceStatus::Matched, Some(root.id))
            .await
            .unwrap();
        // Matching against a duplicate lands on its root instead.
        index
            .set_status(dup2.id, SourceStatus::Matched, Some(dup.id))
            .await
            .unwrap();

        assert_eq!(index.source(dup.id).unwrap().original_ref, Some(root.id));
        assert_eq!(index.source(dup2.id).unwrap().original_ref, Some(root.id));
    }

    #[tokio::test]
    async fn search_counts_each_query_hash_once_per_bucket() {
        let index = MemoryIndex::new();
        let a = index.register_source("vid-a", "A", 60_000);

        // Ten distinct hashes at a constant offset of 100 frames, plus one
        // hash occurring many times in the same bucket.
        let mut rows = Vec::new();
        for i in 0..10u32 {
            rows.push(fp(i as usize, 500, 7, 100 + i));
        }
        for t in 0..20u32 {
            rows.push(fp(900, 901, 3, 100 + t * 2));
        }
        index.insert_occurrences(a.id, &rows, 64).await.unwrap();

        let mut query: Vec<Fingerprint> = (0..10u32).map(|i| fp(i as usize, 500, 7, i)).collect();
        for t in 0..20u32 {
            query.push(fp(900, 901, 3, t * 2));
        }

        let params = SearchConfig {
            ignore_fraction: 0.0,
            min_matches: 1,
            delta_tolerance: 0,
            ..SearchConfig::default()
        };
        let candidates = index.find_candidates(&query, &params).await.unwrap();

        // 10 distinct hashes + 1 repeated hash = 11, not 30.
        assert_eq!(candidates[0].delta, 100);
        assert_eq!(candidates[0].matched_count, 11);
    }

    #[tokio::test]
    async fn delta_smoothing_merges_adjacent_buckets() {
        let index = MemoryIndex::new();
        let a = index.register_source("vid-a", "A", 60_000);

        // Eight hashes at delta 50, three jittered to 51.
        let mut rows = Vec::new();
        for i in 0..8u32 {
            rows.push(fp(i as usize, 300, 9, 50 + i));
        }
        for i in 8..11u32 {
            rows.push(fp(i as usize, 300, 9, 51 + i));
        }
        index.insert_occurrences(a.id, &rows, 64).await.unwrap();

        let query: Vec<Fingerprint> = (0..11u32).map(|i| fp(i as usize, 300, 9, i)).collect();
        let params = SearchConfig {
            ignore_fraction: 0.0,
            min_matches: 3,
            delta_tolerance: 1,
            ..SearchConfig::default()
        };
        let candidates = index.find_candidates(&query, &params).await.unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].delta, 50);
        assert_eq!(candidates[0].matched_count, 11);
    }

    #[tokio::test]
    async fn empty_index_and_empty_query_return_no_candidates() {
        let index = MemoryIndex::new();
        let params = SearchConfig::default();
        assert!(index
            .find_candidates(&[fp(1, 2, 3, 0)], &params)
            .await
            .unwrap()
            .is_empty());
        assert!(index.find_candidates(&[], &params).await.unwrap().is_empty());
    }
}
