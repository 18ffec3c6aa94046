//! Pipeline workers.
//!
//! Each worker claims a batch of unprocessed sources, runs the CPU stages
//! off the async runtime and routes the result: store the fingerprint as a
//! new original, or link the source to the original it duplicates. One
//! source failing never takes the worker down.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, RetryConfig};
use crate::dsp;
use crate::error::{EngineError, Result};
use crate::index::models::{ClaimCursor, Source, SourceStatus};
use crate::index::FingerprintIndex;
use crate::matcher;
use crate::segment;
use crate::store::BlobStore;

/// What the pipeline did with one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Linked to an existing original; nothing stored.
    Matched,
    /// Stored as a new candidate original.
    Stored,
    /// Produced too few hashes; nothing stored.
    TooShort,
}

pub struct Worker {
    pub id: usize,
    pub index: Arc<dyn FingerprintIndex>,
    pub blobs: Arc<dyn BlobStore>,
    pub config: Arc<EngineConfig>,
}

impl Worker {
    /// Claim-process loop. Returns once `shutdown` flips, finishing the
    /// source in flight first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let idle = Duration::from_secs(self.config.service.idle_poll_secs);
        let mut cursor: Option<ClaimCursor> = None;

        info!(worker = self.id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = match retry_with_backoff(&self.config.service.retry, || {
                self.index.claim_next(self.config.service.claim_batch, cursor)
            })
            .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "claim failed, backing off");
                    cursor = None;
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            if batch.sources.is_empty() {
                cursor = None;
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for source in &batch.sources {
                self.process_claimed(source).await;
                if *shutdown.borrow() {
                    info!(worker = self.id, "draining after current source");
                    return;
                }
            }
            cursor = batch.cursor;
        }
        info!(worker = self.id, "worker stopped");
    }

    /// Run one source under the per-source timeout and apply the error
    /// disposition: transient index failures leave the source pending,
    /// everything else flags it.
    pub async fn process_claimed(&self, source: &Source) {
        let started = Instant::now();
        match tokio::time::timeout(self.config.per_source_timeout(), self.process(source)).await {
            Ok(Ok(outcome)) => {
                info!(
                    worker = self.id,
                    source = %source.id,
                    external_id = %source.external_id,
                    ?outcome,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "source processed"
                );
            }
            Ok(Err(e)) if e.leaves_pending() => {
                warn!(
                    worker = self.id,
                    source = %source.id,
                    error = %e,
                    "index unavailable, source left pending"
                );
            }
            Ok(Err(e)) => {
                error!(worker = self.id, source = %source.id, error = %e, "pipeline failed");
                self.flag(source.id).await;
            }
            Err(_) => {
                error!(
                    worker = self.id,
                    source = %source.id,
                    timeout_s = self.config.service.per_source_timeout_secs,
                    "source timed out"
                );
                self.flag(source.id).await;
            }
        }
    }

    async fn process(&self, source: &Source) -> Result<Outcome> {
        let key = format!("{}.mp3", source.external_id);
        let bytes = retry_with_backoff(&self.config.service.retry, || self.blobs.fetch(&key))
            .await?;

        let config = Arc::clone(&self.config);
        let source_id = source.id;
        let fingerprint = task::spawn_blocking(move || dsp::fingerprint_bytes(&bytes, &config))
            .await
            .map_err(|e| EngineError::Pipeline {
                source_id,
                stage: "fingerprint",
                message: e.to_string(),
            })??;

        info!(
            worker = self.id,
            source = %source.id,
            hashes = fingerprint.len(),
            "fingerprint ready"
        );

        if fingerprint.len() < self.config.sampling.min_fingerprint_count {
            retry_with_backoff(&self.config.service.retry, || {
                self.index.set_status(source.id, SourceStatus::TooShort, None)
            })
            .await?;
            return Ok(Outcome::TooShort);
        }

        // Short-but-storable fingerprints skip matching entirely; a sampled
        // query of that size would be all noise.
        if fingerprint.len() >= self.config.sampling.min_matchable {
            let (query, plan) = segment::sample(&fingerprint, &self.config.sampling.anchors);
            let candidates = retry_with_backoff(&self.config.service.retry, || {
                self.index.find_candidates(&query, &self.config.search)
            })
            .await?;

            let decision =
                matcher::decide(&candidates, plan.query_len, &self.config.search, &self.config.audio);
            if let (true, Some(original)) = (decision.matched, decision.source_id) {
                info!(
                    worker = self.id,
                    source = %source.id,
                    original = %original,
                    score = decision.score,
                    offset_ms = decision.offset_ms.unwrap_or(0),
                    "duplicate of known source"
                );
                retry_with_backoff(&self.config.service.retry, || {
                    self.index
                        .set_status(source.id, SourceStatus::Matched, Some(original))
                })
                .await?;
                return Ok(Outcome::Matched);
            }
        }

        let inserted = retry_with_backoff(&self.config.service.retry, || {
            self.index
                .insert_occurrences(source.id, &fingerprint, self.config.ingest.insert_chunk)
        })
        .await?;
        retry_with_backoff(&self.config.service.retry, || {
            self.index
                .set_status(source.id, SourceStatus::Fingerprinted, None)
        })
        .await?;

        info!(worker = self.id, source = %source.id, inserted, "stored as new original");
        Ok(Outcome::Stored)
    }

    async fn flag(&self, source_id: Uuid) {
        let result = retry_with_backoff(&self.config.service.retry, || {
            self.index.set_status(source_id, SourceStatus::Flagged, None)
        })
        .await;
        if let Err(e) = result {
            error!(source = %source_id, error = %e, "could not flag source, left pending");
        }
    }
}

/// Retry transient failures with doubling backoff; other errors pass
/// through on the first attempt.
pub async fn retry_with_backoff<T, F, Fut>(retry: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(retry.base_delay_ms);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retry.attempts => {
                warn!(error = %e, attempt, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry() -> RetryConfig {
        RetryConfig { attempts: 3, base_delay_ms: 1 }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_retry(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::BlobStore("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&fast_retry(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::BlobStore("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&fast_retry(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Decode("bad header".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
