//! Postgres-backed index.
//!
//! Occurrence rows and hash statistics live in Postgres; row triggers keep
//! the statistics exact inside every insert/delete transaction. Claiming
//! and candidate search run server-side as the stored functions created by
//! `migrations/0001_init.sql`, so a query ships one round trip regardless
//! of its hash count.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::config::SearchConfig;
use crate::dsp::Fingerprint;
use crate::error::{EngineError, Result};
use crate::index::models::{Candidate, ClaimBatch, ClaimCursor, Source, SourceStatus};
use crate::index::FingerprintIndex;

pub struct PgIndex {
    pool: PgPool,
}

impl PgIndex {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn source_from_row(row: &PgRow) -> Result<Source> {
    let status_text: String = row.try_get("status")?;
    let status = SourceStatus::parse(&status_text).ok_or_else(|| {
        EngineError::Database(sqlx::Error::Decode(
            format!("unknown source status {status_text:?}").into(),
        ))
    })?;

    Ok(Source {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        duration_ms: row.try_get("duration_ms")?,
        original_ref: row.try_get("original_ref")?,
        status,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl FingerprintIndex for PgIndex {
    async fn claim_next(&self, limit: i64, cursor: Option<ClaimCursor>) -> Result<ClaimBatch> {
        let rows = sqlx::query(
            r#"
            SELECT id, external_id, title, duration_ms, original_ref, status, created_at
            FROM claim_next_sources($1, $2, $3)
            "#,
        )
        .bind(limit)
        .bind(cursor.map(|c| c.duration_ms))
        .bind(cursor.map(|c| c.id))
        .fetch_all(&self.pool)
        .await?;

        let sources: Vec<Source> = rows
            .iter()
            .map(source_from_row)
            .collect::<Result<_>>()?;
        let cursor = sources.last().map(|s| ClaimCursor {
            duration_ms: s.duration_ms,
            id: s.id,
        });
        Ok(ClaimBatch { sources, cursor })
    }

    async fn find_candidates(
        &self,
        query: &[Fingerprint],
        params: &SearchConfig,
    ) -> Result<Vec<Candidate>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT source_id, delta, matched_count
            FROM find_fingerprint_candidates($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(sqlx::types::Json(query))
        .bind(params.ignore_fraction)
        .bind(params.min_matches)
        .bind(params.max_hits_per_hash)
        .bind(params.limit_candidates)
        .bind(params.delta_tolerance)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Candidate {
                    source_id: row.try_get("source_id")?,
                    delta: row.try_get("delta")?,
                    matched_count: row.try_get("matched_count")?,
                })
            })
            .collect()
    }

    async fn insert_occurrences(
        &self,
        source_id: Uuid,
        rows: &[Fingerprint],
        chunk_size: usize,
    ) -> Result<u64> {
        let chunk_size = chunk_size.max(1);
        let mut inserted = 0u64;

        for chunk in rows.chunks(chunk_size) {
            let hashes: Vec<String> = chunk.iter().map(|fp| fp.hash.to_string()).collect();
            let t_refs: Vec<i32> = chunk.iter().map(|fp| fp.t_ref as i32).collect();

            // One transaction per chunk: the stat triggers fire inside it,
            // so occurrences become visible together with their counters.
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                r#"
                INSERT INTO occurrences (hash, source_id, t_ref)
                SELECT u.hash, $1, u.t_ref
                FROM UNNEST($2::text[], $3::int[]) AS u(hash, t_ref)
                ON CONFLICT (hash, source_id, t_ref) DO NOTHING
                "#,
            )
            .bind(source_id)
            .bind(&hashes)
            .bind(&t_refs)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn set_status(
        &self,
        source_id: Uuid,
        status: SourceStatus,
        original_ref: Option<Uuid>,
    ) -> Result<()> {
        if status == SourceStatus::Matched && original_ref.is_none() {
            return Err(EngineError::MissingOriginalRef(source_id));
        }

        let result = sqlx::query(
            r#"
            UPDATE sources SET
                status = $2,
                original_ref = CASE
                    WHEN $2 = 'matched'
                        THEN (SELECT COALESCE(o.original_ref, o.id) FROM sources o WHERE o.id = $3)
                    ELSE NULL
                END
            WHERE id = $1
              AND status = CASE WHEN $2 = 'pending' THEN 'unclaimed' ELSE 'pending' END
              AND ($2 <> 'matched' OR EXISTS (SELECT 1 FROM sources o WHERE o.id = $3))
            "#,
        )
        .bind(source_id)
        .bind(status.as_str())
        .bind(original_ref)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let row = sqlx::query("SELECT status FROM sources WHERE id = $1")
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;
            return match row {
                None => Err(EngineError::SourceNotFound(source_id)),
                Some(row) => {
                    let from_text: String = row.try_get("status")?;
                    Err(EngineError::InvalidTransition {
                        source_id,
                        from: SourceStatus::parse(&from_text)
                            .unwrap_or(SourceStatus::Flagged),
                        to: status,
                    })
                }
            };
        }
        Ok(())
    }

    async fn delete_source(&self, source_id: Uuid) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        // Occurrences go explicitly so the delete triggers decrement stats
        // in this transaction; the source row follows.
        let occurrences = sqlx::query("DELETE FROM occurrences WHERE source_id = $1")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sources WHERE id = $1")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(occurrences.rows_affected())
    }
}
