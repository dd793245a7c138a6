//! Durable sync job state machine and its crash-recovery queue.
//!
//! Jobs move `pending -> processing -> completed | failed`. A queue entry is written in the
//! same transaction as the pending job and removed in the same transaction as the terminal
//! status update, so its presence after a restart means the work never durably finished.

use bcf_core::{JobType, QueueEntry, SyncCounts, SyncJob, SyncStatus};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SyncError;

pub const ORPHAN_MESSAGE: &str = "interrupted by restart";

const JOB_COLUMNS: &str = "id, job_type, status, created_at, started_at, finished_at, \
     products_added, products_updated, products_deleted, rows_rejected, \
     products_recomputed, edges_written, rule_failures, error_message, metadata_json";

#[derive(Debug, Clone)]
pub struct JobController {
    pool: SqlitePool,
}

fn parse_uuid(raw: &str) -> Result<Uuid, SyncError> {
    Uuid::parse_str(raw).map_err(|err| SyncError::Corrupt(format!("job id `{raw}`: {err}")))
}

fn count(row: &SqliteRow, column: &str) -> Result<u64, SyncError> {
    let value: i64 = row.try_get(column)?;
    Ok(value.max(0) as u64)
}

fn job_from_row(row: &SqliteRow) -> Result<SyncJob, SyncError> {
    let id: String = row.try_get("id")?;
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    let metadata: String = row.try_get("metadata_json")?;

    Ok(SyncJob {
        id: parse_uuid(&id)?,
        job_type: JobType::parse(&job_type)
            .ok_or_else(|| SyncError::Corrupt(format!("job type `{job_type}`")))?,
        status: SyncStatus::parse(&status)
            .ok_or_else(|| SyncError::Corrupt(format!("job status `{status}`")))?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        counts: SyncCounts {
            products_added: count(row, "products_added")?,
            products_updated: count(row, "products_updated")?,
            products_deleted: count(row, "products_deleted")?,
            rows_rejected: count(row, "rows_rejected")?,
            products_recomputed: count(row, "products_recomputed")?,
            edges_written: count(row, "edges_written")?,
            rule_failures: count(row, "rule_failures")?,
        },
        error_message: row.try_get("error_message")?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|err| SyncError::Corrupt(format!("job metadata: {err}")))?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<QueueEntry, SyncError> {
    let job_id: String = row.try_get("job_id")?;
    Ok(QueueEntry {
        job_id: parse_uuid(&job_id)?,
        payload_ref: row.try_get("payload_ref")?,
        enqueued_at: row.try_get("enqueued_at")?,
    })
}

async fn insert_pending(
    tx: &mut Transaction<'_, Sqlite>,
    job_type: JobType,
    payload_ref: &str,
    metadata: &JsonValue,
    now: DateTime<Utc>,
) -> Result<Uuid, SyncError> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO sync_jobs (id, job_type, status, created_at, metadata_json)
        VALUES (?, ?, 'pending', ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(job_type.as_str())
    .bind(now)
    .bind(metadata.to_string())
    .execute(&mut **tx)
    .await?;
    sqlx::query("INSERT INTO sync_queue (job_id, payload_ref, enqueued_at) VALUES (?, ?, ?)")
        .bind(id.to_string())
        .bind(payload_ref)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    Ok(id)
}

impl JobController {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records a pending job and its queue entry. Returns only after both are committed.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload_ref: &str,
        metadata: JsonValue,
    ) -> Result<SyncJob, SyncError> {
        let mut tx = self.pool.begin().await?;
        let id = insert_pending(&mut tx, job_type, payload_ref, &metadata, Utc::now()).await?;
        tx.commit().await?;
        info!(job_id = %id, %job_type, payload_ref, "sync job enqueued");
        self.get(id).await?.ok_or(SyncError::UnknownJob(id))
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<SyncJob>, SyncError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Most recent jobs first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<SyncJob>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs ORDER BY seq DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn queue_entries(&self) -> Result<Vec<QueueEntry>, SyncError> {
        let rows = sqlx::query(
            "SELECT job_id, payload_ref, enqueued_at FROM sync_queue ORDER BY enqueued_at, rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn queue_entry(&self, job_id: Uuid) -> Result<Option<QueueEntry>, SyncError> {
        let row = sqlx::query("SELECT job_id, payload_ref, enqueued_at FROM sync_queue WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    /// Oldest queue entry whose job is still pending.
    pub async fn next_pending(&self) -> Result<Option<(SyncJob, QueueEntry)>, SyncError> {
        let row = sqlx::query(
            r#"
            SELECT q.job_id, q.payload_ref, q.enqueued_at
              FROM sync_queue q
              JOIN sync_jobs j ON j.id = q.job_id
             WHERE j.status = 'pending'
             ORDER BY q.enqueued_at, q.rowid
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let entry = entry_from_row(&row)?;
        let job = self
            .get(entry.job_id)
            .await?
            .ok_or(SyncError::UnknownJob(entry.job_id))?;
        Ok(Some((job, entry)))
    }

    /// Flips `pending -> processing`. `false` means another worker already owns the job.
    pub async fn claim(&self, id: Uuid) -> Result<bool, SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = 'processing', started_at = ?
             WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Terminal success. The queue entry is removed in the same transaction, after the status.
    pub async fn complete(
        &self,
        id: Uuid,
        counts: SyncCounts,
        metadata: &JsonValue,
    ) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = 'completed',
                   finished_at = ?,
                   products_added = ?,
                   products_updated = ?,
                   products_deleted = ?,
                   rows_rejected = ?,
                   products_recomputed = ?,
                   edges_written = ?,
                   rule_failures = ?,
                   metadata_json = ?
             WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(Utc::now())
        .bind(counts.products_added as i64)
        .bind(counts.products_updated as i64)
        .bind(counts.products_deleted as i64)
        .bind(counts.rows_rejected as i64)
        .bind(counts.products_recomputed as i64)
        .bind(counts.edges_written as i64)
        .bind(counts.rule_failures as i64)
        .bind(metadata.to_string())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(self.state_error(id, "completion").await);
        }
        sqlx::query("DELETE FROM sync_queue WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Terminal failure with the error captured verbatim. Clears the queue entry: a retry is
    /// a new job, not a replay.
    pub async fn fail(
        &self,
        id: Uuid,
        message: &str,
        metadata: &JsonValue,
    ) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = 'failed',
                   finished_at = ?,
                   error_message = ?,
                   metadata_json = ?
             WHERE id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(Utc::now())
        .bind(message)
        .bind(metadata.to_string())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(self.state_error(id, "failure").await);
        }
        sqlx::query("DELETE FROM sync_queue WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Startup scan: every `processing` job belongs to a dead process. Each is failed with
    /// [`ORPHAN_MESSAGE`]; its queue entry is kept for an explicit resubmit.
    pub async fn recover_orphans(&self) -> Result<Vec<Uuid>, SyncError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT id FROM sync_jobs WHERE status = 'processing' ORDER BY seq")
            .fetch_all(&mut *tx)
            .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            ids.push(parse_uuid(&row.try_get::<String, _>("id")?)?);
        }
        sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = 'failed', finished_at = ?, error_message = ?
             WHERE status = 'processing'
            "#,
        )
        .bind(Utc::now())
        .bind(ORPHAN_MESSAGE)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        for id in &ids {
            warn!(job_id = %id, "orphaned sync job marked failed");
        }
        Ok(ids)
    }

    /// Creates a fresh pending job from a failed job whose queue entry survived, and drops
    /// the stale entry, in one transaction.
    pub async fn resubmit(&self, id: Uuid) -> Result<SyncJob, SyncError> {
        let job = self.get(id).await?.ok_or(SyncError::UnknownJob(id))?;
        if job.status != SyncStatus::Failed {
            return Err(SyncError::InvalidJobState {
                id,
                status: job.status,
                action: "resubmit",
            });
        }
        let entry = self
            .queue_entry(id)
            .await?
            .ok_or(SyncError::InvalidJobState {
                id,
                status: job.status,
                action: "resubmit without a queue entry",
            })?;

        let mut metadata = job.metadata.clone();
        if let Some(map) = metadata.as_object_mut() {
            map.insert("resubmitted_from".to_string(), JsonValue::String(id.to_string()));
        }

        let mut tx = self.pool.begin().await?;
        let new_id =
            insert_pending(&mut tx, job.job_type, &entry.payload_ref, &metadata, Utc::now()).await?;
        sqlx::query("DELETE FROM sync_queue WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(job_id = %new_id, resubmitted_from = %id, "sync job resubmitted");
        self.get(new_id).await?.ok_or(SyncError::UnknownJob(new_id))
    }

    async fn state_error(&self, id: Uuid, action: &'static str) -> SyncError {
        match self.get(id).await {
            Ok(Some(job)) => SyncError::InvalidJobState {
                id,
                status: job.status,
                action,
            },
            Ok(None) => SyncError::UnknownJob(id),
            Err(err) => err,
        }
    }
}
