//! SurrealDB-backed RunLedger implementation

use async_trait::async_trait;
use chrono::Utc;
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::debug;

use crate::connect;
use crate::error::StorageError;
use crate::schema::{RunEventRow, RunRow};
use crate::storage_traits::{
    validate_tag_key, ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunRecord,
    RunStatus, RunSummary, StorageResult,
};

/// SurrealDB-backed implementation of [`RunLedger`].
#[derive(Clone)]
pub struct SurrealRunLedger {
    db: Surreal<Any>,
}

impl SurrealRunLedger {
    /// Wrap an already connected database (schema must be initialized).
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(connect::connect_in_memory().await?))
    }

    /// Create from environment variables, falling back to `local_dir`.
    pub async fn from_env(local_dir: &str) -> crate::Result<Self> {
        Ok(Self::new(connect::connect_from_env(local_dir).await?))
    }

    async fn fetch_run(&self, rid: &str) -> StorageResult<RunRow> {
        let rid_owned = rid.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM runs WHERE run_id = $rid")
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<RunRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: rid.to_string(),
            })
    }

    async fn fetch_running(&self, rid: &str) -> StorageResult<RunRow> {
        let row = self.fetch_run(rid).await?;
        if row.status != RunStatus::Running.as_str() {
            return Err(StorageError::InvalidRunState {
                run_id: rid.to_string(),
                status: row.status,
                expected: RunStatus::Running.as_str().to_string(),
            });
        }
        Ok(row)
    }

    async fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> StorageResult<()> {
        self.fetch_running(&run_id.0).await?;

        self.db
            .query(
                "UPDATE runs SET status = $status, total_events = $total, \
                 duration_ms = $duration, success = $success, completed_at = $at \
                 WHERE run_id = $rid",
            )
            .bind(("status", status.as_str().to_string()))
            .bind(("total", summary.total_events))
            .bind(("duration", summary.duration_ms))
            .bind(("success", summary.success))
            .bind(("at", SurrealDatetime::from(Utc::now())))
            .bind(("rid", run_id.0.clone()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    fn row_to_record(row: RunRow) -> StorageResult<RunRecord> {
        let status = match row.status.as_str() {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            other => {
                return Err(StorageError::Backend(format!(
                    "unknown run status: {other}"
                )))
            }
        };

        let summary = (status != RunStatus::Running).then(|| RunSummary {
            total_events: row.total_events,
            duration_ms: row.duration_ms,
            success: row.success,
        });

        Ok(RunRecord {
            run_id: RunId(row.run_id),
            definition_digest: ContentDigest::try_from(row.definition_digest)?,
            metadata: RunMetadata {
                revision: row.revision,
                pipeline_name: row.pipeline_name,
                tags: row.tags,
            },
            status,
            summary,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[async_trait]
impl RunLedger for SurrealRunLedger {
    async fn create_run(
        &self,
        definition_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let row = RunRow::new(
            run_id.0.clone(),
            definition_digest.as_str().to_string(),
            metadata.revision,
            metadata.pipeline_name,
            metadata.tags,
        );

        debug!(run_id = %run_id, "creating run");

        let _created: Option<RunRow> = self
            .db
            .create("runs")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        self.fetch_running(&run_id.0).await?;

        let row = RunEventRow {
            id: None,
            run_id: run_id.0.clone(),
            seq: event.seq,
            kind: event.kind,
            payload: event.payload,
            timestamp: event.timestamp,
        };

        let created: Result<Option<RunEventRow>, surrealdb::Error> =
            self.db.create("run_events").content(row).await;

        // The (run_id, seq) unique index rejects a replayed seq.
        created.map_err(|e| {
            let msg = e.to_string();
            if msg.contains("idx_run_id_seq") || msg.contains("already contains") {
                StorageError::DuplicateSeq {
                    run_id: run_id.0.clone(),
                    seq: event.seq,
                }
            } else {
                StorageError::Backend(msg)
            }
        })?;

        Ok(())
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Completed, summary).await
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Failed, summary).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let row = self.fetch_run(&run_id.0).await?;
        Self::row_to_record(row)
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        self.fetch_run(&run_id.0).await?;

        let mut res = self
            .db
            .query("SELECT * FROM run_events WHERE run_id = $rid ORDER BY seq ASC")
            .bind(("rid", run_id.0.clone()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<RunEventRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| RunEvent {
                seq: row.seq,
                kind: row.kind,
                payload: row.payload,
                timestamp: row.timestamp,
            })
            .collect())
    }

    async fn list_runs(
        &self,
        definition_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let rows: Vec<RunRow> = if let Some(digest) = definition_digest {
            let mut res = self
                .db
                .query("SELECT * FROM runs WHERE definition_digest = $dd ORDER BY created_at DESC")
                .bind(("dd", digest.as_str().to_string()))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM runs ORDER BY created_at DESC")
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn latest_completed_with_tag(
        &self,
        key: &str,
        value: &str,
    ) -> StorageResult<Option<RunRecord>> {
        // Field paths cannot be bound, so the key is validated before use.
        validate_tag_key(key)?;
        let sql = format!(
            "SELECT * FROM runs WHERE status = $status AND tags.{key} = $value \
             ORDER BY created_at DESC LIMIT 1"
        );
        let mut res = self
            .db
            .query(sql)
            .bind(("status", RunStatus::Completed.as_str().to_string()))
            .bind(("value", value.to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<RunRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().next().map(Self::row_to_record).transpose()
    }
}
