//! SurrealDB-backed SnapshotStore implementation

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::debug;

use crate::connect;
use crate::error::StorageError;
use crate::schema::SnapshotRow;
use crate::storage_traits::{DependencySnapshot, SnapshotStore, StorageResult};

/// Stores one snapshot row per image pipeline in `pipeline_snapshots`.
#[derive(Clone)]
pub struct SurrealSnapshotStore {
    db: Surreal<Any>,
}

impl SurrealSnapshotStore {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(connect::connect_in_memory().await?))
    }

    pub async fn from_env(local_dir: &str) -> crate::Result<Self> {
        Ok(Self::new(connect::connect_from_env(local_dir).await?))
    }
}

#[async_trait]
impl SnapshotStore for SurrealSnapshotStore {
    async fn load(&self, pipeline: &str) -> StorageResult<Option<DependencySnapshot>> {
        let mut res = self
            .db
            .query("SELECT * FROM pipeline_snapshots WHERE pipeline = $p LIMIT 1")
            .bind(("p", pipeline.to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<SnapshotRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows.into_iter().next().map(|row| DependencySnapshot {
            versions: row.versions,
            recorded_at: row.recorded_at,
        }))
    }

    async fn save(&self, pipeline: &str, snapshot: DependencySnapshot) -> StorageResult<()> {
        debug!(pipeline = %pipeline, deps = snapshot.versions.len(), "saving dependency snapshot");

        let row = SnapshotRow {
            id: None,
            pipeline: pipeline.to_string(),
            versions: snapshot.versions,
            recorded_at: snapshot.recorded_at,
        };

        self.db
            .query(
                "BEGIN TRANSACTION; \
                 DELETE pipeline_snapshots WHERE pipeline = $p; \
                 CREATE pipeline_snapshots CONTENT $row; \
                 COMMIT TRANSACTION;",
            )
            .bind(("p", pipeline.to_string()))
            .bind(("row", row))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn clear(&self, pipeline: &str) -> StorageResult<()> {
        self.db
            .query("DELETE pipeline_snapshots WHERE pipeline = $p")
            .bind(("p", pipeline.to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}
