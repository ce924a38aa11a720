//! SurrealDB-backed PublishedStore implementation

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::debug;

use crate::connect;
use crate::error::StorageError;
use crate::schema::PublishedRow;
use crate::storage_traits::{
    ContentDigest, PublishedKind, PublishedStore, PublishedVersion, StorageResult,
};

/// One row per published identity in `published_versions`.
#[derive(Clone)]
pub struct SurrealPublishedStore {
    db: Surreal<Any>,
}

impl SurrealPublishedStore {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(connect::connect_in_memory().await?))
    }

    pub async fn from_env(local_dir: &str) -> crate::Result<Self> {
        Ok(Self::new(connect::connect_from_env(local_dir).await?))
    }

    async fn fetch(&self, entry: &PublishedVersion) -> StorageResult<Option<PublishedRow>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM published_versions \
                 WHERE kind = $kind AND name = $name AND version = $version LIMIT 1",
            )
            .bind(("kind", entry.kind.as_str().to_string()))
            .bind(("name", entry.name.clone()))
            .bind(("version", entry.version.clone()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<PublishedRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    fn conflict(entry: &PublishedVersion) -> StorageError {
        StorageError::PublishedConflict {
            kind: entry.kind.to_string(),
            name: entry.name.clone(),
            version: entry.version.clone(),
        }
    }

    fn row_to_entry(kind: PublishedKind, row: PublishedRow) -> StorageResult<PublishedVersion> {
        Ok(PublishedVersion {
            kind,
            name: row.name,
            version: row.version,
            digest: ContentDigest::try_from(row.digest)?,
            content: row.content,
            published_at: row.published_at,
        })
    }
}

#[async_trait]
impl PublishedStore for SurrealPublishedStore {
    async fn list(&self, kind: PublishedKind) -> StorageResult<Vec<PublishedVersion>> {
        let mut res = self
            .db
            .query("SELECT * FROM published_versions WHERE kind = $kind ORDER BY name, version")
            .bind(("kind", kind.as_str().to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<PublishedRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .map(|row| Self::row_to_entry(kind, row))
            .collect()
    }

    async fn publish(&self, entry: PublishedVersion) -> StorageResult<()> {
        if let Some(existing) = self.fetch(&entry).await? {
            return if existing.digest == entry.digest.as_str() {
                Ok(())
            } else {
                Err(Self::conflict(&entry))
            };
        }

        debug!(kind = %entry.kind, name = %entry.name, version = %entry.version, "recording published version");
        let row = PublishedRow {
            id: None,
            kind: entry.kind.as_str().to_string(),
            name: entry.name.clone(),
            version: entry.version.clone(),
            digest: entry.digest.as_str().to_string(),
            content: entry.content.clone(),
            published_at: entry.published_at,
        };
        let created: Result<Option<PublishedRow>, surrealdb::Error> =
            self.db.create("published_versions").content(row).await;

        match created {
            Ok(_) => Ok(()),
            // A concurrent publish won the unique index; compare against it.
            Err(e) => match self.fetch(&entry).await? {
                Some(existing) if existing.digest == entry.digest.as_str() => Ok(()),
                Some(_) => Err(Self::conflict(&entry)),
                None => Err(StorageError::Backend(e.to_string())),
            },
        }
    }
}
