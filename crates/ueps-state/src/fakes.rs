//! In-memory fakes for storage traits
//!
//! Provides `MemoryRunLedger`, `MemorySnapshotStore` and `MemoryPublishedStore`
//! that satisfy the trait
//! contracts without any external dependencies. Used by tests and by local
//! dry runs of the CLI.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryRunLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    events: Vec<RunEvent>,
}

/// In-memory run ledger backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a running run into a terminal status.
    fn finish(&self, run_id: &RunId, status: RunStatus, summary: RunSummary) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if state.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: state.record.status.as_str().to_string(),
                expected: RunStatus::Running.as_str().to_string(),
            });
        }
        state.record.status = status;
        state.record.summary = Some(summary);
        state.record.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(
        &self,
        definition_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = RunRecord {
            run_id: run_id.clone(),
            definition_digest: definition_digest.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.insert(
            run_id.0.clone(),
            RunState {
                record,
                events: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if state.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: state.record.status.as_str().to_string(),
                expected: RunStatus::Running.as_str().to_string(),
            });
        }
        if state.events.iter().any(|e| e.seq == event.seq) {
            return Err(StorageError::DuplicateSeq {
                run_id: run_id.0.clone(),
                seq: event.seq,
            });
        }
        state.events.push(event);
        Ok(())
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Completed, summary)
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Failed, summary)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let state = runs
            .get(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        let mut events = state.events.clone();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_runs(
        &self,
        definition_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<RunRecord> = runs
            .values()
            .filter(|s| {
                definition_digest
                    .map(|d| s.record.definition_digest == *d)
                    .unwrap_or(true)
            })
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn latest_completed_with_tag(
        &self,
        key: &str,
        value: &str,
    ) -> StorageResult<Option<RunRecord>> {
        validate_tag_key(key)?;
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(runs
            .values()
            .map(|s| &s.record)
            .filter(|r| {
                r.status == RunStatus::Completed
                    && r.metadata.tags.get(key).and_then(|v| v.as_str()) == Some(value)
            })
            .max_by_key(|r| r.created_at)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// MemorySnapshotStore
// ---------------------------------------------------------------------------

/// In-memory snapshot store keyed by pipeline name.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, DependencySnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, pipeline: &str) -> StorageResult<Option<DependencySnapshot>> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(snapshots.get(pipeline).cloned())
    }

    async fn save(&self, pipeline: &str, snapshot: DependencySnapshot) -> StorageResult<()> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        snapshots.insert(pipeline.to_string(), snapshot);
        Ok(())
    }

    async fn clear(&self, pipeline: &str) -> StorageResult<()> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        snapshots.remove(pipeline);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryPublishedStore
// ---------------------------------------------------------------------------

/// In-memory published identities keyed by `(kind, name, version)`.
#[derive(Debug, Default)]
pub struct MemoryPublishedStore {
    entries: Mutex<BTreeMap<(PublishedKind, String, String), PublishedVersion>>,
}

impl MemoryPublishedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PublishedStore for MemoryPublishedStore {
    async fn list(&self, kind: PublishedKind) -> StorageResult<Vec<PublishedVersion>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect())
    }

    async fn publish(&self, entry: PublishedVersion) -> StorageResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let key = (entry.kind, entry.name.clone(), entry.version.clone());
        match entries.get(&key) {
            Some(existing) if existing.digest == entry.digest => Ok(()),
            Some(_) => Err(StorageError::PublishedConflict {
                kind: entry.kind.to_string(),
                name: entry.name,
                version: entry.version,
            }),
            None => {
                entries.insert(key, entry);
                Ok(())
            }
        }
    }
}
