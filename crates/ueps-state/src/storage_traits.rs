//! Storage trait definitions for UEPS
//!
//! These traits define the persistence seams of the release system:
//! - `RunLedger`: release pipeline run persistence (events, summaries)
//! - `SnapshotStore`: per-pipeline dependency-version snapshot of the last
//!   successful image build
//! - `PublishedStore`: immutable component and recipe identities
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Content digest (SHA-256 hex string).
///
/// The inner field is private so the string is always lowercase hex produced
/// by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RunLedger: release pipeline run persistence
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata attached to a run at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Source revision that triggered the run
    pub revision: Option<String>,
    /// Release pipeline name
    pub pipeline_name: String,
    /// Arbitrary key-value tags
    pub tags: serde_json::Value,
}

/// A single event in a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Monotonic sequence number within the run
    pub seq: u64,
    /// Event kind (e.g. "stage_started", "action_succeeded")
    pub kind: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Summary produced when a run ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total events recorded
    pub total_events: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Whether the run succeeded
    pub success: bool,
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// Full run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub definition_digest: ContentDigest,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Release pipeline run ledger.
///
/// Guarantees:
/// - Events are ordered by monotonic `seq` within a run.
/// - A run transitions: Running → Completed | Failed (terminal).
/// - Terminal runs are immutable.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Create a new run for the pipeline definition with the given digest.
    async fn create_run(
        &self,
        definition_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId>;

    /// Append an event to an active run. Fails if the run is terminal.
    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()>;

    /// Mark a run as completed with a summary.
    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as failed with a summary.
    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Retrieve all events for a run, ordered by seq.
    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>>;

    /// List runs newest first, optionally filtered by definition digest.
    async fn list_runs(
        &self,
        definition_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>>;

    /// Newest completed run whose `tags[key]` equals `value`.
    ///
    /// `key` must be a plain identifier (ASCII alphanumerics and `_`).
    async fn latest_completed_with_tag(
        &self,
        key: &str,
        value: &str,
    ) -> StorageResult<Option<RunRecord>>;
}

/// Reject tag keys that are not plain identifiers.
pub fn validate_tag_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StorageError::InvalidTagKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SnapshotStore: dependency versions of the last successful image build
// ---------------------------------------------------------------------------

/// Dependency versions recorded at a pipeline's last successful build.
///
/// Keys are dependency names (the base image and every recipe component),
/// values are the version strings that were built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySnapshot {
    pub versions: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl DependencySnapshot {
    pub fn new(versions: BTreeMap<String, String>) -> Self {
        Self {
            versions,
            recorded_at: Utc::now(),
        }
    }
}

/// Persisted per-pipeline snapshots.
///
/// Semantics:
/// - `save` replaces the snapshot for the pipeline (last writer wins).
/// - `load` returns `None` when the pipeline never completed a build.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, pipeline: &str) -> StorageResult<Option<DependencySnapshot>>;

    async fn save(&self, pipeline: &str, snapshot: DependencySnapshot) -> StorageResult<()>;

    /// Forget the snapshot so the next gated tick treats dependencies as updated.
    async fn clear(&self, pipeline: &str) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// PublishedStore: immutable component and recipe identities
// ---------------------------------------------------------------------------

/// What a published identity names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishedKind {
    Component,
    Recipe,
}

impl PublishedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishedKind::Component => "component",
            PublishedKind::Recipe => "recipe",
        }
    }
}

impl std::fmt::Display for PublishedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published `(kind, name, version)` and the content it was published with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedVersion {
    pub kind: PublishedKind,
    pub name: String,
    pub version: String,
    pub digest: ContentDigest,
    /// Serialized content, enough to restore the identity later.
    pub content: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl PublishedVersion {
    pub fn new(
        kind: PublishedKind,
        name: impl Into<String>,
        version: impl Into<String>,
        digest: ContentDigest,
        content: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            version: version.into(),
            digest,
            content,
            published_at: Utc::now(),
        }
    }
}

/// Append-only record of published identities.
///
/// Semantics:
/// - `publish` of a new identity stores it.
/// - `publish` of a known identity with the same digest is a no-op.
/// - `publish` of a known identity with another digest fails with
///   `StorageError::PublishedConflict` and leaves the stored entry alone.
#[async_trait]
pub trait PublishedStore: Send + Sync {
    /// Every published identity of `kind`, ordered by name then version text.
    async fn list(&self, kind: PublishedKind) -> StorageResult<Vec<PublishedVersion>>;

    async fn publish(&self, entry: PublishedVersion) -> StorageResult<()>;
}
