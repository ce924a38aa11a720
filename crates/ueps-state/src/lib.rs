//! UEPS State: persistence for the release pipeline
//!
//! This crate owns all I/O with SurrealDB. Higher layers talk to it through
//! the [`RunLedger`], [`SnapshotStore`] and [`PublishedStore`] traits so
//! tests can swap in the in-memory fakes.
//!
//! ## Key Components
//!
//! - `RunLedger`: append-only record of release pipeline runs and their events
//! - `SnapshotStore`: last-built dependency versions per image pipeline
//! - `PublishedStore`: component and recipe versions that must not change
//! - `connect`: cloud / URL / local SurrealDB connection setup

pub mod connect;
mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_ledger;
pub mod surreal_published;
pub mod surreal_snapshots;

pub use connect::{connect_from_env, connect_in_memory, CloudConfig};
pub use error::{StateError, StorageError};
pub use storage_traits::{
    ContentDigest, DependencySnapshot, PublishedKind, PublishedStore, PublishedVersion, RunEvent,
    RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary, SnapshotStore, StorageResult,
};
pub use surreal_ledger::SurrealRunLedger;
pub use surreal_published::SurrealPublishedStore;
pub use surreal_snapshots::SurrealSnapshotStore;

/// Result type for ueps-state operations
pub type Result<T> = std::result::Result<T, StateError>;
