//! Domain models for UEPS.
//!
//! - `PipelineDefinition`: stages of run-ordered actions for the release pipeline
//! - `UepsError`: error taxonomy shared by every layer above storage
//! - digest helpers: canonical JSON and content digests

pub mod digest;
pub mod error;
pub mod pipeline;

pub use digest::{canonical_json, compute_digest, to_canonical_json};
pub use error::{Result, UepsError};
pub use pipeline::{template_artifact_name, ActionDef, ActionKind, PipelineDefinition, StageDef};
