//! UEPS Release - release pipeline orchestration
//!
//! Provides:
//! - Stack assembly and synthesis from a `ueps.toml` source bundle
//! - A stage/run-order orchestrator with per-run artifact hand-off
//! - Trigger handling with duplicate acknowledgement and self-update

pub mod artifact;
pub mod coordinator;
pub mod executor;
pub mod orchestrator;
pub mod source;
pub mod trigger;

// Re-export key types
pub use artifact::{Artifact, ArtifactStore};
pub use coordinator::{
    Assembly, ImagePipelineBinding, Manifest, PublishedCatalog, ReleaseCoordinator,
};
pub use executor::{
    ActionExecutor, ActionInputs, ActionOutput, DeployExecutor, Executors, SourceExecutor,
    SynthExecutor,
};
pub use orchestrator::{ActionOutcome, ActionStatus, Orchestrator, RunResult, StageOutcome};
pub use source::{DirectorySource, SourceBundle, SourceProvider, StaticSource};
pub use trigger::{Acknowledgement, Trigger, TriggerHandler, TriggerOutcome, TRIGGER_TAG};

use std::sync::Arc;

use ueps_core::Provisioner;
use ueps_state::{PublishedStore, RunLedger};

/// Standard executors: source from `provider`, synthesis in process against
/// the `published` identities and deploys through `provisioner`.
pub fn standard_executors(
    provider: Arc<dyn SourceProvider>,
    provisioner: Arc<dyn Provisioner>,
    published: Arc<dyn PublishedStore>,
) -> Executors {
    Executors {
        source: Arc::new(SourceExecutor::new(provider)),
        build: Arc::new(SynthExecutor::new(published)),
        deploy: Arc::new(DeployExecutor::new(provisioner)),
    }
}

/// Trigger handler over the standard executors.
pub fn release_handler(
    provider: Arc<dyn SourceProvider>,
    provisioner: Arc<dyn Provisioner>,
    ledger: Arc<dyn RunLedger>,
    published: Arc<dyn PublishedStore>,
    definition: ueps_core::PipelineDefinition,
) -> TriggerHandler {
    let orchestrator = Orchestrator::new(
        standard_executors(provider, provisioner, published),
        ledger,
    );
    TriggerHandler::new(orchestrator, definition)
}
