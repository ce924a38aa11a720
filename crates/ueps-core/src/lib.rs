//! UEPS Core Library
//!
//! Image recipe composition, gated image pipelines and the stacks the
//! release pipeline deploys.

pub mod component;
pub mod config;
pub mod domain;
pub mod image_pipeline;
pub mod inflight;
pub mod infra;
pub mod obs;
pub mod provisioning;
pub mod recipe;
pub mod recording;
pub mod stack;
pub mod telemetry;

pub use component::{Component, ComponentDocument, ComponentRegistry, Platform};
pub use config::{AccountScope, ComponentEntry, ReleaseConfig};
pub use domain::{
    ActionDef, ActionKind, PipelineDefinition, Result, StageDef, UepsError,
};
pub use image_pipeline::{
    BaseImageResolver, BuildResult, DryRunImageBuilder, ImageBuilder, ImageId,
    ImagePipelineController, Pipeline, Schedule, SkipReason, StaticBaseImageResolver,
    TickOutcome, TriggerCondition,
};
pub use inflight::{InFlight, InFlightGuard};
pub use infra::{InfrastructureCatalog, InfrastructureConfig, Placement, SecurityPolicy};
pub use provisioning::{DeployResult, DeployStatus, LocalProvisioner, Provisioner, ResourceHandle};
pub use recipe::{BaseImageRef, ComponentRef, Recipe, RecipeComposer, VersionPin};
pub use recording::RunRecorder;
pub use stack::{Stack, StackGraph, Template};
pub use telemetry::init_tracing;

/// Crate version, used by the CLI and stamped into manifests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
