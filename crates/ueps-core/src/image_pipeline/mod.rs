//! Image pipelines: recipe + infrastructure bound under an optional
//! schedule with dependency-aware trigger gating.

pub mod controller;
pub mod gate;
pub mod schedule;
pub mod ticker;

pub use controller::{
    BaseImageResolver, BuildOutcome, BuildRequest, BuildResult, DryRunImageBuilder, ImageBuilder,
    ImageId, ImagePipelineController, Pipeline, PipelineState, PipelineStatus,
    StaticBaseImageResolver, TickOutcome,
};
pub use gate::{evaluate_gate, updated_dependencies, GateDecision, SkipReason, TriggerCondition};
pub use schedule::Schedule;
pub use ticker::run_schedule;
