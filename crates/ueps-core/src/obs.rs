//! Structured observability hooks for release runs, image builds and
//! stack deploys.
//!
//! Events are emitted at `info!` with an `event` field naming the
//! lifecycle step, so they can be filtered in either log format.

use tracing::info;

/// Run-scoped span. Attach it to async work with `tracing::Instrument`.
pub fn run_span(run_id: &str, pipeline: &str) -> tracing::Span {
    tracing::info_span!("ueps.run", run_id = %run_id, pipeline = %pipeline)
}

pub fn emit_run_started(run_id: &str, pipeline: &str, revision: Option<&str>) {
    info!(
        event = "run.started",
        run_id = %run_id,
        pipeline = %pipeline,
        revision = revision.unwrap_or("-"),
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, total_events: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        total_events = total_events,
        success = success,
    );
}

pub fn emit_event_appended(run_id: &str, kind: &str, seq: u64) {
    tracing::debug!(event = "run.event_appended", run_id = %run_id, kind = %kind, seq = seq);
}

pub fn emit_stage_started(run_id: &str, stage: &str, actions: usize) {
    info!(event = "stage.started", run_id = %run_id, stage = %stage, actions = actions);
}

pub fn emit_action_started(run_id: &str, action: &str, run_order: u32) {
    info!(event = "action.started", run_id = %run_id, action = %action, run_order = run_order);
}

pub fn emit_action_finished(run_id: &str, action: &str, duration_ms: u64, success: bool) {
    info!(
        event = "action.finished",
        run_id = %run_id,
        action = %action,
        duration_ms = duration_ms,
        success = success,
    );
}

/// A scheduled tick's trigger gate was evaluated.
pub fn emit_gate_evaluated(pipeline: &str, condition: &str, run: bool, reason: &str) {
    info!(
        event = "gate.evaluated",
        pipeline = %pipeline,
        condition = %condition,
        run = run,
        reason = %reason,
    );
}

pub fn emit_build_started(pipeline: &str, recipe: &str, recipe_version: &str) {
    info!(
        event = "build.started",
        pipeline = %pipeline,
        recipe = %recipe,
        recipe_version = %recipe_version,
    );
}

pub fn emit_build_finished(pipeline: &str, image_id: Option<&str>, duration_ms: u64, success: bool) {
    info!(
        event = "build.finished",
        pipeline = %pipeline,
        image_id = image_id.unwrap_or("-"),
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_deploy_applied(stack: &str, digest: &str, changed: bool) {
    info!(event = "deploy.applied", stack = %stack, digest = %digest, changed = changed);
}

pub fn emit_trigger_acknowledged(source: &str, git_ref: &str, revision: &str) {
    info!(
        event = "trigger.duplicate",
        source = %source,
        git_ref = %git_ref,
        revision = %revision,
    );
}

pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}
