//! Inbound release triggers.
//!
//! Delivery is at-least-once. A trigger whose `(source, ref, revision)`
//! already completed successfully, or is running right now, is acknowledged
//! without starting a run.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;
use ueps_core::obs;
use ueps_core::{InFlight, PipelineDefinition, Result, UepsError};
use ueps_state::{RunId, RunLedger};

use crate::orchestrator::{Orchestrator, RunResult};

/// Run tag holding [`Trigger::key`].
pub const TRIGGER_TAG: &str = "trigger";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trigger {
    pub source: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub revision: String,
}

impl Trigger {
    pub fn new(
        source: impl Into<String>,
        git_ref: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            git_ref: git_ref.into(),
            revision: revision.into(),
        }
    }

    /// Identity used for duplicate detection.
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.source, self.git_ref, self.revision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// An earlier run for this trigger completed successfully.
    AlreadyReleased(RunId),
    /// A run for this trigger is in flight.
    InFlight,
}

#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Acknowledged(Acknowledgement),
    /// Runs started for this trigger: one, or two when the first changed the
    /// definition and the definition asks for a restart.
    Completed { runs: Vec<RunResult> },
}

impl TriggerOutcome {
    pub fn runs(&self) -> &[RunResult] {
        match self {
            TriggerOutcome::Completed { runs } => runs,
            TriggerOutcome::Acknowledged(_) => &[],
        }
    }

    /// True when nothing failed: an acknowledgement or all runs succeeded.
    pub fn is_success(&self) -> bool {
        self.runs().iter().all(|r| r.success)
    }
}

/// Owns the definition later runs use and applies self-updates between runs.
pub struct TriggerHandler {
    orchestrator: Orchestrator,
    ledger: Arc<dyn RunLedger>,
    definition: Mutex<PipelineDefinition>,
    inflight: InFlight,
}

impl TriggerHandler {
    pub fn new(orchestrator: Orchestrator, definition: PipelineDefinition) -> Self {
        let ledger = Arc::clone(orchestrator.ledger());
        Self {
            orchestrator,
            ledger,
            definition: Mutex::new(definition),
            inflight: InFlight::new(),
        }
    }

    pub fn current_definition(&self) -> PipelineDefinition {
        self.definition
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn replace_definition(&self, definition: PipelineDefinition) {
        *self.definition.lock().unwrap_or_else(|e| e.into_inner()) = definition;
    }

    async fn completed_run(&self, trigger: &Trigger) -> Result<Option<RunId>> {
        let run = self
            .ledger
            .latest_completed_with_tag(TRIGGER_TAG, &trigger.key())
            .await?;
        Ok(run.map(|r| r.run_id))
    }

    pub async fn handle(&self, trigger: &Trigger) -> Result<TriggerOutcome> {
        let _guard = match self.inflight.try_acquire(&trigger.key()) {
            Ok(guard) => guard,
            Err(UepsError::AlreadyRunning { .. }) => {
                obs::emit_trigger_acknowledged(&trigger.source, &trigger.git_ref, &trigger.revision);
                return Ok(TriggerOutcome::Acknowledged(Acknowledgement::InFlight));
            }
            Err(e) => return Err(e),
        };

        if let Some(run_id) = self.completed_run(trigger).await? {
            obs::emit_trigger_acknowledged(&trigger.source, &trigger.git_ref, &trigger.revision);
            return Ok(TriggerOutcome::Acknowledged(Acknowledgement::AlreadyReleased(run_id)));
        }

        let definition = self.current_definition();
        let first = self.orchestrator.run(&definition, trigger).await?;
        let Some(updated) = first.updated_definition.clone() else {
            return Ok(TriggerOutcome::Completed { runs: vec![first] });
        };

        self.replace_definition(updated.clone());
        if !updated.restart_on_update {
            return Ok(TriggerOutcome::Completed { runs: vec![first] });
        }

        info!(pipeline = %updated.name, revision = %trigger.revision, "restarting with updated definition");
        let restarted = self.orchestrator.run(&updated, trigger).await?;
        if let Some(again) = restarted.updated_definition.clone() {
            self.replace_definition(again);
        }
        Ok(TriggerOutcome::Completed {
            runs: vec![first, restarted],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_serializes_ref() {
        let trigger = Trigger::new("github", "refs/heads/main", "abc");
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["ref"], "refs/heads/main");
        let back: Trigger = serde_json::from_value(json).unwrap();
        assert_eq!(back, trigger);
        assert_eq!(trigger.key(), "github|refs/heads/main|abc");
    }
}
