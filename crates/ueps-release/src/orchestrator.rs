//! Build/Release Orchestrator.
//!
//! Stages run strictly in order. Within a stage, actions sharing the lowest
//! remaining run order run concurrently; the next group starts only after
//! every action of the current one has finished. A group's outputs are
//! published only when all of its actions succeeded, so a later group never
//! sees artifacts of a failed one.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn, Instrument};
use ueps_core::domain::template_artifact_name;
use ueps_core::obs;
use ueps_core::provisioning::DeployResult;
use ueps_core::stack::definition_from_template;
use ueps_core::{
    ActionDef, PipelineDefinition, Result, RunRecorder, StageDef, Template, UepsError,
};
use ueps_state::{ContentDigest, RunId, RunLedger, RunMetadata};

use crate::artifact::{Artifact, ArtifactStore};
use crate::executor::{ActionInputs, ActionOutput, Executors};
use crate::trigger::{Trigger, TRIGGER_TAG};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Failed { reason: String },
    /// Refused because the same target was already in flight.
    Rejected { reason: String },
    /// Finished, but a sibling in its run-order group failed.
    Discarded,
    /// Never started.
    Skipped,
}

impl ActionStatus {
    fn event_kind(&self) -> &'static str {
        match self {
            ActionStatus::Succeeded => "action_succeeded",
            ActionStatus::Failed { .. } => "action_failed",
            ActionStatus::Rejected { .. } => "action_rejected",
            ActionStatus::Discarded => "action_discarded",
            ActionStatus::Skipped => "action_skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub name: String,
    pub run_order: u32,
    pub status: ActionStatus,
    pub duration_ms: u64,
    pub deploy: Option<DeployResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub name: String,
    pub actions: Vec<ActionOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub pipeline: String,
    pub definition_digest: ContentDigest,
    pub success: bool,
    pub stages: Vec<StageOutcome>,
    /// Definition deployed by this run's self-stack deploy, when it differs
    /// from the one the run executed.
    pub updated_definition: Option<PipelineDefinition>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn action(&self, name: &str) -> Option<&ActionOutcome> {
        self.stages
            .iter()
            .flat_map(|s| &s.actions)
            .find(|a| a.name == name)
    }

    pub fn deploys(&self) -> impl Iterator<Item = &DeployResult> {
        self.stages
            .iter()
            .flat_map(|s| &s.actions)
            .filter_map(|a| a.deploy.as_ref())
    }
}

/// One finished action of a run-order group.
struct Finished<'a> {
    action: &'a ActionDef,
    inputs: ActionInputs,
    result: anyhow::Result<ActionOutput>,
    duration_ms: u64,
}

/// Mutable state of one run.
struct RunState {
    store: ArtifactStore,
    stages: Vec<StageOutcome>,
    failure: Option<String>,
    updated: Option<PipelineDefinition>,
}

pub struct Orchestrator {
    executors: Executors,
    ledger: Arc<dyn RunLedger>,
}

impl Orchestrator {
    pub fn new(executors: Executors, ledger: Arc<dyn RunLedger>) -> Self {
        Self { executors, ledger }
    }

    pub fn ledger(&self) -> &Arc<dyn RunLedger> {
        &self.ledger
    }

    /// Execute `definition` once for `trigger`.
    ///
    /// Action failures end the run with `success == false`; `Err` is
    /// reserved for an invalid definition or a ledger failure.
    pub async fn run(&self, definition: &PipelineDefinition, trigger: &Trigger) -> Result<RunResult> {
        definition.validate()?;
        let digest = definition.digest()?;
        let metadata = RunMetadata {
            revision: Some(trigger.revision.clone()),
            pipeline_name: definition.name.clone(),
            tags: json!({
                TRIGGER_TAG: trigger.key(),
                "source": trigger.source,
                "ref": trigger.git_ref,
            }),
        };
        let recorder = RunRecorder::start(Arc::clone(&self.ledger), &digest, metadata).await?;
        let run_id = recorder.run_id().clone();
        let started = Instant::now();

        let mut state = RunState {
            store: ArtifactStore::new(),
            stages: Vec::with_capacity(definition.stages.len()),
            failure: None,
            updated: None,
        };

        let executed = self
            .execute(definition, &digest, trigger, &recorder, &mut state)
            .instrument(obs::run_span(&run_id.0, &definition.name))
            .await;
        state.store.clear();

        if let Err(e) = executed {
            if let Err(finalize) = recorder.finish_err().await {
                obs::emit_run_finalize_error(&run_id.0, &finalize);
            }
            return Err(e);
        }

        let success = state.failure.is_none();
        if success {
            recorder.finish_ok().await?;
        } else {
            recorder.finish_err().await?;
        }

        Ok(RunResult {
            run_id,
            pipeline: definition.name.clone(),
            definition_digest: digest,
            success,
            stages: state.stages,
            updated_definition: state.updated,
            error: state.failure,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn execute(
        &self,
        definition: &PipelineDefinition,
        digest: &ContentDigest,
        trigger: &Trigger,
        recorder: &RunRecorder,
        state: &mut RunState,
    ) -> Result<()> {
        for stage in &definition.stages {
            if state.failure.is_some() {
                let actions = Self::skip_actions(recorder, stage.actions.iter()).await?;
                state.stages.push(StageOutcome {
                    name: stage.name.clone(),
                    actions,
                });
                continue;
            }

            obs::emit_stage_started(&recorder.run_id().0, &stage.name, stage.actions.len());
            recorder
                .record(
                    "stage_started",
                    json!({ "stage": stage.name, "actions": stage.actions.len() }),
                )
                .await?;

            let actions = self
                .execute_stage(definition, digest, stage, trigger, recorder, state)
                .await?;
            state.stages.push(StageOutcome {
                name: stage.name.clone(),
                actions,
            });
        }
        Ok(())
    }

    async fn execute_stage(
        &self,
        definition: &PipelineDefinition,
        digest: &ContentDigest,
        stage: &StageDef,
        trigger: &Trigger,
        recorder: &RunRecorder,
        state: &mut RunState,
    ) -> Result<Vec<ActionOutcome>> {
        let mut outcomes = Vec::with_capacity(stage.actions.len());

        for (run_order, group) in stage.run_order_groups() {
            if state.failure.is_some() {
                outcomes.extend(Self::skip_actions(recorder, group.into_iter()).await?);
                continue;
            }

            for action in &group {
                obs::emit_action_started(&recorder.run_id().0, &action.name, run_order);
                recorder
                    .record(
                        "action_started",
                        json!({ "stage": stage.name, "action": action.name, "run_order": run_order }),
                    )
                    .await?;
            }

            let finished = join_all(
                group
                    .iter()
                    .map(|action| self.run_action(*action, trigger, &state.store)),
            )
            .await;

            outcomes.extend(
                self.settle_group(definition, digest, finished, recorder, state)
                    .await?,
            );
        }
        Ok(outcomes)
    }

    async fn run_action<'a>(
        &self,
        action: &'a ActionDef,
        trigger: &Trigger,
        store: &ArtifactStore,
    ) -> Finished<'a> {
        let started = Instant::now();
        let mut inputs = ActionInputs::default();
        let result = async {
            for name in &action.inputs {
                inputs
                    .artifacts
                    .insert(name.clone(), store.fetch(&action.name, name)?);
            }
            let output = self
                .executors
                .for_kind(&action.kind)
                .execute(action, trigger, &inputs)
                .await?;
            if let Some(missing) = action
                .outputs
                .iter()
                .find(|name| !output.artifacts.contains_key(*name))
            {
                anyhow::bail!("action {} did not produce {missing}", action.name);
            }
            Ok::<_, anyhow::Error>(output)
        }
        .await;

        Finished {
            action,
            inputs,
            result,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Record a finished group and publish its outputs if every action
    /// succeeded.
    async fn settle_group(
        &self,
        definition: &PipelineDefinition,
        digest: &ContentDigest,
        finished: Vec<Finished<'_>>,
        recorder: &RunRecorder,
        state: &mut RunState,
    ) -> Result<Vec<ActionOutcome>> {
        let group_ok = finished.iter().all(|f| f.result.is_ok());
        let mut outcomes = Vec::with_capacity(finished.len());
        let mut published = Vec::new();

        for item in finished {
            let action = item.action;
            let (status, deploy) = match item.result {
                Ok(output) => {
                    // A discarded self deploy has still applied its template.
                    if action.target_stack() == Some(definition.self_stack.as_str()) {
                        if let Some(updated) = Self::deployed_definition(action, &item.inputs, digest)? {
                            info!(
                                pipeline = %definition.name,
                                updated = %updated.name,
                                "pipeline definition updated; takes effect on the next run"
                            );
                            recorder
                                .record(
                                    "definition_updated",
                                    json!({ "action": action.name, "digest": updated.digest()?.to_string() }),
                                )
                                .await?;
                            state.updated = Some(updated);
                        }
                    }
                    if !group_ok {
                        (ActionStatus::Discarded, output.deploy)
                    } else {
                        for name in &action.outputs {
                            if let Some(bytes) = output.artifacts.get(name) {
                                published.push(Artifact::new(name.clone(), action.name.clone(), bytes.clone()));
                            }
                        }
                        (ActionStatus::Succeeded, output.deploy)
                    }
                }
                Err(err) => {
                    let status = classify(&err);
                    if state.failure.is_none() {
                        state.failure = Some(
                            UepsError::ActionFailed {
                                action: action.name.clone(),
                                reason: format!("{err:#}"),
                            }
                            .to_string(),
                        );
                    }
                    (status, None)
                }
            };

            obs::emit_action_finished(
                &recorder.run_id().0,
                &action.name,
                item.duration_ms,
                status == ActionStatus::Succeeded,
            );
            if let ActionStatus::Failed { reason } | ActionStatus::Rejected { reason } = &status {
                warn!(action = %action.name, reason = %reason, "action did not succeed");
            }
            recorder
                .record(
                    status.event_kind(),
                    action_payload(action, &status, item.duration_ms),
                )
                .await?;

            outcomes.push(ActionOutcome {
                name: action.name.clone(),
                run_order: action.run_order,
                status,
                duration_ms: item.duration_ms,
                deploy,
            });
        }

        if group_ok {
            if let Err(e) = state.store.publish(published) {
                state.failure = Some(e.to_string());
            }
        }
        Ok(outcomes)
    }

    /// The definition carried by a self-stack deploy's template, when it
    /// differs from the running one.
    fn deployed_definition(
        action: &ActionDef,
        inputs: &ActionInputs,
        running: &ContentDigest,
    ) -> Result<Option<PipelineDefinition>> {
        let Some(stack) = action.target_stack() else {
            return Ok(None);
        };
        let Some(artifact) = inputs.artifacts.get(&template_artifact_name(stack)) else {
            return Ok(None);
        };
        let template = Template::parse(&artifact.bytes)?;
        match definition_from_template(&template)? {
            Some(deployed) if deployed.digest()? != *running => Ok(Some(deployed)),
            _ => Ok(None),
        }
    }

    async fn skip_actions<'a>(
        recorder: &RunRecorder,
        actions: impl Iterator<Item = &'a ActionDef>,
    ) -> Result<Vec<ActionOutcome>> {
        let mut outcomes = Vec::new();
        for action in actions {
            let status = ActionStatus::Skipped;
            recorder
                .record(status.event_kind(), action_payload(action, &status, 0))
                .await?;
            outcomes.push(ActionOutcome {
                name: action.name.clone(),
                run_order: action.run_order,
                status,
                duration_ms: 0,
                deploy: None,
            });
        }
        Ok(outcomes)
    }
}

fn classify(err: &anyhow::Error) -> ActionStatus {
    match err.downcast_ref::<UepsError>() {
        Some(UepsError::AlreadyRunning { .. }) => ActionStatus::Rejected {
            reason: err.to_string(),
        },
        _ => ActionStatus::Failed {
            reason: format!("{err:#}"),
        },
    }
}

fn action_payload(action: &ActionDef, status: &ActionStatus, duration_ms: u64) -> Value {
    let mut payload = json!({
        "action": action.name,
        "kind": action.kind.as_str(),
        "run_order": action.run_order,
        "duration_ms": duration_ms,
    });
    if let ActionStatus::Failed { reason } | ActionStatus::Rejected { reason } = status {
        payload["reason"] = json!(reason);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ueps_state::fakes::MemoryRunLedger;
    use ueps_state::RunStatus;

    use crate::executor::ActionExecutor;

    /// Emits every declared output; fails for actions named in `fail`.
    struct Scripted {
        fail: Vec<&'static str>,
    }

    #[async_trait]
    impl ActionExecutor for Scripted {
        async fn execute(
            &self,
            action: &ActionDef,
            _trigger: &Trigger,
            _inputs: &ActionInputs,
        ) -> anyhow::Result<ActionOutput> {
            if self.fail.contains(&action.name.as_str()) {
                anyhow::bail!("scripted failure");
            }
            Ok(action
                .outputs
                .iter()
                .fold(ActionOutput::default(), |out, name| out.artifact(name, b"{}".to_vec())))
        }
    }

    fn orchestrator(fail: Vec<&'static str>) -> (Orchestrator, Arc<MemoryRunLedger>) {
        let executor: Arc<dyn ActionExecutor> = Arc::new(Scripted { fail });
        let ledger = Arc::new(MemoryRunLedger::new());
        let executors = Executors {
            source: Arc::clone(&executor),
            build: Arc::clone(&executor),
            deploy: executor,
        };
        (Orchestrator::new(executors, ledger.clone()), ledger)
    }

    fn definition() -> PipelineDefinition {
        PipelineDefinition {
            name: "p".to_string(),
            self_stack: "Self".to_string(),
            restart_on_update: false,
            stages: vec![
                StageDef::new("Source", vec![ActionDef::source("Fetch", "source")]),
                StageDef::new(
                    "Build",
                    vec![ActionDef::build(
                        "Synth",
                        1,
                        "source",
                        vec![template_artifact_name("A")],
                    )],
                ),
                StageDef::new("Deploy", vec![ActionDef::deploy("DeployA", 1, "A")]),
            ],
        }
    }

    fn trigger() -> Trigger {
        Trigger::new("webhook", "refs/heads/main", "abc123")
    }

    #[tokio::test]
    async fn test_successful_run_records_every_action() {
        let (orch, ledger) = orchestrator(vec![]);
        let result = orch.run(&definition(), &trigger()).await.unwrap();
        assert!(result.success);
        assert!(result.error.is_none());

        let record = ledger.get_run(&result.run_id).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.metadata.revision.as_deref(), Some("abc123"));

        let kinds: Vec<String> = ledger
            .get_events(&result.run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds.iter().filter(|k| *k == "action_succeeded").count(), 3);
        assert_eq!(kinds.iter().filter(|k| *k == "stage_started").count(), 3);
    }

    #[tokio::test]
    async fn test_failed_stage_skips_later_stages() {
        let (orch, ledger) = orchestrator(vec!["Synth"]);
        let result = orch.run(&definition(), &trigger()).await.unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("Synth"));
        assert!(matches!(result.action("Synth").unwrap().status, ActionStatus::Failed { .. }));
        assert_eq!(result.action("DeployA").unwrap().status, ActionStatus::Skipped);
        assert_eq!(
            ledger.get_run(&result.run_id).await.unwrap().status,
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_missing_output_fails_action() {
        struct Silent;
        #[async_trait]
        impl ActionExecutor for Silent {
            async fn execute(
                &self,
                _action: &ActionDef,
                _trigger: &Trigger,
                _inputs: &ActionInputs,
            ) -> anyhow::Result<ActionOutput> {
                Ok(ActionOutput::default())
            }
        }
        let silent: Arc<dyn ActionExecutor> = Arc::new(Silent);
        let orch = Orchestrator::new(
            Executors {
                source: Arc::clone(&silent),
                build: Arc::clone(&silent),
                deploy: silent,
            },
            Arc::new(MemoryRunLedger::new()),
        );
        let result = orch.run(&definition(), &trigger()).await.unwrap();
        match &result.action("Fetch").unwrap().status {
            ActionStatus::Failed { reason } => assert!(reason.contains("did not produce source")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_discarded_self_deploy_still_updates_definition() {
        use ueps_core::stack::{ReleasePipelineStack, SourceRepository};

        /// Synth renders the pipeline stack with a renamed definition; the
        /// sibling deploy of `A` fails.
        struct SelfUpdate {
            template: String,
        }

        #[async_trait]
        impl ActionExecutor for SelfUpdate {
            async fn execute(
                &self,
                action: &ActionDef,
                _trigger: &Trigger,
                _inputs: &ActionInputs,
            ) -> anyhow::Result<ActionOutput> {
                if action.name == "DeployA" {
                    anyhow::bail!("stack A rolled back");
                }
                Ok(action.outputs.iter().fold(ActionOutput::default(), |out, name| {
                    out.artifact(name, self.template.clone().into_bytes())
                }))
            }
        }

        let mut running = definition();
        running.stages[1].actions[0]
            .outputs
            .push(template_artifact_name("Self"));
        running.stages[2]
            .actions
            .push(ActionDef::deploy("DeploySelf", 1, "Self"));

        let mut next = running.clone();
        next.name = "p-v2".to_string();
        let template = ReleasePipelineStack {
            name: "Self".to_string(),
            definition: next,
            artifact_bucket: None,
            source: SourceRepository {
                owner: "o".to_string(),
                repo: "r".to_string(),
                branch: "main".to_string(),
            },
            depends_on: Vec::new(),
        }
        .template()
        .unwrap()
        .render()
        .unwrap();

        let executor: Arc<dyn ActionExecutor> = Arc::new(SelfUpdate { template });
        let orch = Orchestrator::new(
            Executors {
                source: Arc::clone(&executor),
                build: Arc::clone(&executor),
                deploy: executor,
            },
            Arc::new(MemoryRunLedger::new()),
        );

        let result = orch.run(&running, &trigger()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.action("DeploySelf").unwrap().status, ActionStatus::Discarded);
        assert_eq!(
            result.updated_definition.as_ref().map(|d| d.name.as_str()),
            Some("p-v2")
        );
    }

    #[tokio::test]
    async fn test_invalid_definition_is_error() {
        let (orch, ledger) = orchestrator(vec![]);
        let mut def = definition();
        def.stages.clear();
        assert!(matches!(
            orch.run(&def, &trigger()).await,
            Err(UepsError::InvalidPipeline(_))
        ));
        assert!(ledger.list_runs(None).await.unwrap().is_empty());
    }
}
