//! Action executors: what source, build and deploy actions actually do.
//!
//! Executors return `anyhow::Result` since collaborator failures are
//! arbitrary; a `UepsError` inside the chain keeps its variant so the
//! orchestrator can tell a rejected deploy from a failed one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use ueps_core::domain::ActionKind;
use ueps_core::provisioning::{DeployResult, Provisioner};
use ueps_core::{ActionDef, InFlight, Template};
use ueps_state::PublishedStore;

use crate::artifact::Artifact;
use crate::coordinator::ReleaseCoordinator;
use crate::source::{SourceBundle, SourceProvider};
use crate::trigger::Trigger;

/// Artifacts an action consumes, by name.
#[derive(Debug, Clone, Default)]
pub struct ActionInputs {
    pub artifacts: BTreeMap<String, Arc<Artifact>>,
}

impl ActionInputs {
    pub fn get(&self, name: &str) -> anyhow::Result<&Artifact> {
        self.artifacts
            .get(name)
            .map(Arc::as_ref)
            .ok_or_else(|| anyhow::anyhow!("input {name} was not provided"))
    }
}

/// What an action produced.
#[derive(Debug, Clone, Default)]
pub struct ActionOutput {
    /// Artifact name -> bytes. Must cover the action's declared outputs.
    pub artifacts: BTreeMap<String, Vec<u8>>,
    pub deploy: Option<DeployResult>,
}

impl ActionOutput {
    pub fn artifact(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.artifacts.insert(name.into(), bytes);
        self
    }
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action: &ActionDef,
        trigger: &Trigger,
        inputs: &ActionInputs,
    ) -> anyhow::Result<ActionOutput>;
}

/// One executor per action kind.
#[derive(Clone)]
pub struct Executors {
    pub source: Arc<dyn ActionExecutor>,
    pub build: Arc<dyn ActionExecutor>,
    pub deploy: Arc<dyn ActionExecutor>,
}

impl Executors {
    pub fn for_kind(&self, kind: &ActionKind) -> &Arc<dyn ActionExecutor> {
        match kind {
            ActionKind::Source => &self.source,
            ActionKind::Build => &self.build,
            ActionKind::Deploy { .. } => &self.deploy,
        }
    }
}

/// Fetches the source bundle for the trigger into the action's output.
pub struct SourceExecutor {
    provider: Arc<dyn SourceProvider>,
}

impl SourceExecutor {
    pub fn new(provider: Arc<dyn SourceProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ActionExecutor for SourceExecutor {
    async fn execute(
        &self,
        action: &ActionDef,
        trigger: &Trigger,
        _inputs: &ActionInputs,
    ) -> anyhow::Result<ActionOutput> {
        let bundle = self.provider.fetch(trigger).await?;
        debug!(action = %action.name, revision = %bundle.revision, files = bundle.files.len(), "source fetched");
        let bytes = bundle.to_bytes()?;
        Ok(action
            .outputs
            .iter()
            .fold(ActionOutput::default(), |out, name| out.artifact(name, bytes.clone())))
    }
}

/// Synthesizes stack templates from the source bundle, checking components
/// and recipes against everything earlier releases published.
pub struct SynthExecutor {
    published: Arc<dyn PublishedStore>,
}

impl SynthExecutor {
    pub fn new(published: Arc<dyn PublishedStore>) -> Self {
        Self { published }
    }
}

#[async_trait]
impl ActionExecutor for SynthExecutor {
    async fn execute(
        &self,
        action: &ActionDef,
        _trigger: &Trigger,
        inputs: &ActionInputs,
    ) -> anyhow::Result<ActionOutput> {
        let input = action
            .inputs
            .first()
            .ok_or_else(|| anyhow::anyhow!("build action {} has no input", action.name))?;
        let bundle = SourceBundle::from_bytes(&inputs.get(input)?.bytes)?;
        let config = bundle.config()?;
        let assembly =
            ReleaseCoordinator::assemble_published(&config, &bundle, self.published.as_ref())
                .await?;
        let mut rendered = assembly.render_templates()?;

        let mut output = ActionOutput::default();
        for name in &action.outputs {
            let text = rendered.remove(name).ok_or_else(|| {
                anyhow::anyhow!("build action {} does not produce {name}", action.name)
            })?;
            output = output.artifact(name, text.into_bytes());
        }
        info!(action = %action.name, templates = output.artifacts.len(), "templates synthesized");
        Ok(output)
    }
}

/// Applies a stack template through the provisioner, at most one deploy per
/// stack at a time across all runs sharing this executor.
pub struct DeployExecutor {
    provisioner: Arc<dyn Provisioner>,
    inflight: InFlight,
}

impl DeployExecutor {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            inflight: InFlight::new(),
        }
    }

    pub fn inflight(&self) -> &InFlight {
        &self.inflight
    }
}

#[async_trait]
impl ActionExecutor for DeployExecutor {
    async fn execute(
        &self,
        action: &ActionDef,
        _trigger: &Trigger,
        inputs: &ActionInputs,
    ) -> anyhow::Result<ActionOutput> {
        let stack = action
            .target_stack()
            .ok_or_else(|| anyhow::anyhow!("action {} is not a deploy action", action.name))?;
        let _guard = self.inflight.try_acquire(stack)?;

        let template_name = ueps_core::domain::template_artifact_name(stack);
        let template = Template::parse(&inputs.get(&template_name)?.bytes)?;
        let result = self.provisioner.apply(stack, &template).await?;

        Ok(ActionOutput {
            artifacts: BTreeMap::new(),
            deploy: Some(result),
        })
    }
}
