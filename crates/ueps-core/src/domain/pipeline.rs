//! Release pipeline definition: ordered stages of run-ordered actions.
//!
//! A definition is pure data. It is serialized into the release pipeline
//! stack's template so a deploy of that stack can change the definition used
//! by later runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use ueps_state::ContentDigest;

use crate::domain::digest::compute_digest;
use crate::domain::error::{Result, UepsError};

/// Artifact name of the rendered template for `stack`.
pub fn template_artifact_name(stack: &str) -> String {
    format!("{stack}.template.json")
}

/// What an action does when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Fetches the source bundle for the trigger.
    Source,
    /// Renders stack templates from the source bundle.
    Build,
    /// Applies one stack's template through the provisioner.
    Deploy { stack: String },
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Source => "source",
            ActionKind::Build => "build",
            ActionKind::Deploy { .. } => "deploy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDef {
    pub name: String,
    pub kind: ActionKind,
    /// Actions sharing a run order run concurrently; lower runs first.
    pub run_order: u32,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl ActionDef {
    pub fn source(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ActionKind::Source,
            run_order: 1,
            inputs: Vec::new(),
            outputs: vec![output.into()],
        }
    }

    pub fn build(
        name: impl Into<String>,
        run_order: u32,
        input: impl Into<String>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ActionKind::Build,
            run_order,
            inputs: vec![input.into()],
            outputs,
        }
    }

    /// Deploy action consuming the template artifact of `stack`.
    pub fn deploy(name: impl Into<String>, run_order: u32, stack: impl Into<String>) -> Self {
        let stack = stack.into();
        Self {
            name: name.into(),
            inputs: vec![template_artifact_name(&stack)],
            kind: ActionKind::Deploy { stack },
            run_order,
            outputs: Vec::new(),
        }
    }

    pub fn target_stack(&self) -> Option<&str> {
        match &self.kind {
            ActionKind::Deploy { stack } => Some(stack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,
    pub actions: Vec<ActionDef>,
}

impl StageDef {
    pub fn new(name: impl Into<String>, actions: Vec<ActionDef>) -> Self {
        Self {
            name: name.into(),
            actions,
        }
    }

    /// Actions grouped by run order, lowest first. Declaration order is kept
    /// within a group.
    pub fn run_order_groups(&self) -> BTreeMap<u32, Vec<&ActionDef>> {
        let mut groups: BTreeMap<u32, Vec<&ActionDef>> = BTreeMap::new();
        for action in &self.actions {
            groups.entry(action.run_order).or_default().push(action);
        }
        groups
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    /// Stack that carries this definition; deployed before dependent stacks.
    pub self_stack: String,
    /// Re-run from the source stage right after a run that changed the
    /// definition.
    #[serde(default)]
    pub restart_on_update: bool,
    pub stages: Vec<StageDef>,
}

impl PipelineDefinition {
    pub fn digest(&self) -> Result<ContentDigest> {
        compute_digest(self)
    }

    pub fn action_count(&self) -> usize {
        self.stages.iter().map(|s| s.actions.len()).sum()
    }

    /// Check the structural rules every definition must satisfy before a run:
    /// unique stage and action names, run orders >= 1, exactly one producer
    /// per artifact, and every input produced strictly earlier (an earlier
    /// stage, or a lower run order in the same stage).
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(UepsError::InvalidPipeline(msg));

        if self.name.trim().is_empty() {
            return invalid("pipeline name must not be empty".to_string());
        }
        if self.stages.is_empty() {
            return invalid(format!("pipeline {} has no stages", self.name));
        }

        let mut stage_names = HashSet::new();
        let mut action_names = HashSet::new();
        // artifact -> (stage index, run order, producer)
        let mut producers: HashMap<&str, (usize, u32, &str)> = HashMap::new();

        for (idx, stage) in self.stages.iter().enumerate() {
            if !stage_names.insert(stage.name.as_str()) {
                return invalid(format!("duplicate stage name {}", stage.name));
            }
            if stage.actions.is_empty() {
                return invalid(format!("stage {} has no actions", stage.name));
            }
            for action in &stage.actions {
                if !action_names.insert(action.name.as_str()) {
                    return invalid(format!("duplicate action name {}", action.name));
                }
                if action.run_order == 0 {
                    return invalid(format!("action {} has run order 0", action.name));
                }
                for output in &action.outputs {
                    let entry = (idx, action.run_order, action.name.as_str());
                    if let Some((_, _, other)) = producers.insert(output.as_str(), entry) {
                        return invalid(format!(
                            "artifact {output} is produced by both {other} and {}",
                            action.name
                        ));
                    }
                }
            }
        }

        for (idx, stage) in self.stages.iter().enumerate() {
            for action in &stage.actions {
                match &action.kind {
                    ActionKind::Source if !action.inputs.is_empty() => {
                        return invalid(format!("source action {} takes no inputs", action.name));
                    }
                    ActionKind::Deploy { stack } => {
                        let expected = template_artifact_name(stack);
                        if action.inputs.is_empty() || action.inputs.iter().any(|i| *i != expected)
                        {
                            return invalid(format!(
                                "deploy action {} must consume exactly {expected}",
                                action.name
                            ));
                        }
                    }
                    _ => {}
                }

                for input in &action.inputs {
                    let Some(&(p_stage, p_order, producer)) = producers.get(input.as_str()) else {
                        return invalid(format!(
                            "action {} consumes {input} which no action produces",
                            action.name
                        ));
                    };
                    let earlier = p_stage < idx || (p_stage == idx && p_order < action.run_order);
                    if !earlier {
                        return invalid(format!(
                            "action {} consumes {input} from {producer} which does not run before it",
                            action.name
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}
