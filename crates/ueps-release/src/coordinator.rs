//! Release Coordinator: assembles the stack set, its dependency graph and the
//! release pipeline definition from a configuration and a source bundle.
//!
//! Assembly is all-or-nothing. Every template is rendered in memory before
//! anything is written, so a composition error leaves the output directory
//! untouched.
//!
//! Component and recipe identities outlive one synthesis: assembling against
//! a [`PublishedCatalog`] rejects changed content under a version that an
//! earlier release already published.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, instrument};
use ueps_core::config::ReleaseConfig;
use ueps_core::domain::{
    compute_digest, template_artifact_name, ActionDef, PipelineDefinition, StageDef,
};
use ueps_core::image_pipeline::TriggerCondition;
use ueps_core::stack::{
    build_graph, network_export, ImageBuilderStack, NetworkStack, ReleasePipelineStack,
    SourceRepository,
};
use ueps_core::{
    AccountScope, BaseImageRef, Component, ComponentRef, ComponentRegistry,
    ImagePipelineController, InfrastructureConfig, Pipeline, Placement, Platform, Recipe,
    RecipeComposer, Result, Schedule, SecurityPolicy, Stack, StackGraph, UepsError,
};
use ueps_state::{PublishedKind, PublishedStore, PublishedVersion, StorageError};

use crate::source::SourceBundle;

pub const MANIFEST_FILE: &str = "manifest.json";

pub const SOURCE_STAGE: &str = "Source";
pub const SOURCE_ACTION: &str = "GitHubSource";
pub const SOURCE_ARTIFACT: &str = "source";
pub const ADMINISTER_STAGE: &str = "BuildAndAdministerPipeline";
pub const BUILD_ACTION: &str = "CDK_Build";
pub const ADMINISTER_ACTION: &str = "AdministerPipeline";
pub const DEPLOY_STAGE: &str = "AMIBuilder";

/// Version used for a managed component entry that does not pin one.
const DEFAULT_MANAGED_VERSION: &str = "1.0.0";

/// How the image pipeline is bound once the builder stack is deployed.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePipelineBinding {
    pub name: String,
    /// Recipe components, in install order.
    pub components: Vec<Component>,
    pub recipe: Recipe,
    pub infrastructure: InfrastructureConfig,
    pub schedule: Option<Schedule>,
    pub condition: TriggerCondition,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestStack {
    pub name: String,
    pub kind: String,
    pub template: String,
    pub digest: String,
    pub dependencies: Vec<String>,
}

/// Index of a synthesized output directory.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub version: String,
    pub region: String,
    pub account: String,
    pub pipeline: String,
    pub definition_digest: String,
    pub deploy_order: Vec<String>,
    pub stacks: Vec<ManifestStack>,
}

/// The validated stack set of one configuration.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub scope: AccountScope,
    pub stacks: Vec<Stack>,
    pub graph: StackGraph,
    pub definition: PipelineDefinition,
    pub image_pipeline: ImagePipelineBinding,
}

impl Assembly {
    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stacks.iter().find(|s| s.name() == name)
    }

    pub fn deploy_order(&self) -> Result<Vec<String>> {
        self.graph.topological_order()
    }

    /// Template artifact name -> rendered template, for every stack.
    pub fn render_templates(&self) -> Result<BTreeMap<String, String>> {
        self.stacks
            .iter()
            .map(|stack| {
                let text = stack.template(&self.scope)?.render()?;
                Ok((template_artifact_name(stack.name()), text))
            })
            .collect()
    }

    pub fn manifest(&self) -> Result<Manifest> {
        let mut stacks = Vec::with_capacity(self.stacks.len());
        for stack in &self.stacks {
            let template = stack.template(&self.scope)?;
            stacks.push(ManifestStack {
                name: stack.name().to_string(),
                kind: stack.kind().to_string(),
                template: template_artifact_name(stack.name()),
                digest: template.digest()?.to_string(),
                dependencies: stack.dependencies(),
            });
        }
        Ok(Manifest {
            version: ueps_core::VERSION.to_string(),
            region: self.scope.region.clone(),
            account: self.scope.account.clone(),
            pipeline: self.definition.name.clone(),
            definition_digest: self.definition.digest()?.to_string(),
            deploy_order: self.deploy_order()?,
            stacks,
        })
    }

    /// Every output file (templates plus the manifest), rendered in memory.
    pub fn render(&self) -> Result<BTreeMap<String, String>> {
        let mut files = self.render_templates()?;
        files.insert(
            MANIFEST_FILE.to_string(),
            serde_json::to_string_pretty(&self.manifest()?)?,
        );
        Ok(files)
    }

    /// Render everything, then write it under `out_dir`.
    pub fn synthesize(&self, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let files = self.render()?;
        std::fs::create_dir_all(out_dir)?;
        let mut written = Vec::with_capacity(files.len());
        for (name, text) in files {
            let path = out_dir.join(&name);
            std::fs::write(&path, text)?;
            written.push(path);
        }
        info!(out = %out_dir.display(), files = written.len(), "synthesized");
        Ok(written)
    }

    /// Bind the image pipeline this assembly declares into `controller`.
    pub fn bind_image_pipeline(&self, controller: &ImagePipelineController) -> Result<Pipeline> {
        let binding = &self.image_pipeline;
        controller.bind(
            &binding.name,
            binding.recipe.clone(),
            binding.infrastructure.clone(),
            binding.schedule.clone(),
            Some(binding.condition),
        )
    }
}

/// Components and recipes published by earlier releases.
#[derive(Debug, Clone, Default)]
pub struct PublishedCatalog {
    pub components: Vec<Component>,
    pub recipes: Vec<Recipe>,
}

impl PublishedCatalog {
    pub async fn load(store: &dyn PublishedStore) -> Result<Self> {
        let components = store
            .list(PublishedKind::Component)
            .await?
            .into_iter()
            .map(|entry| Ok(serde_json::from_value(entry.content)?))
            .collect::<Result<Vec<Component>>>()?;
        let recipes = store
            .list(PublishedKind::Recipe)
            .await?
            .into_iter()
            .map(|entry| Ok(serde_json::from_value(entry.content)?))
            .collect::<Result<Vec<Recipe>>>()?;
        Ok(Self {
            components,
            recipes,
        })
    }

    /// Record every identity `assembly` publishes.
    ///
    /// A store-side conflict (another release published the identity first)
    /// surfaces as the matching version conflict.
    pub async fn record(store: &dyn PublishedStore, assembly: &Assembly) -> Result<()> {
        let binding = &assembly.image_pipeline;
        for component in &binding.components {
            let entry = PublishedVersion::new(
                PublishedKind::Component,
                &component.name,
                component.version.to_string(),
                compute_digest(component)?,
                serde_json::to_value(component)?,
            );
            store.publish(entry).await.map_err(|e| match e {
                StorageError::PublishedConflict { name, version, .. } => {
                    UepsError::DuplicateVersionConflict { name, version }
                }
                other => other.into(),
            })?;
        }

        let recipe = &binding.recipe;
        let entry = PublishedVersion::new(
            PublishedKind::Recipe,
            &recipe.name,
            recipe.version.to_string(),
            recipe.digest()?,
            serde_json::to_value(recipe)?,
        );
        store.publish(entry).await.map_err(|e| match e {
            StorageError::PublishedConflict { name, version, .. } => UepsError::VersionConflict {
                name,
                version,
                detail: "published concurrently with different contents".to_string(),
            },
            other => other.into(),
        })?;
        Ok(())
    }
}

pub struct ReleaseCoordinator;

impl ReleaseCoordinator {
    /// Publish the configured components, compose the recipe and assemble
    /// the validated stack set, with nothing published beforehand.
    pub fn assemble(config: &ReleaseConfig, bundle: &SourceBundle) -> Result<Assembly> {
        Self::assemble_with(config, bundle, &PublishedCatalog::default())
    }

    /// Assemble against the identities in `store`, then record the ones this
    /// assembly publishes. A changed component or recipe under a published
    /// version fails before anything is recorded.
    pub async fn assemble_published(
        config: &ReleaseConfig,
        bundle: &SourceBundle,
        store: &dyn PublishedStore,
    ) -> Result<Assembly> {
        let catalog = PublishedCatalog::load(store).await?;
        let assembly = Self::assemble_with(config, bundle, &catalog)?;
        PublishedCatalog::record(store, &assembly).await?;
        Ok(assembly)
    }

    /// Assemble with `published` already in the registry and composer.
    #[instrument(skip_all, fields(revision = %bundle.revision, published = published.components.len()))]
    pub fn assemble_with(
        config: &ReleaseConfig,
        bundle: &SourceBundle,
        published: &PublishedCatalog,
    ) -> Result<Assembly> {
        let scope = config.scope();
        let image = &config.image;
        let platform: Platform = image.platform.parse()?;

        let mut registry = ComponentRegistry::new();
        for component in &published.components {
            registry.restore(component.clone())?;
        }
        let (registry, components) = Self::publish_components(config, bundle, platform, registry)?;
        let refs: Vec<ComponentRef> = components.iter().map(ComponentRef::from).collect();
        let mut composer = RecipeComposer::new(scope.clone(), registry);
        for recipe in &published.recipes {
            composer.restore(recipe.clone())?;
        }
        let recipe = composer.compose(
            &image.recipe_name,
            &image.recipe_version,
            &refs,
            BaseImageRef::new(&image.base_image, &image.base_image_version)?,
        )?;

        let infrastructure = InfrastructureConfig::define(
            &image.infrastructure_name,
            image.instance_types.clone(),
            Placement {
                subnet_id: network_export(&config.network.stack_name, "SubnetId"),
                security_group_ids: Vec::new(),
            },
            &image.instance_profile,
            SecurityPolicy {
                role_name: image.role_name.clone(),
                managed_policies: image.managed_policies.clone(),
            },
        )?;

        let schedule = image.schedule.as_deref().map(Schedule::parse).transpose()?;
        let condition = config.effective_trigger_condition();
        if condition.needs_schedule() && schedule.is_none() {
            return Err(UepsError::InvalidSchedule {
                expression: String::new(),
                reason: format!("trigger condition {condition} requires a schedule"),
            });
        }

        let network = NetworkStack {
            name: config.network.stack_name.clone(),
            cidr: config.network.cidr.clone(),
            max_azs: config.network.max_azs,
            depends_on: config.network.depends_on.clone(),
        };
        let builder = ImageBuilderStack {
            name: image.stack_name.clone(),
            network_stack: network.name.clone(),
            depends_on: image.depends_on.clone(),
            components: components.clone(),
            recipe: recipe.clone(),
            infrastructure: infrastructure.clone(),
            pipeline_name: image.pipeline_name.clone(),
            schedule: schedule.clone(),
            condition,
        };
        // The definition is derived from the graph, so the pipeline stack
        // joins the graph with an empty one first.
        let pending = PipelineDefinition {
            name: config.pipeline.name.clone(),
            self_stack: config.pipeline.stack_name.clone(),
            restart_on_update: config.pipeline.restart_on_update,
            stages: Vec::new(),
        };
        let mut stacks = vec![
            Stack::Network(network),
            Stack::ImageBuilder(builder),
            Stack::ReleasePipeline(Self::pipeline_stack(config, pending)),
        ];

        let graph = build_graph(&stacks)?;
        if graph.len() != stacks.len() {
            return Err(UepsError::InvalidPipeline(
                "stack names must be unique".to_string(),
            ));
        }
        graph.validate()?;

        let definition = Self::release_definition(config, &graph)?;
        if let Some(Stack::ReleasePipeline(pipeline)) = stacks.last_mut() {
            pipeline.definition = definition.clone();
        }

        info!(
            stacks = stacks.len(),
            recipe = %recipe.name,
            recipe_version = %recipe.version,
            pipeline = %definition.name,
            "release assembled"
        );

        Ok(Assembly {
            scope,
            stacks,
            graph,
            definition,
            image_pipeline: ImagePipelineBinding {
                name: image.pipeline_name.clone(),
                components,
                recipe,
                infrastructure,
                schedule,
                condition,
            },
        })
    }

    /// Assemble and write every output, or nothing.
    pub fn synthesize(
        config: &ReleaseConfig,
        bundle: &SourceBundle,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        Self::assemble(config, bundle)?.synthesize(out_dir)
    }

    /// Default three-stage release pipeline: fetch the source, synthesize
    /// every template and redeploy the pipeline's own stack, then deploy the
    /// dependent stacks one topological level per run order.
    pub fn release_definition(
        config: &ReleaseConfig,
        graph: &StackGraph,
    ) -> Result<PipelineDefinition> {
        let self_stack = config.pipeline.stack_name.as_str();
        if !graph.contains(self_stack) {
            return Err(UepsError::UnknownStack(self_stack.to_string()));
        }
        if let Some(dependency) = graph.dependencies_of(self_stack)?.first() {
            return Err(UepsError::InvalidPipeline(format!(
                "{self_stack} deploys before every other stack and cannot depend on {dependency}"
            )));
        }

        let order = graph.topological_order()?;
        let templates: Vec<String> = order.iter().map(|s| template_artifact_name(s)).collect();

        let mut stages = vec![
            StageDef::new(
                SOURCE_STAGE,
                vec![ActionDef::source(SOURCE_ACTION, SOURCE_ARTIFACT)],
            ),
            StageDef::new(
                ADMINISTER_STAGE,
                vec![
                    ActionDef::build(BUILD_ACTION, 1, SOURCE_ARTIFACT, templates),
                    ActionDef::deploy(ADMINISTER_ACTION, 2, self_stack),
                ],
            ),
        ];

        let levels: Vec<Vec<String>> = graph
            .levels()?
            .into_iter()
            .map(|level| level.into_iter().filter(|s| s != self_stack).collect::<Vec<_>>())
            .filter(|level| !level.is_empty())
            .collect();
        let mut deploys = Vec::new();
        for (idx, level) in levels.iter().enumerate() {
            for stack in level {
                deploys.push(ActionDef::deploy(format!("Deploy{stack}"), idx as u32 + 1, stack));
            }
        }
        if !deploys.is_empty() {
            stages.push(StageDef::new(DEPLOY_STAGE, deploys));
        }

        let definition = PipelineDefinition {
            name: config.pipeline.name.clone(),
            self_stack: self_stack.to_string(),
            restart_on_update: config.pipeline.restart_on_update,
            stages,
        };
        definition.validate()?;
        Ok(definition)
    }

    fn pipeline_stack(config: &ReleaseConfig, definition: PipelineDefinition) -> ReleasePipelineStack {
        let pipeline = &config.pipeline;
        ReleasePipelineStack {
            name: pipeline.stack_name.clone(),
            definition,
            artifact_bucket: pipeline.artifact_bucket.clone(),
            source: SourceRepository {
                owner: pipeline.source_owner.clone(),
                repo: pipeline.source_repo.clone(),
                branch: pipeline.source_branch.clone(),
            },
            depends_on: pipeline.depends_on.clone(),
        }
    }

    /// Publish every configured component into `registry`, returning them in
    /// recipe order.
    fn publish_components(
        config: &ReleaseConfig,
        bundle: &SourceBundle,
        platform: Platform,
        mut registry: ComponentRegistry,
    ) -> Result<(ComponentRegistry, Vec<Component>)> {
        let image = &config.image;
        let mut components = Vec::with_capacity(image.components.len());

        for entry in &image.components {
            let component = match (&entry.managed, &entry.document) {
                (Some(managed), _) => registry.register_managed(
                    &entry.name,
                    platform,
                    entry.version.as_deref().unwrap_or(DEFAULT_MANAGED_VERSION),
                    managed,
                )?,
                (None, Some(path)) => registry.register_document(
                    &entry.name,
                    platform,
                    entry.version.as_deref().unwrap_or(&image.component_version),
                    bundle.document(path)?,
                )?,
                (None, None) => {
                    return Err(UepsError::Config(format!(
                        "component {} needs either a document or a managed name",
                        entry.name
                    )))
                }
            };
            components.push(component);
        }
        Ok((registry, components))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "name: x\nschemaVersion: 1.0\nphases:\n  - name: build\n    steps:\n      - name: Run\n        action: ExecutePowerShell\n        inputs:\n          commands: [\"echo\"]\n";

    fn bundle(config: &str) -> SourceBundle {
        let mut bundle = SourceBundle::with_config("rev1", config);
        for name in ["firewall_rules", "nodejs", "nvidia", "nice_dcv"] {
            bundle = bundle.with_file(format!("resources/install_{name}.yml"), DOC);
        }
        bundle
    }

    fn assemble(config: &str) -> Result<Assembly> {
        let bundle = bundle(config);
        ReleaseCoordinator::assemble(&bundle.config()?, &bundle)
    }

    #[test]
    fn test_default_definition_shape() {
        let assembly = assemble("").unwrap();
        let def = &assembly.definition;
        let stages: Vec<&str> = def.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(stages, vec![SOURCE_STAGE, ADMINISTER_STAGE, DEPLOY_STAGE]);
        assert_eq!(def.self_stack, "UEPSPipelineStack");
        assert!(def.restart_on_update);

        let deploys: Vec<(&str, u32)> = def.stages[2]
            .actions
            .iter()
            .map(|a| (a.target_stack().unwrap(), a.run_order))
            .collect();
        assert_eq!(deploys, vec![("UEPSNetworkStack", 1), ("UEPSBuilderStack", 2)]);
        assert_eq!(def.stages[1].actions[0].outputs.len(), 3);
        assert_eq!(
            assembly.deploy_order().unwrap(),
            vec!["UEPSNetworkStack", "UEPSPipelineStack", "UEPSBuilderStack"]
        );
    }

    #[test]
    fn test_recipe_keeps_configured_order() {
        let assembly = assemble("").unwrap();
        let names: Vec<&str> = assembly
            .image_pipeline
            .recipe
            .components
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "dotnet-core-sdk",
                "cloudwatch-agent",
                "aws-cli",
                "chocolatey",
                "firewall-rules",
                "nodejs",
                "nvidia",
                "nice-dcv"
            ]
        );
        assert_eq!(
            assembly.image_pipeline.infrastructure.placement.subnet_id,
            "UEPSNetworkStack-SubnetId"
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = assemble("[network]\ndepends_on = [\"UEPSBuilderStack\"]\n").unwrap_err();
        assert!(matches!(err, UepsError::StackDependencyCycle { .. }));
        assert!(err.is_composition_error());
    }

    #[test]
    fn test_self_stack_dependency_rejected() {
        let err = assemble("[pipeline]\ndepends_on = [\"UEPSNetworkStack\"]\n").unwrap_err();
        assert!(matches!(err, UepsError::InvalidPipeline(ref m) if m.contains("UEPSPipelineStack")));
    }

    #[test]
    fn test_missing_document_names_component_path() {
        let source = SourceBundle::with_config("rev1", "");
        let err = ReleaseCoordinator::assemble(&source.config().unwrap(), &source).unwrap_err();
        assert!(err.to_string().contains("install_firewall_rules.yml"));
    }

    #[test]
    fn test_dependency_condition_requires_schedule() {
        let err = assemble("[image]\ntrigger_condition = \"schedule_match_and_dependency_updated\"\n")
            .unwrap_err();
        assert!(matches!(err, UepsError::InvalidSchedule { .. }));
    }

    fn catalog_of(assembly: &Assembly) -> PublishedCatalog {
        PublishedCatalog {
            components: assembly.image_pipeline.components.clone(),
            recipes: vec![assembly.image_pipeline.recipe.clone()],
        }
    }

    #[test]
    fn test_unchanged_release_matches_published_catalog() {
        let first = assemble("").unwrap();
        let bundle = bundle("");
        let again =
            ReleaseCoordinator::assemble_with(&bundle.config().unwrap(), &bundle, &catalog_of(&first))
                .unwrap();
        assert_eq!(again.image_pipeline.recipe, first.image_pipeline.recipe);
    }

    #[test]
    fn test_changed_document_under_published_version_conflicts() {
        let catalog = catalog_of(&assemble("").unwrap());
        let changed = bundle("").with_file(
            "resources/install_firewall_rules.yml",
            DOC.replace("echo", "echo 443"),
        );
        let err = ReleaseCoordinator::assemble_with(&changed.config().unwrap(), &changed, &catalog)
            .unwrap_err();
        assert!(matches!(
            err,
            UepsError::DuplicateVersionConflict { ref name, ref version }
                if name == "firewall-rules" && version == "0.0.5"
        ));
    }

    #[test]
    fn test_component_bump_without_recipe_bump_conflicts() {
        let catalog = catalog_of(&assemble("").unwrap());
        let bumped = bundle("[image]\ncomponent_version = \"0.0.6\"\n");
        let err = ReleaseCoordinator::assemble_with(&bumped.config().unwrap(), &bumped, &catalog)
            .unwrap_err();
        assert!(matches!(err, UepsError::VersionConflict { ref version, .. } if version == "1.0.5"));

        let both = bundle("[image]\ncomponent_version = \"0.0.6\"\nrecipe_version = \"1.0.6\"\n");
        ReleaseCoordinator::assemble_with(&both.config().unwrap(), &both, &catalog).unwrap();
    }

    #[test]
    fn test_synthesize_writes_templates_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let assembly = assemble("").unwrap();
        let written = assembly.synthesize(dir.path()).unwrap();
        assert_eq!(written.len(), 4);
        for stack in ["UEPSNetworkStack", "UEPSBuilderStack", "UEPSPipelineStack"] {
            assert!(dir.path().join(template_artifact_name(stack)).exists());
        }
        let manifest: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest["stacks"].as_array().unwrap().len(), 3);
        assert_eq!(manifest["deploy_order"][0], "UEPSNetworkStack");

        // Rendering is deterministic.
        assert_eq!(assembly.render().unwrap(), assemble("").unwrap().render().unwrap());
    }
}
