//! Image Pipeline Controller.
//!
//! Binds a recipe and an infrastructure config into a named pipeline and
//! runs builds for it, either on demand (`execute`, never gated) or from a
//! schedule tick (`tick`, gated by the pipeline's trigger condition).
//!
//! Per pipeline: `Idle -> Running -> Succeeded | Failed -> Idle`. At most one
//! build per pipeline is in flight; a second request is rejected with
//! `AlreadyRunning`. The dependency snapshot is saved only after a
//! successful build.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use ueps_state::{ContentDigest, DependencySnapshot, SnapshotStore};

use super::gate::{evaluate_gate, updated_dependencies, GateDecision, SkipReason, TriggerCondition};
use super::schedule::Schedule;
use crate::config::AccountScope;
use crate::domain::error::{Result, UepsError};
use crate::inflight::InFlight;
use crate::infra::InfrastructureConfig;
use crate::obs;
use crate::recipe::{BaseImageRef, Recipe, VersionPin};

/// Identifier of a built machine image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the build tool needs for one build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildRequest {
    pub pipeline: String,
    pub recipe: Recipe,
    pub infrastructure: InfrastructureConfig,
    pub base_image_version: Version,
    /// Dependency name -> version, base image included.
    pub dependencies: BTreeMap<String, String>,
}

/// External image build tool.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> anyhow::Result<ImageId>;
}

/// Resolves a base image pin to a concrete version.
#[async_trait]
pub trait BaseImageResolver: Send + Sync {
    async fn resolve(&self, base: &BaseImageRef) -> anyhow::Result<Version>;
}

/// Builder that performs no work and returns an image id derived from the
/// request, so identical requests yield identical ids.
#[derive(Debug, Default)]
pub struct DryRunImageBuilder {
    builds: AtomicUsize,
}

impl DryRunImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of builds performed.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageBuilder for DryRunImageBuilder {
    async fn build(&self, request: &BuildRequest) -> anyhow::Result<ImageId> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_vec(&(&request.recipe, &request.dependencies))?;
        let digest = ContentDigest::from_bytes(&body);
        Ok(ImageId(format!("ami-{}", &digest.as_str()[..17])))
    }
}

/// Resolver over a fixed table of latest base image versions.
#[derive(Debug, Default)]
pub struct StaticBaseImageResolver {
    latest: Mutex<HashMap<String, Version>>,
}

impl StaticBaseImageResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `version` as the latest version of base image `name`.
    pub fn publish(&self, name: &str, version: Version) {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), version);
    }
}

#[async_trait]
impl BaseImageResolver for StaticBaseImageResolver {
    async fn resolve(&self, base: &BaseImageRef) -> anyhow::Result<Version> {
        match &base.pin {
            VersionPin::Exact(v) => Ok(v.clone()),
            VersionPin::Latest => self
                .latest
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&base.name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no published version of base image {}", base.name)),
        }
    }
}

/// A bound image pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub recipe: Recipe,
    pub infrastructure: InfrastructureConfig,
    pub schedule: Option<Schedule>,
    pub condition: TriggerCondition,
}

impl Pipeline {
    pub fn arn(&self, scope: &AccountScope) -> String {
        scope.arn(
            "imagebuilder",
            &format!("image-pipeline/{}", self.name.to_lowercase()),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub last_outcome: Option<BuildOutcome>,
}

/// Result of a successful build. Carries copies of the recipe and
/// infrastructure config it ran with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub pipeline: String,
    pub image_id: ImageId,
    pub recipe: Recipe,
    pub infrastructure: InfrastructureConfig,
    pub dependencies: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Outcome of a schedule tick.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Built(BuildResult),
    /// The gate was not met; a successful no-op.
    Skipped(SkipReason),
}

impl TickOutcome {
    pub fn is_built(&self) -> bool {
        matches!(self, TickOutcome::Built(_))
    }
}

struct PipelineEntry {
    pipeline: Pipeline,
    status: PipelineStatus,
}

pub struct ImagePipelineController {
    scope: AccountScope,
    builder: Arc<dyn ImageBuilder>,
    resolver: Arc<dyn BaseImageResolver>,
    snapshots: Arc<dyn SnapshotStore>,
    pipelines: Mutex<HashMap<String, PipelineEntry>>,
    inflight: InFlight,
}

impl ImagePipelineController {
    pub fn new(
        scope: AccountScope,
        builder: Arc<dyn ImageBuilder>,
        resolver: Arc<dyn BaseImageResolver>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            scope,
            builder,
            resolver,
            snapshots,
            pipelines: Mutex::new(HashMap::new()),
            inflight: InFlight::new(),
        }
    }

    pub fn scope(&self) -> &AccountScope {
        &self.scope
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, PipelineEntry>> {
        self.pipelines.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind a recipe and infrastructure config into a new pipeline.
    ///
    /// With a schedule and no condition the pipeline gates on schedule match
    /// only; without a schedule it defaults to `Always`. Conditions that
    /// consult the schedule require one.
    #[instrument(skip(self, recipe, infrastructure, schedule))]
    pub fn bind(
        &self,
        name: &str,
        recipe: Recipe,
        infrastructure: InfrastructureConfig,
        schedule: Option<Schedule>,
        condition: Option<TriggerCondition>,
    ) -> Result<Pipeline> {
        infrastructure.validate()?;
        let condition = match (condition, &schedule) {
            (Some(c), _) => c,
            (None, Some(_)) => TriggerCondition::ScheduleMatchOnly,
            (None, None) => TriggerCondition::Always,
        };
        if condition.needs_schedule() && schedule.is_none() {
            return Err(UepsError::InvalidSchedule {
                expression: String::new(),
                reason: format!("trigger condition {condition} requires a schedule"),
            });
        }

        let pipeline = Pipeline {
            name: name.to_string(),
            recipe,
            infrastructure,
            schedule,
            condition,
        };

        let mut entries = self.entries();
        if entries.contains_key(name) {
            return Err(UepsError::InvalidPipeline(format!(
                "image pipeline {name} is already bound"
            )));
        }
        info!(
            pipeline = %name,
            recipe = %pipeline.recipe.name,
            recipe_version = %pipeline.recipe.version,
            condition = %condition,
            "image pipeline bound"
        );
        entries.insert(
            name.to_string(),
            PipelineEntry {
                pipeline: pipeline.clone(),
                status: PipelineStatus {
                    state: PipelineState::Idle,
                    last_outcome: None,
                },
            },
        );
        Ok(pipeline)
    }

    /// Replace the recipe and infrastructure config of a bound pipeline.
    /// A build already in flight keeps the values it started with.
    pub fn rebind(
        &self,
        name: &str,
        recipe: Recipe,
        infrastructure: InfrastructureConfig,
    ) -> Result<Pipeline> {
        infrastructure.validate()?;
        let mut entries = self.entries();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| UepsError::UnknownPipeline(name.to_string()))?;
        entry.pipeline.recipe = recipe;
        entry.pipeline.infrastructure = infrastructure;
        info!(pipeline = %name, recipe_version = %entry.pipeline.recipe.version, "image pipeline rebound");
        Ok(entry.pipeline.clone())
    }

    pub fn pipeline(&self, name: &str) -> Result<Pipeline> {
        self.entries()
            .get(name)
            .map(|e| e.pipeline.clone())
            .ok_or_else(|| UepsError::UnknownPipeline(name.to_string()))
    }

    pub fn state(&self, name: &str) -> Result<PipelineStatus> {
        self.entries()
            .get(name)
            .map(|e| e.status)
            .ok_or_else(|| UepsError::UnknownPipeline(name.to_string()))
    }

    fn set_status(&self, name: &str, state: PipelineState, outcome: Option<BuildOutcome>) {
        if let Some(entry) = self.entries().get_mut(name) {
            entry.status.state = state;
            if outcome.is_some() {
                entry.status.last_outcome = outcome;
            }
        }
    }

    /// Current dependency versions: the resolved base image and every
    /// recipe component.
    async fn current_dependencies(
        &self,
        pipeline: &Pipeline,
    ) -> Result<(Version, BTreeMap<String, String>)> {
        let base = &pipeline.recipe.base_image;
        let base_version = self
            .resolver
            .resolve(base)
            .await
            .map_err(|e| UepsError::Build {
                pipeline: pipeline.name.clone(),
                reason: format!("resolving base image {}: {e:#}", base.name),
            })?;

        let mut deps = BTreeMap::new();
        deps.insert(base.name.clone(), base_version.to_string());
        for component in &pipeline.recipe.components {
            deps.insert(component.name.clone(), component.version.to_string());
        }
        Ok((base_version, deps))
    }

    /// Run a build now, bypassing the trigger gate.
    pub async fn execute(&self, name: &str) -> Result<BuildResult> {
        let pipeline = self.pipeline(name)?;
        self.run_build(pipeline, None).await
    }

    /// Evaluate the trigger gate for a schedule tick at `now` and build if
    /// it is met.
    #[instrument(skip(self), fields(now = %now))]
    pub async fn tick(&self, name: &str, now: DateTime<Utc>) -> Result<TickOutcome> {
        let pipeline = self.pipeline(name)?;
        let (base_version, current) = self.current_dependencies(&pipeline).await?;
        let previous = self.snapshots.load(name).await?;

        let decision = evaluate_gate(
            pipeline.condition,
            pipeline.schedule.as_ref(),
            now,
            previous.as_ref(),
            &current,
        );
        let updated = updated_dependencies(previous.as_ref(), &current);

        match decision {
            GateDecision::Skip(reason) => {
                obs::emit_gate_evaluated(name, pipeline.condition.as_str(), false, &reason.to_string());
                Ok(TickOutcome::Skipped(reason))
            }
            GateDecision::Run => {
                let why = if updated.is_empty() {
                    "gate met".to_string()
                } else {
                    format!("updated: {}", updated.join(","))
                };
                obs::emit_gate_evaluated(name, pipeline.condition.as_str(), true, &why);
                let result = self
                    .run_build(pipeline, Some((base_version, current)))
                    .await?;
                Ok(TickOutcome::Built(result))
            }
        }
    }

    async fn run_build(
        &self,
        pipeline: Pipeline,
        resolved: Option<(Version, BTreeMap<String, String>)>,
    ) -> Result<BuildResult> {
        let _guard = self.inflight.try_acquire(&pipeline.name)?;
        self.set_status(&pipeline.name, PipelineState::Running, None);

        let started_at = Utc::now();
        let started = Instant::now();
        obs::emit_build_started(&pipeline.name, &pipeline.recipe.name, &pipeline.recipe.version.to_string());

        let outcome = self.build_once(&pipeline, resolved).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((image_id, dependencies)) => {
                obs::emit_build_finished(&pipeline.name, Some(&image_id.0), duration_ms, true);
                self.set_status(&pipeline.name, PipelineState::Idle, Some(BuildOutcome::Succeeded));
                Ok(BuildResult {
                    pipeline: pipeline.name,
                    image_id,
                    recipe: pipeline.recipe,
                    infrastructure: pipeline.infrastructure,
                    dependencies,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            Err(err) => {
                warn!(pipeline = %pipeline.name, error = %err, "image build failed");
                obs::emit_build_finished(&pipeline.name, None, duration_ms, false);
                self.set_status(&pipeline.name, PipelineState::Idle, Some(BuildOutcome::Failed));
                Err(err)
            }
        }
    }

    async fn build_once(
        &self,
        pipeline: &Pipeline,
        resolved: Option<(Version, BTreeMap<String, String>)>,
    ) -> Result<(ImageId, BTreeMap<String, String>)> {
        let (base_image_version, dependencies) = match resolved {
            Some(r) => r,
            None => self.current_dependencies(pipeline).await?,
        };

        let request = BuildRequest {
            pipeline: pipeline.name.clone(),
            recipe: pipeline.recipe.clone(),
            infrastructure: pipeline.infrastructure.clone(),
            base_image_version,
            dependencies,
        };

        let image_id = self
            .builder
            .build(&request)
            .await
            .map_err(|e| UepsError::Build {
                pipeline: pipeline.name.clone(),
                reason: format!("{e:#}"),
            })?;

        self.snapshots
            .save(
                &pipeline.name,
                DependencySnapshot::new(request.dependencies.clone()),
            )
            .await?;

        Ok((image_id, request.dependencies))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{Placement, SecurityPolicy};
    use crate::recipe::ComponentRef;
    use chrono::TimeZone;
    use ueps_state::fakes::MemorySnapshotStore;

    fn recipe(version: &str, nvidia: &str) -> Recipe {
        Recipe {
            name: "UEPSWindowsImageRecipe".to_string(),
            version: Version::parse(version).unwrap(),
            components: vec![ComponentRef::new("nvidia", nvidia).unwrap()],
            base_image: BaseImageRef::new("windows-server-2019-full-base", "x.x.x").unwrap(),
        }
    }

    fn infra() -> InfrastructureConfig {
        InfrastructureConfig::define(
            "infra",
            vec!["g4dn.xlarge".to_string()],
            Placement {
                subnet_id: "subnet-1".to_string(),
                security_group_ids: vec![],
            },
            "profile",
            SecurityPolicy {
                role_name: "role".to_string(),
                managed_policies: vec![],
            },
        )
        .unwrap()
    }

    struct Fixture {
        controller: ImagePipelineController,
        builder: Arc<DryRunImageBuilder>,
        resolver: Arc<StaticBaseImageResolver>,
        snapshots: Arc<MemorySnapshotStore>,
    }

    fn fixture() -> Fixture {
        let builder = Arc::new(DryRunImageBuilder::new());
        let resolver = Arc::new(StaticBaseImageResolver::new());
        resolver.publish("windows-server-2019-full-base", Version::new(2024, 1, 0));
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let controller = ImagePipelineController::new(
            AccountScope::new("us-east-1", "123456789012"),
            builder.clone(),
            resolver.clone(),
            snapshots.clone(),
        );
        Fixture {
            controller,
            builder,
            resolver,
            snapshots,
        }
    }

    fn monday_nine() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_bind_defaults_condition() {
        let f = fixture();
        let p = f
            .controller
            .bind("a", recipe("1.0.0", "0.0.5"), infra(), None, None)
            .unwrap();
        assert_eq!(p.condition, TriggerCondition::Always);

        let p = f
            .controller
            .bind("b", recipe("1.0.0", "0.0.5"), infra(), Some(Schedule::parse("0 9 * * 1").unwrap()), None)
            .unwrap();
        assert_eq!(p.condition, TriggerCondition::ScheduleMatchOnly);

        let err = f
            .controller
            .bind("c", recipe("1.0.0", "0.0.5"), infra(), None, Some(TriggerCondition::ScheduleMatchOnly))
            .unwrap_err();
        assert!(matches!(err, UepsError::InvalidSchedule { .. }));

        let err = f
            .controller
            .bind("a", recipe("1.0.0", "0.0.5"), infra(), None, None)
            .unwrap_err();
        assert!(matches!(err, UepsError::InvalidPipeline(_)));
    }

    #[tokio::test]
    async fn test_execute_records_snapshot_and_state() {
        let f = fixture();
        f.controller
            .bind("p", recipe("1.0.0", "0.0.5"), infra(), None, None)
            .unwrap();

        let result = f.controller.execute("p").await.unwrap();
        assert!(result.image_id.0.starts_with("ami-"));
        assert_eq!(result.dependencies["windows-server-2019-full-base"], "2024.1.0");
        assert_eq!(result.dependencies["nvidia"], "0.0.5");

        let status = f.controller.state("p").unwrap();
        assert_eq!(status.state, PipelineState::Idle);
        assert_eq!(status.last_outcome, Some(BuildOutcome::Succeeded));

        let snap = f.snapshots.load("p").await.unwrap().unwrap();
        assert_eq!(snap.versions, result.dependencies);
    }

    /// Holds every build for a while so a second request overlaps it.
    struct SlowBuilder;

    #[async_trait]
    impl ImageBuilder for SlowBuilder {
        async fn build(&self, _request: &BuildRequest) -> anyhow::Result<ImageId> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(ImageId("ami-slow".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_execute_is_rejected() {
        let resolver = Arc::new(StaticBaseImageResolver::new());
        resolver.publish("windows-server-2019-full-base", Version::new(2024, 1, 0));
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let c = ImagePipelineController::new(
            AccountScope::new("us-east-1", "123456789012"),
            Arc::new(SlowBuilder),
            resolver,
            snapshots.clone(),
        );
        c.bind("p", recipe("1.0.0", "0.0.5"), infra(), None, None)
            .unwrap();

        let (a, b) = tokio::join!(c.execute("p"), c.execute("p"));
        let (ok, rejected) = if a.is_ok() { (a, b) } else { (b, a) };
        assert_eq!(ok.unwrap().image_id.0, "ami-slow");
        assert!(matches!(
            rejected,
            Err(UepsError::AlreadyRunning { ref target }) if target == "p"
        ));

        // The rejected request leaves the winner's result in place.
        assert_eq!(c.state("p").unwrap().last_outcome, Some(BuildOutcome::Succeeded));
        assert!(snapshots.load("p").await.unwrap().is_some());

        // Once the first build is done the pipeline accepts work again.
        c.execute("p").await.unwrap();
    }

    #[tokio::test]
    async fn test_dependency_gated_tick() {
        let f = fixture();
        f.controller
            .bind(
                "p",
                recipe("1.0.0", "0.0.5"),
                infra(),
                Some(Schedule::parse("0 9 * * MON").unwrap()),
                Some(TriggerCondition::ScheduleMatchAndDependencyUpdated),
            )
            .unwrap();

        // No history: builds.
        assert!(f.controller.tick("p", monday_nine()).await.unwrap().is_built());
        // Unchanged: skipped.
        let outcome = f.controller.tick("p", monday_nine()).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Skipped(SkipReason::DependenciesUnchanged)));
        // Off schedule: skipped.
        let off = monday_nine() + chrono::Duration::hours(1);
        assert!(matches!(
            f.controller.tick("p", off).await.unwrap(),
            TickOutcome::Skipped(SkipReason::ScheduleNotMatched)
        ));
        // Newer base image: builds.
        f.resolver
            .publish("windows-server-2019-full-base", Version::new(2024, 2, 0));
        assert!(f.controller.tick("p", monday_nine()).await.unwrap().is_built());
        assert_eq!(f.builder.builds(), 2);
    }

    #[tokio::test]
    async fn test_rebind_takes_effect_next_build() {
        let f = fixture();
        f.controller
            .bind("p", recipe("1.0.0", "0.0.5"), infra(), None, None)
            .unwrap();
        let first = f.controller.execute("p").await.unwrap();

        let mut bigger = infra();
        bigger.compute_class = vec!["g4dn.2xlarge".to_string()];
        f.controller
            .rebind("p", recipe("1.0.1", "0.0.6"), bigger)
            .unwrap();

        // The completed build keeps what it ran with.
        assert_eq!(first.infrastructure.compute_class, vec!["g4dn.xlarge"]);
        let second = f.controller.execute("p").await.unwrap();
        assert_eq!(second.infrastructure.compute_class, vec!["g4dn.2xlarge"]);
        assert_eq!(second.dependencies["nvidia"], "0.0.6");
    }

    struct FailingBuilder;

    #[async_trait]
    impl ImageBuilder for FailingBuilder {
        async fn build(&self, _request: &BuildRequest) -> anyhow::Result<ImageId> {
            anyhow::bail!("instance failed to launch")
        }
    }

    #[tokio::test]
    async fn test_failed_build_keeps_previous_snapshot() {
        let resolver = Arc::new(StaticBaseImageResolver::new());
        resolver.publish("windows-server-2019-full-base", Version::new(2024, 1, 0));
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let controller = ImagePipelineController::new(
            AccountScope::new("us-east-1", "123456789012"),
            Arc::new(FailingBuilder),
            resolver,
            snapshots.clone(),
        );
        controller
            .bind("p", recipe("1.0.0", "0.0.5"), infra(), None, None)
            .unwrap();

        let err = controller.execute("p").await.unwrap_err();
        assert!(matches!(err, UepsError::Build { .. }));
        assert!(err.to_string().contains("instance failed to launch"));
        assert!(snapshots.load("p").await.unwrap().is_none());

        let status = controller.state("p").unwrap();
        assert_eq!(status.state, PipelineState::Idle);
        assert_eq!(status.last_outcome, Some(BuildOutcome::Failed));
    }

    #[tokio::test]
    async fn test_unknown_pipeline() {
        let f = fixture();
        assert!(matches!(
            f.controller.execute("missing").await,
            Err(UepsError::UnknownPipeline(_))
        ));
    }
}
