//! UEPS - release pipeline CLI
//!
//! The `ueps` command synthesizes the stack templates, runs the release
//! pipeline against a local provisioner and drives the image pipeline.
//!
//! ## Commands
//!
//! - `synth`: write every stack template and the manifest to an output dir
//! - `plan`: print the deploy order and the release pipeline definition
//! - `release`: handle one source trigger end to end
//! - `runs`: list recorded release runs, or the events of one run
//! - `image`: build, tick or watch the image pipeline

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use semver::Version;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, Level};

use ueps_core::image_pipeline::run_schedule;
use ueps_core::stack::definition_from_template;
use ueps_core::{
    DryRunImageBuilder, ImagePipelineController, LocalProvisioner, PipelineDefinition,
    StaticBaseImageResolver, TickOutcome,
};
use ueps_release::{
    release_handler, Acknowledgement, ActionStatus, Assembly, DirectorySource, PublishedCatalog,
    ReleaseCoordinator, SourceBundle, Trigger, TriggerOutcome,
};
use ueps_state::{
    PublishedStore, RunId, RunLedger, SnapshotStore, SurrealPublishedStore, SurrealRunLedger,
    SurrealSnapshotStore,
};

/// Revision label for bundles read straight from a working tree.
const WORKING_TREE: &str = "working-tree";

#[derive(Parser)]
#[command(name = "ueps")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "UEPS release pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct SourceArgs {
    /// Source tree root
    #[arg(long, default_value = ".")]
    source: PathBuf,

    /// Configuration file, relative to the source root
    #[arg(long, default_value = ueps_release::source::CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Write every stack template and the manifest
    Synth {
        #[command(flatten)]
        source: SourceArgs,

        /// Output directory
        #[arg(short, long, default_value = "cdk.out")]
        out: PathBuf,

        /// Local database directory, used when no SurrealDB env is set
        #[arg(long, env = "UEPS_DB_DIR", default_value = ".ueps/db")]
        db_dir: PathBuf,
    },

    /// Print the deploy order and the release pipeline stages
    Plan {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Run the release pipeline for one source revision
    Release {
        #[command(flatten)]
        source: SourceArgs,

        /// Source revision (commit id) the trigger points at
        #[arg(long)]
        revision: String,

        /// Git ref; defaults to the configured source branch
        #[arg(long = "ref")]
        git_ref: Option<String>,

        /// Directory holding applied stack state
        #[arg(long, default_value = ".ueps/state")]
        state_dir: PathBuf,

        /// Local database directory, used when no SurrealDB env is set
        #[arg(long, env = "UEPS_DB_DIR", default_value = ".ueps/db")]
        db_dir: PathBuf,
    },

    /// List release runs, or show the events of one run
    Runs {
        /// Run id to show events for
        run: Option<String>,

        /// Maximum number of runs to list
        #[arg(short, long, default_value = "10")]
        limit: usize,

        #[arg(long, env = "UEPS_DB_DIR", default_value = ".ueps/db")]
        db_dir: PathBuf,
    },

    /// Drive the image pipeline
    Image {
        #[command(subcommand)]
        action: ImageAction,
    },
}

#[derive(clap::Args, Clone)]
struct ImageArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Latest published version of the base image
    #[arg(long, default_value = "1.0.0")]
    base_version: Version,

    #[arg(long, env = "UEPS_DB_DIR", default_value = ".ueps/db")]
    db_dir: PathBuf,
}

#[derive(Subcommand)]
enum ImageAction {
    /// Build now, ignoring the trigger condition
    Build {
        #[command(flatten)]
        args: ImageArgs,
    },

    /// Evaluate the trigger condition once and build if it is met
    Tick {
        #[command(flatten)]
        args: ImageArgs,

        /// Tick time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// Tick on every schedule match until interrupted
    Watch {
        #[command(flatten)]
        args: ImageArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    ueps_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Synth {
            source,
            out,
            db_dir,
        } => {
            let published = open_published(&db_dir).await?;
            cmd_synth(published.as_ref(), &source, &out).await.map(|_| ())
        }
        Commands::Plan { source } => cmd_plan(&source),
        Commands::Release {
            source,
            revision,
            git_ref,
            state_dir,
            db_dir,
        } => {
            let (ledger, published) = open_release_stores(&db_dir).await?;
            let outcome = cmd_release(
                ledger,
                published,
                &source,
                &revision,
                git_ref.as_deref(),
                &state_dir,
            )
            .await?;
            if !outcome.is_success() {
                bail!("release of {revision} failed");
            }
            Ok(())
        }
        Commands::Runs { run, limit, db_dir } => {
            let ledger = open_ledger(&db_dir).await?;
            cmd_runs(ledger.as_ref(), run.as_deref(), limit).await
        }
        Commands::Image { action } => match action {
            ImageAction::Build { args } => {
                let snapshots = open_snapshots(&args.db_dir).await?;
                cmd_image_build(snapshots, &args.source, &args.base_version).await
            }
            ImageAction::Tick { args, at } => {
                let at = match at {
                    Some(text) => parse_time(&text)?,
                    None => Utc::now(),
                };
                let snapshots = open_snapshots(&args.db_dir).await?;
                cmd_image_tick(snapshots, &args.source, &args.base_version, at)
                    .await
                    .map(|_| ())
            }
            ImageAction::Watch { args } => {
                let snapshots = open_snapshots(&args.db_dir).await?;
                cmd_image_watch(snapshots, &args.source, &args.base_version).await
            }
        },
    }
}

async fn open_ledger(db_dir: &Path) -> Result<Arc<dyn RunLedger>> {
    let ledger = SurrealRunLedger::from_env(&db_dir.to_string_lossy())
        .await
        .context("Failed to connect to the run ledger")?;
    Ok(Arc::new(ledger))
}

async fn open_published(db_dir: &Path) -> Result<Arc<dyn PublishedStore>> {
    let store = SurrealPublishedStore::from_env(&db_dir.to_string_lossy())
        .await
        .context("Failed to connect to the published version store")?;
    Ok(Arc::new(store))
}

/// Ledger and published versions over one connection.
async fn open_release_stores(
    db_dir: &Path,
) -> Result<(Arc<dyn RunLedger>, Arc<dyn PublishedStore>)> {
    let db = ueps_state::connect_from_env(&db_dir.to_string_lossy())
        .await
        .context("Failed to connect to the release database")?;
    Ok((
        Arc::new(SurrealRunLedger::new(db.clone())),
        Arc::new(SurrealPublishedStore::new(db)),
    ))
}

async fn open_snapshots(db_dir: &Path) -> Result<Arc<dyn SnapshotStore>> {
    let store = SurrealSnapshotStore::from_env(&db_dir.to_string_lossy())
        .await
        .context("Failed to connect to the snapshot store")?;
    Ok(Arc::new(store))
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("invalid RFC 3339 time: {text}"))?
        .with_timezone(&Utc))
}

fn read_working_tree(args: &SourceArgs) -> Result<SourceBundle> {
    SourceBundle::from_dir(&args.source, &args.config, WORKING_TREE)
        .with_context(|| format!("Failed to read source at {}", args.source.display()))
}

fn load_assembly(args: &SourceArgs) -> Result<Assembly> {
    let bundle = read_working_tree(args)?;
    let config = bundle.config()?;
    Ok(ReleaseCoordinator::assemble(&config, &bundle)?)
}

/// Synthesize the working tree, checked against released versions. Nothing
/// is recorded; releases record what they publish.
async fn cmd_synth(
    published: &dyn PublishedStore,
    args: &SourceArgs,
    out: &Path,
) -> Result<Vec<PathBuf>> {
    let bundle = read_working_tree(args)?;
    let config = bundle.config()?;
    let catalog = PublishedCatalog::load(published).await?;
    let assembly = ReleaseCoordinator::assemble_with(&config, &bundle, &catalog)?;
    let written = assembly
        .synthesize(out)
        .with_context(|| format!("Failed to synthesize into {}", out.display()))?;
    for path in &written {
        println!("  {}", path.display());
    }
    println!("Synthesized {} files into {}", written.len(), out.display());
    Ok(written)
}

fn cmd_plan(args: &SourceArgs) -> Result<()> {
    let assembly = load_assembly(args)?;
    let definition = &assembly.definition;

    println!("Region:  {}", assembly.scope.region);
    println!("Account: {}", assembly.scope.account);
    println!();
    println!("Deploy order:");
    for (i, name) in assembly.deploy_order()?.iter().enumerate() {
        let deps = assembly.graph.dependencies_of(name)?;
        if deps.is_empty() {
            println!("  {}. {name}", i + 1);
        } else {
            println!("  {}. {name} (after {})", i + 1, deps.join(", "));
        }
    }
    println!();
    println!(
        "Pipeline {} ({}, restart on update: {})",
        definition.name,
        definition.digest()?.short(),
        definition.restart_on_update
    );
    for stage in &definition.stages {
        println!("  {}", stage.name);
        for (order, actions) in stage.run_order_groups() {
            let names: Vec<&str> = actions.iter().map(|a| a.name.as_str()).collect();
            println!("    [{order}] {}", names.join(", "));
        }
    }
    Ok(())
}

/// Definition the deployed pipeline stack carries, or the freshly assembled
/// one on first release.
async fn deployed_definition(
    provisioner: &LocalProvisioner,
    assembly: &Assembly,
    self_stack: &str,
) -> Result<PipelineDefinition> {
    if let Some(state) = provisioner.deployed(self_stack).await? {
        if let Some(definition) = definition_from_template(&state.template)? {
            info!(stack = %self_stack, pipeline = %definition.name, "using deployed definition");
            return Ok(definition);
        }
    }
    Ok(assembly.definition.clone())
}

async fn cmd_release(
    ledger: Arc<dyn RunLedger>,
    published: Arc<dyn PublishedStore>,
    args: &SourceArgs,
    revision: &str,
    git_ref: Option<&str>,
    state_dir: &Path,
) -> Result<TriggerOutcome> {
    let bundle = SourceBundle::from_dir(&args.source, &args.config, revision)
        .with_context(|| format!("Failed to read source at {}", args.source.display()))?;
    let config = bundle.config()?;
    let assembly = ReleaseCoordinator::assemble(&config, &bundle)?;

    let provisioner = LocalProvisioner::new(state_dir);
    let definition =
        deployed_definition(&provisioner, &assembly, &config.pipeline.stack_name).await?;

    let trigger = Trigger::new(
        format!("{}/{}", config.pipeline.source_owner, config.pipeline.source_repo),
        git_ref
            .map(str::to_string)
            .unwrap_or_else(|| format!("refs/heads/{}", config.pipeline.source_branch)),
        revision,
    );

    let source = DirectorySource::new(&args.source).with_config_file(&args.config);
    let handler = release_handler(
        Arc::new(source),
        Arc::new(provisioner),
        ledger,
        published,
        definition,
    );
    let outcome = handler.handle(&trigger).await?;
    print_outcome(&outcome);
    Ok(outcome)
}

fn print_outcome(outcome: &TriggerOutcome) {
    match outcome {
        TriggerOutcome::Acknowledged(Acknowledgement::AlreadyReleased(run_id)) => {
            println!("Already released by run {run_id}");
        }
        TriggerOutcome::Acknowledged(Acknowledgement::InFlight) => {
            println!("A release for this revision is already running");
        }
        TriggerOutcome::Completed { runs } => {
            for run in runs {
                let verdict = if run.success { "succeeded" } else { "failed" };
                println!(
                    "Run {} of {} {verdict} in {}ms",
                    run.run_id, run.pipeline, run.duration_ms
                );
                for stage in &run.stages {
                    println!("  {}", stage.name);
                    for action in &stage.actions {
                        let status = match &action.status {
                            ActionStatus::Succeeded => "ok".to_string(),
                            ActionStatus::Failed { reason } => format!("failed: {reason}"),
                            ActionStatus::Rejected { reason } => format!("rejected: {reason}"),
                            ActionStatus::Discarded => "discarded".to_string(),
                            ActionStatus::Skipped => "skipped".to_string(),
                        };
                        println!("    [{}] {} {status}", action.run_order, action.name);
                    }
                }
                for deploy in run.deploys() {
                    println!(
                        "  {} {:?} ({} resources)",
                        deploy.stack,
                        deploy.status,
                        deploy.resources.len()
                    );
                }
                if run.updated_definition.is_some() {
                    println!("  pipeline definition updated");
                }
                if let Some(err) = &run.error {
                    println!("  error: {err}");
                }
            }
        }
    }
}

async fn cmd_runs(ledger: &dyn RunLedger, run: Option<&str>, limit: usize) -> Result<()> {
    if let Some(run_id) = run {
        let run_id = RunId(run_id.to_string());
        let record = ledger.get_run(&run_id).await?;
        println!(
            "Run {} [{}] {}",
            record.run_id,
            record.status.as_str(),
            record.metadata.pipeline_name
        );
        for event in ledger.get_events(&run_id).await? {
            println!("  {:>3} {:<20} {}", event.seq, event.kind, event.payload);
        }
        return Ok(());
    }

    let runs = ledger.list_runs(None).await?;
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for record in runs.iter().rev().take(limit) {
        println!(
            "{} {:<10} {} {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.status.as_str(),
            record.run_id,
            record.metadata.revision.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

/// Controller with the assembly's image pipeline bound; the base image's
/// latest version is `base_version`.
fn image_controller(
    assembly: &Assembly,
    snapshots: Arc<dyn SnapshotStore>,
    base_version: &Version,
) -> Result<(Arc<ImagePipelineController>, String)> {
    let resolver = StaticBaseImageResolver::new();
    resolver.publish(
        &assembly.image_pipeline.recipe.base_image.name,
        base_version.clone(),
    );
    let controller = ImagePipelineController::new(
        assembly.scope.clone(),
        Arc::new(DryRunImageBuilder::new()),
        Arc::new(resolver),
        snapshots,
    );
    let pipeline = assembly.bind_image_pipeline(&controller)?;
    Ok((Arc::new(controller), pipeline.name))
}

async fn cmd_image_build(
    snapshots: Arc<dyn SnapshotStore>,
    args: &SourceArgs,
    base_version: &Version,
) -> Result<()> {
    let assembly = load_assembly(args)?;
    let (controller, name) = image_controller(&assembly, snapshots, base_version)?;
    let result = controller.execute(&name).await?;
    println!("Built {} for {}", result.image_id, result.pipeline);
    for (dependency, version) in &result.dependencies {
        println!("  {dependency} {version}");
    }
    Ok(())
}

async fn cmd_image_tick(
    snapshots: Arc<dyn SnapshotStore>,
    args: &SourceArgs,
    base_version: &Version,
    at: DateTime<Utc>,
) -> Result<TickOutcome> {
    let assembly = load_assembly(args)?;
    let (controller, name) = image_controller(&assembly, snapshots, base_version)?;
    let outcome = controller.tick(&name, at).await?;
    match &outcome {
        TickOutcome::Built(result) => println!("Built {} for {}", result.image_id, name),
        TickOutcome::Skipped(reason) => println!("Skipped {name}: {reason}"),
    }
    Ok(outcome)
}

async fn cmd_image_watch(
    snapshots: Arc<dyn SnapshotStore>,
    args: &SourceArgs,
    base_version: &Version,
) -> Result<()> {
    let assembly = load_assembly(args)?;
    let (controller, name) = image_controller(&assembly, snapshots, base_version)?;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
        }
        let _ = tx.send(true);
    });

    let builds = run_schedule(controller, &name, rx).await?;
    println!("Watched {name}: {builds} builds");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ueps_core::DeployStatus;
    use ueps_state::fakes::{MemoryPublishedStore, MemoryRunLedger, MemorySnapshotStore};
    use ueps_state::RunStatus;

    const DOC: &str = r#"
name: Install
schemaVersion: 1.0
phases:
  - name: build
    steps:
      - name: Run
        action: ExecutePowerShell
        inputs:
          commands: ["Write-Host install"]
"#;

    fn source_tree(config: &str) -> (tempfile::TempDir, SourceArgs) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ueps.toml"), config).unwrap();
        std::fs::create_dir_all(dir.path().join("resources")).unwrap();
        for name in ["firewall_rules", "nodejs", "nvidia", "nice_dcv"] {
            std::fs::write(
                dir.path().join(format!("resources/install_{name}.yml")),
                DOC,
            )
            .unwrap();
        }
        let args = SourceArgs {
            source: dir.path().to_path_buf(),
            config: PathBuf::from("ueps.toml"),
        };
        (dir, args)
    }

    #[test]
    fn test_cli_parses_release_flags() {
        let cli = Cli::try_parse_from([
            "ueps", "--json", "release", "--revision", "abc", "--ref", "refs/heads/dev",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Release {
                revision, git_ref, ..
            } => {
                assert_eq!(revision, "abc");
                assert_eq!(git_ref.as_deref(), Some("refs/heads/dev"));
            }
            _ => panic!("expected release"),
        }
    }

    #[tokio::test]
    async fn test_cmd_synth_writes_templates_and_manifest() {
        let (dir, args) = source_tree("");
        let out = dir.path().join("cdk.out");
        let written = cmd_synth(&MemoryPublishedStore::new(), &args, &out)
            .await
            .unwrap();
        assert_eq!(written.len(), 4);
        assert!(out.join("manifest.json").exists());
    }

    #[tokio::test]
    async fn test_cmd_synth_missing_document_fails() {
        let (dir, args) = source_tree("");
        std::fs::remove_file(dir.path().join("resources/install_nvidia.yml")).unwrap();
        let out = dir.path().join("cdk.out");
        assert!(cmd_synth(&MemoryPublishedStore::new(), &args, &out)
            .await
            .is_err());
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_cmd_synth_rejects_changed_released_component() {
        let (dir, args) = source_tree("");
        let state = dir.path().join("state");
        let published: Arc<dyn PublishedStore> = Arc::new(MemoryPublishedStore::new());
        let outcome = cmd_release(
            Arc::new(MemoryRunLedger::new()),
            published.clone(),
            &args,
            "rev1",
            None,
            &state,
        )
        .await
        .unwrap();
        assert!(outcome.is_success());

        std::fs::write(
            dir.path().join("resources/install_nvidia.yml"),
            DOC.replace("Write-Host install", "Write-Host driver 2"),
        )
        .unwrap();
        let out = dir.path().join("cdk.out");
        let err = cmd_synth(published.as_ref(), &args, &out).await.unwrap_err();
        assert!(err.to_string().contains("nvidia"), "{err}");
        assert!(!out.exists());
    }

    #[test]
    fn test_cmd_plan_succeeds() {
        let (_dir, args) = source_tree("");
        cmd_plan(&args).unwrap();
    }

    #[tokio::test]
    async fn test_cmd_release_then_duplicate() {
        let (dir, args) = source_tree("");
        let state = dir.path().join("state");
        let ledger: Arc<dyn RunLedger> = Arc::new(MemoryRunLedger::new());

        let published: Arc<dyn PublishedStore> = Arc::new(MemoryPublishedStore::new());

        let outcome = cmd_release(ledger.clone(), published.clone(), &args, "rev1", None, &state)
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.runs().len(), 1);
        let run = &outcome.runs()[0];
        assert_eq!(run.deploys().count(), 3);
        assert!(run.deploys().all(|d| d.status == DeployStatus::Applied));

        let again = cmd_release(ledger.clone(), published, &args, "rev1", None, &state)
            .await
            .unwrap();
        assert!(matches!(
            again,
            TriggerOutcome::Acknowledged(Acknowledgement::AlreadyReleased(_))
        ));

        let runs = ledger.list_runs(None).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        cmd_runs(ledger.as_ref(), None, 5).await.unwrap();
        cmd_runs(ledger.as_ref(), Some(runs[0].run_id.0.as_str()), 5)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cmd_release_uses_deployed_definition() {
        let (dir, args) = source_tree("");
        let state = dir.path().join("state");
        let ledger: Arc<dyn RunLedger> = Arc::new(MemoryRunLedger::new());
        let published: Arc<dyn PublishedStore> = Arc::new(MemoryPublishedStore::new());
        cmd_release(ledger.clone(), published.clone(), &args, "rev1", None, &state)
            .await
            .unwrap();

        // Rename the pipeline; the deployed definition still runs first.
        std::fs::write(
            dir.path().join("ueps.toml"),
            "[pipeline]\nname = \"UEPS-Release-Pipeline-v2\"\nrestart_on_update = false\n",
        )
        .unwrap();
        let outcome = cmd_release(ledger, published, &args, "rev2", None, &state)
            .await
            .unwrap();
        let run = &outcome.runs()[0];
        assert_eq!(run.pipeline, "UEPS-Release-Pipeline");
        assert_eq!(
            run.updated_definition.as_ref().map(|d| d.name.as_str()),
            Some("UEPS-Release-Pipeline-v2")
        );
    }

    #[tokio::test]
    async fn test_cmd_image_tick_skips_unchanged_dependencies() {
        let (_dir, args) = source_tree(
            "[image]\nschedule = \"0 9 * * 1\"\ntrigger_condition = \"schedule_match_and_dependency_updated\"\n",
        );
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let version = Version::new(1, 0, 0);
        // Monday 09:00 UTC
        let at = parse_time("2024-01-01T09:00:00Z").unwrap();

        let first = cmd_image_tick(snapshots.clone(), &args, &version, at)
            .await
            .unwrap();
        assert!(first.is_built());
        let second = cmd_image_tick(snapshots.clone(), &args, &version, at)
            .await
            .unwrap();
        assert!(!second.is_built());

        let newer = Version::new(1, 1, 0);
        let third = cmd_image_tick(snapshots, &args, &newer, at).await.unwrap();
        assert!(third.is_built());
    }

    #[tokio::test]
    async fn test_cmd_image_build_ignores_gate() {
        let (_dir, args) = source_tree("[image]\nschedule = \"0 0 1 1 *\"\n");
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        cmd_image_build(snapshots, &args, &Version::new(1, 0, 0))
            .await
            .unwrap();
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        assert!(parse_time("yesterday").is_err());
        assert_eq!(
            parse_time("2024-01-01T10:00:00+01:00").unwrap(),
            parse_time("2024-01-01T09:00:00Z").unwrap()
        );
    }
}
