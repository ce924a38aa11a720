//! Schedule-driven ticker for a bound image pipeline.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::controller::{ImagePipelineController, TickOutcome};
use crate::domain::error::{Result, UepsError};

/// Tick `pipeline` at every matching minute of its schedule until
/// `shutdown` flips to true or its sender is dropped. Returns the number
/// of builds started.
///
/// Tick failures are logged and the loop keeps going; a failed build
/// leaves the snapshot untouched so the next matching tick retries.
pub async fn run_schedule(
    controller: Arc<ImagePipelineController>,
    pipeline: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64> {
    let schedule = controller
        .pipeline(pipeline)?
        .schedule
        .ok_or_else(|| UepsError::InvalidSchedule {
            expression: String::new(),
            reason: format!("image pipeline {pipeline} has no schedule"),
        })?;

    info!(pipeline = %pipeline, schedule = %schedule, "schedule ticker started");
    let mut builds = 0u64;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let now = Utc::now();
        let Some(next) = schedule.next_after(now) else {
            warn!(pipeline = %pipeline, "schedule has no future match");
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        debug!(pipeline = %pipeline, next = %next, "sleeping until next tick");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match controller.tick(pipeline, next).await {
            Ok(TickOutcome::Built(result)) => {
                builds += 1;
                info!(pipeline = %pipeline, image_id = %result.image_id, "scheduled build finished");
            }
            Ok(TickOutcome::Skipped(reason)) => {
                info!(pipeline = %pipeline, reason = %reason, "scheduled tick skipped");
            }
            Err(err) => {
                warn!(pipeline = %pipeline, error = %err, "scheduled tick failed");
            }
        }
    }

    info!(pipeline = %pipeline, builds, "schedule ticker stopped");
    Ok(builds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountScope;
    use crate::image_pipeline::{DryRunImageBuilder, Schedule, StaticBaseImageResolver};
    use crate::infra::{InfrastructureConfig, Placement, SecurityPolicy};
    use crate::recipe::{BaseImageRef, ComponentRef, Recipe};
    use semver::Version;
    use ueps_state::fakes::MemorySnapshotStore;

    fn controller() -> Arc<ImagePipelineController> {
        Arc::new(ImagePipelineController::new(
            AccountScope::new("us-east-1", "123456789012"),
            Arc::new(DryRunImageBuilder::new()),
            Arc::new(StaticBaseImageResolver::new()),
            Arc::new(MemorySnapshotStore::new()),
        ))
    }

    fn bind(controller: &ImagePipelineController, schedule: Option<Schedule>) {
        let recipe = Recipe {
            name: "r".to_string(),
            version: Version::new(1, 0, 0),
            components: vec![ComponentRef::new("nvidia", "0.0.5").unwrap()],
            base_image: BaseImageRef::new("base", "1.0.0").unwrap(),
        };
        let infra = InfrastructureConfig::define(
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
        .unwrap();
        controller.bind("p", recipe, infra, schedule, None).unwrap();
    }

    #[tokio::test]
    async fn test_requires_schedule() {
        let c = controller();
        bind(&c, None);
        let (_tx, rx) = watch::channel(false);
        let err = run_schedule(c, "p", rx).await.unwrap_err();
        assert!(matches!(err, UepsError::InvalidSchedule { .. }));
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let c = controller();
        bind(&c, Some(Schedule::parse("0 0 1 1 *").unwrap()));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let c = c.clone();
            async move { run_schedule(c, "p", rx).await }
        });
        tx.send(true).unwrap();
        let builds = handle.await.unwrap().unwrap();
        assert_eq!(builds, 0);
    }
}
