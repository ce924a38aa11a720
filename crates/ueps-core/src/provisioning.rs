//! Provisioning seam: applies rendered stack templates.
//!
//! [`LocalProvisioner`] keeps one state file per stack under a directory.
//! Re-applying a template whose digest matches the last applied one is
//! reported as `Unchanged` and touches nothing, which is what makes
//! duplicate deploys safe.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use ueps_state::ContentDigest;

use crate::domain::digest::to_canonical_json;
use crate::domain::error::{Result, UepsError};
use crate::obs;
use crate::stack::{ResourceSpec, Template};

/// Handle to a declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub stack: String,
    pub logical_id: String,
    pub resource_type: String,
    pub physical_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Applied,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResult {
    pub stack: String,
    pub status: DeployStatus,
    pub template_digest: ContentDigest,
    pub resources: Vec<ResourceHandle>,
    /// Export name -> resolved value.
    pub exports: BTreeMap<String, Value>,
}

/// External provisioning API.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Declare one resource of `stack` and return its handle.
    async fn declare(
        &self,
        stack: &str,
        logical_id: &str,
        spec: &ResourceSpec,
    ) -> Result<ResourceHandle>;

    /// Apply `template` as the new desired state of `stack`.
    async fn apply(&self, stack: &str, template: &Template) -> Result<DeployResult>;
}

/// Persisted state of one applied stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackState {
    pub stack: String,
    pub template_digest: ContentDigest,
    pub template: Template,
    pub resources: Vec<ResourceHandle>,
    pub exports: BTreeMap<String, Value>,
    pub applied_at: DateTime<Utc>,
}

/// Provisioner that records applied stacks as JSON files.
#[derive(Debug, Clone)]
pub struct LocalProvisioner {
    root: PathBuf,
}

impl LocalProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, stack: &str) -> PathBuf {
        self.root.join(format!("{stack}.state.json"))
    }

    /// Last applied state of `stack`, if any.
    pub async fn deployed(&self, stack: &str) -> Result<Option<StackState>> {
        match tokio::fs::read(self.state_path(stack)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all applied stacks, sorted.
    pub async fn stacks(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if let Some(stack) = file_name.to_str().and_then(|n| n.strip_suffix(".state.json")) {
                names.push(stack.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Exports of every applied stack other than `except`.
    async fn visible_exports(&self, except: &str) -> Result<BTreeMap<String, Value>> {
        let mut exports = BTreeMap::new();
        for stack in self.stacks().await? {
            if stack == except {
                continue;
            }
            if let Some(state) = self.deployed(&stack).await? {
                exports.extend(state.exports);
            }
        }
        Ok(exports)
    }

    async fn write_state(&self, state: &StackState) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.state_path(&state.stack);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Resolve an output value: `{"Ref": id}` becomes the resource's physical id.
fn resolve_output(value: &Value, handles: &[ResourceHandle]) -> Value {
    if let Some(Value::String(id)) = value.get("Ref") {
        if let Some(handle) = handles.iter().find(|h| &h.logical_id == id) {
            return Value::String(handle.physical_id.clone());
        }
    }
    value.clone()
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn declare(
        &self,
        stack: &str,
        logical_id: &str,
        spec: &ResourceSpec,
    ) -> Result<ResourceHandle> {
        let digest = ContentDigest::from_bytes(to_canonical_json(spec)?.as_bytes());
        Ok(ResourceHandle {
            stack: stack.to_string(),
            logical_id: logical_id.to_string(),
            resource_type: spec.resource_type.clone(),
            physical_id: format!("{stack}-{logical_id}-{}", digest.short()).to_lowercase(),
        })
    }

    async fn apply(&self, stack: &str, template: &Template) -> Result<DeployResult> {
        let template_digest = template.digest()?;

        if let Some(previous) = self.deployed(stack).await? {
            if previous.template_digest == template_digest {
                debug!(stack = %stack, digest = %template_digest.short(), "template unchanged");
                obs::emit_deploy_applied(stack, template_digest.short(), false);
                return Ok(DeployResult {
                    stack: stack.to_string(),
                    status: DeployStatus::Unchanged,
                    template_digest,
                    resources: previous.resources,
                    exports: previous.exports,
                });
            }
        }

        let available = self.visible_exports(stack).await?;
        let own: Vec<&str> = template.exports();
        for import in template.imports() {
            if !available.contains_key(&import) && !own.contains(&import.as_str()) {
                return Err(UepsError::Provisioning {
                    stack: stack.to_string(),
                    reason: format!("imports {import}, which no deployed stack exports"),
                });
            }
        }

        let mut resources = Vec::with_capacity(template.resources.len());
        for (logical_id, spec) in &template.resources {
            resources.push(self.declare(stack, logical_id, spec).await?);
        }

        let exports: BTreeMap<String, Value> = template
            .outputs
            .values()
            .filter_map(|output| {
                output
                    .export
                    .as_ref()
                    .map(|e| (e.name.clone(), resolve_output(&output.value, &resources)))
            })
            .collect();

        let state = StackState {
            stack: stack.to_string(),
            template_digest: template_digest.clone(),
            template: template.clone(),
            resources: resources.clone(),
            exports: exports.clone(),
            applied_at: Utc::now(),
        };
        self.write_state(&state).await?;

        info!(
            stack = %stack,
            digest = %template_digest.short(),
            resources = resources.len(),
            "stack template applied"
        );
        obs::emit_deploy_applied(stack, template_digest.short(), true);

        Ok(DeployResult {
            stack: stack.to_string(),
            status: DeployStatus::Applied,
            template_digest,
            resources,
            exports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::template::{import_value, reference};
    use serde_json::json;

    fn network() -> Template {
        Template::new("net")
            .with_resource("Vpc", ResourceSpec::new("AWS::EC2::VPC", json!({ "CidrBlock": "10.0.0.0/16" })))
            .with_output("VpcId", reference("Vpc"), Some("Net-VpcId"))
    }

    fn builder() -> Template {
        Template::new("builder").with_resource(
            "Sg",
            ResourceSpec::new("AWS::EC2::SecurityGroup", json!({ "VpcId": import_value("Net-VpcId") })),
        )
    }

    #[tokio::test]
    async fn test_reapply_same_template_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let p = LocalProvisioner::new(dir.path());

        let first = p.apply("Net", &network()).await.unwrap();
        assert_eq!(first.status, DeployStatus::Applied);
        let vpc_id = first.exports["Net-VpcId"].as_str().unwrap().to_string();
        assert!(vpc_id.starts_with("net-vpc-"));

        let second = p.apply("Net", &network()).await.unwrap();
        assert_eq!(second.status, DeployStatus::Unchanged);
        assert_eq!(second.template_digest, first.template_digest);
        assert_eq!(second.exports, first.exports);

        let changed = network().with_resource("Igw", ResourceSpec::new("AWS::EC2::InternetGateway", json!({})));
        assert_eq!(p.apply("Net", &changed).await.unwrap().status, DeployStatus::Applied);
        assert_eq!(p.stacks().await.unwrap(), vec!["Net"]);
    }

    #[tokio::test]
    async fn test_imports_require_exporting_stack() {
        let dir = tempfile::tempdir().unwrap();
        let p = LocalProvisioner::new(dir.path());

        let err = p.apply("Builder", &builder()).await.unwrap_err();
        assert!(matches!(err, UepsError::Provisioning { ref stack, .. } if stack == "Builder"));
        assert!(p.deployed("Builder").await.unwrap().is_none());

        p.apply("Net", &network()).await.unwrap();
        let result = p.apply("Builder", &builder()).await.unwrap();
        assert_eq!(result.status, DeployStatus::Applied);
        assert_eq!(result.resources[0].resource_type, "AWS::EC2::SecurityGroup");
    }

    #[tokio::test]
    async fn test_declare_is_deterministic() {
        let p = LocalProvisioner::new("/nonexistent");
        let spec = ResourceSpec::new("AWS::S3::Bucket", json!({}));
        let a = p.declare("S", "Bucket", &spec).await.unwrap();
        let b = p.declare("S", "Bucket", &spec).await.unwrap();
        assert_eq!(a, b);
        assert!(p.stacks().await.unwrap().is_empty());
    }
}
