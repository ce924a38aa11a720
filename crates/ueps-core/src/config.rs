//! Release configuration (`ueps.toml`).
//!
//! Every field has a default matching the pixel streaming deployment, so an
//! empty file is a valid configuration. `UEPS_REGION` and `UEPS_ACCOUNT`
//! override the account scope after the file is read.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::error::{Result, UepsError};
use crate::image_pipeline::TriggerCondition;

pub const REGION_ENV: &str = "UEPS_REGION";
pub const ACCOUNT_ENV: &str = "UEPS_ACCOUNT";

/// Region and account every ARN and template is rendered for.
///
/// Passed explicitly to the composer and stack builders; nothing reads it
/// from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountScope {
    pub region: String,
    pub account: String,
}

impl AccountScope {
    pub fn new(region: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account: account.into(),
        }
    }

    /// `arn:aws:<service>:<region>:<account>:<resource>`
    pub fn arn(&self, service: &str, resource: &str) -> String {
        format!(
            "arn:aws:{service}:{}:{}:{resource}",
            self.region, self.account
        )
    }

    /// ARN owned by AWS itself (managed components, public base images).
    pub fn aws_owned_arn(&self, service: &str, resource: &str) -> String {
        format!("arn:aws:{service}:{}:aws:{resource}", self.region)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub region: String,
    pub account: String,
    pub network: NetworkSettings,
    pub image: ImageSettings,
    pub pipeline: PipelineSettings,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            account: "000000000000".to_string(),
            network: NetworkSettings::default(),
            image: ImageSettings::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub stack_name: String,
    pub cidr: String,
    pub max_azs: u32,
    /// Extra stacks this stack must deploy after.
    pub depends_on: Vec<String>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            stack_name: "UEPSNetworkStack".to_string(),
            cidr: "10.0.0.0/16".to_string(),
            max_azs: 2,
            depends_on: Vec::new(),
        }
    }
}

/// One recipe entry, in install order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentEntry {
    pub name: String,
    /// Version override; defaults to `image.component_version`.
    #[serde(default)]
    pub version: Option<String>,
    /// YAML component document, relative to the source root.
    #[serde(default)]
    pub document: Option<String>,
    /// Name of an AWS managed component, referenced by ARN only.
    #[serde(default)]
    pub managed: Option<String>,
}

impl ComponentEntry {
    pub fn document(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            version: None,
            document: Some(path.to_string()),
            managed: None,
        }
    }

    pub fn managed(name: &str, managed: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: Some(version.to_string()),
            document: None,
            managed: Some(managed.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    pub stack_name: String,
    pub pipeline_name: String,
    pub recipe_name: String,
    pub recipe_version: String,
    pub component_version: String,
    pub platform: String,
    pub base_image: String,
    /// Exact version or `x.x.x` to track the latest published base image.
    pub base_image_version: String,
    pub infrastructure_name: String,
    pub instance_types: Vec<String>,
    pub instance_profile: String,
    pub role_name: String,
    pub managed_policies: Vec<String>,
    /// Cron expression in UTC (5-field or AWS `cron(...)` form).
    pub schedule: Option<String>,
    pub trigger_condition: Option<TriggerCondition>,
    pub components: Vec<ComponentEntry>,
    /// Extra stacks this stack must deploy after, besides the network stack.
    pub depends_on: Vec<String>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            stack_name: "UEPSBuilderStack".to_string(),
            pipeline_name: "UEPSWindowsImagePipeline".to_string(),
            recipe_name: "UEPSWindowsImageRecipe".to_string(),
            recipe_version: "1.0.5".to_string(),
            component_version: "0.0.5".to_string(),
            platform: "Windows".to_string(),
            base_image: "windows-server-2019-full-base".to_string(),
            base_image_version: "x.x.x".to_string(),
            infrastructure_name: "UEPSWindowsImageInfrastructureConfig".to_string(),
            instance_types: vec!["g4dn.xlarge".to_string()],
            instance_profile: "UEPSWindowsImageInstanceProfile".to_string(),
            role_name: "UEPSWindowsImageBuilderRole".to_string(),
            managed_policies: vec![
                "arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore".to_string(),
                "arn:aws:iam::aws:policy/EC2InstanceProfileForImageBuilder".to_string(),
            ],
            schedule: None,
            trigger_condition: None,
            components: vec![
                ComponentEntry::managed("dotnet-core-sdk", "dotnet-core-sdk-windows", "3.1.0"),
                ComponentEntry::managed(
                    "cloudwatch-agent",
                    "amazon-cloudwatch-agent-windows",
                    "1.0.0",
                ),
                ComponentEntry::managed("aws-cli", "aws-cli-version-2-windows", "1.0.0"),
                ComponentEntry::managed("chocolatey", "chocolatey", "1.0.0"),
                ComponentEntry::document("firewall-rules", "resources/install_firewall_rules.yml"),
                ComponentEntry::document("nodejs", "resources/install_nodejs.yml"),
                ComponentEntry::document("nvidia", "resources/install_nvidia.yml"),
                ComponentEntry::document("nice-dcv", "resources/install_nice_dcv.yml"),
            ],
            depends_on: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub stack_name: String,
    pub name: String,
    pub restart_on_update: bool,
    /// Import an existing artifact bucket instead of creating one.
    pub artifact_bucket: Option<String>,
    pub source_owner: String,
    pub source_repo: String,
    pub source_branch: String,
    pub depends_on: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stack_name: "UEPSPipelineStack".to_string(),
            name: "UEPS-Release-Pipeline".to_string(),
            restart_on_update: true,
            artifact_bucket: None,
            source_owner: "ueps".to_string(),
            source_repo: "ueps-release-pipeline".to_string(),
            source_branch: "main".to_string(),
            depends_on: Vec::new(),
        }
    }
}

impl ReleaseConfig {
    /// Parse TOML text. Unset fields take their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| UepsError::Config(e.to_string()))
    }

    /// Read `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            UepsError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml(&text)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `UEPS_REGION` / `UEPS_ACCOUNT` from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(region) = lookup(REGION_ENV).filter(|v| !v.is_empty()) {
            self.region = region;
        }
        if let Some(account) = lookup(ACCOUNT_ENV).filter(|v| !v.is_empty()) {
            self.account = account;
        }
    }

    pub fn scope(&self) -> AccountScope {
        AccountScope::new(&self.region, &self.account)
    }

    /// Trigger condition in effect for the image pipeline. A schedule with no
    /// explicit condition gates on schedule match only.
    pub fn effective_trigger_condition(&self) -> TriggerCondition {
        match (&self.image.schedule, self.image.trigger_condition) {
            (_, Some(condition)) => condition,
            (Some(_), None) => TriggerCondition::ScheduleMatchOnly,
            (None, None) => TriggerCondition::Always,
        }
    }
}
