//! Infrastructure Config: where and as what an image build runs.
//!
//! Configs are unversioned and updated in place by name. A redeploy that
//! changes a config affects the next build only; every `BuildResult` keeps
//! a copy of the config it ran with.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::AccountScope;
use crate::domain::error::{Result, UepsError};

/// Network placement of the build instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
}

/// Role and managed policies attached to the build instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub role_name: String,
    #[serde(default)]
    pub managed_policies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureConfig {
    pub name: String,
    /// Instance types, in preference order.
    pub compute_class: Vec<String>,
    pub placement: Placement,
    /// Instance profile name.
    pub profile: String,
    pub security_policy: SecurityPolicy,
}

impl InfrastructureConfig {
    pub fn define(
        name: impl Into<String>,
        compute_class: Vec<String>,
        placement: Placement,
        profile: impl Into<String>,
        security_policy: SecurityPolicy,
    ) -> Result<Self> {
        let config = Self {
            name: name.into(),
            compute_class,
            placement,
            profile: profile.into(),
            security_policy,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(UepsError::InvalidInfrastructure {
                name: self.name.clone(),
                reason: reason.to_string(),
            })
        };
        if self.name.trim().is_empty() {
            return invalid("name must not be empty");
        }
        if self.compute_class.is_empty() {
            return invalid("compute class must list at least one instance type");
        }
        if self.placement.subnet_id.trim().is_empty() {
            return invalid("subnet id must not be empty");
        }
        if self.profile.trim().is_empty() {
            return invalid("instance profile must not be empty");
        }
        Ok(())
    }

    pub fn arn(&self, scope: &AccountScope) -> String {
        scope.arn(
            "imagebuilder",
            &format!("infrastructure-configuration/{}", self.name.to_lowercase()),
        )
    }
}

/// Named infrastructure configs, updated in place.
#[derive(Debug, Clone, Default)]
pub struct InfrastructureCatalog {
    configs: BTreeMap<String, InfrastructureConfig>,
}

impl InfrastructureCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the config with this name. Returns the previous one.
    pub fn define(&mut self, config: InfrastructureConfig) -> Result<Option<InfrastructureConfig>> {
        config.validate()?;
        info!(infrastructure = %config.name, instance_types = ?config.compute_class, "infrastructure config defined");
        Ok(self.configs.insert(config.name.clone(), config))
    }

    pub fn get(&self, name: &str) -> Result<&InfrastructureConfig> {
        self.configs
            .get(name)
            .ok_or_else(|| UepsError::UnknownInfrastructure(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}
