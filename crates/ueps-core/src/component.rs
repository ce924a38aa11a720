//! Component Registry: named, versioned, platform-tagged install units.
//!
//! A component's identity is `(name, version)`. Publishing is append-only:
//! re-registering an identity with the same payload returns the existing
//! component, a different payload is a [`UepsError::DuplicateVersionConflict`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AccountScope;
use crate::domain::error::{Result, UepsError};

/// Parse a `major.minor.patch` version.
pub fn parse_version(value: &str) -> Result<Version> {
    Version::parse(value.trim()).map_err(|e| UepsError::InvalidVersion {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    Windows,
    Linux,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Windows => write!(f, "Windows"),
            Platform::Linux => write!(f, "Linux"),
        }
    }
}

impl FromStr for Platform {
    type Err = UepsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "windows" => Ok(Platform::Windows),
            "linux" => Ok(Platform::Linux),
            other => Err(UepsError::Config(format!("unknown platform: {other}"))),
        }
    }
}

/// One install step of a component document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStep {
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentPhase {
    pub name: String,
    pub steps: Vec<ComponentStep>,
}

/// YAML component document: the payload of a component.
///
/// ```yaml
/// name: InstallNvidia
/// description: NVIDIA GRID driver
/// schemaVersion: 1.0
/// phases:
///   - name: build
///     steps:
///       - name: Download
///         action: S3Download
///         inputs: [...]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(deserialize_with = "schema_version")]
    pub schema_version: String,
    #[serde(default)]
    pub phases: Vec<ComponentPhase>,
}

/// `schemaVersion: 1.0` parses as a YAML float; keep its text form.
fn schema_version<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    match value {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 => Ok(format!("{f:.1}")),
            _ => Ok(n.to_string()),
        },
        other => Err(serde::de::Error::custom(format!(
            "schemaVersion must be a string or number, got {other:?}"
        ))),
    }
}

impl ComponentDocument {
    /// Parse a YAML component document.
    pub fn parse(yaml: &str) -> Result<Self> {
        let doc: ComponentDocument = serde_yaml::from_str(yaml)?;
        if doc.phases.is_empty() {
            return Err(UepsError::Config(format!(
                "component document {} has no phases",
                doc.name
            )));
        }
        Ok(doc)
    }

    /// Read and parse a YAML component document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Placeholder payload for an AWS managed component; its steps live in
    /// the managed service, not in this repository.
    pub fn managed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: Some("AWS managed component".to_string()),
            schema_version: "1.0".to_string(),
            phases: Vec::new(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn step_count(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub platform: Platform,
    pub version: Version,
    /// Set for AWS managed components, referenced by this managed name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed: Option<String>,
    pub payload: ComponentDocument,
}

impl Component {
    pub fn arn(&self, scope: &AccountScope) -> String {
        match &self.managed {
            Some(managed) => scope.aws_owned_arn(
                "imagebuilder",
                &format!("component/{managed}/{}", self.version),
            ),
            None => scope.arn(
                "imagebuilder",
                &format!("component/{}/{}", self.name.to_lowercase(), self.version),
            ),
        }
    }

    pub fn is_managed(&self) -> bool {
        self.managed.is_some()
    }
}

/// In-memory registry of published components, keyed by `(name, version)`.
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    components: BTreeMap<(String, Version), Component>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a component.
    ///
    /// Idempotent for an identical payload; a different payload under an
    /// existing `(name, version)` fails with `DuplicateVersionConflict`.
    pub fn register(
        &mut self,
        name: &str,
        platform: Platform,
        version: &str,
        payload: ComponentDocument,
    ) -> Result<Component> {
        self.insert(Component {
            name: name.to_string(),
            platform,
            version: parse_version(version)?,
            managed: None,
            payload,
        })
    }

    /// Publish a reference to an AWS managed component.
    pub fn register_managed(
        &mut self,
        name: &str,
        platform: Platform,
        version: &str,
        managed: &str,
    ) -> Result<Component> {
        self.insert(Component {
            name: name.to_string(),
            platform,
            version: parse_version(version)?,
            managed: Some(managed.to_string()),
            payload: ComponentDocument::managed(managed),
        })
    }

    /// Parse `yaml` and publish it.
    pub fn register_document(
        &mut self,
        name: &str,
        platform: Platform,
        version: &str,
        yaml: &str,
    ) -> Result<Component> {
        let payload = ComponentDocument::parse(yaml)?;
        self.register(name, platform, version, payload)
    }

    /// Load a component published by an earlier run. Same rules as
    /// `register`, so restoring the same identity twice is harmless.
    pub fn restore(&mut self, component: Component) -> Result<Component> {
        self.insert(component)
    }

    fn insert(&mut self, component: Component) -> Result<Component> {
        if component.name.trim().is_empty() {
            return Err(UepsError::Config("component name must not be empty".to_string()));
        }

        let key = (component.name.clone(), component.version.clone());
        if let Some(existing) = self.components.get(&key) {
            if existing.payload == component.payload
                && existing.platform == component.platform
                && existing.managed == component.managed
            {
                debug!(component = %component.name, version = %component.version, "idempotent republish");
                return Ok(existing.clone());
            }
            return Err(UepsError::DuplicateVersionConflict {
                name: component.name,
                version: component.version.to_string(),
            });
        }

        info!(
            component = %component.name,
            version = %component.version,
            platform = %component.platform,
            steps = component.payload.step_count(),
            "component registered"
        );
        self.components.insert(key, component.clone());
        Ok(component)
    }

    pub fn get(&self, name: &str, version: &Version) -> Option<&Component> {
        self.components.get(&(name.to_string(), version.clone()))
    }

    /// Highest published version of `name`.
    pub fn latest(&self, name: &str) -> Option<&Component> {
        self.components
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, c)| c)
            .max_by(|a, b| a.version.cmp(&b.version))
    }

    /// Published versions of `name`, ascending.
    pub fn versions(&self, name: &str) -> Vec<Version> {
        self.components
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIREWALL: &str = r#"
name: InstallFirewallRules
description: Open the pixel streaming ports
schemaVersion: 1.0
phases:
  - name: build
    steps:
      - name: OpenPorts
        action: ExecutePowerShell
        inputs:
          commands:
            - New-NetFirewallRule -DisplayName 'PixelStreaming' -LocalPort 80 -Protocol TCP
"#;

    fn firewall_doc() -> ComponentDocument {
        ComponentDocument::parse(FIREWALL).unwrap()
    }

    #[test]
    fn test_parse_document() {
        let doc = firewall_doc();
        assert_eq!(doc.name, "InstallFirewallRules");
        assert_eq!(doc.schema_version, "1.0");
        assert_eq!(doc.phases.len(), 1);
        assert_eq!(doc.phases[0].steps[0].action, "ExecutePowerShell");
        assert!(doc.phases[0].steps[0].inputs["commands"].is_array());
    }

    #[test]
    fn test_document_without_phases_rejected() {
        let err = ComponentDocument::parse("name: x\nschemaVersion: 1.0\n").unwrap_err();
        assert!(err.to_string().contains("no phases"));
    }

    #[test]
    fn test_register_identical_payload_is_idempotent() {
        let mut registry = ComponentRegistry::new();
        let first = registry
            .register("firewall", Platform::Windows, "0.0.5", firewall_doc())
            .unwrap();
        let second = registry
            .register("firewall", Platform::Windows, "0.0.5", firewall_doc())
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_different_payload_conflicts() {
        let mut registry = ComponentRegistry::new();
        registry
            .register("firewall", Platform::Windows, "0.0.5", firewall_doc())
            .unwrap();

        let mut changed = firewall_doc();
        changed.phases[0].steps[0].name = "OpenMorePorts".to_string();
        let err = registry
            .register("firewall", Platform::Windows, "0.0.5", changed.clone())
            .unwrap_err();
        assert!(matches!(err, UepsError::DuplicateVersionConflict { .. }));
        assert!(err.to_string().contains("firewall"));

        // A new version is a new identity.
        registry
            .register("firewall", Platform::Windows, "0.0.6", changed)
            .unwrap();
        assert_eq!(registry.versions("firewall").len(), 2);
    }

    #[test]
    fn test_invalid_version_rejected() {
        let mut registry = ComponentRegistry::new();
        let err = registry
            .register("firewall", Platform::Windows, "0.5", firewall_doc())
            .unwrap_err();
        assert!(matches!(err, UepsError::InvalidVersion { .. }));
    }

    #[test]
    fn test_latest_uses_semver_order() {
        let mut registry = ComponentRegistry::new();
        for v in ["0.0.9", "0.0.10", "0.0.2"] {
            registry
                .register("nodejs", Platform::Windows, v, firewall_doc())
                .unwrap();
        }
        assert_eq!(
            registry.latest("nodejs").unwrap().version,
            Version::new(0, 0, 10)
        );
        assert!(registry.latest("missing").is_none());
    }

    #[test]
    fn test_component_arns() {
        let scope = AccountScope::new("us-east-1", "123456789012");
        let mut registry = ComponentRegistry::new();
        let custom = registry
            .register("NiceDCV", Platform::Windows, "0.0.5", firewall_doc())
            .unwrap();
        let managed = registry
            .register_managed("chocolatey", Platform::Windows, "1.0.0", "chocolatey")
            .unwrap();
        assert_eq!(
            custom.arn(&scope),
            "arn:aws:imagebuilder:us-east-1:123456789012:component/nicedcv/0.0.5"
        );
        assert_eq!(
            managed.arn(&scope),
            "arn:aws:imagebuilder:us-east-1:aws:component/chocolatey/1.0.0"
        );
    }

    #[test]
    fn test_platform_from_str() {
        assert_eq!("windows".parse::<Platform>().unwrap(), Platform::Windows);
        assert_eq!("Linux".parse::<Platform>().unwrap(), Platform::Linux);
        assert!("macos".parse::<Platform>().is_err());
    }
}
