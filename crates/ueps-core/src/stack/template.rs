//! Declarative stack templates.
//!
//! Rendered as canonical JSON so the same stack always produces the same
//! bytes, which is what makes re-applying an unchanged template a no-op.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use ueps_state::ContentDigest;

use crate::domain::digest::{compute_digest, to_canonical_json};
use crate::domain::error::Result;

/// `<StackName>.template.json`
pub fn template_file_name(stack: &str) -> String {
    crate::domain::pipeline::template_artifact_name(stack)
}

/// `{"Ref": id}`
pub fn reference(logical_id: &str) -> Value {
    json!({ "Ref": logical_id })
}

/// `{"Fn::GetAtt": [id, attribute]}`
pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [logical_id, attribute] })
}

/// `{"Fn::ImportValue": export}`
pub fn import_value(export: &str) -> Value {
    json!({ "Fn::ImportValue": export })
}

/// One declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "Type")]
    pub resource_type: String,
    #[serde(rename = "Properties", default)]
    pub properties: Value,
    #[serde(rename = "DependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ResourceSpec {
    pub fn new(resource_type: impl Into<String>, properties: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties,
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, logical_id: &str) -> Self {
        self.depends_on.push(logical_id.to_string());
        self
    }

    /// Export names this resource imports through `Fn::ImportValue`.
    pub fn imports(&self) -> Vec<String> {
        let mut found = Vec::new();
        collect_imports(&self.properties, &mut found);
        found
    }
}

fn collect_imports(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(export)) = map.get("Fn::ImportValue") {
                found.push(export.clone());
            }
            for v in map.values() {
                collect_imports(v, found);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_imports(v, found)),
        _ => {}
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportName {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    #[serde(rename = "Value")]
    pub value: Value,
    #[serde(rename = "Export", default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportName>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Resources", default)]
    pub resources: BTreeMap<String, ResourceSpec>,
    #[serde(rename = "Outputs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

impl Template {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_resource(mut self, logical_id: &str, spec: ResourceSpec) -> Self {
        self.resources.insert(logical_id.to_string(), spec);
        self
    }

    pub fn with_output(mut self, key: &str, value: Value, export: Option<&str>) -> Self {
        self.outputs.insert(
            key.to_string(),
            Output {
                value,
                export: export.map(|name| ExportName {
                    name: name.to_string(),
                }),
            },
        );
        self
    }

    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a ResourceSpec)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, r)| r.resource_type == resource_type)
    }

    /// Export names declared by this template's outputs.
    pub fn exports(&self) -> Vec<&str> {
        self.outputs
            .values()
            .filter_map(|o| o.export.as_ref().map(|e| e.name.as_str()))
            .collect()
    }

    /// Export names imported by any resource, sorted and deduplicated.
    pub fn imports(&self) -> Vec<String> {
        let mut all: Vec<String> = self.resources.values().flat_map(|r| r.imports()).collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn render(&self) -> Result<String> {
        to_canonical_json(self)
    }

    pub fn digest(&self) -> Result<ContentDigest> {
        compute_digest(self)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
