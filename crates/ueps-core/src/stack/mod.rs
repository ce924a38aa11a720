//! Deployable stacks and the templates they render.
//!
//! The stack set is closed: network, image builder, release pipeline.

pub mod graph;
pub mod image_builder;
pub mod network;
pub mod release_pipeline;
pub mod template;

pub use graph::StackGraph;
pub use image_builder::ImageBuilderStack;
pub use network::{network_export, NetworkStack};
pub use release_pipeline::{definition_from_template, ReleasePipelineStack, SourceRepository};
pub use template::{template_file_name, ResourceSpec, Template};

use crate::config::AccountScope;
use crate::domain::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum Stack {
    Network(NetworkStack),
    ImageBuilder(ImageBuilderStack),
    ReleasePipeline(ReleasePipelineStack),
}

impl Stack {
    pub fn name(&self) -> &str {
        match self {
            Stack::Network(s) => &s.name,
            Stack::ImageBuilder(s) => &s.name,
            Stack::ReleasePipeline(s) => &s.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Stack::Network(_) => "network",
            Stack::ImageBuilder(_) => "image_builder",
            Stack::ReleasePipeline(_) => "release_pipeline",
        }
    }

    /// Stacks that must be deployed before this one.
    pub fn dependencies(&self) -> Vec<String> {
        match self {
            Stack::Network(s) => s.depends_on.clone(),
            Stack::ImageBuilder(s) => s.dependencies(),
            Stack::ReleasePipeline(s) => s.depends_on.clone(),
        }
    }

    pub fn template(&self, scope: &AccountScope) -> Result<Template> {
        match self {
            Stack::Network(s) => Ok(s.template()),
            Stack::ImageBuilder(s) => s.template(scope),
            Stack::ReleasePipeline(s) => s.template(),
        }
    }
}

/// Build the dependency graph over `stacks`. Every named dependency must be
/// one of them.
pub fn build_graph(stacks: &[Stack]) -> Result<StackGraph> {
    let mut graph = StackGraph::new();
    for stack in stacks {
        graph.add_stack(stack.name());
    }
    for stack in stacks {
        for dependency in stack.dependencies() {
            graph.add_dependency(&dependency, stack.name())?;
        }
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::UepsError;

    fn network(depends_on: &[&str]) -> Stack {
        Stack::Network(NetworkStack {
            name: "UEPSNetworkStack".to_string(),
            cidr: "10.0.0.0/16".to_string(),
            max_azs: 1,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = build_graph(&[network(&["Nope"])]).unwrap_err();
        assert!(matches!(err, UepsError::UnknownStack(name) if name == "Nope"));
    }

    #[test]
    fn test_graph_from_stacks() {
        let other = Stack::Network(NetworkStack {
            name: "Other".to_string(),
            cidr: "10.1.0.0/16".to_string(),
            max_azs: 1,
            depends_on: vec!["UEPSNetworkStack".to_string()],
        });
        let graph = build_graph(&[network(&[]), other.clone()]).unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec!["UEPSNetworkStack", "Other"]);
        assert_eq!(other.kind(), "network");
    }
}
