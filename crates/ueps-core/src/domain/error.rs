//! Domain-level error taxonomy for UEPS.

use ueps_state::StorageError;

/// UEPS domain errors.
#[derive(Debug, thiserror::Error)]
pub enum UepsError {
    #[error("component {name} version {version} already published with a different payload")]
    DuplicateVersionConflict { name: String, version: String },

    #[error("recipe {name} version {version} already published with different contents: {detail}")]
    VersionConflict {
        name: String,
        version: String,
        detail: String,
    },

    #[error("action {action} requires artifact {artifact} which has not been produced")]
    DependencyNotReady { action: String, artifact: String },

    #[error("{target} is already running")]
    AlreadyRunning { target: String },

    #[error("stack dependency cycle: {}", stacks.join(" -> "))]
    StackDependencyCycle { stacks: Vec<String> },

    #[error("unknown component {name} version {version}")]
    UnknownComponent { name: String, version: String },

    #[error("recipe {recipe} has no components")]
    EmptyRecipe { recipe: String },

    #[error("recipe {recipe} lists component {component} more than once")]
    DuplicateComponent { recipe: String, component: String },

    #[error("invalid version {value:?}: {reason}")]
    InvalidVersion { value: String, reason: String },

    #[error("invalid schedule expression {expression:?}: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("invalid infrastructure config {name}: {reason}")]
    InvalidInfrastructure { name: String, reason: String },

    #[error("unknown stack: {0}")]
    UnknownStack(String),

    #[error("unknown image pipeline: {0}")]
    UnknownPipeline(String),

    #[error("unknown infrastructure config: {0}")]
    UnknownInfrastructure(String),

    #[error("action {action} failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("provisioning stack {stack} failed: {reason}")]
    Provisioning { stack: String, reason: String },

    #[error("image build for pipeline {pipeline} failed: {reason}")]
    Build { pipeline: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl UepsError {
    /// True for both component and recipe identity conflicts.
    pub fn is_version_conflict(&self) -> bool {
        matches!(
            self,
            UepsError::DuplicateVersionConflict { .. } | UepsError::VersionConflict { .. }
        )
    }

    /// Composition-time errors abort synthesis with no output written.
    pub fn is_composition_error(&self) -> bool {
        matches!(
            self,
            UepsError::DuplicateVersionConflict { .. }
                | UepsError::VersionConflict { .. }
                | UepsError::StackDependencyCycle { .. }
                | UepsError::UnknownComponent { .. }
                | UepsError::EmptyRecipe { .. }
                | UepsError::DuplicateComponent { .. }
                | UepsError::InvalidVersion { .. }
                | UepsError::InvalidSchedule { .. }
                | UepsError::InvalidPipeline(_)
                | UepsError::InvalidInfrastructure { .. }
                | UepsError::UnknownStack(_)
        )
    }
}

/// Result type for UEPS domain operations.
pub type Result<T> = std::result::Result<T, UepsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_errors_name_the_identity() {
        let err = UepsError::DuplicateVersionConflict {
            name: "firewall-rules".to_string(),
            version: "0.0.5".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("firewall-rules"));
        assert!(msg.contains("0.0.5"));
        assert!(err.is_version_conflict());

        let err = UepsError::VersionConflict {
            name: "UEPSWindowsImageRecipe".to_string(),
            version: "1.0.5".to_string(),
            detail: "components differ".to_string(),
        };
        assert!(err.to_string().contains("UEPSWindowsImageRecipe"));
        assert!(err.is_version_conflict());
    }

    #[test]
    fn test_cycle_display_joins_stacks() {
        let err = UepsError::StackDependencyCycle {
            stacks: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "stack dependency cycle: A -> B -> A");
        assert!(err.is_composition_error());
    }

    #[test]
    fn test_runtime_errors_are_not_composition_errors() {
        let err = UepsError::AlreadyRunning {
            target: "NetworkStack".to_string(),
        };
        assert!(!err.is_composition_error());
        assert!(!err.is_version_conflict());
    }

    #[test]
    fn test_storage_error_converts() {
        let err: UepsError = StorageError::Backend("down".to_string()).into();
        assert!(err.to_string().contains("storage error"));
    }
}
