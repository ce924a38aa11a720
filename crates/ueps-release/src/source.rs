//! Source bundles: the configuration and component documents a release run
//! synthesizes from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use ueps_core::{ReleaseConfig, Result, UepsError};

use crate::trigger::Trigger;

pub const CONFIG_FILE: &str = "ueps.toml";

/// Text files of one source revision, keyed by path relative to the
/// source root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBundle {
    pub revision: String,
    pub config_path: String,
    pub files: BTreeMap<String, String>,
}

impl SourceBundle {
    /// Bundle holding only a configuration file.
    pub fn with_config(revision: impl Into<String>, config_toml: impl Into<String>) -> Self {
        let mut files = BTreeMap::new();
        files.insert(CONFIG_FILE.to_string(), config_toml.into());
        Self {
            revision: revision.into(),
            config_path: CONFIG_FILE.to_string(),
            files,
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, text: impl Into<String>) -> Self {
        self.files.insert(path.into(), text.into());
        self
    }

    /// Read `config_file` (relative to `root`) and every component
    /// document it references.
    pub fn from_dir(root: &Path, config_file: &Path, revision: impl Into<String>) -> Result<Self> {
        let config_text = std::fs::read_to_string(root.join(config_file)).map_err(|e| {
            UepsError::Config(format!(
                "failed to read {}: {e}",
                root.join(config_file).display()
            ))
        })?;
        let config = ReleaseConfig::from_toml(&config_text)?;

        let config_path = config_file.to_string_lossy().to_string();
        let mut files = BTreeMap::new();
        files.insert(config_path.clone(), config_text);

        for entry in &config.image.components {
            let Some(document) = &entry.document else {
                continue;
            };
            let path = root.join(document);
            let text = std::fs::read_to_string(&path).map_err(|e| {
                UepsError::Config(format!(
                    "component {} document {}: {e}",
                    entry.name,
                    path.display()
                ))
            })?;
            debug!(component = %entry.name, path = %document, "read component document");
            files.insert(document.clone(), text);
        }

        Ok(Self {
            revision: revision.into(),
            config_path,
            files,
        })
    }

    /// Parse the bundled configuration and apply environment overrides.
    pub fn config(&self) -> Result<ReleaseConfig> {
        let mut config = ReleaseConfig::from_toml(self.document(&self.config_path)?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn document(&self, path: &str) -> Result<&str> {
        self.files
            .get(path)
            .map(String::as_str)
            .ok_or_else(|| UepsError::Config(format!("{path} is not in source revision {}", self.revision)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Fetches the source bundle a trigger points at.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn fetch(&self, trigger: &Trigger) -> anyhow::Result<SourceBundle>;
}

/// Working-tree source: reads the configuration and documents from disk at
/// fetch time.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    config_file: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config_file: PathBuf::from(CONFIG_FILE),
        }
    }

    pub fn with_config_file(mut self, config_file: impl Into<PathBuf>) -> Self {
        self.config_file = config_file.into();
        self
    }
}

#[async_trait]
impl SourceProvider for DirectorySource {
    async fn fetch(&self, trigger: &Trigger) -> anyhow::Result<SourceBundle> {
        let root = self.root.clone();
        let config_file = self.config_file.clone();
        let revision = trigger.revision.clone();
        let bundle = tokio::task::spawn_blocking(move || {
            SourceBundle::from_dir(&root, &config_file, revision)
        })
        .await??;
        Ok(bundle)
    }
}

/// In-memory source whose bundle can be swapped between runs.
#[derive(Debug)]
pub struct StaticSource {
    bundle: Mutex<SourceBundle>,
}

impl StaticSource {
    pub fn new(bundle: SourceBundle) -> Self {
        Self {
            bundle: Mutex::new(bundle),
        }
    }

    pub fn replace(&self, bundle: SourceBundle) {
        *self.bundle.lock().unwrap_or_else(|e| e.into_inner()) = bundle;
    }
}

#[async_trait]
impl SourceProvider for StaticSource {
    async fn fetch(&self, trigger: &Trigger) -> anyhow::Result<SourceBundle> {
        let mut bundle = self
            .bundle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        bundle.revision = trigger.revision.clone();
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_dir_reads_referenced_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("resources")).unwrap();
        std::fs::write(
            dir.path().join("ueps.toml"),
            r#"
            [[image.components]]
            name = "nvidia"
            document = "resources/install_nvidia.yml"
            "#,
        )
        .unwrap();
        std::fs::write(dir.path().join("resources/install_nvidia.yml"), "name: nvidia\n").unwrap();

        let bundle = SourceBundle::from_dir(dir.path(), Path::new(CONFIG_FILE), "rev1").unwrap();
        assert_eq!(bundle.files.len(), 2);
        assert_eq!(bundle.document("resources/install_nvidia.yml").unwrap(), "name: nvidia\n");
        assert_eq!(bundle.config().unwrap().image.components.len(), 1);
        assert_eq!(SourceBundle::from_bytes(&bundle.to_bytes().unwrap()).unwrap(), bundle);
    }

    #[test]
    fn test_missing_document_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ueps.toml"),
            "[[image.components]]\nname = \"x\"\ndocument = \"missing.yml\"\n",
        )
        .unwrap();
        let err = SourceBundle::from_dir(dir.path(), Path::new(CONFIG_FILE), "rev1").unwrap_err();
        assert!(matches!(err, UepsError::Config(_)));
        assert!(err.to_string().contains("missing.yml"));
    }
}
