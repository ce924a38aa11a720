//! Per-run artifact store.
//!
//! Artifacts become visible only when the run-order group that produced
//! them has fully succeeded, so an action can never observe output from a
//! group that is still running or that failed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use ueps_core::{Result, UepsError};
use ueps_state::ContentDigest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    /// The single action that produced it.
    pub producer: String,
    pub bytes: Vec<u8>,
    pub digest: ContentDigest,
}

impl Artifact {
    pub fn new(name: impl Into<String>, producer: impl Into<String>, bytes: Vec<u8>) -> Self {
        let digest = ContentDigest::from_bytes(&bytes);
        Self {
            name: name.into(),
            producer: producer.into(),
            bytes,
            digest,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    artifacts: BTreeMap<String, Arc<Artifact>>,
    consumers: BTreeMap<String, Vec<String>>,
}

/// Shared artifact store for one run. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    inner: Arc<Mutex<Inner>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand `name` to `consumer`, failing with `DependencyNotReady` when it
    /// has not been published.
    pub fn fetch(&self, consumer: &str, name: &str) -> Result<Arc<Artifact>> {
        let mut inner = self.lock();
        let artifact = inner
            .artifacts
            .get(name)
            .cloned()
            .ok_or_else(|| UepsError::DependencyNotReady {
                action: consumer.to_string(),
                artifact: name.to_string(),
            })?;
        inner
            .consumers
            .entry(name.to_string())
            .or_default()
            .push(consumer.to_string());
        Ok(artifact)
    }

    /// Publish a completed group's outputs together.
    pub fn publish(&self, artifacts: Vec<Artifact>) -> Result<()> {
        let mut inner = self.lock();
        for artifact in &artifacts {
            if let Some(existing) = inner.artifacts.get(&artifact.name) {
                return Err(UepsError::InvalidPipeline(format!(
                    "artifact {} already produced by {}",
                    artifact.name, existing.producer
                )));
            }
        }
        for artifact in artifacts {
            inner
                .artifacts
                .insert(artifact.name.clone(), Arc::new(artifact));
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().artifacts.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().artifacts.keys().cloned().collect()
    }

    /// Actions that fetched `name`, in fetch order.
    pub fn consumers_of(&self, name: &str) -> Vec<String> {
        self.lock().consumers.get(name).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().artifacts.is_empty()
    }

    /// Drop every artifact. Called when the run ends.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.artifacts.clear();
        inner.consumers.clear();
    }
}
