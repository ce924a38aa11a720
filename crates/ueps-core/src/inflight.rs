//! At-most-one-in-flight admission by key.
//!
//! Used for image pipelines (one build per pipeline) and stacks (one deploy
//! per stack name across all runs). A second request for a busy key is
//! rejected with [`UepsError::AlreadyRunning`], never queued.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::domain::error::{Result, UepsError};

/// Shared set of busy keys. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. The claim is released when the guard drops.
    pub fn try_acquire(&self, key: &str) -> Result<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.to_string()) {
            return Err(UepsError::AlreadyRunning {
                target: key.to_string(),
            });
        }
        Ok(InFlightGuard {
            keys: Arc::clone(&self.keys),
            key: key.to_string(),
        })
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_rejected_until_release() {
        let inflight = InFlight::new();
        let guard = inflight.try_acquire("UEPSBuilderStack").unwrap();
        assert!(inflight.is_busy("UEPSBuilderStack"));

        let err = inflight.try_acquire("UEPSBuilderStack").unwrap_err();
        assert!(matches!(err, UepsError::AlreadyRunning { ref target } if target == "UEPSBuilderStack"));

        // Other keys are independent.
        let _other = inflight.try_acquire("UEPSNetworkStack").unwrap();

        drop(guard);
        assert!(!inflight.is_busy("UEPSBuilderStack"));
        inflight.try_acquire("UEPSBuilderStack").unwrap();
    }

    #[test]
    fn test_clones_share_state() {
        let a = InFlight::new();
        let b = a.clone();
        let _guard = a.try_acquire("p").unwrap();
        assert!(b.try_acquire("p").is_err());
    }
}
