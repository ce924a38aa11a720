//! Run lifecycle adapter: records release run events into a `RunLedger`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use ueps_state::{ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunSummary, StorageResult};

use crate::obs;

/// Records one run. Sequence numbers are assigned here, starting at 1, so
/// callers on concurrent tasks never collide.
///
/// 1. [`RunRecorder::start`] creates the run.
/// 2. [`RunRecorder::record`] appends events.
/// 3. [`RunRecorder::finish_ok`] or [`RunRecorder::finish_err`] closes it.
pub struct RunRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    next_seq: AtomicU64,
    started: Instant,
}

impl RunRecorder {
    pub async fn start(
        ledger: Arc<dyn RunLedger>,
        definition_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<Self> {
        let run_id = ledger.create_run(definition_digest, metadata.clone()).await?;
        obs::emit_run_started(&run_id.0, &metadata.pipeline_name, metadata.revision.as_deref());
        Ok(Self {
            ledger,
            run_id,
            next_seq: AtomicU64::new(1),
            started: Instant::now(),
        })
    }

    pub async fn record(&self, kind: &str, payload: Value) -> StorageResult<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        obs::emit_event_appended(&self.run_id.0, kind, seq);
        self.ledger
            .append_event(
                &self.run_id,
                RunEvent {
                    seq,
                    kind: kind.to_string(),
                    payload,
                    timestamp: Utc::now(),
                },
            )
            .await
    }

    fn summary(&self, success: bool) -> RunSummary {
        RunSummary {
            total_events: self.next_seq.load(Ordering::SeqCst) - 1,
            duration_ms: self.started.elapsed().as_millis() as u64,
            success,
        }
    }

    pub async fn finish_ok(self) -> StorageResult<RunSummary> {
        let summary = self.summary(true);
        obs::emit_run_finished(&self.run_id.0, summary.duration_ms, summary.total_events, true);
        self.ledger.complete_run(&self.run_id, summary.clone()).await?;
        Ok(summary)
    }

    pub async fn finish_err(self) -> StorageResult<RunSummary> {
        let summary = self.summary(false);
        obs::emit_run_finished(&self.run_id.0, summary.duration_ms, summary.total_events, false);
        self.ledger.fail_run(&self.run_id, summary.clone()).await?;
        Ok(summary)
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}
