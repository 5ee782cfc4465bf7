use crate::error::CoreError;
use crate::types::{RunId, RunOutcome, RunProgress, RunRequest};
use async_trait::async_trait;

/// Write-through observer of a run. Failures are reported by the caller and
/// never change the in-memory outcome.
#[async_trait]
pub trait RunSink: Send + Sync {
    async fn run_started(&self, run_id: RunId, request: &RunRequest) -> Result<(), CoreError>;

    async fn progress_updated(&self, run_id: RunId, progress: &RunProgress)
        -> Result<(), CoreError>;

    async fn run_finished(&self, run_id: RunId, outcome: &RunOutcome) -> Result<(), CoreError>;
}
