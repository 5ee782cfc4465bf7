//! Owner of all runs started by a front end.

use crate::orchestrator::Orchestrator;
use harvester_core::{
    AppConfig, CoreError, KeywordSet, PacingConfig, RegistrySettings, RunId, RunOutcome,
    RunProgress, RunRequest, RunResult, RunSink,
};
use morphology::{DictionaryNormalizer, KeywordMatcher, Normalizer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use telegram_client::{ChannelSource, CommentRetriever, RetrieverConfig, RetryConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opaque reference to a started run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunHandle(RunId);

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.0
    }
}

impl std::fmt::Display for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
struct Finished {
    outcome: RunOutcome,
    at: Instant,
}

struct RunEntry {
    request: RunRequest,
    progress: watch::Receiver<RunProgress>,
    finished: watch::Receiver<Option<Finished>>,
    cancel: CancellationToken,
}

impl RunEntry {
    fn finished_at(&self) -> Option<Instant> {
        self.finished.borrow().as_ref().map(|f| f.at)
    }
}

pub struct RunRegistry {
    retriever: Arc<CommentRetriever>,
    normalizer: Arc<dyn Normalizer>,
    pacing: PacingConfig,
    settings: RegistrySettings,
    sink: Option<Arc<dyn RunSink>>,
    runs: RwLock<HashMap<RunId, RunEntry>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RunRegistry {
    pub fn new(
        retriever: Arc<CommentRetriever>,
        normalizer: Arc<dyn Normalizer>,
        pacing: PacingConfig,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            retriever,
            normalizer,
            pacing,
            settings,
            sink: None,
            runs: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registry over `source` with the Russian dictionary and the configured policies.
    pub fn from_config(config: &AppConfig, source: Arc<dyn ChannelSource>) -> Self {
        let retriever = CommentRetriever::new(
            source,
            RetrieverConfig::new(&config.telegram, RetryConfig::from(&config.retry)),
        );
        Self::new(
            Arc::new(retriever),
            Arc::new(DictionaryNormalizer::russian()),
            config.pacing.clone(),
            config.registry.clone(),
        )
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn read_runs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<RunId, RunEntry>> {
        self.runs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_runs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<RunId, RunEntry>> {
        self.runs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_found(handle: &RunHandle) -> CoreError {
        CoreError::NotFound {
            resource: format!("run {}", handle),
        }
    }

    /// Validate the request and start the run in the background. Must be called
    /// from within a Tokio runtime.
    pub fn start_run(
        &self,
        channel: &str,
        posts_limit: u32,
        keywords: KeywordSet,
    ) -> Result<RunHandle, CoreError> {
        let request = RunRequest::new(channel, posts_limit, keywords)?;
        self.enforce_capacity();

        let run_id = RunId::new();
        let (progress_tx, progress_rx) = watch::channel(RunProgress::default());
        let (finished_tx, finished_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let orchestrator = Orchestrator::new(
            run_id,
            request.clone(),
            self.retriever.clone(),
            KeywordMatcher::new(self.normalizer.clone(), &request.keywords),
            self.pacing.clone(),
            cancel.clone(),
            progress_tx,
            self.sink.clone(),
        );

        self.write_runs().insert(
            run_id,
            RunEntry {
                request,
                progress: progress_rx,
                finished: finished_rx,
                cancel,
            },
        );

        let task = tokio::spawn(async move {
            orchestrator
                .run(move |outcome| {
                    finished_tx.send_replace(Some(Finished {
                        outcome: outcome.clone(),
                        at: Instant::now(),
                    }));
                })
                .await;
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);

        info!("Started run {}", run_id);
        Ok(RunHandle(run_id))
    }

    pub fn get_progress(&self, handle: &RunHandle) -> Result<RunProgress, CoreError> {
        let runs = self.read_runs();
        let entry = runs.get(&handle.0).ok_or_else(|| Self::not_found(handle))?;
        let progress = entry.progress.borrow().clone();
        Ok(progress)
    }

    pub fn get_request(&self, handle: &RunHandle) -> Result<RunRequest, CoreError> {
        let runs = self.read_runs();
        runs.get(&handle.0)
            .map(|entry| entry.request.clone())
            .ok_or_else(|| Self::not_found(handle))
    }

    /// Terminal outcome, `None` while the run is still going.
    pub fn outcome(&self, handle: &RunHandle) -> Result<Option<RunOutcome>, CoreError> {
        let runs = self.read_runs();
        let entry = runs.get(&handle.0).ok_or_else(|| Self::not_found(handle))?;
        let outcome = entry.finished.borrow().as_ref().map(|f| f.outcome.clone());
        Ok(outcome)
    }

    pub fn get_result(&self, handle: &RunHandle) -> Result<RunResult, CoreError> {
        match self.outcome(handle)? {
            Some(RunOutcome::Done(result)) => Ok(result),
            Some(RunOutcome::Failed { failure, .. }) => Err(CoreError::RunFailed {
                code: failure.code,
                message: failure.message,
            }),
            Some(RunOutcome::Cancelled { .. }) => Err(CoreError::Cancelled),
            None => Err(CoreError::ResultNotReady {
                state: self.get_progress(handle)?.state.to_string(),
            }),
        }
    }

    /// Resolve once the run reaches a terminal state.
    pub async fn wait(&self, handle: &RunHandle) -> Result<RunOutcome, CoreError> {
        let mut finished = {
            let runs = self.read_runs();
            runs.get(&handle.0)
                .ok_or_else(|| Self::not_found(handle))?
                .finished
                .clone()
        };

        let done = finished
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CoreError::Internal {
                message: format!("run {} stopped without an outcome", handle),
            })?;

        match &*done {
            Some(finished) => Ok(finished.outcome.clone()),
            None => Err(CoreError::Internal {
                message: format!("run {} has no outcome", handle),
            }),
        }
    }

    /// Request cooperative cancellation. A finished run is left as it is.
    pub fn cancel(&self, handle: &RunHandle) -> Result<(), CoreError> {
        let runs = self.read_runs();
        let entry = runs.get(&handle.0).ok_or_else(|| Self::not_found(handle))?;
        if entry.finished_at().is_none() {
            info!("Cancelling run {}", handle);
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Drop terminal runs that finished at least `max_age` ago. Returns how many went.
    pub fn evict_finished(&self, max_age: Duration) -> usize {
        let mut runs = self.write_runs();
        let before = runs.len();
        runs.retain(|_, entry| match entry.finished_at() {
            Some(at) => at.elapsed() < max_age,
            None => true,
        });
        let evicted = before - runs.len();
        if evicted > 0 {
            debug!("Evicted {} finished runs", evicted);
        }
        evicted
    }

    /// Apply the configured age limit and cap on finished runs.
    pub fn enforce_capacity(&self) {
        self.evict_finished(Duration::from_secs(self.settings.finished_run_ttl_secs));

        let mut runs = self.write_runs();
        let mut finished: Vec<(RunId, Instant)> = runs
            .iter()
            .filter_map(|(id, entry)| entry.finished_at().map(|at| (*id, at)))
            .collect();

        if finished.len() > self.settings.max_finished_runs {
            finished.sort_by_key(|(_, at)| *at);
            let excess = finished.len() - self.settings.max_finished_runs;
            for (id, _) in finished.into_iter().take(excess) {
                runs.remove(&id);
            }
            debug!("Dropped {} oldest finished runs", excess);
        }
    }

    /// Wait for every started run task to return, including its final sink writes.
    /// Runs are not cancelled; call [`RunRegistry::cancel`] first to stop them early.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for task in tasks {
            if let Err(e) = task.await {
                warn!("Run task ended abnormally: {}", e);
            }
        }
    }

    pub fn run_count(&self) -> usize {
        self.read_runs().len()
    }

    pub fn active_runs(&self) -> Vec<RunHandle> {
        self.read_runs()
            .iter()
            .filter(|(_, entry)| entry.finished_at().is_none())
            .map(|(id, _)| RunHandle(*id))
            .collect()
    }
}
