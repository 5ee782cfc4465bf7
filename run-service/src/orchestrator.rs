//! Drives one run from connection to the deduplicated author list.

use crate::dedup;
use harvester_core::{
    ChannelRef, CoreError, ErrorExt, ErrorRecovery, PacingConfig, Post, RawComment, RecoveryStrategy, RunFailure,
    RunId, RunOutcome, RunProgress, RunRequest, RunResult, RunSink, RunState,
};
use morphology::KeywordMatcher;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use telegram_client::CommentRetriever;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Orchestrator {
    run_id: RunId,
    request: RunRequest,
    retriever: Arc<CommentRetriever>,
    matcher: KeywordMatcher,
    pacing: PacingConfig,
    cancel: CancellationToken,
    progress_tx: watch::Sender<RunProgress>,
    sink: Option<Arc<dyn RunSink>>,
    progress: RunProgress,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        request: RunRequest,
        retriever: Arc<CommentRetriever>,
        matcher: KeywordMatcher,
        pacing: PacingConfig,
        cancel: CancellationToken,
        progress_tx: watch::Sender<RunProgress>,
        sink: Option<Arc<dyn RunSink>>,
    ) -> Self {
        Self {
            run_id,
            request,
            retriever,
            matcher,
            pacing,
            cancel,
            progress_tx,
            sink,
            progress: RunProgress::default(),
        }
    }

    /// Run to a terminal outcome. Never panics on upstream errors.
    ///
    /// `record_outcome` sees the outcome before the terminal state is published,
    /// so whoever observes that state can already read the result.
    pub async fn run<F>(mut self, record_outcome: F) -> RunOutcome
    where
        F: FnOnce(&RunOutcome) + Send,
    {
        let started = Instant::now();
        info!(
            "Run {} started for {} ({} posts, {} keywords, mode {})",
            self.run_id,
            self.request.channel,
            self.request.posts_limit,
            self.request.keywords.len(),
            self.request.keywords.mode()
        );

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.run_started(self.run_id, &self.request).await {
                e.log_warn();
            }
        }

        let outcome = match self.execute(started).await {
            Ok(result) => {
                info!(
                    "Run {} done in {:?}: {} unique authors from {} matched comments",
                    self.run_id, result.elapsed, result.unique_author_count, result.matched_comments
                );
                self.progress.state = RunState::Done;
                self.progress.current_post_id = None;
                RunOutcome::Done(result)
            }
            Err(CoreError::Cancelled) => {
                info!("Run {} cancelled", self.run_id);
                self.progress.state = RunState::Cancelled;
                self.progress.incomplete = true;
                RunOutcome::Cancelled {
                    progress: self.progress.clone(),
                }
            }
            Err(error) => {
                error.log_error();
                self.progress.state = RunState::Failed;
                self.progress.incomplete = true;
                RunOutcome::Failed {
                    failure: RunFailure {
                        code: error.error_code(),
                        message: error.user_friendly_message(),
                    },
                    progress: self.progress.clone(),
                }
            }
        };

        record_outcome(&outcome);
        self.publish().await;

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.run_finished(self.run_id, &outcome).await {
                e.log_warn();
            }
        }
        outcome
    }

    async fn execute(&mut self, started: Instant) -> Result<RunResult, CoreError> {
        let channel = self.request.channel.clone();

        self.set_state(RunState::Connecting).await;
        self.retriever.connect(&self.cancel).await?;

        self.set_state(RunState::FetchingPosts).await;
        let info = self.retriever.resolve_channel(&channel, &self.cancel).await?;
        // Post links use the name the platform reports
        let canonical = info
            .username
            .as_deref()
            .and_then(|name| ChannelRef::parse(name).ok())
            .unwrap_or_else(|| channel.clone());
        debug!("Channel {} resolved to {} '{}'", channel, canonical, info.title);

        let posts = self
            .retriever
            .fetch_posts(&channel, self.request.posts_limit, &self.cancel)
            .await?;
        self.progress.posts_total = posts.len() as u32;

        let mut matched: Vec<RawComment> = Vec::new();
        let mut authors_seen: HashSet<i64> = HashSet::new();

        for post in &posts {
            if self.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            self.progress.state = RunState::ProcessingPost;
            self.progress.current_post_id = Some(post.id);

            if post.has_comments() {
                self.progress.posts_with_comments += 1;
            } else {
                debug!("Post {} has no comments", post.id);
                self.progress.posts_checked += 1;
                self.publish().await;
                continue;
            }

            let fetched = self.process_post(post, &mut matched, &mut authors_seen).await?;
            self.progress.posts_checked += 1;
            self.publish().await;
            self.pace(fetched).await?;
        }

        self.progress.current_post_id = None;
        self.set_state(RunState::Deduplicating).await;
        let authors = dedup::first_occurrence(&matched, &canonical);

        Ok(RunResult {
            channel: canonical,
            posts_checked: self.progress.posts_checked,
            posts_with_comments: self.progress.posts_with_comments,
            total_comments: self.progress.total_comments,
            matched_comments: self.progress.matched_comments,
            unique_author_count: authors.len() as u64,
            skipped_posts: self.progress.skipped_posts,
            skipped_bots: self.progress.skipped_bots,
            elapsed: started.elapsed(),
            authors,
        })
    }

    /// Fetch and filter one post. Returns how many replies were fetched, for pacing.
    async fn process_post(
        &mut self,
        post: &Post,
        matched: &mut Vec<RawComment>,
        authors_seen: &mut HashSet<i64>,
    ) -> Result<usize, CoreError> {
        let batch = match self
            .retriever
            .fetch_comments(&self.request.channel, post, &self.cancel)
            .await
        {
            Ok(batch) => batch,
            Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
            Err(error) => match ErrorRecovery::after_exhaustion(&error) {
                RecoveryStrategy::Fail => return Err(error),
                _ => {
                    warn!("Skipping post {}: {}", post.id, error);
                    self.progress.skipped_posts += 1;
                    return Ok(0);
                }
            },
        };

        let fetched =
            batch.comments.len() + (batch.skipped_bots + batch.skipped_anonymous) as usize;
        self.progress.skipped_bots += batch.skipped_bots;
        if batch.comments.is_empty() {
            return Ok(fetched);
        }

        self.progress.total_comments += batch.comments.len() as u64;

        for comment in batch.comments {
            let result = self.matcher.evaluate(comment);
            if result.passed {
                self.progress.matched_comments += 1;
                authors_seen.insert(result.comment.author_id);
                matched.push(result.comment);
            }
        }
        self.progress.unique_authors = authors_seen.len() as u64;

        debug!(
            "Post {}: {} fetched, {} matched so far",
            post.id, fetched, self.progress.matched_comments
        );
        Ok(fetched)
    }

    /// Pause after a post; heavy posts get the extra delay on top.
    async fn pace(&self, fetched: usize) -> Result<(), CoreError> {
        let mut delay = Duration::from_millis(self.pacing.post_delay_ms);
        if fetched > self.pacing.heavy_post_threshold {
            delay += Duration::from_millis(self.pacing.heavy_post_extra_delay_ms);
        }
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(CoreError::Cancelled),
            _ = sleep(delay) => Ok(()),
        }
    }

    async fn set_state(&mut self, state: RunState) {
        self.progress.state = state;
        self.publish().await;
    }

    async fn publish(&self) {
        self.progress_tx.send_replace(self.progress.clone());
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.progress_updated(self.run_id, &self.progress).await {
                e.log_warn();
            }
        }
    }
}
