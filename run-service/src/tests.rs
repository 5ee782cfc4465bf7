use crate::{RunHandle, RunRegistry};
use async_trait::async_trait;
use harvester_core::{
    ChannelRef, CoreError, KeywordMode, KeywordSet, PacingConfig, Post, RawComment,
    RegistrySettings, RunId, RunOutcome, RunProgress, RunRequest, RunSink, RunState,
    TelegramApiError,
};
use morphology::DictionaryNormalizer;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use telegram_client::{
    ChannelInfo, ChannelSource, CommentPage, CommentRetriever, PostPage, RetrieverConfig,
};
use tokio::time::Instant;

/// In-memory channel. Successful reads are stateless, scripted failures are consumed once.
#[derive(Default)]
struct FakeChannel {
    posts: Vec<Post>,
    comments: HashMap<i64, Vec<RawComment>>,
    connect_failure: Option<TelegramApiError>,
    resolve_failure: Option<TelegramApiError>,
    /// Username the platform reports, when it differs from the requested spelling
    canonical_username: Option<String>,
    post_failures: Mutex<HashMap<i64, VecDeque<TelegramApiError>>>,
}

impl FakeChannel {
    fn with_post(mut self, id: i64, comments: Vec<RawComment>) -> Self {
        self.posts.push(Post {
            id,
            date: None,
            reply_count: comments.len() as u32,
        });
        self.comments.insert(id, comments);
        self
    }

    fn failing_post(self, id: i64, failures: Vec<TelegramApiError>) -> Self {
        self.post_failures
            .lock()
            .unwrap()
            .insert(id, failures.into());
        self
    }
}

#[async_trait]
impl ChannelSource for FakeChannel {
    async fn connect(&self) -> Result<(), CoreError> {
        match &self.connect_failure {
            Some(e) => Err(e.clone().into()),
            None => Ok(()),
        }
    }

    async fn resolve_channel(&self, channel: &ChannelRef) -> Result<ChannelInfo, CoreError> {
        if let Some(e) = &self.resolve_failure {
            return Err(e.clone().into());
        }
        Ok(ChannelInfo {
            id: 1,
            username: Some(
                self.canonical_username
                    .clone()
                    .unwrap_or_else(|| channel.username().to_string()),
            ),
            title: "Test channel".to_string(),
            participants_count: None,
        })
    }

    async fn fetch_post_page(
        &self,
        _channel: &ChannelRef,
        offset_id: Option<i64>,
        limit: u32,
    ) -> Result<PostPage, CoreError> {
        // Posts are listed newest first, the offset is the last id already seen
        let start = match offset_id {
            Some(offset) => self
                .posts
                .iter()
                .position(|p| p.id == offset)
                .map_or(self.posts.len(), |i| i + 1),
            None => 0,
        };
        let posts: Vec<Post> = self
            .posts
            .iter()
            .skip(start)
            .take(limit as usize)
            .cloned()
            .collect();
        let next_offset = posts.last().map(|p| p.id);
        Ok(PostPage { posts, next_offset })
    }

    async fn fetch_comment_page(
        &self,
        _channel: &ChannelRef,
        post_id: i64,
        _offset_id: Option<i64>,
        _page_size: u32,
    ) -> Result<CommentPage, CoreError> {
        if let Some(failure) = self
            .post_failures
            .lock()
            .unwrap()
            .get_mut(&post_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(failure.into());
        }
        Ok(CommentPage {
            comments: self.comments.get(&post_id).cloned().unwrap_or_default(),
            anonymous: 0,
            next_offset: None,
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl RunSink for RecordingSink {
    async fn run_started(&self, _run_id: RunId, request: &RunRequest) -> Result<(), CoreError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("started {}", request.channel));
        Ok(())
    }

    async fn progress_updated(&self, _run_id: RunId, progress: &RunProgress) -> Result<(), CoreError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("progress {}", progress.state));
        Ok(())
    }

    async fn run_finished(&self, _run_id: RunId, outcome: &RunOutcome) -> Result<(), CoreError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("finished {}", outcome.state()));
        Ok(())
    }
}

/// Takes its time writing the final record.
#[derive(Default)]
struct SlowSink {
    finished_written: Mutex<bool>,
}

#[async_trait]
impl RunSink for SlowSink {
    async fn run_started(&self, _run_id: RunId, _request: &RunRequest) -> Result<(), CoreError> {
        Ok(())
    }

    async fn progress_updated(&self, _run_id: RunId, _progress: &RunProgress) -> Result<(), CoreError> {
        Ok(())
    }

    async fn run_finished(&self, _run_id: RunId, _outcome: &RunOutcome) -> Result<(), CoreError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        *self.finished_written.lock().unwrap() = true;
        Ok(())
    }
}

struct BrokenSink;

#[async_trait]
impl RunSink for BrokenSink {
    async fn run_started(&self, _run_id: RunId, _request: &RunRequest) -> Result<(), CoreError> {
        Err(CoreError::Internal {
            message: "disk full".to_string(),
        })
    }

    async fn progress_updated(&self, _run_id: RunId, _progress: &RunProgress) -> Result<(), CoreError> {
        Err(CoreError::Internal {
            message: "disk full".to_string(),
        })
    }

    async fn run_finished(&self, _run_id: RunId, _outcome: &RunOutcome) -> Result<(), CoreError> {
        Err(CoreError::Internal {
            message: "disk full".to_string(),
        })
    }
}

fn comment(post_id: i64, author_id: i64, text: &str) -> RawComment {
    RawComment {
        post_id,
        comment_id: post_id * 1000 + author_id,
        author_id,
        author_name: format!("Автор {}", author_id),
        author_handle: Some(format!("author{}", author_id)),
        text: text.to_string(),
        is_bot: false,
        date: None,
    }
}

fn bot(post_id: i64, author_id: i64, text: &str) -> RawComment {
    RawComment {
        is_bot: true,
        ..comment(post_id, author_id, text)
    }
}

fn registry(source: FakeChannel) -> RunRegistry {
    registry_with(source, RegistrySettings::default())
}

/// The dictionary is loaded once for the whole test binary.
fn dictionary() -> Arc<DictionaryNormalizer> {
    static DICTIONARY: OnceLock<Arc<DictionaryNormalizer>> = OnceLock::new();
    DICTIONARY
        .get_or_init(|| Arc::new(DictionaryNormalizer::russian()))
        .clone()
}

fn registry_with(source: FakeChannel, settings: RegistrySettings) -> RunRegistry {
    let retriever = CommentRetriever::new(Arc::new(source), RetrieverConfig::default());
    RunRegistry::new(
        Arc::new(retriever),
        dictionary(),
        PacingConfig::default(),
        settings,
    )
}

fn any(keywords: &[&str]) -> KeywordSet {
    KeywordSet::new(keywords.iter().copied(), KeywordMode::Any)
}

async fn finish(registry: &RunRegistry, handle: &RunHandle) -> RunOutcome {
    registry.wait(handle).await.expect("run has an outcome")
}

#[tokio::test(start_paused = true)]
async fn test_first_occurrence_wins_across_posts() {
    let source = FakeChannel::default()
        .with_post(
            1,
            vec![
                comment(1, 1, "Хочу купить билет"),
                comment(1, 2, "Где купить?"),
            ],
        )
        .with_post(2, vec![])
        .with_post(3, vec![comment(3, 1, "Куплю ещё один")]);
    let registry = registry(source);

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    finish(&registry, &handle).await;
    let result = registry.get_result(&handle).unwrap();

    assert_eq!(result.posts_checked, 3);
    assert_eq!(result.posts_with_comments, 2);
    assert_eq!(result.total_comments, 3);
    assert_eq!(result.matched_comments, 3);
    assert_eq!(result.unique_author_count, 2);
    let ids: Vec<i64> = result.authors.iter().map(|a| a.author_id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(result.authors[0].first_comment_text, "Хочу купить билет");
    assert_eq!(result.authors[0].post_url, "https://t.me/okkosport/1");
}

#[tokio::test(start_paused = true)]
async fn test_bots_never_reach_the_result() {
    let source = FakeChannel::default().with_post(
        1,
        vec![
            bot(1, 99, "Купить билет тут"),
            comment(1, 5, "Хочу купить"),
        ],
    );
    let registry = registry(source);

    let handle = registry.start_run("okkosport", 30, any(&["купить"])).unwrap();
    finish(&registry, &handle).await;
    let result = registry.get_result(&handle).unwrap();

    assert_eq!(result.skipped_bots, 1);
    assert_eq!(result.total_comments, 1);
    assert!(result.authors.iter().all(|a| a.author_id != 99));
    assert_eq!(result.unique_author_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_every_post_with_replies_counts_as_commented() {
    let source = FakeChannel::default()
        .with_post(1, vec![bot(1, 99, "Купить билет тут")])
        .with_post(2, vec![comment(2, 5, "Хочу купить")])
        .with_post(3, vec![]);
    let registry = registry(source);

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    finish(&registry, &handle).await;
    let result = registry.get_result(&handle).unwrap();

    // The bot-only post still had replies
    assert_eq!(result.posts_with_comments, 2);
    assert_eq!(result.posts_checked, 3);
    assert_eq!(result.total_comments, 1);
    assert_eq!(result.skipped_bots, 1);
}

#[tokio::test(start_paused = true)]
async fn test_post_links_use_the_resolved_username() {
    let source = FakeChannel {
        canonical_username: Some("okkosport".to_string()),
        ..Default::default()
    }
    .with_post(1, vec![comment(1, 1, "Куплю")]);
    let registry = registry(source);

    let handle = registry
        .start_run("https://t.me/OkkoSport", 30, any(&["купить"]))
        .unwrap();
    finish(&registry, &handle).await;
    let result = registry.get_result(&handle).unwrap();

    assert_eq!(result.channel.username(), "okkosport");
    assert_eq!(result.authors[0].post_url, "https://t.me/okkosport/1");
    // The request keeps what the user typed
    assert_eq!(
        registry.get_request(&handle).unwrap().channel.username(),
        "OkkoSport"
    );
}

#[tokio::test(start_paused = true)]
async fn test_repeated_flood_wait_skips_the_post() {
    let flood = TelegramApiError::FloodWait { retry_after: 5 };
    let source = FakeChannel::default()
        .with_post(1, vec![comment(1, 1, "купить")])
        .with_post(2, vec![comment(2, 2, "купить")])
        .failing_post(1, vec![flood.clone(), flood]);
    let registry = registry(source);

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    let outcome = finish(&registry, &handle).await;

    assert_eq!(outcome.state(), RunState::Done);
    let result = registry.get_result(&handle).unwrap();
    assert_eq!(result.skipped_posts, 1);
    assert_eq!(result.posts_checked, 2);
    let ids: Vec<i64> = result.authors.iter().map(|a| a.author_id).collect();
    assert_eq!(ids, vec![2]);
}

#[tokio::test(start_paused = true)]
async fn test_single_flood_wait_is_not_an_error() {
    let source = FakeChannel::default()
        .with_post(1, vec![comment(1, 1, "купить")])
        .failing_post(1, vec![TelegramApiError::FloodWait { retry_after: 5 }]);
    let registry = registry(source);

    let started = Instant::now();
    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    finish(&registry, &handle).await;
    let result = registry.get_result(&handle).unwrap();

    assert_eq!(result.skipped_posts, 0);
    assert_eq!(result.unique_author_count, 1);
    // Five seconds of flood wait plus one second of pacing
    assert!(started.elapsed() >= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_transient_failures_skip_the_post() {
    let server_error = TelegramApiError::ServerError { status_code: 502 };
    let source = FakeChannel::default()
        .with_post(1, vec![comment(1, 1, "купить")])
        .with_post(2, vec![comment(2, 2, "купить")])
        .failing_post(1, vec![server_error; 4]);
    let registry = registry(source);

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    finish(&registry, &handle).await;
    let result = registry.get_result(&handle).unwrap();

    assert_eq!(result.skipped_posts, 1);
    assert_eq!(result.unique_author_count, 1);
    assert_eq!(result.authors[0].author_id, 2);
}

#[tokio::test(start_paused = true)]
async fn test_two_runs_over_unchanged_data_agree() {
    let source = FakeChannel::default()
        .with_post(
            1,
            vec![
                comment(1, 3, "Куплю два билета"),
                comment(1, 1, "Ничего интересного"),
            ],
        )
        .with_post(2, vec![comment(2, 2, "Покупать или купить?")]);
    let registry = registry(source);
    let keywords = KeywordSet::new(["купить", "билет"], KeywordMode::All);

    let first = registry.start_run("@okkosport", 30, keywords.clone()).unwrap();
    finish(&registry, &first).await;
    let second = registry.start_run("@okkosport", 30, keywords).unwrap();
    finish(&registry, &second).await;

    let mut a = registry.get_result(&first).unwrap();
    let mut b = registry.get_result(&second).unwrap();
    a.elapsed = Duration::ZERO;
    b.elapsed = Duration::ZERO;
    assert_eq!(a, b);
    assert_eq!(a.unique_author_count, 1);
    assert_eq!(a.authors[0].author_id, 3);
}

#[tokio::test(start_paused = true)]
async fn test_empty_keyword_set_keeps_every_comment() {
    let source = FakeChannel::default().with_post(
        1,
        vec![comment(1, 1, ""), comment(1, 2, "123"), comment(1, 3, "Привет")],
    );
    let registry = registry(source);

    let handle = registry.start_run("@okkosport", 30, KeywordSet::empty()).unwrap();
    finish(&registry, &handle).await;
    let result = registry.get_result(&handle).unwrap();

    assert_eq!(result.matched_comments, 3);
    assert_eq!(result.unique_author_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_channel_without_posts_is_done() {
    let registry = registry(FakeChannel::default());

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    finish(&registry, &handle).await;
    let result = registry.get_result(&handle).unwrap();

    assert_eq!(result.posts_checked, 0);
    assert!(result.authors.is_empty());
    let progress = registry.get_progress(&handle).unwrap();
    assert_eq!(progress.state, RunState::Done);
    assert_eq!(progress.percent_complete(), 100);
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_fails_the_run() {
    let source = FakeChannel {
        connect_failure: Some(TelegramApiError::AuthenticationFailed {
            reason: "bad code".to_string(),
        }),
        ..Default::default()
    }
    .with_post(1, vec![comment(1, 1, "купить")]);
    let registry = registry(source);

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    let outcome = finish(&registry, &handle).await;

    match outcome {
        RunOutcome::Failed { failure, progress } => {
            assert_eq!(failure.code, "TG_AUTH_FAILED");
            assert!(progress.incomplete);
            assert_eq!(progress.state, RunState::Failed);
        }
        other => panic!("Expected failed run, got {:?}", other),
    }
    assert!(matches!(
        registry.get_result(&handle),
        Err(CoreError::RunFailed { code, .. }) if code == "TG_AUTH_FAILED"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_private_channel_fails_the_run() {
    let source = FakeChannel {
        resolve_failure: Some(TelegramApiError::ChannelInaccessible {
            channel: "okkosport".to_string(),
        }),
        ..Default::default()
    };
    let registry = registry(source);

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    let outcome = finish(&registry, &handle).await;

    assert_eq!(outcome.state(), RunState::Failed);
    assert!(matches!(
        registry.get_result(&handle),
        Err(CoreError::RunFailed { code, .. }) if code == "TG_CHANNEL_PRIVATE"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_request_never_starts() {
    let registry = registry(FakeChannel::default());

    assert!(matches!(
        registry.start_run("", 30, any(&["купить"])),
        Err(CoreError::Config(_))
    ));
    assert!(matches!(
        registry.start_run("@okkosport", 0, any(&["купить"])),
        Err(CoreError::Config(_))
    ));
    assert_eq!(registry.run_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_result_not_ready_while_running() {
    let registry = registry(FakeChannel::default().with_post(1, vec![comment(1, 1, "купить")]));

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    assert!(matches!(
        registry.get_result(&handle),
        Err(CoreError::ResultNotReady { .. })
    ));
    assert!(registry.outcome(&handle).unwrap().is_none());
    assert_eq!(registry.active_runs(), vec![handle]);

    finish(&registry, &handle).await;
    assert!(registry.get_result(&handle).is_ok());
    assert!(registry.active_runs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_between_posts() {
    let source = FakeChannel::default()
        .with_post(1, vec![comment(1, 1, "купить")])
        .with_post(2, vec![comment(2, 2, "купить")])
        .with_post(3, vec![comment(3, 3, "купить")]);
    let registry = registry(source);

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    // The first post is done and the run is pacing
    tokio::time::sleep(Duration::from_millis(500)).await;
    registry.cancel(&handle).unwrap();

    match finish(&registry, &handle).await {
        RunOutcome::Cancelled { progress } => {
            assert!(progress.incomplete);
            assert_eq!(progress.posts_checked, 1);
            assert_eq!(progress.posts_total, 3);
        }
        other => panic!("Expected cancelled run, got {:?}", other),
    }
    assert!(matches!(
        registry.get_result(&handle),
        Err(CoreError::Cancelled)
    ));
    // Cancelling a finished run is a no-op
    assert!(registry.cancel(&handle).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_heavy_posts_get_extra_pacing() {
    let heavy: Vec<RawComment> = (1..=150).map(|author| comment(2, author, "текст")).collect();
    let source = FakeChannel::default()
        .with_post(1, vec![comment(1, 1, "текст")])
        .with_post(2, heavy);
    let registry = registry(source);

    let started = Instant::now();
    let handle = registry.start_run("@okkosport", 30, KeywordSet::empty()).unwrap();
    finish(&registry, &handle).await;
    let elapsed = started.elapsed();

    // One second after each post plus two for the heavy one
    assert!(elapsed >= Duration::from_secs(4), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(4100), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_sink_sees_the_whole_lifecycle() {
    let sink = Arc::new(RecordingSink::default());
    let registry = registry(FakeChannel::default().with_post(1, vec![comment(1, 1, "купить")]))
        .with_sink(sink.clone());

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    finish(&registry, &handle).await;
    registry.shutdown().await;

    let events = sink.events.lock().unwrap().clone();
    assert_eq!(events.first().map(String::as_str), Some("started @okkosport"));
    assert_eq!(events.last().map(String::as_str), Some("finished done"));
    assert!(events.iter().any(|e| e == "progress processing_post"));
    assert!(events.iter().any(|e| e == "progress deduplicating"));
}

#[tokio::test(start_paused = true)]
async fn test_result_is_ready_once_done_is_published() {
    let sink = Arc::new(SlowSink::default());
    let registry = registry(FakeChannel::default().with_post(1, vec![comment(1, 1, "купить")]))
        .with_sink(sink.clone());

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    while registry.get_progress(&handle).unwrap().state != RunState::Done {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The final sink write is still sleeping
    assert!(!*sink.finished_written.lock().unwrap());
    assert_eq!(registry.get_result(&handle).unwrap().unique_author_count, 1);

    registry.shutdown().await;
    assert!(*sink.finished_written.lock().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_broken_sink_does_not_affect_the_result() {
    let registry = registry(FakeChannel::default().with_post(1, vec![comment(1, 1, "купить")]))
        .with_sink(Arc::new(BrokenSink));

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    let outcome = finish(&registry, &handle).await;

    assert_eq!(outcome.state(), RunState::Done);
    assert_eq!(registry.get_result(&handle).unwrap().unique_author_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_evict_finished_runs() {
    let registry = registry(FakeChannel::default());

    let handle = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    finish(&registry, &handle).await;

    assert_eq!(registry.evict_finished(Duration::from_secs(60)), 0);
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(registry.evict_finished(Duration::from_secs(60)), 1);
    assert!(matches!(
        registry.get_progress(&handle),
        Err(CoreError::NotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_finished_run_cap_drops_the_oldest() {
    let settings = RegistrySettings {
        max_finished_runs: 1,
        ..Default::default()
    };
    let registry = registry_with(FakeChannel::default(), settings);

    let first = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    finish(&registry, &first).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let second = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    finish(&registry, &second).await;

    let third = registry.start_run("@okkosport", 30, any(&["купить"])).unwrap();
    assert!(registry.get_progress(&first).is_err());
    assert!(registry.get_progress(&second).is_ok());
    assert!(registry.get_progress(&third).is_ok());
}
