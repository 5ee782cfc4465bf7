//! Comment retrieval on top of a raw upstream source.

use crate::api::ChannelInfo;
use crate::retry::{RetryConfig, RetryExecutor};
use async_trait::async_trait;
use harvester_core::{ChannelRef, CoreError, Post, RawComment, TelegramConfig, MAX_PAGE_SIZE};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One page of replies as delivered by the upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentPage {
    pub comments: Vec<RawComment>,
    /// Replies without a user behind them
    pub anonymous: u64,
    pub next_offset: Option<i64>,
}

/// One page of channel history, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub next_offset: Option<i64>,
}

/// Raw upstream capability. Implementations perform exactly one request per call.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    async fn connect(&self) -> Result<(), CoreError>;

    async fn resolve_channel(&self, channel: &ChannelRef) -> Result<ChannelInfo, CoreError>;

    /// Up to `limit` posts older than `offset_id`, or the newest ones without an offset.
    async fn fetch_post_page(
        &self,
        channel: &ChannelRef,
        offset_id: Option<i64>,
        limit: u32,
    ) -> Result<PostPage, CoreError>;

    async fn fetch_comment_page(
        &self,
        channel: &ChannelRef,
        post_id: i64,
        offset_id: Option<i64>,
        page_size: u32,
    ) -> Result<CommentPage, CoreError>;
}

/// Comments of one post with automated and anonymous authors removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentBatch {
    pub comments: Vec<RawComment>,
    pub skipped_bots: u64,
    pub skipped_anonymous: u64,
}

#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub page_size: u32,
    pub max_comments_per_post: usize,
    pub retry: RetryConfig,
}

impl RetrieverConfig {
    pub fn new(telegram: &TelegramConfig, retry: RetryConfig) -> Self {
        Self {
            page_size: telegram.comments_page_size.clamp(1, MAX_PAGE_SIZE),
            max_comments_per_post: telegram.max_comments_per_post as usize,
            retry,
        }
    }
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self::new(&TelegramConfig::default(), RetryConfig::default())
    }
}

/// Applies the request policy (flood waits, backoff, cancellation) to a [`ChannelSource`].
pub struct CommentRetriever {
    source: Arc<dyn ChannelSource>,
    executor: RetryExecutor,
    page_size: u32,
    max_comments_per_post: usize,
}

impl CommentRetriever {
    pub fn new(source: Arc<dyn ChannelSource>, config: RetrieverConfig) -> Self {
        Self {
            source,
            executor: RetryExecutor::new(config.retry),
            page_size: config.page_size,
            max_comments_per_post: config.max_comments_per_post,
        }
    }

    pub fn retry_metrics(&self) -> crate::retry::RetryMetrics {
        self.executor.get_metrics()
    }

    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), CoreError> {
        let source = self.source.as_ref();
        self.executor
            .execute("connect", cancel, move || source.connect())
            .await
    }

    pub async fn resolve_channel(
        &self,
        channel: &ChannelRef,
        cancel: &CancellationToken,
    ) -> Result<ChannelInfo, CoreError> {
        let source = self.source.as_ref();
        self.executor
            .execute("resolve channel", cancel, move || {
                source.resolve_channel(channel)
            })
            .await
    }

    /// Up to `limit` most recent posts, newest first. Each page is retried on its
    /// own, so a flood wait never refetches pages already received.
    pub async fn fetch_posts(
        &self,
        channel: &ChannelRef,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<Post>, CoreError> {
        let source = self.source.as_ref();
        let limit = limit as usize;
        let mut posts: Vec<Post> = Vec::new();
        let mut offset_id: Option<i64> = None;

        while posts.len() < limit {
            let page_size = (limit - posts.len()).min(MAX_PAGE_SIZE as usize) as u32;
            let page = self
                .executor
                .execute("fetch posts", cancel, move || {
                    source.fetch_post_page(channel, offset_id, page_size)
                })
                .await?;

            if page.posts.is_empty() {
                break;
            }
            posts.extend(page.posts);

            match page.next_offset {
                Some(next) if Some(next) != offset_id => offset_id = Some(next),
                _ => break,
            }
        }

        posts.truncate(limit);
        info!("Fetched {} posts from {}", posts.len(), channel);
        Ok(posts)
    }

    /// Every comment of `post` in platform order, up to the per-post ceiling.
    pub async fn fetch_comments(
        &self,
        channel: &ChannelRef,
        post: &Post,
        cancel: &CancellationToken,
    ) -> Result<CommentBatch, CoreError> {
        let source = self.source.as_ref();
        let page_size = self.page_size;
        let post_id = post.id;
        let mut batch = CommentBatch::default();
        let mut fetched = 0usize;
        let mut offset_id: Option<i64> = None;

        loop {
            let page = self
                .executor
                .execute("fetch comments", cancel, move || {
                    source.fetch_comment_page(channel, post_id, offset_id, page_size)
                })
                .await?;

            let page_len = page.comments.len() as u64 + page.anonymous;
            batch.skipped_anonymous += page.anonymous;
            for comment in page.comments {
                if fetched >= self.max_comments_per_post {
                    break;
                }
                fetched += 1;
                if comment.is_bot {
                    batch.skipped_bots += 1;
                } else {
                    batch.comments.push(comment);
                }
            }

            if fetched >= self.max_comments_per_post {
                debug!(
                    "Post {} reached the ceiling of {} comments",
                    post_id, self.max_comments_per_post
                );
                break;
            }

            match page.next_offset {
                Some(next) if page_len > 0 && Some(next) != offset_id => offset_id = Some(next),
                _ => break,
            }
        }

        debug!(
            "Post {}: {} comments, {} bots skipped, {} anonymous skipped",
            post_id,
            batch.comments.len(),
            batch.skipped_bots,
            batch.skipped_anonymous
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_core::TelegramApiError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn comment(post_id: i64, id: i64, author: i64, bot: bool) -> RawComment {
        RawComment {
            post_id,
            comment_id: id,
            author_id: author,
            author_name: format!("user{}", author),
            author_handle: None,
            text: format!("comment {}", id),
            is_bot: bot,
            date: None,
        }
    }

    /// Serves pages keyed by offset and records every call. Channel history
    /// is `history` posts with ids counting down from `history`.
    #[derive(Default)]
    struct PagedSource {
        pages: HashMap<Option<i64>, CommentPage>,
        calls: Mutex<Vec<(Option<i64>, u32)>>,
        history: i64,
        post_calls: Mutex<Vec<(Option<i64>, u32)>>,
    }

    impl PagedSource {
        fn with_history(history: i64) -> Self {
            Self {
                history,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ChannelSource for PagedSource {
        async fn connect(&self) -> Result<(), CoreError> {
            Ok(())
        }

        async fn resolve_channel(&self, channel: &ChannelRef) -> Result<ChannelInfo, CoreError> {
            Ok(ChannelInfo {
                id: 1,
                username: Some(channel.username().to_string()),
                title: "Test".to_string(),
                participants_count: None,
            })
        }

        async fn fetch_post_page(
            &self,
            _channel: &ChannelRef,
            offset_id: Option<i64>,
            limit: u32,
        ) -> Result<PostPage, CoreError> {
            self.post_calls.lock().unwrap().push((offset_id, limit));
            let newest = offset_id.map_or(self.history, |offset| offset - 1);
            let posts: Vec<Post> = (1..=newest)
                .rev()
                .take(limit as usize)
                .map(|id| Post {
                    id,
                    date: None,
                    reply_count: 1,
                })
                .collect();
            let next_offset = posts.last().map(|p| p.id);
            Ok(PostPage { posts, next_offset })
        }

        async fn fetch_comment_page(
            &self,
            _channel: &ChannelRef,
            _post_id: i64,
            offset_id: Option<i64>,
            page_size: u32,
        ) -> Result<CommentPage, CoreError> {
            self.calls.lock().unwrap().push((offset_id, page_size));
            self.pages
                .get(&offset_id)
                .cloned()
                .ok_or(CoreError::TelegramApi(TelegramApiError::PostNotFound { post_id: 0 }))
        }
    }

    fn channel() -> ChannelRef {
        ChannelRef::parse("@test").unwrap()
    }

    fn post(id: i64) -> Post {
        Post {
            id,
            date: None,
            reply_count: 3,
        }
    }

    fn retriever(source: Arc<PagedSource>, max: usize) -> CommentRetriever {
        CommentRetriever::new(
            source,
            RetrieverConfig {
                page_size: 2,
                max_comments_per_post: max,
                retry: RetryConfig::default(),
            },
        )
    }

    #[tokio::test]
    async fn test_walks_pages_and_filters_bots() {
        let mut source = PagedSource::default();
        source.pages.insert(
            None,
            CommentPage {
                comments: vec![comment(1, 1, 10, false), comment(1, 2, 11, true)],
                anonymous: 0,
                next_offset: Some(2),
            },
        );
        source.pages.insert(
            Some(2),
            CommentPage {
                comments: vec![comment(1, 3, 12, false)],
                anonymous: 1,
                next_offset: None,
            },
        );
        let source = Arc::new(source);
        let cancel = CancellationToken::new();

        let batch = retriever(source.clone(), 10_000)
            .fetch_comments(&channel(), &post(1), &cancel)
            .await
            .unwrap();

        let ids: Vec<i64> = batch.comments.iter().map(|c| c.comment_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(batch.skipped_bots, 1);
        assert_eq!(batch.skipped_anonymous, 1);
        assert!(batch.comments.iter().all(|c| !c.is_bot));
        assert_eq!(*source.calls.lock().unwrap(), vec![(None, 2), (Some(2), 2)]);
    }

    #[tokio::test]
    async fn test_stops_at_ceiling() {
        let mut source = PagedSource::default();
        source.pages.insert(
            None,
            CommentPage {
                comments: vec![comment(1, 1, 10, false), comment(1, 2, 11, false)],
                anonymous: 0,
                next_offset: Some(2),
            },
        );
        let source = Arc::new(source);
        let cancel = CancellationToken::new();

        let batch = retriever(source.clone(), 1)
            .fetch_comments(&channel(), &post(1), &cancel)
            .await
            .unwrap();

        assert_eq!(batch.comments.len(), 1);
        assert_eq!(source.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_page_ends_pagination() {
        let mut source = PagedSource::default();
        source.pages.insert(
            None,
            CommentPage {
                comments: vec![],
                anonymous: 0,
                next_offset: Some(7),
            },
        );
        let source = Arc::new(source);
        let cancel = CancellationToken::new();

        let batch = retriever(source.clone(), 100)
            .fetch_comments(&channel(), &post(1), &cancel)
            .await
            .unwrap();

        assert!(batch.comments.is_empty());
        assert_eq!(source.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_posts_respects_limit() {
        let source = Arc::new(PagedSource::with_history(5));
        let cancel = CancellationToken::new();

        let posts = retriever(source.clone(), 100)
            .fetch_posts(&channel(), 3, &cancel)
            .await
            .unwrap();

        let ids: Vec<i64> = posts.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(*source.post_calls.lock().unwrap(), vec![(None, 3)]);
    }

    #[tokio::test]
    async fn test_fetch_posts_pages_through_history() {
        let source = Arc::new(PagedSource::with_history(250));
        let cancel = CancellationToken::new();

        let posts = retriever(source.clone(), 100)
            .fetch_posts(&channel(), 150, &cancel)
            .await
            .unwrap();

        assert_eq!(posts.len(), 150);
        assert_eq!(posts.first().map(|p| p.id), Some(250));
        assert_eq!(posts.last().map(|p| p.id), Some(101));
        assert_eq!(
            *source.post_calls.lock().unwrap(),
            vec![(None, MAX_PAGE_SIZE), (Some(151), 50)]
        );
    }

    #[tokio::test]
    async fn test_short_history_ends_post_paging() {
        let source = Arc::new(PagedSource::with_history(4));
        let cancel = CancellationToken::new();

        let posts = retriever(source.clone(), 100)
            .fetch_posts(&channel(), 10, &cancel)
            .await
            .unwrap();

        assert_eq!(posts.len(), 4);
        // Second request finds nothing older than post 1
        assert_eq!(
            *source.post_calls.lock().unwrap(),
            vec![(None, 10), (Some(1), 6)]
        );
    }

    #[test]
    fn test_page_size_is_clamped() {
        let config = RetrieverConfig::new(
            &TelegramConfig {
                comments_page_size: 500,
                ..Default::default()
            },
            RetryConfig::default(),
        );
        assert_eq!(config.page_size, MAX_PAGE_SIZE);
        assert_eq!(config.max_comments_per_post, 10_000);
    }
}
