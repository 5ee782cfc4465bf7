pub mod api;
pub mod metrics;
pub mod rate_limiter;
pub mod retriever;
pub mod retry;


pub use api::{ChannelInfo, TelegramApiClient};
pub use retriever::{
    ChannelSource, CommentBatch, CommentPage, CommentRetriever, PostPage, RetrieverConfig,
};
pub use retry::{RetryConfig, RetryExecutor};

use async_trait::async_trait;
use harvester_core::{
    ChannelRef, CoreError, Post, TelegramApiError, TelegramConfig, TelegramCredentials,
};
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum AuthState {
    NotAuthenticated,
    Authenticated {
        session: String,
        since: SystemTime,
    },
    Failed {
        reason: String,
    },
}

/// Gateway-backed Telegram client. One session, shared by all runs.
pub struct TelegramClient {
    api: TelegramApiClient,
    credentials: TelegramCredentials,
    auth_state: RwLock<AuthState>,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig, credentials: TelegramCredentials) -> Result<Self, CoreError> {
        Ok(Self {
            api: TelegramApiClient::new(config)?,
            credentials,
            auth_state: RwLock::new(AuthState::NotAuthenticated),
        })
    }

    pub async fn get_auth_state(&self) -> AuthState {
        self.auth_state.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        matches!(*self.auth_state.read().await, AuthState::Authenticated { .. })
    }

    /// Session token of an established session.
    async fn session(&self) -> Result<String, CoreError> {
        match &*self.auth_state.read().await {
            AuthState::Authenticated { session, .. } => Ok(session.clone()),
            AuthState::NotAuthenticated => Err(TelegramApiError::AuthenticationFailed {
                reason: "Not authenticated. Connect first.".to_string(),
            }
            .into()),
            AuthState::Failed { reason } => Err(TelegramApiError::AuthenticationFailed {
                reason: reason.clone(),
            }
            .into()),
        }
    }

    /// Forget a session the gateway no longer accepts.
    async fn invalidate_on(&self, error: &CoreError) {
        if matches!(error, CoreError::TelegramApi(TelegramApiError::InvalidSession)) {
            warn!("Telegram session rejected, dropping it");
            *self.auth_state.write().await = AuthState::NotAuthenticated;
        }
    }

    pub async fn get_api_metrics(&self) -> metrics::ApiMetrics {
        self.api.get_metrics().await
    }

    pub async fn get_rate_limit_status(&self) -> rate_limiter::RateLimitStatus {
        self.api.get_rate_limit_status().await
    }
}

#[async_trait]
impl ChannelSource for TelegramClient {
    async fn connect(&self) -> Result<(), CoreError> {
        if self.is_authenticated().await {
            debug!("Reusing existing Telegram session");
            return Ok(());
        }

        match self.api.create_session(&self.credentials).await {
            Ok(session) => {
                info!(
                    "Authenticated as {}",
                    session
                        .user_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| self.credentials.phone.clone())
                );
                *self.auth_state.write().await = AuthState::Authenticated {
                    session: session.session,
                    since: SystemTime::now(),
                };
                Ok(())
            }
            Err(CoreError::TelegramApi(TelegramApiError::AuthenticationFailed { reason })) => {
                *self.auth_state.write().await = AuthState::Failed {
                    reason: reason.clone(),
                };
                Err(TelegramApiError::AuthenticationFailed { reason }.into())
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_channel(&self, channel: &ChannelRef) -> Result<ChannelInfo, CoreError> {
        let session = self.session().await?;
        let result = self.api.get_channel(&session, channel).await;
        if let Err(e) = &result {
            self.invalidate_on(e).await;
        }
        result
    }

    async fn fetch_post_page(
        &self,
        channel: &ChannelRef,
        offset_id: Option<i64>,
        limit: u32,
    ) -> Result<PostPage, CoreError> {
        let session = self.session().await?;
        let page = match self.api.get_posts(&session, channel, limit, offset_id).await {
            Ok(page) => page,
            Err(e) => {
                self.invalidate_on(&e).await;
                return Err(e);
            }
        };

        Ok(PostPage {
            posts: page.messages.into_iter().map(Post::from).collect(),
            next_offset: page.next_offset,
        })
    }

    async fn fetch_comment_page(
        &self,
        channel: &ChannelRef,
        post_id: i64,
        offset_id: Option<i64>,
        page_size: u32,
    ) -> Result<CommentPage, CoreError> {
        let session = self.session().await?;
        let page = match self
            .api
            .get_replies(&session, channel, post_id, page_size, offset_id)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.invalidate_on(&e).await;
                return Err(e);
            }
        };

        let total = page.messages.len();
        let comments: Vec<_> = page
            .messages
            .into_iter()
            .filter_map(|reply| reply.into_comment(post_id))
            .collect();

        Ok(CommentPage {
            anonymous: (total - comments.len()) as u64,
            comments,
            next_offset: page.next_offset,
        })
    }
}
