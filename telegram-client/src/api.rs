use crate::metrics::{MetricsCollector, RequestMetrics};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use chrono::{DateTime, Utc};
use harvester_core::{
    ChannelRef, CoreError, ErrorExt, Post, RawComment, TelegramApiError, TelegramConfig,
    TelegramCredentials, UNKNOWN_AUTHOR_NAME,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

/// Flood wait assumed when the gateway signals one without a duration.
const DEFAULT_FLOOD_WAIT_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize)]
struct SessionRequest<'a> {
    api_id: i32,
    api_hash: &'a str,
    phone: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionData {
    pub session: String,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: i64,
    pub username: Option<String>,
    pub title: String,
    pub participants_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePage<T> {
    pub messages: Vec<T>,
    /// Offset for the next page, absent on the last one
    pub next_offset: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostData {
    pub id: i64,
    /// Unix seconds
    pub date: Option<i64>,
    #[serde(default)]
    pub replies_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderData {
    pub id: i64,
    pub first_name: Option<String>,
    pub username: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyData {
    pub id: i64,
    pub date: Option<i64>,
    pub text: Option<String>,
    pub sender: Option<SenderData>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    retry_after: Option<u64>,
}

fn timestamp(seconds: Option<i64>) -> Option<DateTime<Utc>> {
    seconds.and_then(|s| DateTime::from_timestamp(s, 0))
}

impl From<PostData> for Post {
    fn from(post: PostData) -> Self {
        Self {
            id: post.id,
            date: timestamp(post.date),
            reply_count: post.replies_count,
        }
    }
}

impl ReplyData {
    /// `None` when the reply has no user behind it (anonymous admin, deleted account).
    pub fn into_comment(self, post_id: i64) -> Option<RawComment> {
        let sender = self.sender?;
        let author_name = sender
            .first_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_AUTHOR_NAME.to_string());

        Some(RawComment {
            post_id,
            comment_id: self.id,
            author_id: sender.id,
            author_name,
            author_handle: sender.username.filter(|handle| !handle.is_empty()),
            text: self.text.unwrap_or_default(),
            is_bot: sender.bot,
            date: timestamp(self.date),
        })
    }
}

/// What a request was about, used to turn HTTP statuses into typed errors.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    Session,
    Channel(&'a ChannelRef),
    Post(&'a ChannelRef, i64),
}

impl Resource<'_> {
    fn endpoint_family(&self) -> &'static str {
        match self {
            Resource::Session => "session",
            Resource::Channel(_) => "channel",
            Resource::Post(..) => "replies",
        }
    }
}

fn retry_after_from(headers: &HeaderMap, body: &Option<ErrorBody>) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .or_else(|| body.as_ref().and_then(|b| b.retry_after))
        .unwrap_or(DEFAULT_FLOOD_WAIT_SECS)
}

/// Map a non-success gateway status onto the upstream error taxonomy.
pub fn error_for_status(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    resource: Resource<'_>,
) -> TelegramApiError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let reason = parsed
        .as_ref()
        .and_then(|b| b.error.clone())
        .unwrap_or_else(|| status.to_string());

    match (status.as_u16(), resource) {
        // 420 is FLOOD_WAIT on the Telegram side
        (420 | 429, _) => TelegramApiError::FloodWait {
            retry_after: retry_after_from(headers, &parsed),
        },
        (401 | 403, Resource::Session) => TelegramApiError::AuthenticationFailed { reason },
        (401, _) => TelegramApiError::InvalidSession,
        (403, Resource::Channel(channel) | Resource::Post(channel, _)) => {
            TelegramApiError::ChannelInaccessible {
                channel: channel.to_string(),
            }
        }
        (404, Resource::Channel(channel)) => TelegramApiError::ChannelNotFound {
            channel: channel.to_string(),
        },
        (404, Resource::Post(_, post_id)) => TelegramApiError::PostNotFound { post_id },
        (code, _) if status.is_server_error() => TelegramApiError::ServerError { status_code: code },
        _ => TelegramApiError::InvalidResponse {
            details: format!("unexpected status {}: {}", status, reason),
        },
    }
}

#[derive(Debug)]
pub struct TelegramApiClient {
    http_client: Client,
    base_url: Url,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
}

impl TelegramApiClient {
    pub fn new(config: &TelegramConfig) -> Result<Self, CoreError> {
        let base_url = Url::parse(&config.gateway_url).map_err(|e| CoreError::InvalidInput {
            message: format!("invalid gateway URL '{}': {}", config.gateway_url, e),
        })?;

        let http_client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http_client,
            base_url,
            rate_limiter: Arc::new(RateLimiter::new(RateLimitConfig::telegram(
                config.requests_per_minute,
            ))),
            metrics: Arc::new(MetricsCollector::new()),
        })
    }

    fn endpoint_url(&self, segments: &[&str]) -> Result<Url, CoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CoreError::InvalidInput {
                message: format!("gateway URL '{}' cannot be a base", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn make_request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        session: Option<&str>,
        query_params: &[(&str, String)],
        body: Option<&B>,
        resource: Resource<'_>,
    ) -> Result<Response, CoreError> {
        let url = self.endpoint_url(segments)?;
        let endpoint = resource.endpoint_family();
        let start_time = Instant::now();

        // Held until the response arrives: one request in flight per session
        let permit = self.rate_limiter.acquire_permit().await?;
        debug!(
            "Acquired rate limit permit for {} {} after {:?}",
            method,
            url.path(),
            permit.queue_wait_time
        );

        let mut request_builder = self.http_client.request(method.clone(), url.clone());
        if let Some(session) = session {
            request_builder = request_builder.bearer_auth(session);
        }
        if !query_params.is_empty() {
            request_builder = request_builder.query(query_params);
        }
        if let Some(body) = body {
            request_builder = request_builder.json(body);
        }

        debug!("Telegram gateway request: {} {}", method, url.path());
        let outcome = match request_builder.send().await {
            Ok(response) if response.status().is_success() => Ok(response),
            Ok(response) => {
                let status = response.status();
                let headers = response.headers().clone();
                let text = response.text().await.unwrap_or_default();
                let api_error = error_for_status(status, &headers, &text, resource);
                error!("Request {} {} failed with {}: {}", method, url.path(), status, api_error);
                Err(CoreError::TelegramApi(api_error))
            }
            Err(e) if e.is_timeout() => {
                warn!("Request {} {} timed out", method, url.path());
                Err(CoreError::TelegramApi(TelegramApiError::RequestTimeout))
            }
            Err(e) if e.is_connect() => {
                warn!("Cannot reach gateway for {} {}: {}", method, url.path(), e);
                Err(CoreError::TelegramApi(TelegramApiError::ConnectionFailed {
                    reason: e.to_string(),
                }))
            }
            Err(e) => {
                error!("Network error for {} {}: {}", method, url.path(), e);
                Err(CoreError::Network(e))
            }
        };
        drop(permit);

        let status_code = match &outcome {
            Ok(response) => Some(response.status().as_u16()),
            Err(_) => None,
        };
        self.metrics
            .record_request(RequestMetrics {
                endpoint: endpoint.to_string(),
                status_code,
                response_time: start_time.elapsed(),
                success: outcome.is_ok(),
                flood_wait: matches!(
                    outcome,
                    Err(CoreError::TelegramApi(TelegramApiError::FloodWait { .. }))
                ),
                error_code: outcome.as_ref().err().map(|e| e.error_code()),
            })
            .await;

        outcome
    }

    async fn parse<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, CoreError> {
        response.json::<T>().await.map_err(|e| {
            error!("Failed to parse {}: {}", what, e);
            CoreError::TelegramApi(TelegramApiError::InvalidResponse {
                details: format!("Failed to parse {}", what),
            })
        })
    }

    pub async fn create_session(
        &self,
        credentials: &TelegramCredentials,
    ) -> Result<SessionData, CoreError> {
        let body = SessionRequest {
            api_id: credentials.api_id,
            api_hash: &credentials.api_hash,
            phone: &credentials.phone,
        };
        let response = self
            .make_request(
                Method::POST,
                &["auth", "session"],
                None,
                &[],
                Some(&body),
                Resource::Session,
            )
            .await?;

        let session: SessionData = Self::parse(response, "session").await?;
        info!("Telegram session established");
        Ok(session)
    }

    pub async fn get_channel(
        &self,
        session: &str,
        channel: &ChannelRef,
    ) -> Result<ChannelInfo, CoreError> {
        let response = self
            .make_request::<()>(
                Method::GET,
                &["channels", channel.username()],
                Some(session),
                &[],
                None,
                Resource::Channel(channel),
            )
            .await?;

        let info: ChannelInfo = Self::parse(response, "channel info").await?;
        debug!("Resolved {} to '{}' ({})", channel, info.title, info.id);
        Ok(info)
    }

    pub async fn get_posts(
        &self,
        session: &str,
        channel: &ChannelRef,
        limit: u32,
        offset_id: Option<i64>,
    ) -> Result<MessagePage<PostData>, CoreError> {
        let mut params = vec![("limit", limit.to_string())];
        if let Some(offset) = offset_id {
            params.push(("offset_id", offset.to_string()));
        }

        let response = self
            .make_request::<()>(
                Method::GET,
                &["channels", channel.username(), "messages"],
                Some(session),
                &params,
                None,
                Resource::Channel(channel),
            )
            .await?;

        let page: MessagePage<PostData> = Self::parse(response, "channel posts").await?;
        debug!("Retrieved {} posts from {}", page.messages.len(), channel);
        Ok(page)
    }

    pub async fn get_replies(
        &self,
        session: &str,
        channel: &ChannelRef,
        post_id: i64,
        limit: u32,
        offset_id: Option<i64>,
    ) -> Result<MessagePage<ReplyData>, CoreError> {
        let post = post_id.to_string();
        let mut params = vec![("limit", limit.to_string())];
        if let Some(offset) = offset_id {
            params.push(("offset_id", offset.to_string()));
        }

        let response = self
            .make_request::<()>(
                Method::GET,
                &["channels", channel.username(), "messages", &post, "replies"],
                Some(session),
                &params,
                None,
                Resource::Post(channel, post_id),
            )
            .await?;

        let page: MessagePage<ReplyData> = Self::parse(response, "replies").await?;
        debug!(
            "Retrieved {} replies for post {} of {}",
            page.messages.len(),
            post_id,
            channel
        );
        Ok(page)
    }

    pub async fn get_metrics(&self) -> crate::metrics::ApiMetrics {
        self.metrics.get_metrics().await
    }

    pub async fn get_rate_limit_status(&self) -> crate::rate_limiter::RateLimitStatus {
        self.rate_limiter.status().await
    }

    pub async fn reset_metrics(&self) {
        self.metrics.reset_metrics().await;
    }
}
