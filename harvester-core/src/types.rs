use crate::config::MAX_POSTS_LIMIT;
use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Display name used when the platform does not report one.
pub const UNKNOWN_AUTHOR_NAME: &str = "Unknown";

const TELEGRAM_HOSTS: [&str; 4] = ["t.me", "www.t.me", "telegram.me", "www.telegram.me"];
const MAX_USERNAME_LEN: usize = 32;

/// A validated public channel reference, stored as the bare username.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef(String);

impl ChannelRef {
    /// Accepts `https://t.me/name`, `t.me/name`, `@name` or a bare `name`.
    pub fn parse(reference: &str) -> Result<Self, ConfigError> {
        let trimmed = reference.trim();
        let invalid = || ConfigError::InvalidChannel {
            reference: reference.to_string(),
        };

        let username = if let Some(name) = trimmed.strip_prefix('@') {
            name.to_string()
        } else if trimmed.contains('/') {
            let with_scheme = if trimmed.contains("://") {
                trimmed.to_string()
            } else {
                format!("https://{}", trimmed)
            };
            let url = Url::parse(&with_scheme).map_err(|_| invalid())?;
            let host = url.host_str().ok_or_else(invalid)?;
            if !TELEGRAM_HOSTS.contains(&host) {
                return Err(invalid());
            }

            let mut segments = url
                .path_segments()
                .map(|segments| segments.filter(|s| !s.is_empty()).collect::<Vec<_>>())
                .unwrap_or_default()
                .into_iter();
            match segments.next() {
                // Web preview links look like t.me/s/<name>
                Some("s") => segments.next().ok_or_else(invalid)?.to_string(),
                Some(first) => first.to_string(),
                None => return Err(invalid()),
            }
        } else {
            trimmed.to_string()
        };

        if !is_valid_username(&username) {
            return Err(invalid());
        }

        Ok(Self(username))
    }

    pub fn username(&self) -> &str {
        &self.0
    }

    pub fn url(&self) -> String {
        format!("https://t.me/{}", self.0)
    }

    pub fn post_url(&self, post_id: i64) -> String {
        format!("https://t.me/{}/{}", self.0, post_id)
    }
}

fn is_valid_username(name: &str) -> bool {
    // Invite links (`+hash`, `joinchat/...`) point at private chats and are rejected here.
    if name.is_empty() || name.len() > MAX_USERNAME_LEN || name.eq_ignore_ascii_case("joinchat") {
        return false;
    }
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl FromStr for ChannelRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordMode {
    /// A comment passes when any keyword appears
    #[default]
    Any,
    /// A comment passes only when every keyword appears
    All,
}

impl FromStr for KeywordMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "or" => Ok(KeywordMode::Any),
            "all" | "and" => Ok(KeywordMode::All),
            other => Err(ConfigError::InvalidValue {
                field: "keyword_mode".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for KeywordMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeywordMode::Any => write!(f, "any"),
            KeywordMode::All => write!(f, "all"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyword(String);

impl Keyword {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered keywords plus the way they combine. Blank keywords never make it in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawKeywordSet")]
pub struct KeywordSet {
    keywords: Vec<Keyword>,
    mode: KeywordMode,
}

/// Wire shape of a [`KeywordSet`]; deserialization goes through [`KeywordSet::new`].
#[derive(Deserialize)]
struct RawKeywordSet {
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    mode: KeywordMode,
}

impl From<RawKeywordSet> for KeywordSet {
    fn from(raw: RawKeywordSet) -> Self {
        Self::new(raw.keywords, raw.mode)
    }
}

impl KeywordSet {
    pub fn new<I, S>(keywords: I, mode: KeywordMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_string())
            .filter(|k| !k.is_empty())
            .map(Keyword)
            .collect();
        Self { keywords, mode }
    }

    /// Parses a comma-separated list such as `"купить, продать"`.
    pub fn parse(list: &str, mode: KeywordMode) -> Self {
        Self::new(list.split(','), mode)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn mode(&self) -> KeywordMode {
        self.mode
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keyword> {
        self.keywords.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub date: Option<DateTime<Utc>>,
    /// Reply counter reported by the platform
    pub reply_count: u32,
}

impl Post {
    pub fn has_comments(&self) -> bool {
        self.reply_count > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawComment {
    pub post_id: i64,
    pub comment_id: i64,
    pub author_id: i64,
    pub author_name: String,
    pub author_handle: Option<String>,
    pub text: String,
    pub is_bot: bool,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub comment: RawComment,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueAuthor {
    pub author_id: i64,
    pub display_name: String,
    pub handle: Option<String>,
    pub first_comment_text: String,
    pub post_id: i64,
    pub post_url: String,
}

impl UniqueAuthor {
    pub fn from_comment(comment: &RawComment, channel: &ChannelRef) -> Self {
        Self {
            author_id: comment.author_id,
            display_name: comment.author_name.clone(),
            handle: comment.author_handle.clone(),
            first_comment_text: comment.text.clone(),
            post_id: comment.post_id,
            post_url: channel.post_url(comment.post_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Everything needed to start one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub channel: ChannelRef,
    pub posts_limit: u32,
    pub keywords: KeywordSet,
}

impl RunRequest {
    pub fn new(channel: &str, posts_limit: u32, keywords: KeywordSet) -> Result<Self, ConfigError> {
        if !(1..=MAX_POSTS_LIMIT).contains(&posts_limit) {
            return Err(ConfigError::InvalidValue {
                field: "posts_limit".to_string(),
                value: posts_limit.to_string(),
            });
        }
        Ok(Self {
            channel: ChannelRef::parse(channel)?,
            posts_limit,
            keywords,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Connecting,
    FetchingPosts,
    ProcessingPost,
    Deduplicating,
    Done,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed | RunState::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Connecting => "connecting",
            RunState::FetchingPosts => "fetching_posts",
            RunState::ProcessingPost => "processing_post",
            RunState::Deduplicating => "deduplicating",
            RunState::Done => "done",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Snapshot published after every post. Read by front ends, never by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub state: RunState,
    pub posts_total: u32,
    pub posts_checked: u32,
    pub posts_with_comments: u32,
    pub total_comments: u64,
    pub matched_comments: u64,
    pub unique_authors: u64,
    pub current_post_id: Option<i64>,
    pub skipped_posts: u32,
    pub skipped_bots: u64,
    /// Set when the run ended without a result
    pub incomplete: bool,
}

impl RunProgress {
    pub fn percent_complete(&self) -> u8 {
        if self.posts_total == 0 {
            return if self.state == RunState::Done { 100 } else { 0 };
        }
        let percent = u64::from(self.posts_checked) * 100 / u64::from(self.posts_total);
        percent.min(100) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub channel: ChannelRef,
    pub posts_checked: u32,
    pub posts_with_comments: u32,
    pub total_comments: u64,
    pub matched_comments: u64,
    pub unique_author_count: u64,
    pub skipped_posts: u32,
    pub skipped_bots: u64,
    pub elapsed: Duration,
    pub authors: Vec<UniqueAuthor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Done(RunResult),
    Failed {
        failure: RunFailure,
        progress: RunProgress,
    },
    Cancelled {
        progress: RunProgress,
    },
}

impl RunOutcome {
    pub fn state(&self) -> RunState {
        match self {
            RunOutcome::Done(_) => RunState::Done,
            RunOutcome::Failed { .. } => RunState::Failed,
            RunOutcome::Cancelled { .. } => RunState::Cancelled,
        }
    }

    pub fn result(&self) -> Option<&RunResult> {
        match self {
            RunOutcome::Done(result) => Some(result),
            _ => None,
        }
    }
}
