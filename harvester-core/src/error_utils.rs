use crate::error::*;
use std::time::Duration;
use tracing::{error, warn};

pub trait ErrorExt {
    fn log_error(&self) -> &Self;
    fn log_warn(&self) -> &Self;
    fn is_retryable(&self) -> bool;
    /// Errors that end the whole run rather than the current request.
    fn is_fatal(&self) -> bool;
    fn retry_after(&self) -> Option<Duration>;
    fn user_friendly_message(&self) -> String;
    fn error_code(&self) -> String;
}

impl ErrorExt for CoreError {
    fn log_error(&self) -> &Self {
        error!("CoreError: {}", self);
        match self {
            CoreError::TelegramApi(e) => {
                error!("Telegram API error details: {:?}", e);
            }
            CoreError::Database(e) => {
                error!("Database error details: {:?}", e);
            }
            CoreError::Config(e) => {
                error!("Configuration error details: {:?}", e);
            }
            _ => {}
        }
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("CoreError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        match self {
            CoreError::TelegramApi(e) => e.is_retryable(),
            CoreError::Database(e) => e.is_retryable(),
            CoreError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            CoreError::Timeout { .. } => true,
            _ => false,
        }
    }

    fn is_fatal(&self) -> bool {
        match self {
            CoreError::TelegramApi(e) => e.is_fatal(),
            CoreError::Config(_) => true,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::TelegramApi(e) => e.retry_after(),
            CoreError::Timeout { seconds } => Some(Duration::from_secs(*seconds)),
            _ if self.is_retryable() => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            CoreError::TelegramApi(e) => e.user_friendly_message(),
            CoreError::Database(e) => e.user_friendly_message(),
            CoreError::Config(e) => e.user_friendly_message(),
            CoreError::Network(_) => {
                "Network connection error. Please check your internet connection.".to_string()
            }
            CoreError::InvalidInput { message } => format!("Invalid input: {}", message),
            CoreError::Timeout { .. } => {
                "The operation took too long to complete. Please try again.".to_string()
            }
            CoreError::NotFound { resource } => format!("Could not find: {}", resource),
            CoreError::ResultNotReady { state } => {
                format!("The run has not finished yet (currently {}).", state)
            }
            CoreError::RunFailed { message, .. } => format!("The run failed: {}", message),
            CoreError::Cancelled => "The run was cancelled.".to_string(),
            _ => "An unexpected error occurred. Please try again later.".to_string(),
        }
    }

    fn error_code(&self) -> String {
        match self {
            CoreError::TelegramApi(e) => e.error_code(),
            CoreError::Database(_) => "DATABASE".to_string(),
            CoreError::Config(_) => "CONFIG".to_string(),
            CoreError::Io(_) => "IO".to_string(),
            CoreError::Serialization(_) => "SERIALIZATION".to_string(),
            CoreError::Network(_) => "NETWORK".to_string(),
            CoreError::InvalidInput { .. } => "INVALID_INPUT".to_string(),
            CoreError::Timeout { .. } => "TIMEOUT".to_string(),
            CoreError::NotFound { .. } => "NOT_FOUND".to_string(),
            CoreError::ResultNotReady { .. } => "RESULT_NOT_READY".to_string(),
            CoreError::RunFailed { code, .. } => code.clone(),
            CoreError::Cancelled => "CANCELLED".to_string(),
            CoreError::Internal { .. } => "INTERNAL".to_string(),
        }
    }
}

impl ErrorExt for TelegramApiError {
    fn log_error(&self) -> &Self {
        error!("TelegramApiError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("TelegramApiError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            TelegramApiError::FloodWait { .. }
                | TelegramApiError::RequestTimeout
                | TelegramApiError::ConnectionFailed { .. }
                | TelegramApiError::InvalidResponse { .. }
                | TelegramApiError::ServerError { .. }
        )
    }

    fn is_fatal(&self) -> bool {
        matches!(
            self,
            TelegramApiError::AuthenticationFailed { .. }
                | TelegramApiError::InvalidSession
                | TelegramApiError::ChannelInaccessible { .. }
                | TelegramApiError::ChannelNotFound { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            TelegramApiError::FloodWait { retry_after } => Some(Duration::from_secs(*retry_after)),
            _ if self.is_retryable() => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            TelegramApiError::AuthenticationFailed { .. } => {
                "Telegram authentication failed. Please check your API credentials.".to_string()
            }
            TelegramApiError::InvalidSession => {
                "Telegram session is invalid. Please sign in again.".to_string()
            }
            TelegramApiError::FloodWait { retry_after } => format!(
                "Too many requests. Telegram asks to wait {} seconds.",
                retry_after
            ),
            TelegramApiError::ChannelInaccessible { channel } => format!(
                "Channel {} is private or you are not subscribed.",
                channel
            ),
            TelegramApiError::ChannelNotFound { channel } => {
                format!("Channel {} does not exist or was deleted.", channel)
            }
            TelegramApiError::PostNotFound { post_id } => {
                format!("Post #{} could not be found.", post_id)
            }
            TelegramApiError::RequestTimeout => {
                "Request to Telegram timed out. Please try again.".to_string()
            }
            TelegramApiError::RetriesExhausted { operation, .. } => {
                format!("{} kept failing and was skipped.", operation)
            }
            _ => "Telegram API error occurred. Please try again later.".to_string(),
        }
    }

    fn error_code(&self) -> String {
        match self {
            TelegramApiError::AuthenticationFailed { .. } => "TG_AUTH_FAILED".to_string(),
            TelegramApiError::InvalidSession => "TG_INVALID_SESSION".to_string(),
            TelegramApiError::FloodWait { .. } => "TG_FLOOD_WAIT".to_string(),
            TelegramApiError::ChannelInaccessible { .. } => "TG_CHANNEL_PRIVATE".to_string(),
            TelegramApiError::ChannelNotFound { .. } => "TG_CHANNEL_NOT_FOUND".to_string(),
            TelegramApiError::PostNotFound { .. } => "TG_POST_NOT_FOUND".to_string(),
            TelegramApiError::RequestTimeout => "TG_TIMEOUT".to_string(),
            TelegramApiError::ConnectionFailed { .. } => "TG_CONNECTION_FAILED".to_string(),
            TelegramApiError::InvalidResponse { .. } => "TG_INVALID_RESPONSE".to_string(),
            TelegramApiError::ServerError { .. } => "TG_SERVER_ERROR".to_string(),
            TelegramApiError::RepeatedFloodWait { .. } => "TG_REPEATED_FLOOD_WAIT".to_string(),
            TelegramApiError::RetriesExhausted { .. } => "TG_RETRIES_EXHAUSTED".to_string(),
        }
    }
}

impl ErrorExt for DatabaseError {
    fn log_error(&self) -> &Self {
        error!("DatabaseError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("DatabaseError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DatabaseError::DatabaseLocked | DatabaseError::ConnectionFailed { .. }
        )
    }

    fn is_fatal(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            DatabaseError::DatabaseLocked => Some(Duration::from_millis(100)),
            _ if self.is_retryable() => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            DatabaseError::ConnectionFailed { .. } => {
                "Database connection failed. Please try again.".to_string()
            }
            DatabaseError::DatabaseLocked => {
                "Database is temporarily busy. Please try again.".to_string()
            }
            _ => "Database error occurred. Please try again.".to_string(),
        }
    }

    fn error_code(&self) -> String {
        match self {
            DatabaseError::ConnectionFailed { .. } => "DB_CONNECTION_FAILED".to_string(),
            DatabaseError::MigrationFailed { .. } => "DB_MIGRATION_FAILED".to_string(),
            DatabaseError::QueryFailed { .. } => "DB_QUERY_FAILED".to_string(),
            DatabaseError::ConstraintViolation { .. } => "DB_CONSTRAINT_VIOLATION".to_string(),
            DatabaseError::DatabaseLocked => "DB_LOCKED".to_string(),
            DatabaseError::Sql(_) => "DB_SQL_ERROR".to_string(),
        }
    }
}

impl ErrorExt for ConfigError {
    fn log_error(&self) -> &Self {
        error!("ConfigError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("ConfigError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        false
    }

    fn is_fatal(&self) -> bool {
        true
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }

    fn user_friendly_message(&self) -> String {
        match self {
            ConfigError::FileNotFound { path } => {
                format!("Configuration file '{}' not found.", path)
            }
            ConfigError::InvalidFormat { .. } | ConfigError::Parse(_) => {
                "Configuration file format is invalid. Please check the settings.".to_string()
            }
            ConfigError::MissingField { field } => {
                format!("Required configuration field '{}' is missing.", field)
            }
            ConfigError::InvalidValue { field, .. } => {
                format!("Invalid value for configuration field '{}'.", field)
            }
            ConfigError::InvalidChannel { reference } => format!(
                "'{}' is not a public channel link. Use https://t.me/<name> or @<name>.",
                reference
            ),
            ConfigError::ValidationFailed { reason } => {
                format!("Configuration is not valid: {}", reason)
            }
        }
    }

    fn error_code(&self) -> String {
        match self {
            ConfigError::FileNotFound { .. } => "CONFIG_FILE_NOT_FOUND".to_string(),
            ConfigError::InvalidFormat { .. } => "CONFIG_INVALID_FORMAT".to_string(),
            ConfigError::MissingField { .. } => "CONFIG_MISSING_FIELD".to_string(),
            ConfigError::InvalidValue { .. } => "CONFIG_INVALID_VALUE".to_string(),
            ConfigError::InvalidChannel { .. } => "CONFIG_INVALID_CHANNEL".to_string(),
            ConfigError::ValidationFailed { .. } => "CONFIG_VALIDATION_FAILED".to_string(),
            ConfigError::Parse(_) => "CONFIG_PARSE_ERROR".to_string(),
        }
    }
}
