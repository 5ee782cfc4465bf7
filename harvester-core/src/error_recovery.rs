//! Error recovery strategies for upstream requests.
//!
//! The retry executor asks [`ErrorRecovery::determine_strategy`] what to do with a
//! failed request, and the orchestrator asks [`ErrorRecovery::after_exhaustion`]
//! whether a request that finally failed ends the run or only the current post.

use crate::{CoreError, ErrorExt, TelegramApiError};
use std::time::Duration;

/// Recovery strategy for a single failed request
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryStrategy {
    /// Sleep exactly the upstream-mandated duration, then retry once
    WaitAndRetryOnce(Duration),
    /// Retry with exponential backoff, bounded by the retry budget
    RetryWithBackoff,
    /// Give up on this request, the run continues
    Skip,
    /// Give up on the whole run
    Fail,
}

pub struct ErrorRecovery;

impl ErrorRecovery {
    /// Determine the appropriate recovery strategy for a failed request
    pub fn determine_strategy(error: &CoreError) -> RecoveryStrategy {
        match error {
            CoreError::TelegramApi(TelegramApiError::FloodWait { retry_after }) => {
                RecoveryStrategy::WaitAndRetryOnce(Duration::from_secs(*retry_after))
            }
            CoreError::Cancelled => RecoveryStrategy::Fail,
            e if e.is_fatal() => RecoveryStrategy::Fail,
            e if e.is_retryable() => RecoveryStrategy::RetryWithBackoff,
            _ => RecoveryStrategy::Skip,
        }
    }

    /// Decide what a request failure that survived all retries means for the run
    pub fn after_exhaustion(error: &CoreError) -> RecoveryStrategy {
        match error {
            CoreError::Cancelled => RecoveryStrategy::Fail,
            e if e.is_fatal() => RecoveryStrategy::Fail,
            _ => RecoveryStrategy::Skip,
        }
    }
}
