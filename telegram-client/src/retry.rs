use harvester_core::{
    CoreError, ErrorRecovery, RecoveryStrategy, RetrySettings, TelegramApiError,
};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// Base delay for exponential backoff (in milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Maximum jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay_ms: settings.base_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            backoff_multiplier: 2.0,
            jitter_factor: settings.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

/// Calculate delay with exponential backoff and jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = config.backoff_multiplier.powi(attempt as i32);
    let delay_ms = ((config.base_delay_ms as f64 * multiplier) as u64).min(config.max_delay_ms);

    let jitter_range = (delay_ms as f64 * config.jitter_factor) as u64;
    let jitter = if jitter_range > 0 {
        fastrand::u64(0..=jitter_range)
    } else {
        0
    };

    Duration::from_millis((delay_ms + jitter).min(config.max_delay_ms))
}

/// Retry metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct RetryMetrics {
    pub total_retries: u64,
    pub successful_retries: u64,
    pub failed_operations: u64,
    pub flood_waits: u64,
    pub total_delay_ms: u64,
}

/// Wraps single upstream requests with the flood-wait and backoff policy
#[derive(Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    metrics: Mutex<RetryMetrics>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            metrics: Mutex::new(RetryMetrics::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn update_metrics(&self, f: impl FnOnce(&mut RetryMetrics)) {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics);
    }

    /// Sleep unless the token fires first.
    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> Result<(), CoreError> {
        self.update_metrics(|m| m.total_delay_ms += delay.as_millis() as u64);
        tokio::select! {
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            _ = sleep(delay) => Ok(()),
        }
    }

    /// Execute an operation with retry logic.
    ///
    /// A flood wait is honoured once with exactly the signalled delay; a second
    /// one fails the request. Transient errors get `max_retries` backoff retries.
    pub async fn execute<F, Fut, T>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, CoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut retries = 0u32;
        let mut flood_waited: Option<u64> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(CoreError::Cancelled),
                result = operation() => result,
            };

            let error = match result {
                Ok(value) => {
                    if retries > 0 || flood_waited.is_some() {
                        self.update_metrics(|m| m.successful_retries += 1);
                        info!(
                            "Operation {} succeeded after {} retries",
                            operation_name,
                            retries + u32::from(flood_waited.is_some())
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            debug!("Attempt failed for {}: {}", operation_name, error);

            match ErrorRecovery::determine_strategy(&error) {
                RecoveryStrategy::WaitAndRetryOnce(delay) => {
                    if let Some(waited_secs) = flood_waited {
                        warn!(
                            "Second flood wait for {}, giving up on the request",
                            operation_name
                        );
                        self.update_metrics(|m| m.failed_operations += 1);
                        return Err(TelegramApiError::RepeatedFloodWait { waited_secs }.into());
                    }
                    flood_waited = Some(delay.as_secs());
                    self.update_metrics(|m| {
                        m.flood_waits += 1;
                        m.total_retries += 1;
                    });
                    warn!("Flood wait for {}: sleeping {:?}", operation_name, delay);
                    self.pause(delay, cancel).await?;
                }
                RecoveryStrategy::RetryWithBackoff if retries < self.config.max_retries => {
                    let delay = calculate_delay(retries, &self.config);
                    retries += 1;
                    self.update_metrics(|m| m.total_retries += 1);
                    info!(
                        "Retrying {} in {:?} (retry {}/{}) due to: {}",
                        operation_name, delay, retries, self.config.max_retries, error
                    );
                    self.pause(delay, cancel).await?;
                }
                RecoveryStrategy::RetryWithBackoff => {
                    self.update_metrics(|m| m.failed_operations += 1);
                    warn!(
                        "Operation {} failed after {} attempts",
                        operation_name,
                        retries + 1
                    );
                    return Err(TelegramApiError::RetriesExhausted {
                        operation: operation_name.to_string(),
                        attempts: retries + 1,
                        last_error: error.to_string(),
                    }
                    .into());
                }
                RecoveryStrategy::Skip | RecoveryStrategy::Fail => {
                    if !matches!(error, CoreError::Cancelled) {
                        self.update_metrics(|m| m.failed_operations += 1);
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Get current retry metrics
    pub fn get_metrics(&self) -> RetryMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset_metrics(&self) {
        self.update_metrics(|m| *m = RetryMetrics::default());
    }
}
