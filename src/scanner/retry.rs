use crate::error::{ErrorKind, ScanError};
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_JITTER_FACTOR: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    /// 为空时所有错误均可重试。
    pub retryable: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: true,
            retryable: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    pub fn should_retry(&self, err: &ScanError) -> bool {
        self.retryable.is_empty() || self.retryable.contains(&err.kind())
    }

    fn normalized(&self) -> (Duration, Duration, f64) {
        let initial = if self.initial_delay.is_zero() {
            Duration::from_millis(100)
        } else {
            self.initial_delay
        };
        let max = if self.max_delay.is_zero() {
            Duration::from_secs(10)
        } else {
            self.max_delay
        };
        let factor = if self.backoff_factor > 0.0 { self.backoff_factor } else { 2.0 };
        (initial, max, factor)
    }
}

/// 最多执行 max_retries + 1 次，每次尝试前检查取消信号。
pub async fn retry_with_backoff<T, F, Fut>(
    cancel: &CancellationToken,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, ScanError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ScanError>>,
{
    let (mut delay, max_delay, factor) = config.normalized();
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt = attempt, "重试后成功");
                }
                return Ok(value);
            }
            Err(err) => {
                if !config.should_retry(&err) {
                    debug!(error = %err, "错误不可重试，放弃");
                    return Err(err);
                }
                debug!(
                    attempt = attempt,
                    max_retries = config.max_retries,
                    error = %err,
                    "操作失败"
                );
                last_error = Some(err);
            }
        }

        if attempt < config.max_retries {
            let wait = if config.jitter {
                jitter_duration(delay, DEFAULT_JITTER_FACTOR)
            } else {
                delay
            };
            sleep_or_cancel(cancel, wait).await?;
            delay = delay.mul_f64(factor).min(max_delay);
        }
    }

    let source = last_error.unwrap_or(ScanError::Cancelled);
    warn!(retries = config.max_retries, error = %source, "重试次数耗尽");
    Err(ScanError::RetriesExhausted {
        retries: config.max_retries,
        source: Box::new(source),
    })
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ScanError>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// 与 retry_with_backoff 相同，额外返回尝试次数与总耗时。
pub async fn retry_with_result<T, F, Fut>(
    cancel: &CancellationToken,
    config: &RetryConfig,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ScanError>>,
{
    let start = Instant::now();
    let mut attempts = 0;
    let result = retry_with_backoff(cancel, config, || {
        attempts += 1;
        operation()
    })
    .await;

    RetryOutcome {
        result,
        attempts,
        elapsed: start.elapsed(),
    }
}

/// base * 2^attempt，上限为 max。
pub fn exponential_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}

/// 在 [d*(1-factor), d*(1+factor)] 内随机抖动，factor 超出 (0, 1] 时取 0.3。
pub fn jitter_duration(duration: Duration, factor: f64) -> Duration {
    let factor = if factor > 0.0 && factor <= 1.0 { factor } else { DEFAULT_JITTER_FACTOR };
    let spread = duration.as_secs_f64() * factor;
    if spread <= 0.0 {
        return duration;
    }
    let delta = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((duration.as_secs_f64() + delta).max(0.0))
}

#[derive(Debug, Clone, Copy)]
enum Backoff {
    Linear { base: Duration },
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Backoff,
    retryable: Vec<ErrorKind>,
}

impl RetryPolicy {
    /// 第 n 次失败后等待 base * (n + 1)。
    pub fn linear(base: Duration) -> Self {
        Self {
            backoff: Backoff::Linear { base },
            retryable: Vec::new(),
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential { base, max },
            retryable: Vec::new(),
        }
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Linear { base } => base.saturating_mul(attempt.saturating_add(1)),
            Backoff::Exponential { base, max } => exponential_backoff(attempt, base, max),
        }
    }

    pub fn should_retry(&self, err: &ScanError) -> bool {
        if matches!(err, ScanError::Cancelled) {
            return false;
        }
        self.retryable.is_empty() || self.retryable.contains(&err.kind())
    }
}

pub async fn retry_with_policy<T, F, Fut>(
    cancel: &CancellationToken,
    max_retries: u32,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, ScanError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ScanError>>,
{
    let mut last_error = None;

    for attempt in 0..=max_retries {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !policy.should_retry(&err) => return Err(err),
            Err(err) => last_error = Some(err),
        }

        if attempt < max_retries {
            sleep_or_cancel(cancel, policy.delay(attempt)).await?;
        }
    }

    Err(ScanError::RetriesExhausted {
        retries: max_retries,
        source: Box::new(last_error.unwrap_or(ScanError::Cancelled)),
    })
}

async fn sleep_or_cancel(cancel: &CancellationToken, wait: Duration) -> Result<(), ScanError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ScanError::Cancelled),
        _ = tokio::time::sleep(wait) => Ok(()),
    }
}
