use crate::error::ScanError;
use crate::scanner::rate_limit::{RateLimiter, Throttle};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_SAMPLES: usize = 100;
const MIN_SAMPLES: usize = 10;

/// 根据观测到的响应延迟自动升降速率的限速器。
pub struct AdaptiveRateLimiter {
    limiter: RateLimiter,
    min_rate: f64,
    max_rate: f64,
    target_latency: Duration,
    samples: Mutex<VecDeque<Duration>>,
}

impl AdaptiveRateLimiter {
    pub fn new(initial_rate: f64, min_rate: f64, max_rate: f64, target_latency: Duration) -> Self {
        let min_rate = if min_rate > 0.0 { min_rate } else { 1.0 };
        let max_rate = max_rate.max(min_rate);
        let initial_rate = initial_rate.clamp(min_rate, max_rate);

        Self {
            limiter: RateLimiter::new(initial_rate, initial_rate.ceil() as usize),
            min_rate,
            max_rate,
            target_latency,
            samples: Mutex::new(VecDeque::with_capacity(MAX_SAMPLES)),
        }
    }

    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), ScanError> {
        self.limiter.wait(cancel).await
    }

    pub fn record_latency(&self, latency: Duration) {
        let average = {
            let mut samples = self.samples.lock();
            samples.push_back(latency);
            if samples.len() > MAX_SAMPLES {
                samples.pop_front();
            }
            if samples.len() < MIN_SAMPLES {
                return;
            }
            average(&samples)
        };

        self.adjust(average);
    }

    fn adjust(&self, average: Duration) {
        let current = self.limiter.rate();
        let target = self.target_latency;

        let new_rate = if average > target * 2 {
            (current * 0.5).max(self.min_rate)
        } else if average > target {
            (current * 0.8).max(self.min_rate)
        } else if average < target / 2 {
            (current * 1.2).min(self.max_rate)
        } else {
            current
        };

        if (new_rate - current).abs() > f64::EPSILON {
            let change = if new_rate > current { "↑" } else { "↓" };
            debug!(
                "🔄 调整速率: {:.1} {} {:.1} (平均延迟: {}ms, 目标: {}ms)",
                current,
                change,
                new_rate,
                average.as_millis(),
                target.as_millis()
            );
            self.limiter.set_rate(new_rate);
        }
    }

    pub fn current_rate(&self) -> f64 {
        self.limiter.rate()
    }

    pub fn average_latency(&self) -> Duration {
        let samples = self.samples.lock();
        average(&samples)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }
}

fn average(samples: &VecDeque<Duration>) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let total: Duration = samples.iter().sum();
    total / samples.len() as u32
}

#[async_trait]
impl Throttle for AdaptiveRateLimiter {
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), ScanError> {
        AdaptiveRateLimiter::wait(self, cancel).await
    }

    fn record_latency(&self, latency: Duration) {
        AdaptiveRateLimiter::record_latency(self, latency)
    }

    fn current_rate(&self) -> f64 {
        self.limiter.rate()
    }
}
