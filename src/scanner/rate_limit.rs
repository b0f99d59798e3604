use crate::error::ScanError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const DEFAULT_RATE: f64 = 10.0;

/// 令牌桶限速器，按流逝时间惰性补充令牌。
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_update = now;
    }

    fn wait_time(&self, n: f64) -> Duration {
        let missing = (n - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / self.rate)
    }
}

impl RateLimiter {
    /// rate 为每秒令牌数，burst 为桶容量；非正值回落到默认值。
    pub fn new(rate: f64, burst: usize) -> Self {
        let rate = if rate > 0.0 && rate.is_finite() { rate } else { DEFAULT_RATE };
        let burst = if burst == 0 { (rate as usize).max(1) } else { burst };
        let burst = burst as f64;

        Self {
            bucket: Mutex::new(TokenBucket {
                rate,
                burst,
                tokens: burst,
                last_update: Instant::now(),
            }),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    pub fn allow_n(&self, n: usize) -> bool {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());

        let n = n as f64;
        if bucket.tokens >= n {
            bucket.tokens -= n;
            true
        } else {
            false
        }
    }

    /// 阻塞直到取得一个令牌，或取消信号触发。
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), ScanError> {
        loop {
            let wait_time = {
                let mut bucket = self.bucket.lock();
                bucket.refill(Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                bucket.wait_time(1.0)
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                _ = tokio::time::sleep(wait_time) => {}
            }
        }
    }

    /// 立即占用一个令牌并返回调用方应等待的时长，不阻塞。
    pub fn reserve(&self) -> Duration {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Duration::ZERO;
        }

        let wait = bucket.wait_time(1.0);
        bucket.tokens = 0.0;
        wait
    }

    pub fn set_rate(&self, rate: f64) {
        if rate <= 0.0 || !rate.is_finite() {
            return;
        }
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.rate = rate;
    }

    pub fn set_burst(&self, burst: usize) {
        if burst == 0 {
            return;
        }
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.burst = burst as f64;
        bucket.tokens = bucket.tokens.min(bucket.burst);
    }

    pub fn rate(&self) -> f64 {
        self.bucket.lock().rate
    }

    pub fn burst(&self) -> usize {
        self.bucket.lock().burst as usize
    }

    pub fn tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens
    }
}

/// 可替换的节流器，探测器既可使用固定速率也可使用自适应速率。
#[async_trait]
pub trait Throttle: Send + Sync {
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), ScanError>;

    fn record_latency(&self, _latency: Duration) {}

    fn current_rate(&self) -> f64;
}

#[async_trait]
impl Throttle for RateLimiter {
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), ScanError> {
        RateLimiter::wait(self, cancel).await
    }

    fn current_rate(&self) -> f64 {
        self.rate()
    }
}

/// 按主机隔离的限速器集合，首次访问时按需创建。
#[derive(Debug)]
pub struct PerHostRateLimiter {
    rate: f64,
    burst: usize,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
}

impl PerHostRateLimiter {
    pub fn new(rate: f64, burst: usize) -> Self {
        Self {
            rate,
            burst,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    pub fn limiter(&self, host: &str) -> Arc<RateLimiter> {
        if let Some(limiter) = self.limiters.read().get(host) {
            return Arc::clone(limiter);
        }

        let mut limiters = self.limiters.write();
        // 获取写锁期间可能已被其他任务创建
        let limiter = limiters
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(self.rate, self.burst)));
        Arc::clone(limiter)
    }

    pub fn allow(&self, host: &str) -> bool {
        self.limiter(host).allow()
    }

    pub async fn wait(&self, host: &str, cancel: &CancellationToken) -> Result<(), ScanError> {
        self.limiter(host).wait(cancel).await
    }

    pub fn host_count(&self) -> usize {
        self.limiters.read().len()
    }
}
