use crate::error::ScanError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct CircuitStatus {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// 连续失败 max_failures 次后熔断，reset_timeout 后放行一次试探调用。
#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    status: Mutex<CircuitStatus>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            reset_timeout,
            status: Mutex::new(CircuitStatus {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ScanError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ScanError>>,
    {
        let guard = self.acquire()?;

        let result = operation().await;
        guard.disarm();
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    fn acquire(&self) -> Result<TrialGuard<'_>, ScanError> {
        let mut status = self.status.lock();
        self.transition(&mut status);

        match status.state {
            CircuitState::Closed => Ok(TrialGuard { breaker: self, armed: false }),
            CircuitState::Open => Err(ScanError::CircuitOpen),
            CircuitState::HalfOpen => {
                if status.trial_in_flight {
                    Err(ScanError::CircuitOpen)
                } else {
                    status.trial_in_flight = true;
                    Ok(TrialGuard { breaker: self, armed: true })
                }
            }
        }
    }

    fn abandon_trial(&self) {
        let mut status = self.status.lock();
        if status.state == CircuitState::HalfOpen && status.trial_in_flight {
            debug!("试探调用被取消，重新放行下一次试探");
            status.trial_in_flight = false;
        }
    }

    fn transition(&self, status: &mut CircuitStatus) {
        if status.state != CircuitState::Open {
            return;
        }
        let expired = status
            .opened_at
            .is_some_and(|opened| opened.elapsed() >= self.reset_timeout);
        if expired {
            debug!("熔断器进入半开状态");
            status.state = CircuitState::HalfOpen;
            status.trial_in_flight = false;
        }
    }

    fn on_success(&self) {
        let mut status = self.status.lock();
        if status.state == CircuitState::HalfOpen {
            debug!("试探调用成功，熔断器关闭");
        }
        status.state = CircuitState::Closed;
        status.failures = 0;
        status.opened_at = None;
        status.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut status = self.status.lock();
        status.trial_in_flight = false;

        match status.state {
            CircuitState::HalfOpen => self.open(&mut status),
            _ => {
                status.failures += 1;
                if status.failures >= self.max_failures {
                    self.open(&mut status);
                }
            }
        }
    }

    fn open(&self, status: &mut CircuitStatus) {
        debug!(failures = status.failures, "熔断器打开");
        status.state = CircuitState::Open;
        status.opened_at = Some(Instant::now());
    }

    pub fn state(&self) -> CircuitState {
        let mut status = self.status.lock();
        self.transition(&mut status);
        status.state
    }

    pub fn failures(&self) -> u32 {
        self.status.lock().failures
    }

    pub fn reset(&self) {
        self.on_success();
    }
}

/// 半开状态下的试探名额；调用未完成就被丢弃时归还名额。
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}

/// 按主机维护独立熔断器。
#[derive(Debug)]
pub struct HostBreakers {
    max_failures: u32,
    reset_timeout: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl HostBreakers {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures,
            reset_timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, host: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.max_failures, self.reset_timeout)));
        Arc::clone(breaker)
    }

    pub fn open_hosts(&self) -> Vec<String> {
        let breakers: Vec<(String, Arc<CircuitBreaker>)> = self
            .breakers
            .lock()
            .iter()
            .map(|(host, breaker)| (host.clone(), Arc::clone(breaker)))
            .collect();
        let mut hosts: Vec<String> = breakers
            .into_iter()
            .filter(|(_, breaker)| breaker.state() == CircuitState::Open)
            .map(|(host, _)| host)
            .collect();
        hosts.sort();
        hosts
    }
}
