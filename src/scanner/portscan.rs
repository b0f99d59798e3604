use crate::error::{ErrorStats, ScanError};
use crate::scanner::pool::WorkerPool;
use crate::scanner::probes::clean_banner;
use crate::scanner::rate_limit::RateLimiter;
use crate::scanner::service_detect::ServiceDetector;
use crate::scanner::{deadline_token, tcp_connect, timestamp, DEFAULT_DEADLINE};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PortScanConfig {
    pub targets: Vec<String>,
    pub ports: Vec<u16>,
    pub workers: usize,
    pub timeout: Duration,
    /// 每秒连接数。
    pub rate_limit: f64,
    pub service_detect: bool,
    pub deep: bool,
    pub deadline: Duration,
}

impl Default for PortScanConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            ports: Vec::new(),
            workers: 300,
            timeout: Duration::from_secs(3),
            rate_limit: 1000.0,
            service_detect: false,
            deep: false,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortResult {
    pub host: String,
    pub port: u16,
    pub open: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub banner: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub product: String,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
struct ScanJob {
    host: Arc<str>,
    port: u16,
}

#[derive(Clone)]
pub struct PortScanner {
    config: Arc<PortScanConfig>,
    limiter: Arc<RateLimiter>,
    detector: Arc<ServiceDetector>,
}

impl PortScanner {
    pub fn new(mut config: PortScanConfig) -> Result<Self, ScanError> {
        if config.targets.is_empty() {
            return Err(ScanError::InvalidTarget("未指定扫描目标".to_string()));
        }
        if config.ports.is_empty() {
            return Err(ScanError::InvalidPortRange("端口列表为空".to_string()));
        }

        let defaults = PortScanConfig::default();
        if config.workers == 0 {
            config.workers = defaults.workers;
        }
        if config.timeout.is_zero() {
            config.timeout = defaults.timeout;
        }
        if config.rate_limit <= 0.0 {
            config.rate_limit = defaults.rate_limit;
        }
        if config.deadline.is_zero() {
            config.deadline = defaults.deadline;
        }

        let limiter = RateLimiter::new(config.rate_limit, config.rate_limit.ceil() as usize);
        let detector = ServiceDetector::new(config.timeout);

        Ok(Self {
            config: Arc::new(config),
            limiter: Arc::new(limiter),
            detector: Arc::new(detector),
        })
    }

    pub fn config(&self) -> &PortScanConfig {
        &self.config
    }

    pub fn total_jobs(&self) -> usize {
        self.config.targets.len() * self.config.ports.len()
    }

    pub async fn scan(&self) -> Result<Vec<PortResult>, ScanError> {
        self.scan_with_cancel(&CancellationToken::new()).await
    }

    /// 只返回开放端口，按主机与端口排序。
    pub async fn scan_with_cancel(&self, parent: &CancellationToken) -> Result<Vec<PortResult>, ScanError> {
        if parent.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let cancel = deadline_token(parent, self.config.deadline);
        let _guard = cancel.clone().drop_guard();

        let start = Instant::now();
        let total = self.total_jobs();
        let workers = self.config.workers.min(total.max(1));
        let stats = Arc::new(Mutex::new(ErrorStats::new()));

        let hosts: Vec<Arc<str>> = self.config.targets.iter().map(|h| Arc::from(h.as_str())).collect();
        let ports = &self.config.ports;
        let jobs = hosts
            .iter()
            .flat_map(|host| ports.iter().map(move |&port| ScanJob { host: Arc::clone(host), port }));

        let scanner = self.clone();
        let job_stats = Arc::clone(&stats);
        let pool = WorkerPool::new(workers, workers * 2, cancel.clone());
        let mut results = pool
            .run(jobs, move |ctx, job: ScanJob| {
                let scanner = scanner.clone();
                let stats = Arc::clone(&job_stats);
                async move {
                    scanner.limiter.wait(&ctx.cancel).await.ok()?;
                    let scanned = tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => return None,
                        res = scanner.scan_port(&job.host, job.port) => res,
                    };
                    match scanned {
                        Ok(result) => Some(result),
                        Err(e) => {
                            stats.lock().record(&e);
                            None
                        }
                    }
                }
            })
            .await;

        results.sort_by(|a, b| a.host.cmp(&b.host).then(a.port.cmp(&b.port)));

        if cancel.is_cancelled() && !parent.is_cancelled() {
            warn!(open = results.len(), "端口扫描达到截止时间，返回已完成部分");
        }
        info!(
            jobs = total,
            open = results.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            errors = %stats.lock().summary(),
            "端口扫描完成"
        );
        Ok(results)
    }

    /// 扫描单个端口。连接失败以错误返回，调用方据此丢弃关闭端口。
    pub async fn scan_port(&self, host: &str, port: u16) -> Result<PortResult, ScanError> {
        let stream = tcp_connect::connect(host, port, self.config.timeout).await?;
        drop(stream);

        let mut result = PortResult {
            host: host.to_string(),
            port,
            open: true,
            service: String::new(),
            banner: String::new(),
            version: String::new(),
            product: String::new(),
            timestamp: timestamp(),
        };

        if self.config.deep {
            let info = self.detector.detect(host, port).await;
            result.service = info.name;
            result.version = info.version;
            result.product = info.product;
            result.banner = clean_banner(&info.banner);
        } else if self.config.service_detect {
            let (service, banner) = self.detector.identify(host, port).await;
            result.service = service;
            result.banner = banner.map(|b| clean_banner(&b)).unwrap_or_default();
        }

        debug!(host = host, port = port, service = %result.service, "发现开放端口");
        Ok(result)
    }

    /// 与 scan_port 相同，但关闭端口返回 open=false 的结果。
    pub async fn check_port(&self, host: &str, port: u16) -> PortResult {
        match self.scan_port(host, port).await {
            Ok(result) => result,
            Err(_) => PortResult {
                host: host.to_string(),
                port,
                open: false,
                service: String::new(),
                banner: String::new(),
                version: String::new(),
                product: String::new(),
                timestamp: timestamp(),
            },
        }
    }
}
