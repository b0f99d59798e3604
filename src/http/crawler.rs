use crate::error::{ErrorStats, ScanError};
use crate::http::extract::{classify_url, extract_forms_resolved, extract_js_endpoints, extract_links, is_same_host};
use crate::http::prober::{ProbeConfig, Prober, MAX_FETCH_BODY};
use crate::scanner::circuit_breaker::HostBreakers;
use crate::scanner::pool::{JobSender, WorkerPool};
use crate::scanner::rate_limit::{PerHostRateLimiter, RateLimiter};
use crate::scanner::seen::SeenSet;
use crate::scanner::{deadline_token, timestamp, DEFAULT_DEADLINE};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_CRAWL_USER_AGENT: &str = "TL-Recon/2.0";
const CRAWL_MAX_REDIRECTS: usize = 3;

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub start_urls: Vec<String>,
    pub max_depth: usize,
    pub max_urls: usize,
    pub workers: usize,
    pub timeout: Duration,
    pub rate_limit: f64,
    /// 单主机每秒请求数，0 表示不限制。
    pub host_rate_limit: f64,
    pub same_host: bool,
    pub js_parse: bool,
    pub user_agent: String,
    pub breaker_failures: u32,
    pub breaker_reset: Duration,
    pub deadline: Duration,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            start_urls: Vec::new(),
            max_depth: 3,
            max_urls: 1000,
            workers: 20,
            timeout: Duration::from_secs(10),
            rate_limit: 50.0,
            host_rate_limit: 0.0,
            same_host: false,
            js_parse: false,
            user_agent: DEFAULT_CRAWL_USER_AGENT.to_string(),
            breaker_failures: 5,
            breaker_reset: Duration::from_secs(30),
            deadline: DEFAULT_DEADLINE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlResult {
    pub url: String,
    pub source: String,
    pub depth: usize,
    /// page、form、api、js、css
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    pub timestamp: String,
}

impl CrawlResult {
    fn new(url: impl Into<String>, source: &str, depth: usize, kind: &str) -> Self {
        Self {
            url: url.into(),
            source: source.to_string(),
            depth,
            kind: kind.to_string(),
            params: Vec::new(),
            method: String::new(),
            timestamp: timestamp(),
        }
    }
}

#[derive(Debug, Clone)]
struct CrawlJob {
    url: String,
    depth: usize,
    /// 种子 URL 的主机，用于同主机过滤。
    root: Arc<str>,
}

/// 单次运行的共享状态。
struct CrawlRun {
    seen: SeenSet,
    breakers: HostBreakers,
    pending: AtomicUsize,
    fetched: AtomicUsize,
    results: Mutex<Vec<CrawlResult>>,
    stats: Mutex<ErrorStats>,
    done: CancellationToken,
}

impl CrawlRun {
    fn push(&self, result: CrawlResult) {
        self.results.lock().push(result);
    }

    /// 任务计数归零即全部完成。
    fn finish_job(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.cancel();
        }
    }

    fn enqueue(&self, sender: &JobSender<CrawlJob>, job: CrawlJob) -> bool {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if sender.try_submit(job) {
            return true;
        }
        self.finish_job();
        false
    }
}

#[derive(Clone)]
pub struct Crawler {
    config: Arc<CrawlConfig>,
    prober: Prober,
    limiter: Arc<RateLimiter>,
    host_limiter: Option<Arc<PerHostRateLimiter>>,
}

impl Crawler {
    pub fn new(mut config: CrawlConfig) -> Result<Self, ScanError> {
        let defaults = CrawlConfig::default();
        if config.max_depth == 0 {
            config.max_depth = defaults.max_depth;
        }
        if config.max_urls == 0 {
            config.max_urls = defaults.max_urls;
        }
        if config.workers == 0 {
            config.workers = defaults.workers;
        }
        if config.timeout.is_zero() {
            config.timeout = defaults.timeout;
        }
        if config.rate_limit <= 0.0 {
            config.rate_limit = defaults.rate_limit;
        }
        if config.user_agent.is_empty() {
            config.user_agent = defaults.user_agent;
        }
        if config.breaker_failures == 0 {
            config.breaker_failures = defaults.breaker_failures;
        }
        if config.breaker_reset.is_zero() {
            config.breaker_reset = defaults.breaker_reset;
        }
        if config.deadline.is_zero() {
            config.deadline = defaults.deadline;
        }

        config.start_urls = config
            .start_urls
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(|u| {
                if u.starts_with("http://") || u.starts_with("https://") {
                    u.to_string()
                } else {
                    format!("https://{}", u)
                }
            })
            .collect();
        if config.start_urls.is_empty() {
            return Err(ScanError::InvalidTarget("未指定起始 URL".to_string()));
        }

        let prober = Prober::new(ProbeConfig {
            workers: config.workers,
            timeout: config.timeout,
            follow_redirects: true,
            max_redirects: CRAWL_MAX_REDIRECTS,
            tls_verify: false,
            retries: 0,
            rate_limit: config.rate_limit,
            user_agent: config.user_agent.clone(),
            deadline: config.deadline,
            ..ProbeConfig::default()
        })?;
        let limiter = RateLimiter::new(config.rate_limit, config.rate_limit.ceil() as usize);
        let host_limiter = (config.host_rate_limit > 0.0).then(|| {
            Arc::new(PerHostRateLimiter::new(
                config.host_rate_limit,
                config.host_rate_limit.ceil() as usize,
            ))
        });

        Ok(Self {
            config: Arc::new(config),
            prober,
            limiter: Arc::new(limiter),
            host_limiter,
        })
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    pub async fn crawl(&self) -> Result<Vec<CrawlResult>, ScanError> {
        self.crawl_with_cancel(&CancellationToken::new()).await
    }

    /// 广度受限的爬取：达到深度或 URL 上限即停止扩展，队列排空后结束。
    pub async fn crawl_with_cancel(&self, parent: &CancellationToken) -> Result<Vec<CrawlResult>, ScanError> {
        if parent.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let cancel = deadline_token(parent, self.config.deadline);
        let _guard = cancel.clone().drop_guard();
        let start = Instant::now();

        let run = Arc::new(CrawlRun {
            seen: SeenSet::new(),
            breakers: HostBreakers::new(self.config.breaker_failures, self.config.breaker_reset),
            // 种子投递期间保持为 1，避免提前判定完成
            pending: AtomicUsize::new(1),
            fetched: AtomicUsize::new(0),
            results: Mutex::new(Vec::new()),
            stats: Mutex::new(ErrorStats::new()),
            done: cancel.child_token(),
        });

        let workers = self.config.workers;
        let mut pool: WorkerPool<CrawlJob, ()> = WorkerPool::new(workers, workers * 10, run.done.clone());
        let Some(sender) = pool.job_sender() else {
            return Ok(Vec::new());
        };

        let crawler = self.clone();
        let worker_run = Arc::clone(&run);
        let worker_sender = sender.clone();
        pool.start(move |ctx, job: CrawlJob| {
            let crawler = crawler.clone();
            let run = Arc::clone(&worker_run);
            let sender = worker_sender.clone();
            async move {
                crawler.crawl_url(&ctx.cancel, &run, &sender, job).await;
                run.finish_job();
                None
            }
        });

        for start_url in &self.config.start_urls {
            let Some(root) = Url::parse(start_url).ok().and_then(|u| u.host_str().map(Arc::<str>::from)) else {
                debug!(url = %start_url, "无法解析起始 URL");
                continue;
            };
            if !run.seen.mark_url_within(start_url, self.config.max_urls) {
                continue;
            }
            run.pending.fetch_add(1, Ordering::AcqRel);
            let job = CrawlJob {
                url: start_url.clone(),
                depth: 0,
                root,
            };
            if pool.submit(job).await.is_err() {
                run.finish_job();
                break;
            }
        }
        drop(sender);
        run.finish_job();

        run.done.cancelled().await;
        pool.close().await;

        if cancel.is_cancelled() && !parent.is_cancelled() {
            warn!("爬取达到截止时间，返回已完成部分");
        }

        let results = std::mem::take(&mut *run.results.lock());
        info!(
            pages = run.fetched.load(Ordering::Acquire),
            seen = run.seen.len(),
            results = results.len(),
            open_hosts = ?run.breakers.open_hosts(),
            errors = %run.stats.lock().summary(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "爬取完成"
        );
        Ok(results)
    }

    async fn crawl_url(&self, cancel: &CancellationToken, run: &CrawlRun, sender: &JobSender<CrawlJob>, job: CrawlJob) {
        if run.fetched.fetch_add(1, Ordering::AcqRel) >= self.config.max_urls {
            run.done.cancel();
            return;
        }

        let Ok(base) = Url::parse(&job.url) else {
            return;
        };
        let host = base.host_str().unwrap_or_default().to_string();

        if let Some(host_limiter) = &self.host_limiter {
            if host_limiter.wait(&host, cancel).await.is_err() {
                return;
            }
        }
        if self.limiter.wait(cancel).await.is_err() {
            return;
        }

        let breaker = run.breakers.get(&host);
        let page = match breaker.execute(|| self.prober.fetch(cancel, &job.url)).await {
            Ok(page) => page,
            Err(ScanError::Cancelled) => return,
            Err(ScanError::CircuitOpen) => {
                debug!(host = %host, url = %job.url, "主机熔断中，跳过");
                return;
            }
            Err(e) => {
                debug!(url = %job.url, error = %e, "页面抓取失败");
                run.stats.lock().record(&e);
                return;
            }
        };

        run.push(CrawlResult::new(
            job.url.as_str(),
            "crawl",
            job.depth,
            classify_url(&job.url, &page.content_type),
        ));

        if job.depth >= self.config.max_depth || !page.content_type.contains("text/html") {
            return;
        }

        let body = match self.prober.fetch_body(cancel, &job.url, MAX_FETCH_BODY).await {
            Ok(body) if !body.is_empty() => body,
            Ok(_) => return,
            Err(e) => {
                run.stats.lock().record(&e);
                return;
            }
        };

        for link in extract_links(&body, &base) {
            if run.seen.len() >= self.config.max_urls {
                break;
            }
            if self.config.same_host && !is_same_host(&link, &job.root) {
                continue;
            }
            if run.seen.mark_url_within(&link, self.config.max_urls) {
                let next = CrawlJob {
                    url: link,
                    depth: job.depth + 1,
                    root: Arc::clone(&job.root),
                };
                if !run.enqueue(sender, next) {
                    debug!(depth = job.depth + 1, "任务队列已满，丢弃链接");
                }
            }
        }

        if self.config.js_parse {
            for endpoint in extract_js_endpoints(&body, &base) {
                if run.seen.mark_url_within(&endpoint, self.config.max_urls) {
                    run.push(CrawlResult::new(endpoint, "js-parse", job.depth, "api"));
                }
            }
        }

        for form in extract_forms_resolved(&body, &base) {
            if run.seen.mark_url_within(&form.action, self.config.max_urls) {
                let mut result = CrawlResult::new(form.action, "form", job.depth, "form");
                result.params = form.fields;
                result.method = form.method;
                run.push(result);
            }
        }
    }
}
