use crate::error::{ErrorStats, ScanError};
use crate::http::analyzer::{self, AnalysisResult};
use crate::http::extract::extract_title;
use crate::http::fingerprints::{self, PROBE_RULES};
use crate::http::{collect_headers, header_value, Headers};
use crate::scanner::adaptive::AdaptiveRateLimiter;
use crate::scanner::pool::WorkerPool;
use crate::scanner::rate_limit::{RateLimiter, Throttle};
use crate::scanner::retry::{retry_with_policy, RetryPolicy};
use crate::scanner::{deadline_token, timestamp, DEFAULT_DEADLINE};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{redirect, Client, Response};
use serde::Serialize;
use std::error::Error as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// 标题与指纹分析只读取前 100KB。
pub const MAX_PROBE_BODY: usize = 100 * 1024;
/// 爬虫抓取正文的上限。
pub const MAX_FETCH_BODY: usize = 1024 * 1024;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const ADAPTIVE_TARGET_LATENCY: Duration = Duration::from_millis(500);
const ADAPTIVE_MIN_RATE: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub targets: Vec<String>,
    pub workers: usize,
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub tls_verify: bool,
    /// 失败后的额外尝试次数，0 表示只请求一次。
    pub retries: u32,
    pub rate_limit: f64,
    pub adaptive: bool,
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
    pub analyze: bool,
    pub deadline: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            workers: 100,
            timeout: Duration::from_secs(10),
            follow_redirects: true,
            max_redirects: 5,
            tls_verify: false,
            retries: 2,
            rate_limit: 500.0,
            adaptive: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers: Vec::new(),
            analyze: false,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeResult {
    pub url: String,
    pub status_code: u16,
    pub content_length: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub technologies: Vec<String>,
    #[serde(skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub redirected: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub final_url: String,
    pub response_time_ms: u64,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,
}

impl ProbeResult {
    pub fn is_alive(&self) -> bool {
        self.status_code > 0
    }
}

#[derive(Clone)]
pub struct Prober {
    config: Arc<ProbeConfig>,
    client: Client,
    throttle: Arc<dyn Throttle>,
    policy: RetryPolicy,
}

impl Prober {
    pub fn new(mut config: ProbeConfig) -> Result<Self, ScanError> {
        let defaults = ProbeConfig::default();
        if config.workers == 0 {
            config.workers = defaults.workers;
        }
        if config.timeout.is_zero() {
            config.timeout = defaults.timeout;
        }
        if config.max_redirects == 0 {
            config.max_redirects = defaults.max_redirects;
        }
        if config.rate_limit <= 0.0 {
            config.rate_limit = defaults.rate_limit;
        }
        if config.user_agent.is_empty() {
            config.user_agent = defaults.user_agent;
        }
        if config.deadline.is_zero() {
            config.deadline = defaults.deadline;
        }

        let client = build_client(&config)?;
        let throttle: Arc<dyn Throttle> = if config.adaptive {
            Arc::new(AdaptiveRateLimiter::new(
                config.rate_limit,
                ADAPTIVE_MIN_RATE,
                config.rate_limit * 2.0,
                ADAPTIVE_TARGET_LATENCY,
            ))
        } else {
            Arc::new(RateLimiter::new(config.rate_limit, config.rate_limit.ceil() as usize))
        };

        Ok(Self {
            config: Arc::new(config),
            client,
            throttle,
            policy: RetryPolicy::linear(RETRY_BASE_DELAY),
        })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn current_rate(&self) -> f64 {
        self.throttle.current_rate()
    }

    pub async fn probe(&self) -> Result<Vec<ProbeResult>, ScanError> {
        self.probe_with_cancel(&CancellationToken::new()).await
    }

    /// 只返回有响应的目标，顺序为完成顺序。
    pub async fn probe_with_cancel(&self, parent: &CancellationToken) -> Result<Vec<ProbeResult>, ScanError> {
        if parent.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let cancel = deadline_token(parent, self.config.deadline);
        let _guard = cancel.clone().drop_guard();

        let start = Instant::now();
        let targets: Vec<String> = self
            .config
            .targets
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let total = targets.len();
        let workers = self.config.workers.min(total.max(1));
        let stats = Arc::new(Mutex::new(ErrorStats::new()));

        let prober = self.clone();
        let job_stats = Arc::clone(&stats);
        let pool = WorkerPool::new(workers, workers * 2, cancel.clone());
        let results = pool
            .run(targets, move |ctx, target: String| {
                let prober = prober.clone();
                let stats = Arc::clone(&job_stats);
                async move {
                    match prober.probe_target(&ctx.cancel, &target).await {
                        Ok(result) => Some(result),
                        Err(e) => {
                            stats.lock().record(&e);
                            None
                        }
                    }
                }
            })
            .await;

        if cancel.is_cancelled() && !parent.is_cancelled() {
            warn!(alive = results.len(), "HTTP 探测达到截止时间，返回已完成部分");
        }
        info!(
            targets = total,
            alive = results.len(),
            rate = self.throttle.current_rate(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            errors = %stats.lock().summary(),
            "HTTP 探测完成"
        );
        Ok(results)
    }

    /// 依次尝试候选 URL，返回第一个有响应的结果。
    pub async fn probe_target(&self, cancel: &CancellationToken, target: &str) -> Result<ProbeResult, ScanError> {
        let mut last_error = None;
        for url in candidate_urls(target) {
            match self.probe_url(cancel, &url).await {
                Ok(result) => return Ok(result),
                Err(ScanError::Cancelled) => return Err(ScanError::Cancelled),
                Err(e) => {
                    debug!(url = %url, error = %e, "候选地址无响应");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ScanError::InvalidTarget(target.to_string())))
    }

    /// 单个 URL，失败按 500ms × 次数线性退避重试，每次尝试前经过节流。
    pub async fn probe_url(&self, cancel: &CancellationToken, url: &str) -> Result<ProbeResult, ScanError> {
        retry_with_policy(cancel, self.config.retries, &self.policy, |_| async move {
            self.throttle.wait(cancel).await?;
            self.fetch(cancel, url).await
        })
        .await
    }

    /// 单次请求，不节流、不重试。
    pub async fn fetch(&self, cancel: &CancellationToken, url: &str) -> Result<ProbeResult, ScanError> {
        let requested = Url::parse(url).map_err(|e| ScanError::InvalidTarget(format!("{}: {}", url, e)))?;

        let start = Instant::now();
        let mut resp = self.send(cancel, url).await?;
        let elapsed = start.elapsed();
        self.throttle.record_latency(elapsed);

        let headers = collect_headers(resp.headers());
        let final_url = resp.url().clone();
        let status = resp.status().as_u16();
        let content_length = resp.content_length().map_or(-1, |len| len as i64);
        let body_bytes = read_body_limited(&mut resp, MAX_PROBE_BODY).await;
        let body = String::from_utf8_lossy(&body_bytes);

        let redirected = final_url != requested;
        let mut result = ProbeResult {
            url: url.to_string(),
            status_code: status,
            content_length,
            content_type: header_value(&headers, "Content-Type").unwrap_or_default().to_string(),
            title: extract_title(&body),
            server: header_value(&headers, "Server").unwrap_or_default().to_string(),
            technologies: fingerprints::detect(PROBE_RULES, &headers, &body),
            headers,
            redirected,
            final_url: if redirected { final_url.to_string() } else { String::new() },
            response_time_ms: elapsed.as_millis() as u64,
            timestamp: timestamp(),
            analysis: None,
        };

        if self.config.analyze {
            result.analysis = Some(analyzer::analyze(url, &result.headers, &body));
        }
        Ok(result)
    }

    /// 抓取正文，最多读取 limit 字节。
    pub async fn fetch_body(&self, cancel: &CancellationToken, url: &str, limit: usize) -> Result<String, ScanError> {
        let mut resp = self.send(cancel, url).await?;
        let bytes = read_body_limited(&mut resp, limit).await;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn send(&self, cancel: &CancellationToken, url: &str) -> Result<Response, ScanError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ScanError::Cancelled),
            resp = self.client.get(url).send() => {
                resp.map_err(|e| classify_request_error(url, &e, self.config.timeout))
            }
        }
    }
}

/// 有 scheme 时原样使用，否则先 https 后 http。
pub fn candidate_urls(target: &str) -> Vec<String> {
    let target = target.trim();
    if target.starts_with("http://") || target.starts_with("https://") {
        return vec![target.to_string()];
    }
    vec![format!("https://{}", target), format!("http://{}", target)]
}

fn build_client(config: &ProbeConfig) -> Result<Client, ScanError> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    default_headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
    for (key, value) in &config.headers {
        let name = HeaderName::from_bytes(key.trim().as_bytes())
            .map_err(|e| ScanError::Config(format!("无效的请求头名称 {}: {}", key, e)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| ScanError::Config(format!("无效的请求头值 {}: {}", key, e)))?;
        default_headers.insert(name, value);
    }

    let policy = if config.follow_redirects {
        redirect::Policy::limited(config.max_redirects)
    } else {
        redirect::Policy::none()
    };

    Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.timeout)
        .danger_accept_invalid_certs(!config.tls_verify)
        .redirect(policy)
        .user_agent(config.user_agent.as_str())
        .default_headers(default_headers)
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Duration::from_secs(30))
        .build()
        .map_err(|e| ScanError::Config(format!("HTTP 客户端初始化失败: {}", e)))
}

/// 分块读取正文，超过上限即截断。
async fn read_body_limited(resp: &mut Response, limit: usize) -> Vec<u8> {
    let mut body = Vec::new();
    while let Ok(Some(chunk)) = resp.chunk().await {
        if body.len() + chunk.len() > limit {
            body.extend_from_slice(&chunk[..limit - body.len()]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    body
}

fn classify_request_error(url: &str, err: &reqwest::Error, timeout: Duration) -> ScanError {
    if err.is_timeout() {
        return ScanError::Timeout {
            target: url.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
    }

    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    let detail = chain.join(": ");
    let lower = detail.to_lowercase();

    if lower.contains("certificate") || lower.contains("handshake") || lower.contains("tls") {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string());
        return ScanError::TlsHandshakeFailed { host, reason: detail };
    }
    if err.is_connect() {
        return ScanError::ConnectionFailed {
            target: url.to_string(),
            reason: if detail.is_empty() { err.to_string() } else { detail },
        };
    }
    ScanError::HttpError {
        url: url.to_string(),
        reason: if detail.is_empty() { err.to_string() } else { detail },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_urls_order() {
        assert_eq!(
            candidate_urls("example.com"),
            vec!["https://example.com", "http://example.com"]
        );
        assert_eq!(candidate_urls(" http://example.com/x "), vec!["http://example.com/x"]);
    }

    #[test]
    fn test_defaults_normalised() {
        let prober = Prober::new(ProbeConfig {
            workers: 0,
            timeout: Duration::ZERO,
            rate_limit: 0.0,
            user_agent: String::new(),
            ..ProbeConfig::default()
        })
        .unwrap();
        assert_eq!(prober.config().workers, 100);
        assert_eq!(prober.config().timeout, Duration::from_secs(10));
        assert_eq!(prober.config().user_agent, DEFAULT_USER_AGENT);
        assert_eq!(prober.current_rate(), 500.0);
    }

    #[test]
    fn test_adaptive_throttle_selected() {
        let prober = Prober::new(ProbeConfig {
            adaptive: true,
            rate_limit: 40.0,
            ..ProbeConfig::default()
        })
        .unwrap();
        assert_eq!(prober.current_rate(), 40.0);
    }

    #[test]
    fn test_invalid_custom_header_is_config_error() {
        let result = Prober::new(ProbeConfig {
            headers: vec![("Bad Header".to_string(), "x".to_string())],
            ..ProbeConfig::default()
        });
        assert!(matches!(result.err(), Some(ScanError::Config(_))));
    }

    #[test]
    fn test_failed_result_serialization() {
        let result = ProbeResult {
            url: "https://example.com".to_string(),
            timestamp: timestamp(),
            ..ProbeResult::default()
        };
        assert!(!result.is_alive());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status_code"], 0);
        assert!(json.get("redirected").is_none());
        assert!(json.get("headers").is_none());
        assert!(json.get("analysis").is_none());
        assert!(json.get("response_time_ms").is_some());
    }

    #[tokio::test]
    async fn test_unreachable_target_is_absent() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = Prober::new(ProbeConfig {
            targets: vec![format!("127.0.0.1:{}", port)],
            retries: 0,
            timeout: Duration::from_secs(2),
            ..ProbeConfig::default()
        })
        .unwrap();
        let results = prober.probe().await.unwrap();
        assert!(results.is_empty());
    }
}
