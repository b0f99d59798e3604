use crate::error::{ErrorStats, ScanError};
use crate::scanner::pool::{WorkerContext, WorkerPool};
use crate::scanner::retry::{retry_with_policy, RetryPolicy};
use crate::scanner::{deadline_token, timestamp, DEFAULT_DEADLINE};
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig as HickoryConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::TokioResolver;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_RESOLVERS: &[&str] = &["8.8.8.8:53", "1.1.1.1:53", "8.8.4.4:53"];

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub resolvers: Vec<String>,
    pub timeout: Duration,
    pub retries: u32,
    pub workers: usize,
    pub deadline: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            resolvers: DEFAULT_RESOLVERS.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_secs(5),
            retries: 2,
            workers: 100,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionResult {
    pub subdomain: String,
    pub ips: Vec<String>,
    pub alive: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub timestamp: String,
}

/// 单个 DNS 服务器上的 A/AAAA 查询。
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>, ScanError>;

    fn server(&self) -> String;
}

pub struct HickoryLookup {
    server: SocketAddr,
    resolver: TokioResolver,
}

impl HickoryLookup {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        let mut config = HickoryConfig::new();
        config.add_name_server(NameServerConfig::new(server, Protocol::Udp));

        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        // 重试由上层策略控制
        opts.attempts = 1;

        let resolver = TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();

        Self { server, resolver }
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>, ScanError> {
        let lookup = self
            .resolver
            .lookup_ip(name)
            .await
            .map_err(|e| ScanError::DnsResolutionFailed {
                domain: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(lookup.iter().collect())
    }

    fn server(&self) -> String {
        self.server.to_string()
    }
}

/// 解析 "ip" 或 "ip:port"，缺省端口为 53。
pub fn parse_server(server: &str) -> Result<SocketAddr, ScanError> {
    let server = server.trim();
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    server
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| ScanError::Config(format!("无效的 DNS 服务器地址: {}", server)))
}

#[derive(Clone)]
pub struct DnsResolver {
    config: ResolverConfig,
    lookups: Vec<Arc<dyn DnsLookup>>,
    policy: RetryPolicy,
}

impl DnsResolver {
    pub fn new(mut config: ResolverConfig) -> Result<Self, ScanError> {
        normalize(&mut config);
        let lookups = config
            .resolvers
            .iter()
            .map(|server| {
                parse_server(server)
                    .map(|addr| Arc::new(HickoryLookup::new(addr, config.timeout)) as Arc<dyn DnsLookup>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::with_lookups(config, lookups))
    }

    pub fn with_lookups(mut config: ResolverConfig, lookups: Vec<Arc<dyn DnsLookup>>) -> Self {
        normalize(&mut config);
        Self {
            config,
            lookups,
            policy: RetryPolicy::linear(Duration::from_millis(100)),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// 按工作者下标固定选择 DNS 服务器。
    fn lookup_for(&self, worker: usize) -> Option<&Arc<dyn DnsLookup>> {
        if self.lookups.is_empty() {
            return None;
        }
        self.lookups.get(worker % self.lookups.len())
    }

    pub async fn resolve_one(
        &self,
        cancel: &CancellationToken,
        worker: usize,
        subdomain: &str,
    ) -> ResolutionResult {
        let mut result = ResolutionResult {
            subdomain: subdomain.to_string(),
            ips: Vec::new(),
            alive: false,
            error: String::new(),
            timestamp: timestamp(),
        };

        let Some(lookup) = self.lookup_for(worker) else {
            result.error = "未配置 DNS 服务器".to_string();
            return result;
        };
        let timeout = self.config.timeout;

        let outcome = retry_with_policy(cancel, self.config.retries, &self.policy, |_| async move {
            let ips = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                res = tokio::time::timeout(timeout, lookup.lookup_ip(subdomain)) => {
                    res.map_err(|_| ScanError::Timeout {
                        target: subdomain.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })??
                }
            };
            if ips.is_empty() {
                return Err(ScanError::DnsResolutionFailed {
                    domain: subdomain.to_string(),
                    reason: "no records".to_string(),
                });
            }
            Ok(ips)
        })
        .await;

        match outcome {
            Ok(ips) => {
                result.ips = ips.iter().map(IpAddr::to_string).collect();
                result.alive = true;
            }
            Err(e) => {
                debug!(subdomain = subdomain, server = %lookup.server(), error = %e, "解析失败");
                result.error = e.last_failure().to_string();
            }
        }
        result
    }

    pub async fn resolve(&self, subdomains: Vec<String>) -> Result<Vec<ResolutionResult>, ScanError> {
        self.resolve_with_cancel(&CancellationToken::new(), subdomains).await
    }

    /// 只返回存活的解析结果。
    pub async fn resolve_with_cancel(
        &self,
        parent: &CancellationToken,
        subdomains: Vec<String>,
    ) -> Result<Vec<ResolutionResult>, ScanError> {
        if parent.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let cancel = deadline_token(parent, self.config.deadline);
        let _guard = cancel.clone().drop_guard();

        let total = subdomains.len();
        let workers = self.config.workers.min(total.max(1));
        let errors = Arc::new(Mutex::new(ErrorStats::new()));
        let resolver = Arc::new(self.clone());

        let pool = WorkerPool::new(workers, workers * 2, cancel.clone());
        let stats = Arc::clone(&errors);
        let results = pool
            .run(subdomains, move |ctx: WorkerContext, subdomain: String| {
                let resolver = Arc::clone(&resolver);
                let stats = Arc::clone(&stats);
                async move {
                    let result = resolver.resolve_one(&ctx.cancel, ctx.index, &subdomain).await;
                    if !result.alive {
                        stats.lock().record(&ScanError::DnsResolutionFailed {
                            domain: result.subdomain.clone(),
                            reason: result.error.clone(),
                        });
                    }
                    result.alive.then_some(result)
                }
            })
            .await;

        info!(
            total = total,
            alive = results.len(),
            errors = %errors.lock().summary(),
            "DNS 解析完成"
        );
        Ok(results)
    }

    pub async fn filter_alive(&self, subdomains: Vec<String>) -> Result<Vec<String>, ScanError> {
        let results = self.resolve(subdomains).await?;
        Ok(results.into_iter().map(|r| r.subdomain).collect())
    }
}

fn normalize(config: &mut ResolverConfig) {
    let defaults = ResolverConfig::default();
    if config.resolvers.is_empty() {
        config.resolvers = defaults.resolvers;
    }
    if config.timeout.is_zero() {
        config.timeout = defaults.timeout;
    }
    if config.workers == 0 {
        config.workers = defaults.workers;
    }
    if config.deadline.is_zero() {
        config.deadline = defaults.deadline;
    }
}
