use crate::error::ScanError;
use crate::plugins::SourceManager;
use crate::scanner::pool::WorkerPool;
use crate::scanner::resolver::{DnsResolver, ResolverConfig};
use crate::scanner::seen::SeenSet;
use crate::scanner::{deadline_token, timestamp, DEFAULT_DEADLINE};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RESULT_BUFFER: usize = 1024;
const SOURCE_BRUTEFORCE: &str = "bruteforce";

#[derive(Debug, Clone)]
pub struct SubdomainConfig {
    pub domain: String,
    pub wordlist: Option<PathBuf>,
    pub workers: usize,
    /// 被动数据源 HTTP 请求超时。
    pub timeout: Duration,
    pub deadline: Duration,
    pub passive: bool,
    pub bruteforce: bool,
    pub resolver: ResolverConfig,
}

impl Default for SubdomainConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            wordlist: None,
            workers: 100,
            timeout: Duration::from_secs(30),
            deadline: DEFAULT_DEADLINE,
            passive: true,
            bruteforce: false,
            resolver: ResolverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubdomainResult {
    pub subdomain: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    pub source: String,
    pub timestamp: String,
}

pub struct SubdomainScanner {
    config: SubdomainConfig,
    client: reqwest::Client,
    sources: SourceManager,
    resolver: Arc<DnsResolver>,
}

impl SubdomainScanner {
    pub fn new(config: SubdomainConfig) -> Result<Self, ScanError> {
        let resolver = DnsResolver::new(config.resolver.clone())?;
        Self::with_parts(config, SourceManager::new(), resolver)
    }

    pub fn with_parts(
        mut config: SubdomainConfig,
        sources: SourceManager,
        resolver: DnsResolver,
    ) -> Result<Self, ScanError> {
        config.domain = config.domain.trim().trim_end_matches('.').to_lowercase();
        if config.domain.is_empty() {
            return Err(ScanError::Config("未指定目标域名".to_string()));
        }
        if config.workers == 0 {
            config.workers = SubdomainConfig::default().workers;
        }
        if config.deadline.is_zero() {
            config.deadline = DEFAULT_DEADLINE;
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("TL-Recon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ScanError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            config,
            client,
            sources,
            resolver: Arc::new(resolver),
        })
    }

    pub async fn enumerate(&self) -> Result<Vec<SubdomainResult>, ScanError> {
        self.enumerate_with_cancel(&CancellationToken::new()).await
    }

    /// 被动与爆破两组任务并发运行，共享同一结果通道。
    pub async fn enumerate_with_cancel(
        &self,
        parent: &CancellationToken,
    ) -> Result<Vec<SubdomainResult>, ScanError> {
        if parent.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        // 字典不可读属于配置错误，必须在任何任务开始前暴露
        let wordlist = if self.config.bruteforce {
            let path = self
                .config
                .wordlist
                .as_ref()
                .ok_or_else(|| ScanError::Config("爆破模式需要指定字典文件 (-w)".to_string()))?;
            let file = File::open(path).await.map_err(|source| ScanError::FileError {
                path: path.display().to_string(),
                source,
            })?;
            Some(file)
        } else {
            None
        };

        let cancel = deadline_token(parent, self.config.deadline);
        let _guard = cancel.clone().drop_guard();
        let seen = SeenSet::new();
        let (tx, mut rx) = mpsc::channel(RESULT_BUFFER);

        let passive = self.run_passive(&cancel, &seen, tx.clone());
        let brute = self.run_bruteforce(&cancel, &seen, wordlist, tx.clone());
        drop(tx);

        let collect = async {
            let mut results = Vec::new();
            while let Some(result) = rx.recv().await {
                results.push(result);
            }
            results
        };

        let ((), (), mut results) = tokio::join!(passive, brute, collect);
        results.sort_by(|a: &SubdomainResult, b| a.subdomain.cmp(&b.subdomain));

        if cancel.is_cancelled() && !parent.is_cancelled() {
            warn!(found = results.len(), "子域名枚举达到截止时间，返回已发现结果");
        }
        info!(domain = %self.config.domain, found = results.len(), "子域名枚举完成");
        Ok(results)
    }

    async fn run_passive(
        &self,
        cancel: &CancellationToken,
        seen: &SeenSet,
        tx: mpsc::Sender<SubdomainResult>,
    ) {
        if !self.config.passive {
            return;
        }

        let hits = self.sources.collect(cancel, &self.client, &self.config.domain).await;
        for hit in hits {
            for name in hit.names {
                let result = SubdomainResult {
                    subdomain: name,
                    ips: Vec::new(),
                    source: hit.source.clone(),
                    timestamp: timestamp(),
                };
                if !add_result(seen, &tx, result).await {
                    return;
                }
            }
        }
    }

    async fn run_bruteforce(
        &self,
        cancel: &CancellationToken,
        seen: &SeenSet,
        wordlist: Option<File>,
        tx: mpsc::Sender<SubdomainResult>,
    ) {
        let Some(file) = wordlist else {
            return;
        };

        let workers = self.config.workers;
        let mut pool = WorkerPool::new(workers, workers * 2, cancel.clone());
        let Some(mut resolved) = pool.take_results() else {
            return;
        };

        let resolver = Arc::clone(&self.resolver);
        pool.start(move |ctx, candidate: String| {
            let resolver = Arc::clone(&resolver);
            async move {
                let result = resolver.resolve_one(&ctx.cancel, ctx.index, &candidate).await;
                result.alive.then(|| SubdomainResult {
                    subdomain: result.subdomain,
                    ips: result.ips,
                    source: SOURCE_BRUTEFORCE.to_string(),
                    timestamp: result.timestamp,
                })
            }
        });

        let domain = &self.config.domain;
        let feed = async {
            let mut lines = BufReader::new(file).lines();
            let mut submitted = 0usize;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let word = line.trim();
                        if word.is_empty() || word.starts_with('#') {
                            continue;
                        }
                        let candidate = format!("{}.{}", word.trim_end_matches('.').to_lowercase(), domain);
                        if pool.submit(candidate).await.is_err() {
                            break;
                        }
                        submitted += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "读取字典中断");
                        break;
                    }
                }
            }
            pool.close().await;
            info!(candidates = submitted, "字典候选投递完毕");
        };

        let forward = async {
            let mut open = true;
            while let Some(result) = resolved.recv().await {
                // 下游关闭后继续排空，避免工作者阻塞
                if open && !add_result(seen, &tx, result).await {
                    open = false;
                }
            }
        };

        tokio::join!(feed, forward);
    }
}

/// 唯一的结果写入点，已见过的子域名直接忽略。返回 false 表示结果通道已关闭。
async fn add_result(
    seen: &SeenSet,
    tx: &mpsc::Sender<SubdomainResult>,
    result: SubdomainResult,
) -> bool {
    if !seen.insert(result.subdomain.clone()) {
        return true;
    }
    tx.send(result).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PassiveSource;
    use crate::scanner::resolver::tests::StaticLookup;
    use anyhow::bail;
    use async_trait::async_trait;
    use reqwest::Client;
    use std::io::Write;

    struct FixedSource(&'static str, Vec<&'static str>);

    #[async_trait]
    impl PassiveSource for FixedSource {
        fn name(&self) -> &str {
            self.0
        }

        async fn query(&self, _client: &Client, _domain: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.1.iter().map(|s| s.to_string()).collect())
        }
    }

    struct DownSource;

    #[async_trait]
    impl PassiveSource for DownSource {
        fn name(&self) -> &str {
            "down"
        }

        async fn query(&self, _client: &Client, _domain: &str) -> anyhow::Result<Vec<String>> {
            bail!("connection refused")
        }
    }

    fn resolver(records: &[(&str, &str)]) -> DnsResolver {
        let config = ResolverConfig {
            retries: 0,
            ..ResolverConfig::default()
        };
        DnsResolver::with_lookups(config, vec![Arc::new(StaticLookup::new("fake", records))])
    }

    fn wordlist(lines: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(lines.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_passive_merge_and_dedup() {
        let mut sources = SourceManager::empty();
        sources.register(Arc::new(FixedSource("crtsh", vec!["www.example.com", "*.mail.example.com"])));
        sources.register(Arc::new(DownSource));
        sources.register(Arc::new(FixedSource("hackertarget", vec!["www.example.com", "api.example.com"])));

        let config = SubdomainConfig {
            domain: "Example.com".to_string(),
            ..SubdomainConfig::default()
        };
        let scanner = SubdomainScanner::with_parts(config, sources, resolver(&[])).unwrap();
        let results = scanner.enumerate().await.unwrap();

        let names: Vec<&str> = results.iter().map(|r| r.subdomain.as_str()).collect();
        assert_eq!(names, vec!["api.example.com", "mail.example.com", "www.example.com"]);
        let www = results.iter().find(|r| r.subdomain == "www.example.com").unwrap();
        assert_eq!(www.source, "crtsh");
        assert!(www.timestamp.ends_with('Z'));
    }

    #[tokio::test]
    async fn test_bruteforce_skips_comments_and_blanks() {
        let list = wordlist("# common\nwww\n\n  \ndev\nnothere\n");
        let config = SubdomainConfig {
            domain: "example.com".to_string(),
            wordlist: Some(list.path().to_path_buf()),
            workers: 4,
            passive: false,
            bruteforce: true,
            ..SubdomainConfig::default()
        };
        let scanner = SubdomainScanner::with_parts(
            config,
            SourceManager::empty(),
            resolver(&[("www.example.com", "10.0.0.1"), ("dev.example.com", "10.0.0.2")]),
        )
        .unwrap();

        let results = scanner.enumerate().await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.source == "bruteforce" && !r.ips.is_empty()));
        assert_eq!(results[0].subdomain, "dev.example.com");
    }

    #[tokio::test]
    async fn test_passive_and_bruteforce_share_dedup() {
        let list = wordlist("www\n");
        let mut sources = SourceManager::empty();
        sources.register(Arc::new(FixedSource("crtsh", vec!["www.example.com"])));

        let config = SubdomainConfig {
            domain: "example.com".to_string(),
            wordlist: Some(list.path().to_path_buf()),
            bruteforce: true,
            ..SubdomainConfig::default()
        };
        let scanner =
            SubdomainScanner::with_parts(config, sources, resolver(&[("www.example.com", "10.0.0.1")])).unwrap();

        let results = scanner.enumerate().await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_wordlist_is_fatal() {
        let config = SubdomainConfig {
            domain: "example.com".to_string(),
            wordlist: Some(PathBuf::from("/nonexistent/words.txt")),
            bruteforce: true,
            ..SubdomainConfig::default()
        };
        let scanner = SubdomainScanner::with_parts(config, SourceManager::empty(), resolver(&[])).unwrap();
        let err = scanner.enumerate().await.unwrap_err();
        assert!(matches!(err, ScanError::FileError { .. }));
    }

    #[test]
    fn test_empty_domain_rejected() {
        let err = SubdomainScanner::with_parts(SubdomainConfig::default(), SourceManager::empty(), resolver(&[]))
            .err()
            .unwrap();
        assert!(matches!(err, ScanError::Config(_)));
    }

    #[test]
    fn test_result_serialization_omits_empty_ips() {
        let result = SubdomainResult {
            subdomain: "www.example.com".to_string(),
            ips: Vec::new(),
            source: "crtsh".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("ips").is_none());
        assert_eq!(json["source"], "crtsh");
    }
}
