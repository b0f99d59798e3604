pub mod crtsh;
pub mod hackertarget;
pub mod threatcrowd;

use crate::scanner::pool::parallel_map_settled;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 被动子域名数据源。
#[async_trait]
pub trait PassiveSource: Send + Sync {
    fn name(&self) -> &str;

    async fn query(&self, client: &Client, domain: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct SourceHit {
    pub source: String,
    pub names: Vec<String>,
}

pub struct SourceManager {
    sources: Vec<Arc<dyn PassiveSource>>,
}

impl SourceManager {
    pub fn new() -> Self {
        let mut sm = Self::empty();
        sm.register(Arc::new(crtsh::CrtShSource::default()));
        sm.register(Arc::new(hackertarget::HackerTargetSource::default()));
        sm.register(Arc::new(threatcrowd::ThreatCrowdSource::default()));
        sm
    }

    pub fn empty() -> Self {
        Self { sources: Vec::new() }
    }

    pub fn register(&mut self, source: Arc<dyn PassiveSource>) {
        self.sources.push(source);
    }

    pub fn sources(&self) -> &[Arc<dyn PassiveSource>] {
        &self.sources
    }

    /// 并发查询全部数据源。单个数据源失败时按空结果处理，不影响其他数据源。
    pub async fn collect(&self, cancel: &CancellationToken, client: &Client, domain: &str) -> Vec<SourceHit> {
        let hits = parallel_map_settled(cancel, self.sources.clone(), self.sources.len(), |source| async move {
            let names = tokio::select! {
                biased;
                _ = cancel.cancelled() => Vec::new(),
                res = source.query(client, domain) => match res {
                    Ok(names) => names,
                    Err(e) => {
                        debug!(source = source.name(), error = %e, "被动数据源查询失败");
                        Vec::new()
                    }
                },
            };

            let names: Vec<String> = names
                .iter()
                .filter_map(|name| normalize_name(name, domain))
                .collect();
            debug!(source = source.name(), count = names.len(), "被动数据源返回");

            Ok(SourceHit {
                source: source.name().to_string(),
                names,
            })
        })
        .await;

        hits
            .into_iter()
            .filter_map(|hit| match hit {
                Ok(hit) => Some(hit),
                Err(e) => {
                    debug!(error = %e, "被动数据源未执行");
                    None
                }
            })
            .collect()
    }
}

impl Default for SourceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 小写化并去掉通配前缀，只保留属于 domain 的名称。
pub fn normalize_name(raw: &str, domain: &str) -> Option<String> {
    let name = raw.trim().trim_end_matches('.').to_lowercase();
    let name = name.trim_start_matches("*.");
    let domain = domain.trim().trim_end_matches('.').to_lowercase();

    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    if name == domain || name.ends_with(&format!(".{}", domain)) {
        Some(name.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct FixedSource(&'static str, Vec<&'static str>);

    #[async_trait]
    impl PassiveSource for FixedSource {
        fn name(&self) -> &str {
            self.0
        }

        async fn query(&self, _client: &Client, _domain: &str) -> Result<Vec<String>> {
            Ok(self.1.iter().map(|s| s.to_string()).collect())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl PassiveSource for BrokenSource {
        fn name(&self) -> &str {
            "broken"
        }

        async fn query(&self, _client: &Client, _domain: &str) -> Result<Vec<String>> {
            bail!("upstream down")
        }
    }

    /// 查询途中取消整个收集过程。
    struct CancellingSource(CancellationToken);

    #[async_trait]
    impl PassiveSource for CancellingSource {
        fn name(&self) -> &str {
            "cancelling"
        }

        async fn query(&self, _client: &Client, _domain: &str) -> Result<Vec<String>> {
            self.0.cancel();
            Ok(vec!["vpn.example.com".to_string()])
        }
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("*.Dev.Example.com", "example.com").as_deref(), Some("dev.example.com"));
        assert_eq!(normalize_name("example.com.", "example.com").as_deref(), Some("example.com"));
        assert_eq!(normalize_name("notexample.com", "example.com"), None);
        assert_eq!(normalize_name("other.org", "example.com"), None);
        assert_eq!(normalize_name("  ", "example.com"), None);
    }

    #[test]
    fn test_default_sources_registered() {
        let sm = SourceManager::new();
        let names: Vec<&str> = sm.sources().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["crtsh", "hackertarget", "threatcrowd"]);
    }

    #[tokio::test]
    async fn test_failing_source_is_absorbed() {
        let mut sm = SourceManager::empty();
        sm.register(Arc::new(FixedSource("a", vec!["www.example.com", "evil.org"])));
        sm.register(Arc::new(BrokenSource));
        sm.register(Arc::new(FixedSource("b", vec!["*.api.example.com"])));

        let client = Client::new();
        let hits = sm.collect(&CancellationToken::new(), &client, "example.com").await;

        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].names, vec!["www.example.com".to_string()]);
        assert!(hits[1].names.is_empty());
        assert_eq!(hits[2].names, vec!["api.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_finished_sources_survive_cancellation() {
        let cancel = CancellationToken::new();
        let mut sm = SourceManager::empty();
        sm.register(Arc::new(CancellingSource(cancel.clone())));
        sm.register(Arc::new(FixedSource("late", vec!["www.example.com"])));

        let client = Client::new();
        let hits = sm.collect(&cancel, &client, "example.com").await;

        assert!(cancel.is_cancelled());
        let first = hits.iter().find(|h| h.source == "cancelling").unwrap();
        assert_eq!(first.names, vec!["vpn.example.com".to_string()]);
    }
}
