use super::PassiveSource;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct DomainReport {
    #[serde(default)]
    subdomains: Vec<String>,
}

pub struct ThreatCrowdSource {
    base_url: String,
}

impl ThreatCrowdSource {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for ThreatCrowdSource {
    fn default() -> Self {
        Self::with_base_url("https://www.threatcrowd.org")
    }
}

#[async_trait]
impl PassiveSource for ThreatCrowdSource {
    fn name(&self) -> &str {
        "threatcrowd"
    }

    async fn query(&self, client: &Client, domain: &str) -> Result<Vec<String>> {
        let url = format!("{}/searchApi/v2/domain/report/?domain={}", self.base_url, domain);
        let resp = client.get(&url).send().await.context("threatcrowd 请求失败")?;
        if !resp.status().is_success() {
            bail!("threatcrowd 返回状态码 {}", resp.status());
        }
        let body = resp.bytes().await.context("读取 threatcrowd 响应失败")?;
        let report: DomainReport = serde_json::from_slice(&body).context("解析 threatcrowd JSON 失败")?;
        Ok(report.subdomains)
    }
}
