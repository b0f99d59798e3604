use super::PassiveSource;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct CertEntry {
    #[serde(default)]
    name_value: String,
}

/// 证书透明日志查询 (crt.sh)。
pub struct CrtShSource {
    base_url: String,
}

impl CrtShSource {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for CrtShSource {
    fn default() -> Self {
        Self::with_base_url("https://crt.sh")
    }
}

#[async_trait]
impl PassiveSource for CrtShSource {
    fn name(&self) -> &str {
        "crtsh"
    }

    async fn query(&self, client: &Client, domain: &str) -> Result<Vec<String>> {
        let url = format!("{}/?q=%25.{}&output=json", self.base_url, domain);
        let resp = client.get(&url).send().await.context("crt.sh 请求失败")?;
        if !resp.status().is_success() {
            bail!("crt.sh 返回状态码 {}", resp.status());
        }
        let body = resp.bytes().await.context("读取 crt.sh 响应失败")?;
        parse_response(&body)
    }
}

/// name_value 中可能含有多个以换行分隔的名称。
pub fn parse_response(body: &[u8]) -> Result<Vec<String>> {
    let entries: Vec<CertEntry> = serde_json::from_slice(body).context("解析 crt.sh JSON 失败")?;
    Ok(entries
        .iter()
        .flat_map(|e| e.name_value.split('\n'))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect())
}
