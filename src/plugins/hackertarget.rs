use super::PassiveSource;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;

pub struct HackerTargetSource {
    base_url: String,
}

impl HackerTargetSource {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for HackerTargetSource {
    fn default() -> Self {
        Self::with_base_url("https://api.hackertarget.com")
    }
}

#[async_trait]
impl PassiveSource for HackerTargetSource {
    fn name(&self) -> &str {
        "hackertarget"
    }

    async fn query(&self, client: &Client, domain: &str) -> Result<Vec<String>> {
        let url = format!("{}/hostsearch/?q={}", self.base_url, domain);
        let resp = client.get(&url).send().await.context("hackertarget 请求失败")?;
        if !resp.status().is_success() {
            bail!("hackertarget 返回状态码 {}", resp.status());
        }
        let body = resp.text().await.context("读取 hackertarget 响应失败")?;
        Ok(parse_response(&body))
    }
}

/// 每行格式为 "host,ip"，取第一列。
pub fn parse_response(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.split(',').next())
        .map(str::trim)
        .filter(|host| !host.is_empty() && !host.starts_with("error") && !host.contains(' '))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv_lines() {
        let body = "www.example.com,93.184.216.34\napi.example.com,10.0.0.1\n\n";
        assert_eq!(parse_response(body), vec!["www.example.com", "api.example.com"]);
    }

    #[test]
    fn test_parse_api_error() {
        assert!(parse_response("API count exceeded - Increase Quota with Membership").is_empty());
        assert!(parse_response("error check your search parameter").is_empty());
    }
}
