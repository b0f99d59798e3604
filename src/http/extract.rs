//! HTML 片段提取：标题、链接、表单与脚本中的接口地址。

use crate::http::{cached_regex, cached_regexes};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use url::Url;

pub const MAX_TITLE_CHARS: usize = 100;

static TITLE_REGEX: OnceLock<Regex> = OnceLock::new();
static HREF_REGEX: OnceLock<Regex> = OnceLock::new();
static SRC_REGEX: OnceLock<Regex> = OnceLock::new();
static FORM_REGEX: OnceLock<Regex> = OnceLock::new();
static ACTION_REGEX: OnceLock<Regex> = OnceLock::new();
static METHOD_REGEX: OnceLock<Regex> = OnceLock::new();
static INPUT_NAME_REGEX: OnceLock<Regex> = OnceLock::new();
static JS_ENDPOINT_REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();

const JS_ENDPOINT_PATTERNS: &[&str] = &[
    r#"["'](/api/[^"']+)["']"#,
    r#"["'](/v[0-9]+/[^"']+)["']"#,
    r#"["'](/graphql[^"']*)["']"#,
    r#"fetch\(["']([^"']+)["']"#,
    r#"axios\.[a-z]+\(["']([^"']+)["']"#,
    r#"url:\s*["']([^"']+)["']"#,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormInfo {
    pub action: String,
    pub method: String,
    pub fields: Vec<String>,
}

/// 第一个 `<title>`，超过 100 个字符截断并追加 "..."。
pub fn extract_title(body: &str) -> String {
    let re = cached_regex(&TITLE_REGEX, r"(?i)<title[^>]*>([^<]+)</title>");
    let Some(caps) = re.captures(body) else {
        return String::new();
    };
    let title = caps.get(1).map_or("", |m| m.as_str().trim());
    if title.chars().count() > MAX_TITLE_CHARS {
        let truncated: String = title.chars().take(MAX_TITLE_CHARS).collect();
        format!("{}...", truncated)
    } else {
        title.to_string()
    }
}

/// 相对地址转绝对地址，仅保留 http/https。
pub fn resolve_url(href: &str, base: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("data:")
    {
        return None;
    }

    let resolved = base.join(href).ok()?;
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

/// href 与 src 中的链接，保持首次出现顺序。
pub fn extract_links(body: &str, base: &Url) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for re in [cached_regex(&HREF_REGEX, r#"href=["']([^"']+)["']"#), cached_regex(&SRC_REGEX, r#"src=["']([^"']+)["']"#)] {
        for caps in re.captures_iter(body) {
            if let Some(link) = caps.get(1).and_then(|m| resolve_url(m.as_str(), base)) {
                if seen.insert(link.clone()) {
                    links.push(link);
                }
            }
        }
    }

    links
}

pub fn extract_js_endpoints(body: &str, base: &Url) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut endpoints = Vec::new();

    for re in cached_regexes(&JS_ENDPOINT_REGEXES, JS_ENDPOINT_PATTERNS) {
        for caps in re.captures_iter(body) {
            if let Some(endpoint) = caps.get(1).and_then(|m| resolve_url(m.as_str(), base)) {
                if seen.insert(endpoint.clone()) {
                    endpoints.push(endpoint);
                }
            }
        }
    }

    endpoints
}

/// 表单的原始 action、方法 (默认 GET) 与字段名。
pub fn extract_forms(body: &str) -> Vec<FormInfo> {
    let form_re = cached_regex(&FORM_REGEX, r"(?is)<form([^>]*)>(.*?)</form>");
    let action_re = cached_regex(&ACTION_REGEX, r#"(?i)action=["']([^"']*)["']"#);
    let method_re = cached_regex(&METHOD_REGEX, r#"(?i)method=["']([^"']+)["']"#);
    let input_re = input_name_regex();

    form_re
        .captures_iter(body)
        .map(|caps| {
            let attrs = caps.get(1).map_or("", |m| m.as_str());
            let content = caps.get(2).map_or("", |m| m.as_str());

            let action = action_re
                .captures(attrs)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            let method = method_re
                .captures(attrs)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_uppercase())
                .unwrap_or_else(|| "GET".to_string());
            let fields = input_re
                .captures_iter(content)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .collect();

            FormInfo { action, method, fields }
        })
        .collect()
}

/// 同 extract_forms，但 action 解析为绝对地址；缺失或无法解析时指向当前页面。
pub fn extract_forms_resolved(body: &str, base: &Url) -> Vec<FormInfo> {
    extract_forms(body)
        .into_iter()
        .map(|mut form| {
            form.action = resolve_url(&form.action, base).unwrap_or_else(|| base.to_string());
            form
        })
        .collect()
}

fn input_name_regex() -> &'static Regex {
    cached_regex(&INPUT_NAME_REGEX, r#"name=["']([^"']+)["']"#)
}

/// 主机相同，或为种子主机的子域名。
pub fn is_same_host(url: &str, host: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    match parsed.host_str() {
        Some(h) => h.eq_ignore_ascii_case(host) || h.to_ascii_lowercase().ends_with(&format!(".{}", host.to_ascii_lowercase())),
        None => false,
    }
}

pub fn classify_url(url: &str, content_type: &str) -> &'static str {
    let lower = url.to_lowercase();

    if lower.contains("/api/") || lower.contains("/graphql") {
        return "api";
    }
    if lower.ends_with(".js") {
        return "js";
    }
    if lower.ends_with(".css") {
        return "css";
    }
    if content_type.contains("json") {
        return "api";
    }
    if content_type.contains("javascript") {
        return "js";
    }
    "page"
}
