use anyhow::{Context, Result};
use ipnet::IpNet;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use tracing::warn;

/// 单个网段或范围最多展开的主机数。
pub const MAX_EXPANDED_HOSTS: usize = 65535;

/// 按行读取列表文件，跳过空行与 # 注释。
pub fn load_lines(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("无法打开列表文件: {:?}", path))?;
    let reader = BufReader::new(file);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("读取列表文件失败: {:?}", path))?;
        let line = line.trim();
        if !line.is_empty() && !line.starts_with('#') {
            lines.push(line.to_string());
        }
    }
    Ok(lines)
}

/// 目标参数为已存在的文件时按列表读取，否则视为单个目标。
pub fn load_targets(input: &str) -> Result<Vec<String>> {
    let input = input.trim();
    let path = Path::new(input);
    if path.is_file() {
        return load_lines(path);
    }
    if input.is_empty() {
        anyhow::bail!("目标为空");
    }
    Ok(vec![input.to_string()])
}

/// 去除 http(s):// 前缀与路径部分。
pub fn clean_host(input: &str) -> &str {
    let mut cleaned = input.trim();
    let lower = cleaned.to_ascii_lowercase();
    if lower.starts_with("http://") {
        cleaned = &cleaned[7..];
    } else if lower.starts_with("https://") {
        cleaned = &cleaned[8..];
    }
    if let Some(idx) = cleaned.find('/') {
        cleaned = &cleaned[..idx];
    }
    cleaned
}

/// 去掉 host:port 中的端口，IPv6 字面量保持不变。
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(host, |(addr, _)| addr);
    }
    if host.matches(':').count() == 1 {
        if let Some((name, _)) = host.rsplit_once(':') {
            return name;
        }
    }
    host
}

/// 展开端口扫描目标：CIDR、完整 IP 范围、末段范围；其余按主机名保留。结果去重且保持顺序。
pub fn expand_hosts(inputs: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();
    for input in inputs {
        for host in expand_one(input) {
            if seen.insert(host.clone()) {
                hosts.push(host);
            }
        }
    }
    hosts
}

fn expand_one(input: &str) -> Vec<String> {
    let cleaned = clean_host(input);
    if cleaned.is_empty() {
        return Vec::new();
    }

    if let Ok(net) = cleaned.parse::<IpNet>() {
        return expand_cidr(input, net);
    }
    if let Some(hosts) = expand_full_range(input, cleaned) {
        return hosts;
    }
    if let Some(hosts) = expand_last_octet(cleaned) {
        return hosts;
    }
    vec![strip_port(cleaned).to_string()]
}

fn expand_cidr(input: &str, net: IpNet) -> Vec<String> {
    let single = match net {
        IpNet::V4(_) => net.prefix_len() == 32,
        IpNet::V6(_) => net.prefix_len() == 128,
    };
    if single {
        return vec![net.addr().to_string()];
    }

    let too_large = match net {
        IpNet::V4(_) => net.prefix_len() < 16,
        IpNet::V6(_) => net.prefix_len() < 112,
    };
    if too_large {
        warn!(input = input, limit = MAX_EXPANDED_HOSTS, "网段过大，仅处理前部分主机");
    }
    net.hosts().take(MAX_EXPANDED_HOSTS).map(|ip| ip.to_string()).collect()
}

/// 192.168.1.1-192.168.2.10
fn expand_full_range(input: &str, cleaned: &str) -> Option<Vec<String>> {
    let (start, end) = cleaned.split_once('-')?;
    let (IpAddr::V4(start), IpAddr::V4(end)) = (start.parse::<IpAddr>().ok()?, end.parse::<IpAddr>().ok()?) else {
        return None;
    };
    let (start, end) = (u32::from(start), u32::from(end));
    if start > end {
        return None;
    }

    let count = u64::from(end) - u64::from(start) + 1;
    if count > MAX_EXPANDED_HOSTS as u64 {
        warn!(input = input, count = count, limit = MAX_EXPANDED_HOSTS, "IP 范围过大，仅处理前部分主机");
    }
    Some(
        (start..=end)
            .take(MAX_EXPANDED_HOSTS)
            .map(|ip| Ipv4Addr::from(ip).to_string())
            .collect(),
    )
}

/// 192.168.1.1-10
fn expand_last_octet(cleaned: &str) -> Option<Vec<String>> {
    let (prefix, suffix) = cleaned.rsplit_once('.')?;
    let (start, end) = suffix.split_once('-')?;
    let (start, end) = (start.parse::<u8>().ok()?, end.parse::<u8>().ok()?);
    if start > end {
        return None;
    }

    let hosts: Vec<String> = (start..=end)
        .map(|i| format!("{}.{}", prefix, i))
        .filter(|ip| ip.parse::<IpAddr>().is_ok())
        .collect();
    (!hosts.is_empty()).then_some(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_targets_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment\nexample.com\n\n  api.example.com  \n#another").unwrap();
        let targets = load_targets(file.path().to_str().unwrap()).unwrap();
        assert_eq!(targets, vec!["example.com", "api.example.com"]);
    }

    #[test]
    fn test_load_targets_single_value() {
        assert_eq!(load_targets("example.com").unwrap(), vec!["example.com"]);
        assert!(load_targets("   ").is_err());
    }

    #[test]
    fn test_clean_host() {
        assert_eq!(clean_host("HTTPS://example.com/index.html"), "example.com");
        assert_eq!(clean_host("http://1.2.3.4:8080/a"), "1.2.3.4:8080");
        assert_eq!(clean_host("example.com"), "example.com");
    }

    #[test]
    fn test_expand_cidr_and_ranges() {
        let hosts = expand_hosts(&["192.168.1.0/30".to_string()]);
        assert_eq!(hosts, vec!["192.168.1.1", "192.168.1.2"]);

        let hosts = expand_hosts(&["10.0.0.254-10.0.1.1".to_string()]);
        assert_eq!(hosts, vec!["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"]);

        let hosts = expand_hosts(&["172.16.0.1-3".to_string()]);
        assert_eq!(hosts, vec!["172.16.0.1", "172.16.0.2", "172.16.0.3"]);
    }

    #[test]
    fn test_expand_hosts_dedup_and_strip() {
        let hosts = expand_hosts(&[
            "http://example.com:8080/path".to_string(),
            "example.com".to_string(),
            "10.0.0.1/32".to_string(),
            "::1".to_string(),
        ]);
        assert_eq!(hosts, vec!["example.com", "10.0.0.1", "::1"]);
    }

    #[test]
    fn test_large_cidr_capped() {
        let hosts = expand_hosts(&["10.0.0.0/8".to_string()]);
        assert_eq!(hosts.len(), MAX_EXPANDED_HOSTS);
    }
}
