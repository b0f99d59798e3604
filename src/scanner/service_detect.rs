use crate::scanner::probes::{self, contains_ignore_case};
use crate::scanner::{service_map, tcp_connect};
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const FAST_READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub banner: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub product: String,
}

#[derive(Debug, Clone)]
pub struct ServiceDetector {
    timeout: Duration,
}

impl ServiceDetector {
    pub fn new(timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() { Duration::from_secs(5) } else { timeout };
        Self { timeout }
    }

    /// 快速识别：先查端口表，未命中再抓取横幅并匹配关键字。
    pub async fn identify(&self, host: &str, port: u16) -> (String, Option<String>) {
        if let Some(name) = service_map::get_service_name(port) {
            return (name.to_string(), None);
        }

        let read_timeout = self.timeout.min(FAST_READ_TIMEOUT);
        match probes::grab_banner(host, port, self.timeout, read_timeout).await {
            Some(banner) => (probes::identify_from_banner(&banner).to_string(), Some(banner)),
            None => ("unknown".to_string(), None),
        }
    }

    /// 深度识别：端口表、横幅解析，HTTP 类端口再补充一次 HEAD 探测。
    pub async fn detect(&self, host: &str, port: u16) -> ServiceInfo {
        let mut info = ServiceInfo {
            name: service_map::get_service_name(port).unwrap_or("unknown").to_string(),
            ..ServiceInfo::default()
        };

        if let Some(banner) = probes::grab_banner(host, port, self.timeout, self.timeout).await {
            let parsed = parse_banner(&banner);
            info.banner = banner;
            if !parsed.name.is_empty() {
                info.name = parsed.name;
            }
            if !parsed.version.is_empty() {
                info.version = parsed.version;
            }
            if !parsed.product.is_empty() {
                info.product = parsed.product;
            }
        }

        if service_map::looks_like_http(port) && info.name == "unknown" {
            if let Some(http_info) = self.probe_http(host, port).await {
                return http_info;
            }
        }

        info
    }

    async fn probe_http(&self, host: &str, port: u16) -> Option<ServiceInfo> {
        let mut stream = tcp_connect::connect(host, port, self.timeout).await.ok()?;
        let request = format!("HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);
        timeout(self.timeout, stream.write_all(request.as_bytes())).await.ok()?.ok()?;

        let mut buffer = vec![0u8; 4096];
        let n = timeout(self.timeout, stream.read(&mut buffer)).await.ok()?.ok()?;
        let response = String::from_utf8_lossy(&buffer[..n]);
        if !response.starts_with("HTTP") {
            return None;
        }

        Some(ServiceInfo {
            name: "http".to_string(),
            product: header_value(&response, "Server").unwrap_or_default(),
            banner: probes::sanitize_banner(response.as_bytes()),
            ..ServiceInfo::default()
        })
    }
}

fn header_value(response: &str, name: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

/// 从横幅中提取服务名、版本与产品信息。
pub fn parse_banner(banner: &str) -> ServiceInfo {
    let mut info = ServiceInfo::default();

    if let Some(rest) = banner.strip_prefix("SSH-") {
        info.name = "ssh".to_string();
        info.version = rest
            .lines()
            .next()
            .unwrap_or_default()
            .chars()
            .take(46)
            .collect::<String>()
            .trim()
            .to_string();
        return info;
    }

    if banner.get(..4).is_some_and(|prefix| prefix.eq_ignore_ascii_case("http")) {
        info.name = "http".to_string();
        info.product = header_value(banner, "Server").unwrap_or_default();
        return info;
    }

    if contains_ignore_case(banner, "mysql") || contains_ignore_case(banner, "mariadb") {
        info.name = "mysql".to_string();
        return info;
    }

    if contains_ignore_case(banner, "postgresql") {
        info.name = "postgresql".to_string();
        return info;
    }

    if contains_ignore_case(banner, "redis") || banner.starts_with('-') || banner.starts_with('+') {
        info.name = "redis".to_string();
        return info;
    }

    if banner.starts_with("220") || banner.starts_with("250 ") {
        let name = if contains_ignore_case(banner, "smtp") || contains_ignore_case(banner, "mail") {
            "smtp"
        } else {
            "ftp"
        };
        info.name = name.to_string();
        return info;
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_ssh_banner() {
        let info = parse_banner("SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5\r\n");
        assert_eq!(info.name, "ssh");
        assert_eq!(info.version, "2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5");
    }

    #[test]
    fn test_parse_http_banner() {
        let info = parse_banner("HTTP/1.1 400 Bad Request\r\nServer: nginx/1.18.0\r\nContent-Length: 0\r\n");
        assert_eq!(info.name, "http");
        assert_eq!(info.product, "nginx/1.18.0");
    }

    #[test]
    fn test_parse_ftp_vs_smtp() {
        assert_eq!(parse_banner("220 ProFTPD Server ready").name, "ftp");
        assert_eq!(parse_banner("220 mx.example.com ESMTP Postfix").name, "smtp");
        assert_eq!(parse_banner("-ERR unknown command").name, "redis");
        assert_eq!(parse_banner("J\x00\x00\x00\n5.7.33").name, "");
    }

    #[tokio::test]
    async fn test_identify_uses_port_table_first() {
        let detector = ServiceDetector::new(Duration::from_millis(200));
        let (name, banner) = detector.identify("127.0.0.1", 22).await;
        assert_eq!(name, "ssh");
        assert!(banner.is_none());
    }

    #[tokio::test]
    async fn test_detect_reads_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"SSH-2.0-dropbear_2022.83\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let detector = ServiceDetector::new(Duration::from_millis(300));
        let info = detector.detect("127.0.0.1", port).await;
        assert_eq!(info.name, "ssh");
        assert_eq!(info.version, "2.0-dropbear_2022.83");
        assert!(info.banner.starts_with("SSH-"));
    }
}
