use crate::scanner::tcp_connect;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const MAX_BANNER_LEN: usize = 256;
const BANNER_BUFFER: usize = 4096;

/// 无主动横幅时依次发送的通用探针。
pub const GENERIC_PROBES: &[&[u8]] = &[b"\r\n", b"HEAD / HTTP/1.0\r\n\r\n", b"HELP\r\n"];

/// 横幅关键字 -> 服务名，按顺序匹配，大小写不敏感。
const BANNER_SIGNATURES: &[(&str, &str)] = &[
    ("SSH", "ssh"),
    ("HTTP", "http"),
    ("SMTP", "smtp"),
    ("FTP", "ftp"),
    ("MySQL", "mysql"),
    ("PostgreSQL", "postgresql"),
    ("MongoDB", "mongodb"),
    ("Redis", "redis"),
    ("nginx", "nginx"),
    ("Apache", "apache"),
];

async fn read_with_timeout(stream: &mut TcpStream, buffer: &mut [u8], wait: Duration) -> usize {
    let start = Instant::now();
    let mut total_read = match timeout(wait, stream.read(buffer)).await {
        Ok(Ok(n)) => n,
        _ => return 0,
    };
    if total_read == 0 {
        return 0;
    }

    while total_read < buffer.len() {
        if start.elapsed() >= wait {
            break;
        }
        match timeout(Duration::from_millis(200), stream.read(&mut buffer[total_read..])).await {
            Ok(Ok(n)) if n > 0 => total_read += n,
            _ => break,
        }
    }
    total_read
}

/// 建立连接后先被动读取横幅，无数据时逐个发送探针再读取。
pub async fn grab_banner(host: &str, port: u16, connect_timeout: Duration, read_timeout: Duration) -> Option<String> {
    let mut stream = tcp_connect::connect(host, port, connect_timeout).await.ok()?;
    let mut buffer = vec![0u8; BANNER_BUFFER];

    let mut n = read_with_timeout(&mut stream, &mut buffer, read_timeout).await;
    if n == 0 {
        for probe in GENERIC_PROBES {
            if timeout(read_timeout, stream.write_all(probe)).await.is_err() {
                break;
            }
            n = read_with_timeout(&mut stream, &mut buffer, read_timeout).await;
            if n > 0 {
                break;
            }
        }
    }

    let banner = sanitize_banner(&buffer[..n]);
    (!banner.trim().is_empty()).then_some(banner)
}

/// 仅保留可打印 ASCII 与 \r\n\t，截断到 256 字节。
pub fn sanitize_banner(raw: &[u8]) -> String {
    raw.iter()
        .copied()
        .filter(|b| (32..127).contains(b) || matches!(b, b'\n' | b'\r' | b'\t'))
        .take(MAX_BANNER_LEN)
        .map(char::from)
        .collect()
}

/// 输出用：折叠换行与连续空白。
pub fn clean_banner(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut last_was_space = false;

    for c in s.chars() {
        let c = if c == '\n' || c == '\r' || c == '\t' { ' ' } else { c };
        if !(c.is_ascii_graphic() || c == ' ') {
            continue;
        }
        if c == ' ' {
            if !last_was_space {
                result.push(c);
            }
            last_was_space = true;
        } else {
            result.push(c);
            last_was_space = false;
        }
    }

    result.trim().to_string()
}

pub fn identify_from_banner(banner: &str) -> &'static str {
    let lower = banner.to_lowercase();
    BANNER_SIGNATURES
        .iter()
        .find(|(keyword, _)| lower.contains(&keyword.to_lowercase()))
        .map(|(_, name)| *name)
        .unwrap_or("unknown")
}

pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
