use crate::error::ScanError;
use std::io;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// 发起 TCP 连接，本地资源耗尽 (端口/文件句柄) 时退避重试直至超时。
async fn connect_with_backoff(host: &str, port: u16, timeout_duration: Duration) -> io::Result<TcpStream> {
    let start = Instant::now();
    let mut backoff = 20;

    loop {
        let remaining = timeout_duration.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connection timed out"));
        }

        let connect_result = timeout(remaining, TcpStream::connect((host, port)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))?;

        match connect_result {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                let raw_err = e.raw_os_error().unwrap_or(0);
                // 本地端口耗尽 (EADDRINUSE / WSAEADDRINUSE)
                if raw_err == 98 || raw_err == 48 || raw_err == 10048 {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    backoff = (backoff * 2).min(2000);
                    continue;
                }
                // 文件句柄耗尽 / 地址不可用
                if raw_err == 24 || raw_err == 99 || raw_err == 10024 || raw_err == 10049 {
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(1000);
                    continue;
                }
                return Err(e);
            }
        }
    }
}

pub async fn connect(host: &str, port: u16, timeout_duration: Duration) -> Result<TcpStream, ScanError> {
    connect_with_backoff(host, port, timeout_duration)
        .await
        .map_err(|e| {
            let target = format!("{}:{}", host, port);
            if e.kind() == io::ErrorKind::TimedOut {
                ScanError::Timeout {
                    target,
                    timeout_ms: timeout_duration.as_millis() as u64,
                }
            } else {
                ScanError::ConnectionFailed {
                    target,
                    reason: e.to_string(),
                }
            }
        })
}
