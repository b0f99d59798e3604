pub mod adaptive;
pub mod circuit_breaker;
pub mod pool;
pub mod portscan;
pub mod probes;
pub mod rate_limit;
pub mod resolver;
pub mod retry;
pub mod seen;
pub mod service_detect;
pub mod service_map;
pub mod subdomain;
pub mod tcp_connect;

use chrono::{SecondsFormat, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 每次运行的默认截止时间。
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// RFC3339 UTC 时间戳，秒级精度。
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// 派生一个子令牌，父令牌取消或到达截止时间时取消。
///
/// 调用方持有返回令牌的 drop guard，运行结束即回收计时任务。
pub fn deadline_token(parent: &CancellationToken, deadline: Duration) -> CancellationToken {
    let token = parent.child_token();
    if deadline.is_zero() {
        return token;
    }

    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => {
                warn!(deadline_secs = deadline.as_secs(), "达到截止时间，停止调度新任务");
                timer.cancel();
            }
            _ = timer.cancelled() => {}
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_format() {
        let ts = timestamp();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
        assert!(!ts.contains('.'));
    }

    #[tokio::test]
    async fn test_deadline_token_fires() {
        let parent = CancellationToken::new();
        let token = deadline_token(&parent, Duration::from_millis(30));
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_token_follows_parent() {
        let parent = CancellationToken::new();
        let token = deadline_token(&parent, Duration::from_secs(60));
        parent.cancel();
        assert!(token.is_cancelled());
    }
}
