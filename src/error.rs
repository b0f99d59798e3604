use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("网络连接失败: {target} - {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("连接超时: {target} ({timeout_ms}ms)")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("DNS解析失败: {domain} - {reason}")]
    DnsResolutionFailed { domain: String, reason: String },

    #[error("HTTP请求失败: {url} - {reason}")]
    HttpError { url: String, reason: String },

    #[error("TLS握手失败: {host} - {reason}")]
    TlsHandshakeFailed { host: String, reason: String },

    #[error("文件操作失败: {path}")]
    FileError {
        path: String,
        source: std::io::Error,
    },

    #[error("配置错误: {0}")]
    Config(String),

    #[error("端口范围无效: {0}")]
    InvalidPortRange(String),

    #[error("目标格式无效: {0}")]
    InvalidTarget(String),

    #[error("操作已取消")]
    Cancelled,

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("max retries ({retries}) exceeded: {source}")]
    RetriesExhausted {
        retries: u32,
        source: Box<ScanError>,
    },

    #[error("工作池已关闭")]
    PoolClosed,

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 错误类别，用作重试配置中的可重试集合。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionFailed,
    Timeout,
    DnsResolutionFailed,
    HttpError,
    TlsHandshakeFailed,
    FileError,
    Config,
    InvalidPortRange,
    InvalidTarget,
    Cancelled,
    CircuitOpen,
    RetriesExhausted,
    PoolClosed,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailed => "ConnectionFailed",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::DnsResolutionFailed => "DnsResolutionFailed",
            ErrorKind::HttpError => "HttpError",
            ErrorKind::TlsHandshakeFailed => "TlsHandshakeFailed",
            ErrorKind::FileError => "FileError",
            ErrorKind::Config => "Config",
            ErrorKind::InvalidPortRange => "InvalidPortRange",
            ErrorKind::InvalidTarget => "InvalidTarget",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::CircuitOpen => "CircuitOpen",
            ErrorKind::RetriesExhausted => "RetriesExhausted",
            ErrorKind::PoolClosed => "PoolClosed",
            ErrorKind::Io => "Io",
        }
    }
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            ScanError::Timeout { .. } => ErrorKind::Timeout,
            ScanError::DnsResolutionFailed { .. } => ErrorKind::DnsResolutionFailed,
            ScanError::HttpError { .. } => ErrorKind::HttpError,
            ScanError::TlsHandshakeFailed { .. } => ErrorKind::TlsHandshakeFailed,
            ScanError::FileError { .. } => ErrorKind::FileError,
            ScanError::Config(_) => ErrorKind::Config,
            ScanError::InvalidPortRange(_) => ErrorKind::InvalidPortRange,
            ScanError::InvalidTarget(_) => ErrorKind::InvalidTarget,
            ScanError::Cancelled => ErrorKind::Cancelled,
            ScanError::CircuitOpen => ErrorKind::CircuitOpen,
            ScanError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            ScanError::PoolClosed => ErrorKind::PoolClosed,
            ScanError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScanError::Timeout { .. }
                | ScanError::ConnectionFailed { .. }
                | ScanError::DnsResolutionFailed { .. }
                | ScanError::HttpError { .. }
        )
    }

    /// 重试耗尽时返回最后一次的底层错误，其余情况返回自身。
    pub fn last_failure(&self) -> &ScanError {
        match self {
            ScanError::RetriesExhausted { source, .. } => source.last_failure(),
            other => other,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ScanError::Config(_)
            | ScanError::InvalidPortRange(_)
            | ScanError::InvalidTarget(_) => ErrorSeverity::Critical,
            ScanError::FileError { .. } | ScanError::PoolClosed => ErrorSeverity::High,
            ScanError::DnsResolutionFailed { .. }
            | ScanError::TlsHandshakeFailed { .. }
            | ScanError::HttpError { .. }
            | ScanError::CircuitOpen
            | ScanError::RetriesExhausted { .. } => ErrorSeverity::Medium,
            ScanError::Timeout { .. }
            | ScanError::ConnectionFailed { .. }
            | ScanError::Cancelled
            | ScanError::Io(_) => ErrorSeverity::Low,
        }
    }

    pub fn user_hint(&self) -> Option<String> {
        match self.last_failure() {
            ScanError::Timeout { .. } => {
                Some("提示：尝试增加超时时间 (-t 参数) 或降低并发数 (-c 参数)".to_string())
            }
            ScanError::ConnectionFailed { .. } => {
                Some("提示：检查目标是否在线，或者防火墙是否阻止了连接".to_string())
            }
            ScanError::DnsResolutionFailed { .. } => {
                Some("提示：检查DNS服务器设置 (--resolvers 参数) 或网络连接".to_string())
            }
            ScanError::FileError { .. } => Some("提示：确认文件路径存在且可读".to_string()),
            ScanError::Cancelled => Some("提示：扫描超出截止时间，可通过 --deadline 调整".to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorStats {
    pub total: usize,
    pub by_kind: HashMap<ErrorKind, usize>,
    pub critical_count: usize,
    pub high_count: usize,
    pub medium_count: usize,
    pub low_count: usize,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, error: &ScanError) {
        self.total += 1;
        *self.by_kind.entry(error.last_failure().kind()).or_insert(0) += 1;

        match error.severity() {
            ErrorSeverity::Critical => self.critical_count += 1,
            ErrorSeverity::High => self.high_count += 1,
            ErrorSeverity::Medium => self.medium_count += 1,
            ErrorSeverity::Low => self.low_count += 1,
        }
    }

    pub fn summary(&self) -> String {
        if self.total == 0 {
            return "无错误".to_string();
        }

        let mut summary = format!("总错误数: {}", self.total);

        if self.critical_count > 0 {
            summary.push_str(&format!(" | 致命: {}", self.critical_count));
        }
        if self.high_count > 0 {
            summary.push_str(&format!(" | 严重: {}", self.high_count));
        }
        if self.medium_count > 0 {
            summary.push_str(&format!(" | 中等: {}", self.medium_count));
        }
        if self.low_count > 0 {
            summary.push_str(&format!(" | 轻微: {}", self.low_count));
        }

        let mut kinds: Vec<_> = self.by_kind.iter().collect();
        kinds.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        let detail: Vec<String> = kinds
            .iter()
            .map(|(kind, count)| format!("{}={}", kind.as_str(), count))
            .collect();
        if !detail.is_empty() {
            summary.push_str(&format!(" ({})", detail.join(", ")));
        }

        summary
    }
}
