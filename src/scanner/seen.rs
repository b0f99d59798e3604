use parking_lot::Mutex;
use std::collections::HashSet;
use url::Url;

/// 并发安全的去重集合，insert 为原子的“检查并插入”。
#[derive(Debug, Default)]
pub struct SeenSet {
    keys: Mutex<HashSet<String>>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 首次出现返回 true。
    pub fn insert(&self, key: impl Into<String>) -> bool {
        self.keys.lock().insert(key.into())
    }

    /// 集合未达到 cap 且 key 首次出现时插入并返回 true。
    pub fn insert_within(&self, key: impl Into<String>, cap: usize) -> bool {
        let key = key.into();
        let mut keys = self.keys.lock();
        if keys.len() >= cap || keys.contains(&key) {
            return false;
        }
        keys.insert(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    /// 按 scheme://host[:port]/path 归一化后去重，查询串与片段不参与比较。
    pub fn mark_url(&self, raw: &str) -> bool {
        match normalize_url(raw) {
            Some(key) => self.insert(key),
            None => false,
        }
    }

    pub fn mark_url_within(&self, raw: &str, cap: usize) -> bool {
        match normalize_url(raw) {
            Some(key) => self.insert_within(key, cap),
            None => false,
        }
    }
}

pub fn normalize_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    Some(format!("{}://{}{}", url.scheme(), authority, url.path()))
}
