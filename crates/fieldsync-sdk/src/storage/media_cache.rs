//! 共享图片缓存
//!
//! 附件上传成功后，图片字节按服务端 URL 入缓存，UI 层随后按 URL 取图
//! 就不必立刻回源下载刚上传的内容。容量按总字节数封顶，满了按插入序淘汰。

use std::collections::HashMap;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

/// 默认缓存容量（字节）
pub const DEFAULT_MEDIA_CACHE_CAPACITY: usize = 64 * 1024 * 1024;

struct CacheInner {
    entries: HashMap<String, Bytes>,
    // 插入顺序，淘汰用
    order: Vec<String>,
    total_bytes: usize,
}

/// URL → 字节 的进程内缓存
pub struct MediaCache {
    inner: Mutex<CacheInner>,
    capacity_bytes: usize,
}

impl MediaCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
                total_bytes: 0,
            }),
            capacity_bytes,
        }
    }

    /// 写入一条缓存；超过容量的单条直接拒收
    pub fn put(&self, url: &str, data: Bytes) {
        if data.len() > self.capacity_bytes {
            debug!("media cache 拒收超容量条目: {} ({} bytes)", url, data.len());
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(url) {
            inner.total_bytes -= old.len();
            inner.order.retain(|k| k != url);
        }
        inner.total_bytes += data.len();
        inner.entries.insert(url.to_string(), data);
        inner.order.push(url.to_string());
        // 按插入序淘汰到容量以内
        while inner.total_bytes > self.capacity_bytes {
            let oldest = inner.order.remove(0);
            if let Some(evicted) = inner.entries.remove(&oldest) {
                inner.total_bytes -= evicted.len();
                debug!("media cache 淘汰: {}", oldest);
            }
        }
    }

    pub fn get(&self, url: &str) -> Option<Bytes> {
        self.inner.lock().entries.get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

impl Default for MediaCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEDIA_CACHE_CAPACITY)
    }
}
