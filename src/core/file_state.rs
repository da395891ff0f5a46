//! 文件指纹 - 会话内跳过内容未变化的重复上传

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// 计算文件内容的 hash（使用 BLAKE3 快速哈希）
pub fn calculate_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    // 只取前 16 字节（32 个十六进制字符），足够检测变化
    hash.to_hex()[..32].to_string()
}

/// 快速计算文件 hash（基于采样，适用于大文件）
pub fn calculate_quick_hash(data: &[u8]) -> String {
    let len = data.len();
    if len <= 65536 {
        // 小于 64KB，完整哈希
        return calculate_hash(data);
    }

    // 大文件：采样哈希（头部 + 中部 + 尾部 + 大小）
    let mut hasher = blake3::Hasher::new();
    let chunk_size = 16384; // 16KB

    hasher.update(&data[..chunk_size]);
    hasher.update(&data[len / 2 - chunk_size / 2..len / 2 + chunk_size / 2]);
    hasher.update(&data[len - chunk_size..]);
    hasher.update(&len.to_le_bytes());

    let hash = hasher.finalize();
    hash.to_hex()[..32].to_string()
}

/// 最近一次成功上传的内容指纹，按相对路径索引。
///
/// 只在一个会话内有效（跨重启保留，stopSync 后丢弃），不落盘。
#[derive(Debug, Clone, Default)]
pub struct FingerprintCache {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内容是否与上次成功上传的一致
    pub fn is_unchanged(&self, path: &str, fingerprint: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .is_some_and(|f| f == fingerprint)
    }

    pub fn record(&self, path: &str, fingerprint: String) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), fingerprint);
    }

    /// 删除路径及其子路径的指纹
    pub fn forget(&self, path: &str) {
        let child_prefix = format!("{}/", path);
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|k, _| k != path && !k.starts_with(&child_prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_hash_detects_changes() {
        let small_a = calculate_quick_hash(b"hello");
        let small_b = calculate_quick_hash(b"hellO");
        assert_ne!(small_a, small_b);
        assert_eq!(small_a.len(), 32);

        let mut large = vec![0u8; 200_000];
        let before = calculate_quick_hash(&large);
        let last = large.len() - 1;
        large[last] = 1;
        assert_ne!(before, calculate_quick_hash(&large));
    }

    #[test]
    fn test_fingerprint_cache() {
        let cache = FingerprintCache::new();
        let fp = calculate_hash(b"content");
        assert!(!cache.is_unchanged("a.txt", &fp));

        cache.record("a.txt", fp.clone());
        assert!(cache.is_unchanged("a.txt", &fp));
        assert!(!cache.is_unchanged("a.txt", &calculate_hash(b"other")));

        cache.record("dir/b.txt", fp.clone());
        cache.forget("dir");
        assert!(!cache.is_unchanged("dir/b.txt", &fp));
        assert!(cache.is_unchanged("a.txt", &fp));
    }
}
