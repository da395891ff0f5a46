pub mod bucket;
#[cfg(test)]
pub mod memory;

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use bucket::BucketStore;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- list, stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 对象信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectInfo {
    /// 完整 key；分隔符列表中的公共前缀以 `/` 结尾
    pub key: String,
    pub size: u64,
    pub updated_at: Option<DateTime<Utc>>,
    /// 是否为分隔符前缀（或 `key/` 占位对象）
    pub is_prefix: bool,
}

/// 对象存储抽象接口
///
/// key 一律使用 `/` 分隔，不带前导 `/`；空前缀表示 bucket 根。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 列出 prefix 下的对象。
    ///
    /// `delimited` 为 true 时只返回直接子项，子前缀作为 `is_prefix` 条目返回；
    /// 为 false 时递归返回所有 key。
    async fn list(&self, prefix: &str, delimited: bool) -> SyncResult<Vec<ObjectInfo>>;

    /// 读取整个对象
    async fn get(&self, key: &str) -> SyncResult<Bytes>;

    /// 写入整个对象
    async fn put(&self, key: &str, data: Bytes) -> SyncResult<()>;

    /// 删除单个对象，不存在时不报错
    async fn delete(&self, key: &str) -> SyncResult<()>;

    /// 创建文件夹占位对象（`key/`，零字节），幂等
    async fn create_folder(&self, key: &str) -> SyncResult<()> {
        let key = format!("{}/", key.trim_end_matches('/'));
        self.put(&key, Bytes::new()).await
    }

    /// 复制对象（同一 bucket 内）
    async fn copy(&self, from: &str, to: &str) -> SyncResult<()> {
        let data = self.get(from).await?;
        self.put(to, data).await
    }

    /// 重命名：复制后删除
    async fn rename(&self, from: &str, to: &str) -> SyncResult<()> {
        self.copy(from, to).await?;
        self.delete(from).await
    }

    /// 递归删除 prefix 下所有对象，返回删除数量
    async fn delete_prefix(&self, prefix: &str) -> SyncResult<usize> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let mut objects = self.list(&prefix, false).await?;
        // 先删子项，最后删占位对象本身
        objects.sort_by(|a, b| b.key.len().cmp(&a.key.len()));

        let mut deleted = 0;
        for object in objects.iter().filter(|o| o.key != prefix) {
            self.delete(&object.key).await?;
            deleted += 1;
        }
        // list 不一定返回前缀自身的占位对象
        self.delete(&prefix).await?;
        Ok(deleted)
    }

    /// bucket 名称
    fn bucket(&self) -> &str;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    Gcs,
    S3,
    /// 本地目录模拟 bucket
    Fs,
}

/// 存储连接配置（凭据部分由调用方提供，本模块不负责发现或导入）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// GCS 服务账号 JSON 文件路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_path: Option<String>,
    /// fs 后端的根目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_bucket: Option<String>,
}

/// 根据配置连接指定 bucket，并做一次探测以尽早暴露认证错误
pub async fn connect(config: &StorageConfig, bucket: &str) -> SyncResult<Arc<dyn ObjectStore>> {
    if bucket.trim().is_empty() {
        return Err(SyncError::Config("bucket 名称不能为空".to_string()));
    }

    let store = match config.provider {
        StorageProvider::S3 => {
            let region = config
                .region
                .as_deref()
                .ok_or_else(|| SyncError::Config("S3 storage requires region".to_string()))?;
            let access_key = config
                .access_key
                .as_deref()
                .ok_or_else(|| SyncError::Auth("S3 storage requires accessKey".to_string()))?;
            let secret_key = config
                .secret_key
                .as_deref()
                .ok_or_else(|| SyncError::Auth("S3 storage requires secretKey".to_string()))?;
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            BucketStore::s3(bucket, region, access_key, secret_key, config.endpoint.as_deref())?
        }
        StorageProvider::Gcs => {
            let credential_path = config
                .credential_path
                .as_deref()
                .ok_or_else(|| SyncError::Auth("GCS storage requires credentialPath".to_string()))?;
            tracing::info!("初始化GCS存储: bucket={}", bucket);
            BucketStore::gcs(bucket, credential_path, config.endpoint.as_deref())?
        }
        StorageProvider::Fs => {
            let root = config
                .root
                .as_deref()
                .ok_or_else(|| SyncError::Config("fs storage requires root".to_string()))?;
            tracing::info!("初始化本地模拟存储: root={}, bucket={}", root, bucket);
            BucketStore::fs(root, bucket)?
        }
    };

    store.probe().await?;
    Ok(Arc::new(store) as Arc<dyn ObjectStore>)
}
