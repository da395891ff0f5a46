use super::{ObjectInfo, ObjectStore, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Builder, Metakey, Operator};
use std::time::Duration;
use tracing::debug;

/// 基于 OpenDAL 的单 bucket 存储，进程内长期持有，连接复用
pub struct BucketStore {
    operator: Operator,
    bucket: String,
    name: String,
}

impl BucketStore {
    pub fn s3(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<&str>,
    ) -> SyncResult<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        Self::build(builder, bucket, format!("s3://{}", bucket))
    }

    pub fn gcs(bucket: &str, credential_path: &str, endpoint: Option<&str>) -> SyncResult<Self> {
        use opendal::services::Gcs;

        let mut builder = Gcs::default().bucket(bucket).credential_path(credential_path);

        if let Some(ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        Self::build(builder, bucket, format!("gs://{}", bucket))
    }

    /// 用本地目录 `root/bucket` 模拟一个 bucket
    pub fn fs(root: &str, bucket: &str) -> SyncResult<Self> {
        use opendal::services::Fs;

        let dir = std::path::Path::new(root).join(bucket);
        std::fs::create_dir_all(&dir).map_err(|e| SyncError::from_io(root, e))?;
        let builder = Fs::default().root(&dir.to_string_lossy());

        Self::build(builder, bucket, format!("fs://{}", dir.display()))
    }

    fn build<B: Builder>(builder: B, bucket: &str, name: String) -> SyncResult<Self> {
        // 添加超时层，单次调用最长等待时间有上限
        let operator = Operator::new(builder)
            .map_err(|e| SyncError::Config(e.to_string()))?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        Ok(Self {
            operator,
            bucket: bucket.to_string(),
            name,
        })
    }

    /// 列出根目录的第一个条目，用于验证凭据和 bucket 是否可用
    pub async fn probe(&self) -> SyncResult<()> {
        let mut lister = self
            .operator
            .lister_with("/")
            .await
            .map_err(SyncError::from_storage)?;
        lister.try_next().await.map_err(SyncError::from_storage)?;
        debug!("存储可访问: {}", self.name);
        Ok(())
    }

    fn list_path(prefix: &str) -> String {
        let prefix = prefix.trim_start_matches('/');
        if prefix.is_empty() {
            "/".to_string()
        } else if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{}/", prefix)
        }
    }
}

#[async_trait]
impl ObjectStore for BucketStore {
    async fn list(&self, prefix: &str, delimited: bool) -> SyncResult<Vec<ObjectInfo>> {
        let path = Self::list_path(prefix);
        let mut objects = Vec::new();

        let mut lister = self
            .operator
            .lister_with(&path)
            .recursive(!delimited)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await
            .map_err(SyncError::from_storage)?;

        while let Some(entry) = lister.try_next().await.map_err(SyncError::from_storage)? {
            let key = entry.path().trim_start_matches('/').to_string();

            // 跳过根目录和前缀自身
            if key.is_empty() || key == path {
                continue;
            }

            let meta = entry.metadata();
            let is_prefix = meta.is_dir() || key.ends_with('/');

            objects.push(ObjectInfo {
                key,
                size: if is_prefix { 0 } else { meta.content_length() },
                updated_at: meta.last_modified(),
                is_prefix,
            });
        }

        debug!("list {} (delimited={}): {} 个条目", path, delimited, objects.len());
        Ok(objects)
    }

    async fn get(&self, key: &str) -> SyncResult<Bytes> {
        let data = self
            .operator
            .read(key)
            .await
            .map_err(SyncError::from_storage)?;
        Ok(data.to_bytes())
    }

    async fn put(&self, key: &str, data: Bytes) -> SyncResult<()> {
        if key.ends_with('/') {
            // 目录占位对象交给后端自己的 create_dir 语义
            return self
                .operator
                .create_dir(key)
                .await
                .map_err(|e| SyncError::from_upload(key, e));
        }
        self.operator
            .write(key, data)
            .await
            .map_err(|e| SyncError::from_upload(key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        // 对象存储删除不存在的 key 不会报错
        self.operator
            .delete(key)
            .await
            .map_err(SyncError::from_storage)
    }

    async fn create_folder(&self, key: &str) -> SyncResult<()> {
        let dir_path = format!("{}/", key.trim_end_matches('/'));
        self.operator
            .create_dir(&dir_path)
            .await
            .map_err(|e| SyncError::from_upload(&dir_path, e))
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_path() {
        assert_eq!(BucketStore::list_path(""), "/");
        assert_eq!(BucketStore::list_path("Desktop"), "Desktop/");
        assert_eq!(BucketStore::list_path("/Desktop/sub/"), "Desktop/sub/");
    }

    #[tokio::test]
    async fn test_fs_bucket_folder_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = BucketStore::fs(dir.path().to_str().unwrap(), "b1").unwrap();

        store.create_folder("Desktop").await.unwrap();
        store
            .put("Desktop/a.txt", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let top = store.list("", true).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].key, "Desktop/");
        assert!(top[0].is_prefix);

        let inner = store.list("Desktop", true).await.unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].key, "Desktop/a.txt");
        assert_eq!(inner[0].size, 10);

        store.delete("Desktop/a.txt").await.unwrap();
        assert!(store.list("Desktop", true).await.unwrap().is_empty());
    }
}
