use crate::error::SyncResult;
use crate::models::{RemoteEntry, RemoteListing};
use crate::storage::ObjectStore;
use futures::future::try_join_all;
use tracing::debug;

/// 远端列表
///
/// 一次只列一层。每个子文件夹额外发两次列表请求统计文件数和子文件夹数，
/// 延迟与文件夹数量成正比。失败时返回错误，不会伪装成空列表。
pub struct RemoteLister<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> RemoteLister<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    /// 规范化前缀：去掉前导 `/`，非空时以 `/` 结尾
    pub fn normalize_prefix(prefix: &str) -> String {
        let prefix = prefix.replace('\\', "/");
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix)
        }
    }

    pub async fn list(&self, prefix: &str) -> SyncResult<RemoteListing> {
        let prefix = Self::normalize_prefix(prefix);
        let objects = self.store.list(&prefix, true).await?;

        let mut listing = RemoteListing::default();
        let mut folder_keys = Vec::new();

        for object in objects {
            if object.key == prefix {
                continue;
            }
            if object.is_prefix {
                folder_keys.push(object.key);
            } else {
                listing.files.push(RemoteEntry {
                    name: object.key,
                    is_folder: false,
                    size: object.size,
                    updated_at: object.updated_at,
                    file_count: 0,
                    folder_count: 0,
                });
            }
        }

        listing.folders = try_join_all(folder_keys.into_iter().map(|key| self.describe_folder(key))).await?;

        debug!(
            "远端列表 {}:{} -> {} 个文件, {} 个文件夹",
            self.store.name(),
            prefix,
            listing.files.len(),
            listing.folders.len()
        );
        Ok(listing)
    }

    /// 统计文件夹下的文件总数（递归）和直接子文件夹数
    async fn describe_folder(&self, key: String) -> SyncResult<RemoteEntry> {
        let all = self.store.list(&key, false).await?;
        let file_count = all.iter().filter(|o| !o.key.ends_with('/')).count() as u32;
        let updated_at = all.iter().filter_map(|o| o.updated_at).max();

        let children = self.store.list(&key, true).await?;
        let folder_count = children
            .iter()
            .filter(|o| o.is_prefix && o.key != key)
            .count() as u32;

        Ok(RemoteEntry {
            name: key,
            is_folder: true,
            size: 0,
            updated_at,
            file_count,
            folder_count,
        })
    }
}
