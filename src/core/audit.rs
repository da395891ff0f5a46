//! 远端审计：查看最近更新的对象、清理本地已不存在的远端对象

use crate::core::scanner::absolute_path;
use crate::error::SyncResult;
use crate::storage::{ObjectInfo, ObjectStore};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

/// 按更新时间倒序列出最近的 `limit` 个对象（不含文件夹占位）
pub async fn latest_objects(store: &dyn ObjectStore, limit: usize) -> SyncResult<Vec<ObjectInfo>> {
    let mut objects: Vec<ObjectInfo> = store
        .list("", false)
        .await?
        .into_iter()
        .filter(|o| !o.is_prefix)
        .collect();
    objects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.key.cmp(&b.key)));
    objects.truncate(limit);
    Ok(objects)
}

/// 清理结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub processed: usize,
    pub purged: Vec<String>,
    /// (key, 失败原因)
    pub failed: Vec<(String, String)>,
    pub dry_run: bool,
}

/// 删除 `root_folder/` 下本地对应路径已不存在的远端对象。
///
/// 单个删除失败只记录，不中断审计。列表失败直接返回错误。
pub async fn purge_ghosts(
    store: &dyn ObjectStore,
    root_folder: &str,
    local_root: &Path,
    dry_run: bool,
) -> SyncResult<PurgeReport> {
    let prefix = format!("{}/", root_folder.trim_matches('/'));
    let objects = store.list(&prefix, false).await?;

    let mut report = PurgeReport {
        dry_run,
        ..Default::default()
    };

    // 子项先于占位对象处理
    let mut keys: Vec<String> = objects.into_iter().map(|o| o.key).collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    for key in keys {
        report.processed += 1;
        let relative = key[prefix.len()..].trim_matches('/');
        if relative.is_empty() {
            continue;
        }
        if absolute_path(local_root, relative).exists() {
            continue;
        }

        if dry_run {
            info!("发现残留对象（未删除）: {}", key);
            report.purged.push(key);
            continue;
        }

        match store.delete(&key).await {
            Ok(()) => {
                info!("已清理残留对象: {}", key);
                report.purged.push(key);
            }
            Err(e) => {
                warn!("清理 {} 失败: {}", key, e);
                report.failed.push((key, e.to_string()));
            }
        }
    }

    info!(
        "审计完成: 处理 {} 个对象, 清理 {} 个, 失败 {} 个",
        report.processed,
        report.purged.len(),
        report.failed.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::storage::memory::MemoryStore;

    fn local_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kept.txt"), b"k").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        dir
    }

    fn remote_tree() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert("Desktop/", b"");
        store.insert("Desktop/kept.txt", b"k");
        store.insert("Desktop/gone.txt", b"g");
        store.insert("Desktop/docs/", b"");
        store.insert("Desktop/old/", b"");
        store.insert("Desktop/old/x.txt", b"x");
        store.insert("Other/file.txt", b"o");
        store
    }

    #[tokio::test]
    async fn test_purge_removes_only_ghosts() {
        let local = local_tree();
        let store = remote_tree();

        let report = purge_ghosts(&store, "Desktop", local.path(), false).await.unwrap();
        assert_eq!(report.processed, 5);
        assert_eq!(report.purged.len(), 3);
        assert!(report.failed.is_empty());

        assert_eq!(
            store.keys(),
            vec!["Desktop/", "Desktop/docs/", "Desktop/kept.txt", "Other/file.txt"]
        );
    }

    #[tokio::test]
    async fn test_purge_dry_run_deletes_nothing() {
        let local = local_tree();
        let store = remote_tree();
        let before = store.keys();

        let report = purge_ghosts(&store, "Desktop", local.path(), true).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.purged.len(), 3);
        assert_eq!(store.keys(), before);
    }

    #[tokio::test]
    async fn test_purge_listing_failure_is_error() {
        let local = local_tree();
        let store = MemoryStore::failing(SyncError::Auth("denied".to_string()));
        let result = purge_ghosts(&store, "Desktop", local.path(), false).await;
        assert!(matches!(result, Err(SyncError::Auth(_))));
    }

    #[tokio::test]
    async fn test_latest_objects_newest_first() {
        let store = MemoryStore::new();
        store.insert("a.txt", b"a");
        store.insert("dir/", b"");
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.insert("dir/b.txt", b"bb");

        let latest = latest_objects(&store, 10).await.unwrap();
        let keys: Vec<_> = latest.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["dir/b.txt", "a.txt"]);

        let latest = latest_objects(&store, 1).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].size, 2);
    }

    #[tokio::test]
    async fn test_latest_objects_empty_bucket() {
        let store = MemoryStore::new();
        assert!(latest_objects(&store, 10).await.unwrap().is_empty());
    }
}
