//! 同步状态跟踪 - 相对路径到同步状态的内存映射

use crate::models::{normalize_relative, SyncStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// 单个路径的状态记录
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedStatus {
    pub status: SyncStatus,
    /// 失败原因（仅 error 状态）
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// 状态统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub pending: usize,
    pub uploading: usize,
    pub synced: usize,
    pub error: usize,
}

/// 状态跟踪器
///
/// 进程内共享，克隆得到同一份映射。各 key 的更新互不相关，一把互斥锁足够。
/// key 为同步根下的相对路径（`/` 分隔）。
#[derive(Debug, Clone, Default)]
pub struct StatusTracker {
    inner: Arc<Mutex<HashMap<String, TrackedStatus>>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedStatus>> {
        // 持锁期间不会 panic，中毒时直接沿用内部数据
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 设置状态，返回状态是否真的发生了变化。
    ///
    /// synced 不能直接回到 pending，必须先经过 [`forget`](Self::forget)（即删除事件）。
    pub fn set(&self, path: &str, status: SyncStatus) -> bool {
        self.set_with_message(path, status, None)
    }

    pub fn set_with_message(&self, path: &str, status: SyncStatus, message: Option<String>) -> bool {
        let key = normalize_relative(path);
        let mut map = self.lock();

        if let Some(current) = map.get(&key) {
            if current.status == SyncStatus::Synced && status == SyncStatus::Pending {
                return false;
            }
            if current.status == status && current.message == message {
                return false;
            }
        }

        map.insert(
            key,
            TrackedStatus {
                status,
                message,
                updated_at: Utc::now(),
            },
        );
        true
    }

    pub fn get(&self, path: &str) -> Option<SyncStatus> {
        self.lock().get(&normalize_relative(path)).map(|s| s.status)
    }

    pub fn entry(&self, path: &str) -> Option<TrackedStatus> {
        self.lock().get(&normalize_relative(path)).cloned()
    }

    pub fn all(&self) -> HashMap<String, SyncStatus> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.status))
            .collect()
    }

    /// 删除路径及其下所有子路径的记录，返回删除数量
    pub fn forget(&self, path: &str) -> usize {
        let key = normalize_relative(path);
        let child_prefix = format!("{}/", key);
        let mut map = self.lock();
        let before = map.len();
        map.retain(|k, _| *k != key && !k.starts_with(&child_prefix));
        before - map.len()
    }

    /// 清空（新会话开始时调用）
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for tracked in self.lock().values() {
            match tracked.status {
                SyncStatus::Pending => summary.pending += 1,
                SyncStatus::Uploading => summary.uploading += 1,
                SyncStatus::Synced => summary.synced += 1,
                SyncStatus::Error => summary.error += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let tracker = StatusTracker::new();
        assert!(tracker.set("b.txt", SyncStatus::Pending));
        assert!(tracker.set("b.txt", SyncStatus::Uploading));
        assert!(tracker.set("b.txt", SyncStatus::Synced));
        assert_eq!(tracker.get("b.txt"), Some(SyncStatus::Synced));
    }

    #[test]
    fn test_synced_never_returns_to_pending() {
        let tracker = StatusTracker::new();
        tracker.set("a.txt", SyncStatus::Synced);
        assert!(!tracker.set("a.txt", SyncStatus::Pending));
        assert_eq!(tracker.get("a.txt"), Some(SyncStatus::Synced));

        // 修改已同步的文件直接进入 uploading
        assert!(tracker.set("a.txt", SyncStatus::Uploading));
    }

    #[test]
    fn test_forget_allows_pending_again() {
        let tracker = StatusTracker::new();
        tracker.set("a.txt", SyncStatus::Synced);
        assert_eq!(tracker.forget("a.txt"), 1);
        assert!(tracker.set("a.txt", SyncStatus::Pending));
    }

    #[test]
    fn test_forget_removes_subtree() {
        let tracker = StatusTracker::new();
        tracker.set("docs", SyncStatus::Synced);
        tracker.set("docs/a.txt", SyncStatus::Synced);
        tracker.set("docs/sub/b.txt", SyncStatus::Error);
        tracker.set("docs2/c.txt", SyncStatus::Synced);

        assert_eq!(tracker.forget("docs"), 3);
        assert_eq!(tracker.all().len(), 1);
        assert!(tracker.get("docs2/c.txt").is_some());
    }

    #[test]
    fn test_repeated_status_is_not_a_change() {
        let tracker = StatusTracker::new();
        assert!(tracker.set("a.txt", SyncStatus::Pending));
        assert!(!tracker.set("a.txt", SyncStatus::Pending));
        assert!(tracker.set_with_message("a.txt", SyncStatus::Error, Some("denied".into())));
        assert_eq!(
            tracker.entry("a.txt").unwrap().message.as_deref(),
            Some("denied")
        );
    }

    #[test]
    fn test_paths_are_normalized() {
        let tracker = StatusTracker::new();
        tracker.set("sub\\b.txt", SyncStatus::Uploading);
        assert_eq!(tracker.get("sub/b.txt"), Some(SyncStatus::Uploading));
        assert_eq!(tracker.summary().uploading, 1);
    }
}
