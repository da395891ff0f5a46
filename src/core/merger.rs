//! 合并视图 - 把本地目录和远端列表合成一个按名称去重的目录视图

use crate::core::lister::RemoteLister;
use crate::core::scanner::{absolute_path, LocalScanner};
use crate::core::status::StatusTracker;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    base_name, normalize_relative, remote_key, MergedEntry, Provenance, RemoteEntry,
    RemoteListing, SyncSession, SyncStatus,
};
use crate::storage::ObjectStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

pub const DIRECTORY_CONTENT_TYPE: &str = "directory";

/// 排序方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    /// 最后一段名称，大小写不敏感
    #[default]
    Name,
    Modified,
    ContentType,
}

/// 稳定排序，相等时保持原有顺序
pub fn sort_entries(entries: &mut [MergedEntry], key: SortKey) {
    match key {
        SortKey::Name => entries.sort_by_cached_key(|e| base_name(&e.display_name).to_lowercase()),
        SortKey::Modified => entries.sort_by_key(|e| e.updated_at),
        SortKey::ContentType => entries.sort_by(|a, b| a.content_type.cmp(&b.content_type)),
    }
}

/// 按扩展名猜测 MIME 类型
pub fn guess_content_type(name: &str) -> String {
    let ext = std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let mime = match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "htm" | "html" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => "application/octet-stream",
    };
    mime.to_string()
}

/// 视图合并器，每次导航调用一次，每次都重新读取本地和远端
pub struct ViewMerger<'a> {
    store: &'a dyn ObjectStore,
    scanner: &'a LocalScanner,
    tracker: &'a StatusTracker,
}

impl<'a> ViewMerger<'a> {
    pub fn new(store: &'a dyn ObjectStore, scanner: &'a LocalScanner, tracker: &'a StatusTracker) -> Self {
        Self {
            store,
            scanner,
            tracker,
        }
    }

    /// 生成一层目录的合并视图。
    ///
    /// - 没有活动会话：直接返回 `remote_root_prefix/relative_sub_path` 的远端列表
    /// - 有会话且子路径为空：虚拟根，同步根目录加上 bucket 顶层的其他内容
    /// - 子路径以同步根目录名开头：进入同步树，本地与远端合并
    /// - 子路径是虚拟根下的其他远端文件夹：远端列表，视为已同步
    pub async fn merge(
        &self,
        session: Option<&SyncSession>,
        remote_root_prefix: &str,
        relative_sub_path: &str,
    ) -> SyncResult<Vec<MergedEntry>> {
        let sub_path = normalize_relative(relative_sub_path);

        let entries = match session {
            None => {
                let prefix = join_prefix(remote_root_prefix, &sub_path);
                self.remote_view(&prefix, None).await?
            }
            Some(session) if sub_path.is_empty() => self.virtual_root(session, remote_root_prefix).await?,
            Some(session) => {
                let (first, rest) = sub_path.split_once('/').unwrap_or((sub_path.as_str(), ""));
                if first == session.root_folder_name {
                    self.synced_dir(session, rest).await?
                } else {
                    let prefix = join_prefix(remote_root_prefix, &sub_path);
                    self.remote_view(&prefix, Some(SyncStatus::Synced)).await?
                }
            }
        };

        Ok(finalize(entries))
    }

    async fn virtual_root(&self, session: &SyncSession, remote_root_prefix: &str) -> SyncResult<Vec<MergedEntry>> {
        let root_mtime = std::fs::metadata(&session.root_local_path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        let mut entries = vec![MergedEntry {
            display_name: session.root_folder_name.clone(),
            is_folder: true,
            size: 0,
            updated_at: root_mtime,
            content_type: DIRECTORY_CONTENT_TYPE.to_string(),
            sync_state: Some(SyncStatus::Synced),
            provenance: Provenance::Both,
        }];

        let listing = RemoteLister::new(self.store).list(remote_root_prefix).await?;
        entries.extend(
            remote_entries(&listing, Some(SyncStatus::Synced))
                .into_iter()
                .filter(|e| e.display_name != session.root_folder_name),
        );
        Ok(entries)
    }

    async fn synced_dir(&self, session: &SyncSession, inner: &str) -> SyncResult<Vec<MergedEntry>> {
        let local_path = absolute_path(&session.root_local_path, inner);
        let remote_prefix = format!("{}/", remote_key(&session.root_folder_name, inner));

        let local = match self.scanner.scan(&local_path).await {
            Ok(entries) => entries,
            Err(SyncError::NotFound(_)) => {
                debug!("本地目录不存在，只显示远端: {}", local_path.display());
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let listing = RemoteLister::new(self.store).list(&remote_prefix).await?;

        let mut entries = Vec::with_capacity(local.len() + listing.files.len() + listing.folders.len());
        let mut local_names = HashSet::new();

        for entry in local {
            let relative = if inner.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", inner, entry.name)
            };
            let remote = listing.find(&entry.name);
            let base_state = if remote.is_some() {
                SyncStatus::Synced
            } else {
                SyncStatus::Pending
            };
            // 正在处理中的状态优先于列表推断
            let sync_state = match self.tracker.get(&relative) {
                Some(tracked @ (SyncStatus::Pending | SyncStatus::Uploading | SyncStatus::Error)) => tracked,
                _ => base_state,
            };

            local_names.insert(entry.name.clone());
            entries.push(MergedEntry {
                content_type: if entry.is_directory {
                    DIRECTORY_CONTENT_TYPE.to_string()
                } else {
                    guess_content_type(&entry.name)
                },
                display_name: entry.name,
                is_folder: entry.is_directory,
                size: entry.size,
                updated_at: Some(entry.mtime),
                sync_state: Some(sync_state),
                provenance: if remote.is_some() {
                    Provenance::Both
                } else {
                    Provenance::LocalOnly
                },
            });
        }

        entries.extend(
            remote_entries(&listing, Some(SyncStatus::Synced))
                .into_iter()
                .filter(|e| !local_names.contains(&e.display_name)),
        );
        Ok(entries)
    }

    async fn remote_view(&self, prefix: &str, state: Option<SyncStatus>) -> SyncResult<Vec<MergedEntry>> {
        let listing = RemoteLister::new(self.store).list(prefix).await?;
        Ok(remote_entries(&listing, state))
    }
}

fn join_prefix(root: &str, sub_path: &str) -> String {
    let root = normalize_relative(root);
    match (root.is_empty(), sub_path.is_empty()) {
        (true, _) => sub_path.to_string(),
        (false, true) => root,
        (false, false) => format!("{}/{}", root, sub_path),
    }
}

fn remote_entry(entry: &RemoteEntry, state: Option<SyncStatus>) -> MergedEntry {
    let name = entry.base_name().to_string();
    MergedEntry {
        content_type: if entry.is_folder {
            DIRECTORY_CONTENT_TYPE.to_string()
        } else {
            guess_content_type(&name)
        },
        display_name: name,
        is_folder: entry.is_folder,
        size: entry.size,
        updated_at: entry.updated_at,
        sync_state: state,
        provenance: Provenance::RemoteOnly,
    }
}

fn remote_entries(listing: &RemoteListing, state: Option<SyncStatus>) -> Vec<MergedEntry> {
    listing
        .folders
        .iter()
        .chain(listing.files.iter())
        .map(|e| remote_entry(e, state))
        .collect()
}

/// 去掉末尾分隔符，丢弃空名称，按名称去重（先出现的优先，本地条目总在前面）
fn finalize(entries: Vec<MergedEntry>) -> Vec<MergedEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter_map(|mut entry| {
            entry.display_name = entry.display_name.trim_end_matches(['/', '\\']).to_string();
            if base_name(&entry.display_name).trim().is_empty() {
                return None;
            }
            if !seen.insert(entry.display_name.clone()) {
                return None;
            }
            Some(entry)
        })
        .collect()
}
