use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// 远端条目（一次列表调用的结果，不跨调用缓存）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    /// 完整 key，文件夹以 `/` 结尾
    pub name: String,
    pub is_folder: bool,
    pub size: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub file_count: u32,
    pub folder_count: u32,
}

impl RemoteEntry {
    /// key 的最后一段（去掉末尾分隔符）
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }
}

/// 一次分隔符列表的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteListing {
    pub files: Vec<RemoteEntry>,
    pub folders: Vec<RemoteEntry>,
}

impl RemoteListing {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.folders.is_empty()
    }

    /// 按最后一段名称查找
    pub fn find(&self, name: &str) -> Option<&RemoteEntry> {
        self.folders
            .iter()
            .chain(self.files.iter())
            .find(|e| e.base_name() == name)
    }
}

/// 本地目录的直接子项
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalEntry {
    pub name: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub is_directory: bool,
}

/// 同步状态，状态跟踪器和事件流共用
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Uploading,
    Synced,
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Pending => write!(f, "pending"),
            SyncStatus::Uploading => write!(f, "uploading"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

/// 条目来源
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    LocalOnly,
    RemoteOnly,
    Both,
}

/// 合并视图中的一行
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MergedEntry {
    pub display_name: String,
    pub is_folder: bool,
    pub size: u64,
    pub updated_at: Option<DateTime<Utc>>,
    /// `directory` 或按扩展名猜测的 MIME
    pub content_type: String,
    /// `None` 表示没有同步语义（未启动会话时的纯远端列表）
    pub sync_state: Option<SyncStatus>,
    pub provenance: Provenance,
}

/// 会话状态机
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Scanning,
    Watching,
    Error,
}

/// 同步会话快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub id: Uuid,
    pub root_local_path: PathBuf,
    pub bucket_name: String,
    /// rootLocalPath 的最后一段，也是所有远端 key 的顶层前缀
    pub root_folder_name: String,
    pub status: SessionStatus,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

impl SyncSession {
    pub fn new(root_local_path: PathBuf, bucket_name: &str, root_folder_name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            root_local_path,
            bucket_name: bucket_name.to_string(),
            root_folder_name: root_folder_name.to_string(),
            status: SessionStatus::Idle,
            restart_count: 0,
            last_error: None,
        }
    }

    /// 本地相对路径对应的远端 key
    pub fn remote_key(&self, relative_path: &str) -> String {
        remote_key(&self.root_folder_name, relative_path)
    }
}

/// 向调用方输出的事件
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MirrorEvent {
    /// 给人看的日志行
    Log { message: String },
    /// 单个文件的一次状态变化
    #[serde(rename = "sync_event")]
    FileStatus {
        file: String,
        status: SyncStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// 首次全量扫描完成
    ScanComplete { total: u32 },
    /// 会话状态变化
    SessionState {
        status: SessionStatus,
        restart_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// `key = rootFolderName + "/" + localRelativePath`，分隔符统一为 `/`
pub fn remote_key(root_folder_name: &str, relative_path: &str) -> String {
    let relative = normalize_relative(relative_path);
    if relative.is_empty() {
        root_folder_name.to_string()
    } else {
        format!("{}/{}", root_folder_name, relative)
    }
}

/// 统一分隔符并去掉首尾的 `/`
pub fn normalize_relative(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}

/// 路径最后一段（忽略末尾分隔符）
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_key_normalizes_separators() {
        assert_eq!(remote_key("Desktop", "a.txt"), "Desktop/a.txt");
        assert_eq!(remote_key("Desktop", "sub\\b.txt"), "Desktop/sub/b.txt");
        assert_eq!(remote_key("Desktop", "/sub/"), "Desktop/sub");
        assert_eq!(remote_key("Desktop", ""), "Desktop");
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("Desktop/sub/"), "sub");
        assert_eq!(base_name("Desktop/a.txt"), "a.txt");
        assert_eq!(base_name("a.txt"), "a.txt");
        assert_eq!(base_name("/"), "");
    }

    #[test]
    fn test_file_status_event_shape() {
        let event = MirrorEvent::FileStatus {
            file: "b.txt".to_string(),
            status: SyncStatus::Uploading,
            message: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "sync_event");
        assert_eq!(json["file"], "b.txt");
        assert_eq!(json["status"], "uploading");
        assert!(json.get("message").is_none());
    }
}
