use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod models;
pub mod storage;

use crate::config::{SessionRecord, SyncSettings};
use crate::core::{
    latest_objects, purge_ghosts, sort_entries, EventSink, LocalScanner, PurgeReport, ScanRules,
    SortKey, StatusTracker, SyncSupervisor, ViewMerger,
};
use crate::models::{MergedEntry, SessionStatus, SyncSession};
use crate::storage::{ObjectInfo, ObjectStore, StorageConfig};

pub use error::{SyncError, SyncResult};

/// 应用状态，CLI 各命令共享
#[derive(Clone)]
pub struct AppState {
    pub config_dir: PathBuf,
    pub storage_config: StorageConfig,
    pub settings: SyncSettings,
    pub tracker: StatusTracker,
    pub supervisor: Arc<SyncSupervisor>,
    scanner: LocalScanner,
}

impl AppState {
    pub fn new(config_dir: PathBuf, events: EventSink) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config_dir)?;

        let storage_config = StorageConfig::load(&config_dir);
        let settings = SyncSettings::load(&config_dir);
        tracing::debug!("配置目录: {:?}, 存储后端: {:?}", config_dir, storage_config.provider);

        let tracker = StatusTracker::new();
        let supervisor = Arc::new(SyncSupervisor::new(tracker.clone(), settings.clone(), events));
        let scanner = LocalScanner::new(ScanRules::new(&settings.exclude_patterns));

        Ok(Self {
            config_dir,
            storage_config,
            settings,
            tracker,
            supervisor,
            scanner,
        })
    }

    /// 显式指定 > 配置中的默认 bucket > 上次会话使用的 bucket
    pub fn resolve_bucket(&self, bucket: Option<&str>) -> SyncResult<String> {
        bucket
            .map(|b| b.to_string())
            .or_else(|| self.storage_config.default_bucket.clone())
            .or_else(|| SessionRecord::load(&self.config_dir).last_bucket)
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| SyncError::Config("未指定 bucket".to_string()))
    }

    pub async fn connect(&self, bucket: Option<&str>) -> SyncResult<Arc<dyn ObjectStore>> {
        let bucket = self.resolve_bucket(bucket)?;
        storage::connect(&self.storage_config, &bucket).await
    }

    /// 开始同步，成功后记录本次会话参数
    pub async fn start_sync(&self, path: &Path, bucket: Option<&str>) -> SyncResult<SyncSession> {
        let store = self.connect(bucket).await?;
        let session = self.supervisor.start_sync(path, store).await?;

        let record = SessionRecord {
            last_sync_path: Some(session.root_local_path.clone()),
            last_credential_path: self.storage_config.credential_path.as_ref().map(PathBuf::from),
            last_bucket: Some(session.bucket_name.clone()),
        };
        if let Err(e) = record.save(&self.config_dir) {
            tracing::warn!("保存会话记录失败: {}", e);
        }
        Ok(session)
    }

    pub async fn stop_sync(&self) -> SyncResult<()> {
        self.supervisor.stop_sync().await
    }

    pub async fn session(&self) -> Option<SyncSession> {
        self.supervisor.session().await
    }

    /// 浏览合并视图。只有当前会话同步到同一个 bucket 时才合并本地内容。
    pub async fn browse(
        &self,
        bucket: Option<&str>,
        remote_root_prefix: &str,
        relative_sub_path: &str,
        sort: SortKey,
    ) -> SyncResult<Vec<MergedEntry>> {
        let bucket = self.resolve_bucket(bucket)?;
        let store = storage::connect(&self.storage_config, &bucket).await?;
        let session = self
            .session()
            .await
            .filter(|s| s.bucket_name == bucket && s.status != SessionStatus::Idle);

        let merger = ViewMerger::new(store.as_ref(), &self.scanner, &self.tracker);
        let mut entries = merger
            .merge(session.as_ref(), remote_root_prefix, relative_sub_path)
            .await?;
        sort_entries(&mut entries, sort);
        Ok(entries)
    }

    /// 最近更新的对象
    pub async fn verify(&self, bucket: Option<&str>, limit: usize) -> SyncResult<Vec<ObjectInfo>> {
        let store = self.connect(bucket).await?;
        latest_objects(store.as_ref(), limit).await
    }

    /// 清理 `path` 对应远端根目录下本地已不存在的对象
    pub async fn purge(&self, path: &Path, bucket: Option<&str>, dry_run: bool) -> SyncResult<PurgeReport> {
        let root = tokio::fs::canonicalize(path)
            .await
            .map_err(|_| SyncError::NotFound(path.display().to_string()))?;
        let root_folder = root
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::Config(format!("无法作为同步根目录: {}", root.display())))?
            .to_string();

        let store = self.connect(bucket).await?;
        purge_ghosts(store.as_ref(), &root_folder, &root, dry_run).await
    }

    /// 清理资源（退出前调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");
        if let Err(e) = self.stop_sync().await {
            tracing::warn!("停止同步失败: {}", e);
        }
        tracing::info!("资源清理完成");
    }
}

/// 平台配置目录
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        }
    }
}
