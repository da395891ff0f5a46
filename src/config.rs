//! 应用配置模块
//!
//! 所有配置保存在 `config.json` 中，按 section 分别读写，互不覆盖。

use crate::core::scanner::default_exclude_patterns;
use crate::storage::StorageConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";

/// 读取 config.json 中的一个 section，缺失或格式错误时返回 None
pub(crate) fn load_section<T: DeserializeOwned>(config_dir: &Path, section: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    serde_json::from_value(config.get(section)?.clone()).ok()
}

/// 更新 config.json 中的一个 section，保留其他 section
pub(crate) fn save_section<T: Serialize>(config_dir: &Path, section: &str, value: &T) -> io::Result<()> {
    fs::create_dir_all(config_dir)?;
    let config_file = config_dir.join(CONFIG_FILE);

    // 读取现有配置
    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };

    config[section] = serde_json::to_value(value).map_err(io::Error::other)?;

    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(&config_file, content)
}

/// 同步行为配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// 会话内最多自动重启次数
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// 重启前等待（毫秒）
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    /// 变更防抖窗口（毫秒）
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// 最大并发上传数
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    /// 排除规则（glob patterns）
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_backoff_ms() -> u64 {
    2000
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_max_concurrent_transfers() -> usize {
    4
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff_ms(),
            debounce_ms: default_debounce_ms(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

impl SyncSettings {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "sync").unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "sync", self)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

/// 上次会话记录，启动时读取，开始同步时写入
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default)]
    pub last_sync_path: Option<PathBuf>,
    #[serde(default)]
    pub last_credential_path: Option<PathBuf>,
    #[serde(default)]
    pub last_bucket: Option<String>,
}

impl SessionRecord {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "session").unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "session", self)
    }
}

impl StorageConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "storage").unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "storage", self)
    }
}

/// 默认配置目录
pub fn default_config_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("bucketmirror"))
        .unwrap_or_else(|| PathBuf::from(".bucketmirror"))
}
