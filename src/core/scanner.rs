use crate::error::{SyncError, SyncResult};
use crate::models::LocalEntry;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// 默认排除规则：系统生成文件和编辑器/Office 的临时文件
pub fn default_exclude_patterns() -> Vec<String> {
    vec![
        ".DS_Store".to_string(),
        "Thumbs.db".to_string(),
        "desktop.ini".to_string(),
        "*.tmp".to_string(),
        "~$*".to_string(),
        ".~lock.*".to_string(),
    ]
}

#[derive(Debug, Clone)]
enum ExcludePattern {
    /// `dir/**` 或 `**/name`
    Tree { prefix: String, suffix: String },
    /// 含 `*` 的模式，只匹配最后一段
    Glob(Regex),
    /// 精确匹配最后一段或完整相对路径
    Exact(String),
}

/// 排除规则（大小写不敏感）
#[derive(Debug, Clone)]
pub struct ScanRules {
    patterns: Vec<ExcludePattern>,
}

impl ScanRules {
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| Self::compile(&p.to_lowercase()))
            .collect();
        Self { patterns }
    }

    /// 不排除任何文件
    pub fn none() -> Self {
        Self { patterns: vec![] }
    }

    fn compile(pattern: &str) -> Option<ExcludePattern> {
        if pattern.is_empty() {
            return None;
        }

        if let Some((prefix, suffix)) = pattern.split_once("**") {
            return Some(ExcludePattern::Tree {
                prefix: prefix.trim_end_matches('/').to_string(),
                suffix: suffix.trim_start_matches('/').to_string(),
            });
        }

        if pattern.contains('*') {
            let regex_pattern = pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            return match Regex::new(&format!("^{}$", regex_pattern)) {
                Ok(re) => Some(ExcludePattern::Glob(re)),
                Err(e) => {
                    debug!("忽略无效的排除规则 {}: {}", pattern, e);
                    None
                }
            };
        }

        Some(ExcludePattern::Exact(pattern.to_string()))
    }

    /// 检查相对路径（`/` 分隔）是否应该被排除
    pub fn is_excluded(&self, relative_path: &str) -> bool {
        let path = relative_path.replace('\\', "/").to_lowercase();
        let name = crate::models::base_name(&path).to_string();

        self.patterns.iter().any(|pattern| match pattern {
            ExcludePattern::Tree { prefix, suffix } => {
                if prefix.is_empty() && suffix.is_empty() {
                    return true;
                }
                if !prefix.is_empty() && !(path == *prefix || path.starts_with(&format!("{}/", prefix))) {
                    return false;
                }
                suffix.is_empty() || path.ends_with(suffix.as_str())
            }
            ExcludePattern::Glob(re) => re.is_match(&name),
            ExcludePattern::Exact(exact) => name == *exact || path == *exact,
        })
    }
}

impl Default for ScanRules {
    fn default() -> Self {
        Self::new(&default_exclude_patterns())
    }
}

/// 递归遍历得到的条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkItem {
    /// 相对根目录的路径，`/` 分隔
    pub relative_path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// 本地扫描器
#[derive(Debug, Clone, Default)]
pub struct LocalScanner {
    rules: ScanRules,
}

impl LocalScanner {
    pub fn new(rules: ScanRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ScanRules {
        &self.rules
    }

    /// 列出目录的直接子项（不递归）。目录不存在时返回 `NotFound`。
    pub async fn scan(&self, path: &Path) -> SyncResult<Vec<LocalEntry>> {
        let dir = path.to_path_buf();
        if !dir.is_dir() {
            return Err(SyncError::NotFound(dir.display().to_string()));
        }

        let rules = self.rules.clone();
        // 使用 spawn_blocking 避免阻塞 async runtime
        let entries = tokio::task::spawn_blocking(move || {
            WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter_map(|entry| {
                    let name = entry.file_name().to_str()?.to_string();
                    if rules.is_excluded(&name) {
                        return None;
                    }
                    let metadata = entry.metadata().ok()?;
                    Some(LocalEntry {
                        name,
                        size: if metadata.is_dir() { 0 } else { metadata.len() },
                        mtime: metadata
                            .modified()
                            .map(DateTime::<Utc>::from)
                            .unwrap_or_default(),
                        is_directory: metadata.is_dir(),
                    })
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| SyncError::TransientIo(format!("扫描任务失败: {}", e)))?;

        Ok(entries)
    }

    /// 递归遍历整棵目录树（不含根目录本身），被排除的目录整体跳过
    pub async fn walk(&self, root: &Path) -> SyncResult<Vec<WalkItem>> {
        let base = root.to_path_buf();
        if !base.is_dir() {
            return Err(SyncError::NotFound(base.display().to_string()));
        }

        info!("开始遍历本地目录: {}", base.display());
        let rules = self.rules.clone();

        let items = tokio::task::spawn_blocking(move || {
            let mut excluded = 0usize;
            let items: Vec<WalkItem> = WalkDir::new(&base)
                .min_depth(1)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| {
                    let keep = relative_to(&base, entry.path())
                        .map(|rel| !rules.is_excluded(&rel))
                        .unwrap_or(false);
                    if !keep {
                        excluded += 1;
                    }
                    keep
                })
                .filter_map(|e| match e {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        debug!("跳过无法访问的条目: {}", err);
                        None
                    }
                })
                .filter_map(|entry| {
                    let relative_path = relative_to(&base, entry.path())?;
                    let metadata = entry.metadata().ok()?;
                    Some(WalkItem {
                        relative_path,
                        is_dir: metadata.is_dir(),
                        size: if metadata.is_dir() { 0 } else { metadata.len() },
                    })
                })
                .collect();
            debug!("遍历排除 {} 个条目", excluded);
            items
        })
        .await
        .map_err(|e| SyncError::TransientIo(format!("遍历任务失败: {}", e)))?;

        info!(
            "遍历完成: {} 个文件, {} 个目录",
            items.iter().filter(|i| !i.is_dir).count(),
            items.iter().filter(|i| i.is_dir).count()
        );
        Ok(items)
    }
}

/// 绝对路径转为相对根目录的 `/` 分隔路径；根目录本身返回 None
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let relative = relative.to_str()?.replace('\\', "/");
    let relative = relative.trim_matches('/').to_string();
    if relative.is_empty() {
        None
    } else {
        Some(relative)
    }
}

/// 相对路径还原为绝对路径
pub fn absolute_path(root: &Path, relative_path: &str) -> PathBuf {
    relative_path
        .split('/')
        .filter(|s| !s.is_empty())
        .fold(root.to_path_buf(), |acc, segment| acc.join(segment))
}
