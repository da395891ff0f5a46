//! 本地变更监听 - 基于 notify，按路径防抖合并后输出相对路径事件

use crate::core::scanner::{absolute_path, relative_to, ScanRules};
use crate::error::{SyncError, SyncResult};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// 归一化后的变更事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsChange {
    /// 相对同步根的路径，`/` 分隔
    pub relative_path: String,
    pub kind: ChangeKind,
}

/// 原始事件的粗分类，最终类型在窗口结束时按磁盘状态决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawHint {
    Created,
    Modified,
    Removed,
}

impl RawHint {
    fn from_event_kind(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(RawHint::Created),
            // 重命名的两端都按磁盘状态判断：旧路径不存在即删除，新路径存在即创建
            EventKind::Modify(ModifyKind::Name(_)) => Some(RawHint::Created),
            EventKind::Modify(ModifyKind::Metadata(_)) => None,
            EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(RawHint::Modified),
            EventKind::Remove(_) => Some(RawHint::Removed),
            EventKind::Access(_) => None,
        }
    }
}

#[derive(Debug)]
struct PendingChange {
    order: u64,
    last_seen: Instant,
    created: bool,
}

/// 防抖合并器：同一路径在窗口内的多次事件只输出一次
#[derive(Debug)]
pub struct Coalescer {
    window: Duration,
    pending: HashMap<String, PendingChange>,
    next_order: u64,
}

impl Coalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            next_order: 0,
        }
    }

    pub fn push(&mut self, path: String, hint: RawHint, now: Instant) {
        let order = self.next_order;
        let entry = self.pending.entry(path).or_insert_with(|| PendingChange {
            order,
            last_seen: now,
            created: false,
        });
        if entry.order == order {
            self.next_order += 1;
        }
        entry.last_seen = now;
        if hint == RawHint::Created {
            entry.created = true;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// 最早到期的时间点
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.last_seen + self.window)
            .min()
    }

    /// 取出所有已静默满一个窗口的路径，按首次出现顺序输出。
    ///
    /// 最终类型以磁盘状态为准：不存在即 `Deleted`，这样窗口内先创建后删除的文件只会产生删除。
    pub fn drain_due(&mut self, now: Instant, exists: impl Fn(&str) -> bool) -> Vec<FsChange> {
        let window = self.window;
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.last_seen + window <= now)
            .map(|(path, _)| path.clone())
            .collect();

        let mut ready: Vec<(u64, FsChange)> = due
            .into_iter()
            .filter_map(|path| {
                let pending = self.pending.remove(&path)?;
                let kind = if !exists(&path) {
                    ChangeKind::Deleted
                } else if pending.created {
                    ChangeKind::Created
                } else {
                    ChangeKind::Modified
                };
                Some((
                    pending.order,
                    FsChange {
                        relative_path: path,
                        kind,
                    },
                ))
            })
            .collect();

        ready.sort_by_key(|(order, _)| *order);
        ready.into_iter().map(|(_, change)| change).collect()
    }
}

/// 本地目录监听器。drop 后停止监听。
pub struct ChangeWatcher {
    _watcher: RecommendedWatcher,
    changes: mpsc::UnboundedReceiver<SyncResult<FsChange>>,
    task: JoinHandle<()>,
}

impl ChangeWatcher {
    /// 递归监听 `root`，在 `cancel` 触发或 drop 前持续输出事件
    pub fn start(
        root: &Path,
        debounce: Duration,
        rules: ScanRules,
        cancel: CancellationToken,
    ) -> SyncResult<Self> {
        let root = root.to_path_buf();
        if !root.is_dir() {
            return Err(SyncError::NotFound(root.display().to_string()));
        }
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        })
        .map_err(|e| SyncError::TransientIo(format!("创建文件监听失败: {}", e)))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| match e.kind {
                notify::ErrorKind::PathNotFound => SyncError::NotFound(root.display().to_string()),
                _ => SyncError::TransientIo(format!("监听 {} 失败: {}", root.display(), e)),
            })?;
        info!("开始监听本地变更: {}", root.display());

        let task = tokio::spawn(debounce_loop(root, debounce, rules, raw_rx, out_tx, cancel));

        Ok(Self {
            _watcher: watcher,
            changes: out_rx,
            task,
        })
    }

    /// 等待下一个事件；监听结束时返回 None
    pub async fn next(&mut self) -> Option<SyncResult<FsChange>> {
        self.changes.recv().await
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn debounce_loop(
    root: PathBuf,
    debounce: Duration,
    rules: ScanRules,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    out_tx: mpsc::UnboundedSender<SyncResult<FsChange>>,
    cancel: CancellationToken,
) {
    let mut coalescer = Coalescer::new(debounce);

    loop {
        let deadline = coalescer
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = cancel.cancelled() => break,
            raw = raw_rx.recv() => match raw {
                Some(Ok(event)) => {
                    let Some(hint) = RawHint::from_event_kind(&event.kind) else {
                        continue;
                    };
                    let now = Instant::now();
                    for path in event.paths {
                        let Some(relative) = relative_to(&root, &path) else {
                            continue;
                        };
                        if rules.is_excluded(&relative) {
                            continue;
                        }
                        coalescer.push(relative, hint, now);
                    }
                }
                Some(Err(e)) => {
                    warn!("文件监听出错: {}", e);
                    let _ = out_tx.send(Err(SyncError::TransientIo(format!("文件监听出错: {}", e))));
                    break;
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline), if !coalescer.is_empty() => {
                let changes = coalescer.drain_due(Instant::now(), |relative| {
                    absolute_path(&root, relative).symlink_metadata().is_ok()
                });
                for change in changes {
                    debug!("本地变更: {:?} {}", change.kind, change.relative_path);
                    if out_tx.send(Ok(change)).is_err() {
                        return;
                    }
                }
            }
        }
    }
    debug!("本地监听循环退出: {}", root.display());
}
