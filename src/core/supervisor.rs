//! 同步会话监督器
//!
//! 一个进程同时只有一个会话。会话先全量扫描上传，再持续监听本地变更；
//! 可恢复的错误触发整轮重启（有次数上限），认证类错误直接终止。

use crate::config::SyncSettings;
use crate::core::file_state::{calculate_quick_hash, FingerprintCache};
use crate::core::scanner::{absolute_path, LocalScanner, ScanRules};
use crate::core::status::StatusTracker;
use crate::core::watcher::{ChangeKind, ChangeWatcher, FsChange};
use crate::error::{SyncError, SyncResult};
use crate::models::{remote_key, MirrorEvent, SessionStatus, SyncSession, SyncStatus};
use crate::storage::ObjectStore;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 事件出口。没有订阅者时事件直接丢弃。
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<MirrorEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<MirrorEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: MirrorEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// 写一条日志并转发给订阅者
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.emit(MirrorEvent::Log { message });
    }
}

/// 多个任务共享的会话快照
#[derive(Debug, Clone)]
struct SharedSession(Arc<RwLock<SyncSession>>);

impl SharedSession {
    fn new(session: SyncSession) -> Self {
        Self(Arc::new(RwLock::new(session)))
    }

    fn snapshot(&self) -> SyncSession {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update(&self, f: impl FnOnce(&mut SyncSession)) -> SyncSession {
        let mut session = self.0.write().unwrap_or_else(|e| e.into_inner());
        f(&mut session);
        session.clone()
    }
}

struct ActiveSession {
    state: SharedSession,
    cancel: CancellationToken,
    /// 会话任务退出时触发
    done: CancellationToken,
    task: JoinHandle<()>,
}

/// 同步监督器
pub struct SyncSupervisor {
    tracker: StatusTracker,
    settings: SyncSettings,
    events: EventSink,
    active: Mutex<Option<ActiveSession>>,
}

impl SyncSupervisor {
    pub fn new(tracker: StatusTracker, settings: SyncSettings, events: EventSink) -> Self {
        Self {
            tracker,
            settings,
            events,
            active: Mutex::new(None),
        }
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// 开始同步 `local_path` 到 `store`。已有会话时先停止旧会话。
    pub async fn start_sync(&self, local_path: &Path, store: Arc<dyn ObjectStore>) -> SyncResult<SyncSession> {
        let root = tokio::fs::canonicalize(local_path)
            .await
            .map_err(|_| SyncError::NotFound(local_path.display().to_string()))?;
        if !root.is_dir() {
            return Err(SyncError::NotFound(root.display().to_string()));
        }
        let root_folder = root
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string())
            .ok_or_else(|| SyncError::Config(format!("无法作为同步根目录: {}", root.display())))?;

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!("停止上一个同步会话");
            teardown(previous, &self.events).await;
        }

        self.tracker.clear();

        let mut session = SyncSession::new(root.clone(), store.bucket(), &root_folder);
        session.status = SessionStatus::Scanning;
        let state = SharedSession::new(session.clone());

        let ctx = Arc::new(SessionContext {
            state: state.clone(),
            store,
            tracker: self.tracker.clone(),
            events: self.events.clone(),
            settings: self.settings.clone(),
            scanner: LocalScanner::new(ScanRules::new(&self.settings.exclude_patterns)),
            fingerprints: FingerprintCache::new(),
            root,
            root_folder,
        });

        self.events.log(format!(
            "开始同步 {} -> {}/{}",
            ctx.root.display(),
            session.bucket_name,
            ctx.root_folder
        ));

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let task = tokio::spawn(run_session(ctx, cancel.clone(), done.clone()));

        *active = Some(ActiveSession {
            state,
            cancel,
            done,
            task,
        });
        Ok(session)
    }

    /// 停止当前会话，没有会话时什么也不做
    pub async fn stop_sync(&self) -> SyncResult<()> {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            teardown(previous, &self.events).await;
        }
        Ok(())
    }

    /// 当前会话快照
    pub async fn session(&self) -> Option<SyncSession> {
        self.active.lock().await.as_ref().map(|a| a.state.snapshot())
    }

    /// 等待当前会话任务结束（停止或进入终止错误）
    pub async fn wait(&self) {
        let done = match self.active.lock().await.as_ref() {
            Some(active) => active.done.clone(),
            None => return,
        };
        done.cancelled().await;
    }
}

async fn teardown(session: ActiveSession, events: &EventSink) {
    session.cancel.cancel();
    if let Err(e) = session.task.await {
        warn!("同步任务异常退出: {}", e);
    }
    let snapshot = session.state.update(|s| s.status = SessionStatus::Idle);
    events.emit(MirrorEvent::SessionState {
        status: SessionStatus::Idle,
        restart_count: snapshot.restart_count,
        message: None,
    });
    events.log(format!("同步已停止: {}", snapshot.root_local_path.display()));
}

/// 一个会话内各轮运行共享的上下文
struct SessionContext {
    state: SharedSession,
    store: Arc<dyn ObjectStore>,
    tracker: StatusTracker,
    events: EventSink,
    settings: SyncSettings,
    scanner: LocalScanner,
    fingerprints: FingerprintCache,
    root: PathBuf,
    root_folder: String,
}

impl SessionContext {
    fn remote_key(&self, relative_path: &str) -> String {
        remote_key(&self.root_folder, relative_path)
    }

    fn set_status(&self, status: SessionStatus) {
        let snapshot = self.state.update(|s| s.status = status);
        self.events.emit(MirrorEvent::SessionState {
            status,
            restart_count: snapshot.restart_count,
            message: None,
        });
    }

    /// 进入终止错误状态
    fn fail(&self, err: SyncError) {
        let message = err.to_string();
        error!("同步会话终止: {}", message);
        let snapshot = self.state.update(|s| {
            s.status = SessionStatus::Error;
            s.last_error = Some(message.clone());
        });
        self.events.emit(MirrorEvent::SessionState {
            status: SessionStatus::Error,
            restart_count: snapshot.restart_count,
            message: Some(message.clone()),
        });
        self.events.emit(MirrorEvent::Log {
            message: format!("同步失败: {}", message),
        });
    }

    /// 更新文件状态，真正变化时才发事件
    fn transition(&self, path: &str, status: SyncStatus, message: Option<String>) {
        if self.tracker.set_with_message(path, status, message.clone()) {
            self.events.emit(MirrorEvent::FileStatus {
                file: path.to_string(),
                status,
                message,
            });
        }
    }
}

/// 会话主循环：运行、失败后按策略重启
async fn run_session(ctx: Arc<SessionContext>, cancel: CancellationToken, done: CancellationToken) {
    let _done = done.drop_guard();

    loop {
        ctx.set_status(SessionStatus::Scanning);

        let run_cancel = cancel.child_token();
        let result = run_once(&ctx, &run_cancel).await;
        // 让本轮残留的上传任务全部失效
        run_cancel.cancel();

        if cancel.is_cancelled() {
            break;
        }

        let err = match result {
            Ok(()) | Err(SyncError::Cancelled) => break,
            Err(e) => e,
        };

        if !err.is_restartable() {
            ctx.fail(err);
            break;
        }

        let restarts = ctx.state.snapshot().restart_count;
        if restarts >= ctx.settings.max_restarts {
            ctx.fail(SyncError::RestartsExhausted {
                restarts,
                last: err.to_string(),
            });
            break;
        }

        let message = err.to_string();
        let snapshot = ctx.state.update(|s| {
            s.restart_count += 1;
            s.status = SessionStatus::Error;
            s.last_error = Some(message.clone());
        });
        warn!(
            "同步出错，{}ms 后第 {}/{} 次重启: {}",
            ctx.settings.restart_backoff_ms, snapshot.restart_count, ctx.settings.max_restarts, message
        );
        ctx.events.emit(MirrorEvent::SessionState {
            status: SessionStatus::Error,
            restart_count: snapshot.restart_count,
            message: Some(message),
        });

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(ctx.settings.restart_backoff()) => {}
        }
    }

    debug!("同步会话任务退出");
}

/// 一轮完整运行：全量扫描，然后监听直到出错或被取消
async fn run_once(ctx: &Arc<SessionContext>, cancel: &CancellationToken) -> SyncResult<()> {
    // 先开始监听，扫描期间的变更不会丢
    let mut watcher = ChangeWatcher::start(
        &ctx.root,
        ctx.settings.debounce(),
        ctx.scanner.rules().clone(),
        cancel.clone(),
    )?;

    let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
    let pipeline = Arc::new(Pipeline::new(ctx.clone(), cancel.clone(), fault_tx));

    let total = pipeline.initial_scan().await?;
    if cancel.is_cancelled() {
        return Ok(());
    }
    ctx.events.emit(MirrorEvent::ScanComplete { total });
    ctx.events.log(format!("全量扫描完成: {} 个文件", total));
    ctx.set_status(SessionStatus::Watching);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            Some(fault) = fault_rx.recv() => return Err(fault),
            change = watcher.next() => match change {
                Some(Ok(change)) => pipeline.handle_change(change),
                Some(Err(e)) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    return Err(e);
                }
                None => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    return Err(SyncError::TransientIo("文件监听意外结束".to_string()));
                }
            },
        }
    }
}

#[derive(Debug, Clone)]
enum Job {
    Upload(String),
    /// 创建文件夹占位；`walk` 为 true 时继续提交子树中的条目
    Folder { path: String, walk: bool },
    Remove(String),
}

impl Job {
    fn path(&self) -> &str {
        match self {
            Job::Upload(path) | Job::Remove(path) => path,
            Job::Folder { path, .. } => path,
        }
    }
}

/// 上传流水线
///
/// 同一路径的任务串行执行；路径上有更新的任务提交后，旧任务不再改写状态。
struct Pipeline {
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
    permits: Semaphore,
    faults: mpsc::UnboundedSender<SyncError>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    generations: StdMutex<HashMap<String, u64>>,
}

impl Pipeline {
    fn new(ctx: Arc<SessionContext>, cancel: CancellationToken, faults: mpsc::UnboundedSender<SyncError>) -> Self {
        let permits = Semaphore::new(ctx.settings.max_concurrent_transfers.max(1));
        Self {
            ctx,
            cancel,
            permits,
            faults,
            locks: StdMutex::new(HashMap::new()),
            generations: StdMutex::new(HashMap::new()),
        }
    }

    /// 遍历整棵树并等待所有上传完成，返回文件数
    async fn initial_scan(self: &Arc<Self>) -> SyncResult<u32> {
        let ctx = &self.ctx;
        if let Err(e) = ctx.store.create_folder(&ctx.root_folder).await {
            if !e.is_per_file() {
                return Err(e);
            }
            warn!("创建根目录占位失败: {}", e);
        }

        let items = ctx.scanner.walk(&ctx.root).await?;
        let mut total = 0u32;
        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            let job = if item.is_dir {
                Job::Folder {
                    path: item.relative_path,
                    walk: false,
                }
            } else {
                total += 1;
                Job::Upload(item.relative_path)
            };
            handles.push(self.submit(job));
        }

        for handle in handles {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                joined = handle => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(e) => return Err(SyncError::TransientIo(format!("上传任务异常: {}", e))),
                },
            }
        }

        Ok(total)
    }

    fn handle_change(self: &Arc<Self>, change: FsChange) {
        let path = change.relative_path;
        debug!("本地变更: {:?} {}", change.kind, path);

        match change.kind {
            ChangeKind::Created | ChangeKind::Modified => {
                if absolute_path(&self.ctx.root, &path).is_dir() {
                    if change.kind == ChangeKind::Created {
                        self.submit(Job::Folder { path, walk: true });
                    }
                } else {
                    self.enqueue_upload(path);
                }
            }
            ChangeKind::Deleted => {
                self.submit(Job::Remove(path));
            }
        }
    }

    fn enqueue_upload(self: &Arc<Self>, path: String) {
        self.ctx.transition(&path, SyncStatus::Pending, None);
        self.submit(Job::Upload(path));
    }

    fn submit(self: &Arc<Self>, job: Job) -> JoinHandle<SyncResult<()>> {
        let generation = self.bump_generation(job.path());
        let pipeline = self.clone();
        tokio::spawn(async move {
            let result = pipeline.run_job(job, generation).await;
            if let Err(e) = &result {
                if !pipeline.cancel.is_cancelled() {
                    let _ = pipeline.faults.send(e.clone());
                }
            }
            result
        })
    }

    async fn run_job(self: &Arc<Self>, job: Job, generation: u64) -> SyncResult<()> {
        let path = job.path().to_string();
        let result = {
            let lock = self.path_lock(&path);
            let _guard = lock.lock().await;
            self.run_locked(&job, generation).await
        };
        self.release_lock(&path);
        result
    }

    async fn run_locked(self: &Arc<Self>, job: &Job, generation: u64) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if !self.is_current(job.path(), generation) {
            debug!("已有更新的任务，跳过: {}", job.path());
            return Ok(());
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        match job {
            Job::Upload(path) => self.upload_file(path, generation).await,
            Job::Folder { path, walk } => {
                self.create_folder(path).await?;
                if *walk {
                    self.submit_subtree(path).await?;
                }
                Ok(())
            }
            Job::Remove(path) => self.remove_remote(path).await,
        }
    }

    async fn upload_file(self: &Arc<Self>, path: &str, generation: u64) -> SyncResult<()> {
        let ctx = &self.ctx;
        let abs = absolute_path(&ctx.root, path);

        let metadata = match tokio::fs::metadata(&abs).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("文件已不存在，跳过上传: {}", path);
                return Ok(());
            }
            Err(e) => return self.fail_file(path, SyncError::from_io(path, e)),
        };
        if metadata.is_dir() {
            return self.create_folder(path).await;
        }

        ctx.transition(path, SyncStatus::Uploading, None);

        let data = match tokio::fs::read(&abs).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("文件在上传前被删除: {}", path);
                return Ok(());
            }
            Err(e) => return self.fail_file(path, SyncError::from_io(path, e)),
        };

        let fingerprint = calculate_quick_hash(&data);
        if ctx.fingerprints.is_unchanged(path, &fingerprint) {
            debug!("内容未变化，跳过上传: {}", path);
        } else {
            let key = ctx.remote_key(path);
            let size = data.len();
            if let Err(e) = ctx.store.put(&key, Bytes::from(data)).await {
                return self.fail_file(path, e);
            }
            ctx.fingerprints.record(path, fingerprint);
            debug!("已上传 {} ({} 字节)", key, size);
        }

        // 停止后到达的完成结果直接忽略
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if self.is_current(path, generation) {
            ctx.transition(path, SyncStatus::Synced, None);
        }
        Ok(())
    }

    /// 单个文件失败：标记 error；非单文件错误继续向上传播
    fn fail_file(&self, path: &str, err: SyncError) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.ctx.transition(path, SyncStatus::Error, Some(err.to_string()));
        if err.is_per_file() {
            warn!("{}", err);
            self.ctx.events.emit(MirrorEvent::Log {
                message: err.to_string(),
            });
            Ok(())
        } else {
            Err(err)
        }
    }

    async fn create_folder(&self, path: &str) -> SyncResult<()> {
        let key = self.ctx.remote_key(path);
        match self.ctx.store.create_folder(&key).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_per_file() => {
                warn!("创建文件夹失败 {}: {}", key, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 新建目录时补齐其中已有的内容
    async fn submit_subtree(self: &Arc<Self>, path: &str) -> SyncResult<()> {
        let abs = absolute_path(&self.ctx.root, path);
        let items = match self.ctx.scanner.walk(&abs).await {
            Ok(items) => items,
            Err(SyncError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        for item in items {
            let child = format!("{}/{}", path, item.relative_path);
            if item.is_dir {
                self.submit(Job::Folder {
                    path: child,
                    walk: false,
                });
            } else {
                self.enqueue_upload(child);
            }
        }
        Ok(())
    }

    async fn remove_remote(&self, path: &str) -> SyncResult<()> {
        let ctx = &self.ctx;
        let key = ctx.remote_key(path);

        // 只有文件会进入状态表；其余按目录处理，连同子树一起删除
        let removed = if ctx.tracker.get(path).is_some() {
            0
        } else {
            ctx.store.delete_prefix(&key).await?
        };
        ctx.store.delete(&key).await?;

        ctx.tracker.forget(path);
        ctx.fingerprints.forget(path);
        if removed > 0 {
            ctx.events.log(format!("已删除远端 {} 及其下 {} 个对象", key, removed));
        } else {
            ctx.events.log(format!("已删除远端 {}", key));
        }
        Ok(())
    }

    fn bump_generation(&self, path: &str) -> u64 {
        let mut generations = self.generations.lock().unwrap_or_else(|e| e.into_inner());
        let generation = generations.entry(path.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    fn is_current(&self, path: &str, generation: u64) -> bool {
        self.generations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .is_some_and(|g| *g == generation)
    }

    fn path_lock(&self, path: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    fn release_lock(&self, path: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(path).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::merger::ViewMerger;
    use crate::models::Provenance;
    use crate::storage::memory::MemoryStore;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn test_settings() -> SyncSettings {
        SyncSettings {
            max_restarts: 3,
            restart_backoff_ms: 10,
            debounce_ms: 50,
            max_concurrent_transfers: 2,
            exclude_patterns: vec![],
        }
    }

    fn supervisor() -> (SyncSupervisor, mpsc::UnboundedReceiver<MirrorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = SyncSupervisor::new(StatusTracker::new(), test_settings(), EventSink::new(tx));
        (supervisor, rx)
    }

    /// 建一个名为 Desktop 的同步根
    fn desktop() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Desktop");
        std::fs::create_dir(&root).unwrap();
        (dir, root)
    }

    async fn wait_for(rx: &mut mpsc::UnboundedReceiver<MirrorEvent>, pred: impl Fn(&MirrorEvent) -> bool) -> MirrorEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = rx.recv().await.expect("事件通道已关闭");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("等待事件超时")
    }

    async fn wait_watching(rx: &mut mpsc::UnboundedReceiver<MirrorEvent>) {
        wait_for(rx, |e| {
            matches!(
                e,
                MirrorEvent::SessionState {
                    status: SessionStatus::Watching,
                    ..
                }
            )
        })
        .await;
    }

    #[tokio::test]
    async fn test_initial_scan_uploads_tree() {
        let (_dir, root) = desktop();
        std::fs::write(root.join("a.txt"), b"0123456789").unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub").join("c.txt"), b"c").unwrap();

        let store = Arc::new(MemoryStore::new());
        let (supervisor, mut rx) = supervisor();
        let session = supervisor.start_sync(&root, store.clone()).await.unwrap();
        assert_eq!(session.root_folder_name, "Desktop");
        assert_eq!(session.bucket_name, "b1");

        let event = wait_for(&mut rx, |e| matches!(e, MirrorEvent::ScanComplete { .. })).await;
        assert_eq!(event, MirrorEvent::ScanComplete { total: 2 });
        wait_watching(&mut rx).await;

        assert!(store.contains("Desktop/"));
        assert!(store.contains("Desktop/a.txt"));
        assert!(store.contains("Desktop/sub/"));
        assert!(store.contains("Desktop/sub/c.txt"));
        assert_eq!(supervisor.tracker().get("a.txt"), Some(SyncStatus::Synced));
        assert_eq!(supervisor.tracker().get("sub/c.txt"), Some(SyncStatus::Synced));

        let session = supervisor.session().await.unwrap();
        assert_eq!(session.status, SessionStatus::Watching);

        let scanner = LocalScanner::default();
        let merger = ViewMerger::new(store.as_ref(), &scanner, supervisor.tracker());
        let top = merger.merge(Some(&session), "", "").await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].display_name, "Desktop");
        assert_eq!(top[0].provenance, Provenance::Both);

        let inside = merger.merge(Some(&session), "", "Desktop").await.unwrap();
        let a = inside.iter().find(|e| e.display_name == "a.txt").unwrap();
        assert_eq!(a.size, 10);
        assert_eq!(a.sync_state, Some(SyncStatus::Synced));

        supervisor.stop_sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_file_goes_pending_uploading_synced() {
        let (_dir, root) = desktop();
        let store = Arc::new(MemoryStore::new());
        let (supervisor, mut rx) = supervisor();
        supervisor.start_sync(&root, store.clone()).await.unwrap();
        wait_watching(&mut rx).await;

        std::fs::write(root.join("b.txt"), b"hello").unwrap();

        let statuses = tokio::time::timeout(WAIT, async {
            let mut statuses = Vec::new();
            loop {
                if let Some(MirrorEvent::FileStatus { file, status, .. }) = rx.recv().await {
                    if file == "b.txt" {
                        statuses.push(status);
                        if status == SyncStatus::Synced {
                            return statuses;
                        }
                    }
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(
            statuses,
            vec![SyncStatus::Pending, SyncStatus::Uploading, SyncStatus::Synced]
        );
        assert!(store.contains("Desktop/b.txt"));
        supervisor.stop_sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_deleted_file_is_removed_remotely() {
        let (_dir, root) = desktop();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        let store = Arc::new(MemoryStore::new());
        let (supervisor, mut rx) = supervisor();
        supervisor.start_sync(&root, store.clone()).await.unwrap();
        wait_watching(&mut rx).await;
        assert!(store.contains("Desktop/a.txt"));

        std::fs::remove_file(root.join("a.txt")).unwrap();

        tokio::time::timeout(WAIT, async {
            while store.contains("Desktop/a.txt") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(supervisor.tracker().get("a.txt"), None);
        assert!(store.contains("Desktop/"));
        supervisor.stop_sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_directory_contents_are_uploaded() {
        let (dir, root) = desktop();
        let store = Arc::new(MemoryStore::new());
        let (supervisor, mut rx) = supervisor();
        supervisor.start_sync(&root, store.clone()).await.unwrap();
        wait_watching(&mut rx).await;

        // 在同步根之外准备好目录再整体移入
        let staged = dir.path().join("staged");
        std::fs::create_dir(&staged).unwrap();
        std::fs::write(staged.join("x.txt"), b"x").unwrap();
        std::fs::rename(&staged, root.join("docs")).unwrap();

        tokio::time::timeout(WAIT, async {
            while !store.contains("Desktop/docs/x.txt") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(store.contains("Desktop/docs/"));
        supervisor.stop_sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_failure_marks_only_that_file() {
        let (_dir, root) = desktop();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("bad.txt"), b"bad").unwrap();

        let store = Arc::new(MemoryStore::new());
        store.fail_on_key(
            "Desktop/bad.txt",
            SyncError::PermanentUpload {
                path: "Desktop/bad.txt".to_string(),
                reason: "403".to_string(),
            },
        );
        let (supervisor, mut rx) = supervisor();
        supervisor.start_sync(&root, store.clone()).await.unwrap();
        wait_watching(&mut rx).await;

        assert_eq!(supervisor.tracker().get("a.txt"), Some(SyncStatus::Synced));
        let bad = supervisor.tracker().entry("bad.txt").unwrap();
        assert_eq!(bad.status, SyncStatus::Error);
        assert!(bad.message.unwrap().contains("403"));

        let session = supervisor.session().await.unwrap();
        assert_eq!(session.status, SessionStatus::Watching);
        assert_eq!(session.restart_count, 0);
        supervisor.stop_sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_stop_after_max_restarts() {
        let (_dir, root) = desktop();
        let store = Arc::new(MemoryStore::failing(SyncError::TransientIo("connection reset".to_string())));
        let (supervisor, _rx) = supervisor();
        supervisor.start_sync(&root, store.clone()).await.unwrap();

        tokio::time::timeout(WAIT, supervisor.wait()).await.unwrap();

        let session = supervisor.session().await.unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.restart_count, 3);
        assert!(session.last_error.unwrap().contains("connection reset"));
        // 首次运行加三次重启
        assert_eq!(store.writes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_auth_failure_is_terminal() {
        let (_dir, root) = desktop();
        let store = Arc::new(MemoryStore::failing(SyncError::Auth("invalid_grant".to_string())));
        let (supervisor, _rx) = supervisor();
        supervisor.start_sync(&root, store.clone()).await.unwrap();

        tokio::time::timeout(WAIT, supervisor.wait()).await.unwrap();

        let session = supervisor.session().await.unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.restart_count, 0);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (supervisor, _rx) = supervisor();
        supervisor.stop_sync().await.unwrap();

        let (_dir, root) = desktop();
        supervisor.start_sync(&root, Arc::new(MemoryStore::new())).await.unwrap();
        supervisor.stop_sync().await.unwrap();
        supervisor.stop_sync().await.unwrap();
        assert!(supervisor.session().await.is_none());
    }

    #[tokio::test]
    async fn test_second_start_replaces_first_session() {
        let (_dir1, first) = desktop();
        let dir2 = tempfile::tempdir().unwrap();
        let second = dir2.path().join("Photos");
        std::fs::create_dir(&second).unwrap();

        let (supervisor, _rx) = supervisor();
        supervisor.start_sync(&first, Arc::new(MemoryStore::new())).await.unwrap();
        supervisor.start_sync(&second, Arc::new(MemoryStore::new())).await.unwrap();

        let session = supervisor.session().await.unwrap();
        assert_eq!(session.root_folder_name, "Photos");
        supervisor.stop_sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_root_is_not_found() {
        let (supervisor, _rx) = supervisor();
        let result = supervisor
            .start_sync(Path::new("/definitely/not/here"), Arc::new(MemoryStore::new()))
            .await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
        assert!(supervisor.session().await.is_none());
    }
}
