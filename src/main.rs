use std::path::PathBuf;

use anyhow::Result;
use bucketmirror_lib::config::{default_config_dir, SessionRecord};
use bucketmirror_lib::core::{EventSink, SortKey};
use bucketmirror_lib::logging::{log_dir, LogConfig, SizeRotatingWriter};
use bucketmirror_lib::models::{MirrorEvent, SessionStatus};
use bucketmirror_lib::AppState;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "bucketmirror", version, about = "把本地目录单向镜像到云存储 bucket")]
struct Cli {
    /// 配置目录 [默认: 平台配置目录/bucketmirror]
    #[arg(long, env = "BUCKETMIRROR_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// 提高控制台日志级别（-v, -vv）
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 开始同步并持续监听，Ctrl-C 停止
    Sync {
        path: PathBuf,
        #[arg(short, long)]
        bucket: Option<String>,
        /// 以 JSON 行输出事件
        #[arg(long)]
        json: bool,
    },
    /// 列出 bucket 中一层目录
    Ls {
        /// bucket 内的子路径
        #[arg(default_value = "")]
        sub_path: String,
        #[arg(short, long)]
        bucket: Option<String>,
        /// 远端根前缀
        #[arg(long, default_value = "")]
        prefix: String,
        #[arg(long, value_enum, default_value_t = SortArg::Name)]
        sort: SortArg,
    },
    /// 查看 bucket 中最近更新的对象
    Verify {
        #[arg(short, long)]
        bucket: Option<String>,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// 删除本地已不存在的远端对象
    Purge {
        path: PathBuf,
        #[arg(short, long)]
        bucket: Option<String>,
        /// 只报告，不删除
        #[arg(long)]
        dry_run: bool,
    },
    /// 显示配置和上次会话
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Name,
    Modified,
    Type,
}

impl From<SortArg> for SortKey {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Name => SortKey::Name,
            SortArg::Modified => SortKey::Modified,
            SortArg::Type => SortKey::ContentType,
        }
    }
}

/// 初始化日志系统：文件日志按配置写入，控制台日志跟随 -v
fn init_logging(config_dir: &std::path::Path, verbosity: u8) -> Option<WorkerGuard> {
    let config = LogConfig::load(config_dir);

    let console_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let console_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("bucketmirror={0},bucketmirror_lib={0}", console_level).into());
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    if !config.enabled {
        tracing_subscriber::registry().with(console_layer).init();
        return None;
    }

    match SizeRotatingWriter::new(&log_dir(config_dir), config.max_size_mb) {
        Ok(file_writer) => {
            let (writer, guard) = tracing_appender::non_blocking(file_writer);
            let file_filter = tracing_subscriber::EnvFilter::new(format!(
                "{},opendal=warn,hyper=warn",
                config.tracing_level()
            ));
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(file_filter);

            tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，只输出到控制台
            tracing_subscriber::registry().with(console_layer).init();
            tracing::warn!("无法创建日志文件: {}", e);
            None
        }
    }
}

fn print_event(event: &MirrorEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        MirrorEvent::Log { message } => println!("{}", message),
        MirrorEvent::FileStatus { file, status, message } => match message {
            Some(message) => println!("[{}] {}: {}", status, file, message),
            None => println!("[{}] {}", status, file),
        },
        MirrorEvent::ScanComplete { total } => println!("扫描完成，共 {} 个文件", total),
        MirrorEvent::SessionState {
            status,
            restart_count,
            message,
        } => println!(
            "会话状态: {:?} (重启 {} 次){}",
            status,
            restart_count,
            message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default()
        ),
    }
    Ok(())
}

async fn run_sync(
    state: &AppState,
    mut events: mpsc::UnboundedReceiver<MirrorEvent>,
    path: PathBuf,
    bucket: Option<String>,
    json: bool,
) -> Result<()> {
    state.start_sync(&path, bucket.as_deref()).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("收到 Ctrl-C，停止同步");
                break;
            }
            _ = state.supervisor.wait() => {
                break;
            }
            Some(event) = events.recv() => print_event(&event, json)?,
        }
    }

    // 会话结束前发出的事件
    while let Ok(event) = events.try_recv() {
        print_event(&event, json)?;
    }

    let session = state.session().await;
    state.cleanup().await;

    if let Some(session) = session.filter(|s| s.status == SessionStatus::Error) {
        anyhow::bail!(
            "同步失败: {}",
            session.last_error.unwrap_or_else(|| "未知错误".to_string())
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = cli.config_dir.unwrap_or_else(default_config_dir);
    let _guard = init_logging(&config_dir, cli.verbose);

    let (tx, rx) = mpsc::unbounded_channel();
    let state = AppState::new(config_dir, EventSink::new(tx))?;

    match cli.command {
        Command::Sync { path, bucket, json } => run_sync(&state, rx, path, bucket, json).await?,
        Command::Ls {
            sub_path,
            bucket,
            prefix,
            sort,
        } => {
            let entries = state
                .browse(bucket.as_deref(), &prefix, &sub_path, sort.into())
                .await?;
            if entries.is_empty() {
                println!("(空)");
            }
            for entry in entries {
                let status = entry
                    .sync_state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let updated = entry
                    .updated_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                let name = if entry.is_folder {
                    format!("{}/", entry.display_name)
                } else {
                    entry.display_name
                };
                println!("{:<10} {:>12} {:<16} {}", status, entry.size, updated, name);
            }
        }
        Command::Verify { bucket, limit } => {
            let objects = state.verify(bucket.as_deref(), limit).await?;
            if objects.is_empty() {
                println!("bucket 为空");
            }
            for object in objects {
                let updated = object
                    .updated_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{} ({} bytes) - Updated: {}", object.key, object.size, updated);
            }
        }
        Command::Purge {
            path,
            bucket,
            dry_run,
        } => {
            let report = state.purge(&path, bucket.as_deref(), dry_run).await?;
            for key in &report.purged {
                println!("{} {}", if dry_run { "将删除" } else { "已删除" }, key);
            }
            for (key, reason) in &report.failed {
                println!("删除失败 {}: {}", key, reason);
            }
            println!(
                "审计完成：处理 {} 个对象，清理 {} 个，失败 {} 个",
                report.processed,
                report.purged.len(),
                report.failed.len()
            );
        }
        Command::Status => {
            let record = SessionRecord::load(&state.config_dir);
            println!("配置目录: {}", state.config_dir.display());
            println!("存储后端: {:?}", state.storage_config.provider);
            println!(
                "默认 bucket: {}",
                state.storage_config.default_bucket.as_deref().unwrap_or("-")
            );
            println!(
                "上次同步目录: {}",
                record
                    .last_sync_path
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            println!("上次 bucket: {}", record.last_bucket.as_deref().unwrap_or("-"));
            println!("日志目录: {}", log_dir(&state.config_dir).display());
        }
    }

    Ok(())
}
