//! 日志模块 - 文件日志和大小管理

use crate::config::{load_section, save_section};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "mirror.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "log").unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "log", self)
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 带大小限制的日志文件，超过上限时当前文件改名为 `.old`（只保留一份）
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    written: u64,
    writer: BufWriter<File>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        Self::with_max_bytes(log_dir, (max_size_mb as u64) * 1024 * 1024)
    }

    fn with_max_bytes(log_dir: &Path, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let file_path = log_dir.join(LOG_FILE);

        // 启动时已经超限的文件先轮转
        if fs::metadata(&file_path).is_ok_and(|m| m.len() > max_size) {
            Self::rotate_log(&file_path)?;
        }
        let (writer, written) = Self::open_file(&file_path)?;

        Ok(Self {
            file_path,
            max_size,
            written,
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path) -> io::Result<(BufWriter<File>, u64)> {
        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        let len = file.metadata()?.len();
        Ok((BufWriter::new(file), len))
    }

    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        Self::rotate_log(&self.file_path)?;
        let (writer, written) = Self::open_file(&self.file_path)?;
        self.writer = writer;
        self.written = written;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.writer.write(buf)?;
        self.written += n as u64;
        self.writer.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// 日志目录：配置目录下的 logs/
pub fn log_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("logs")
}
