//! 错误类型
//!
//! 会话层按错误种类决定重启、终止还是只标记单个文件失败。

use std::io;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// 凭据缺失或无效，会话直接终止，不重试
    #[error("认证失败: {0}")]
    Auth(String),

    /// 本地路径或 bucket 不存在
    #[error("未找到: {0}")]
    NotFound(String),

    /// 网络抖动、文件被占用等，通过会话重启重试
    #[error("临时 I/O 错误: {0}")]
    TransientIo(String),

    /// 单个对象写入失败，只标记该文件，不影响其他文件
    #[error("上传失败 {path}: {reason}")]
    PermanentUpload { path: String, reason: String },

    #[error("已重启 {restarts} 次仍然失败: {last}")]
    RestartsExhausted { restarts: u32, last: String },

    #[error("配置错误: {0}")]
    Config(String),

    #[error("操作已取消")]
    Cancelled,
}

impl SyncError {
    /// 列表、探测等非写入操作的错误映射
    pub fn from_storage(err: opendal::Error) -> Self {
        use opendal::ErrorKind;

        match err.kind() {
            ErrorKind::PermissionDenied | ErrorKind::ConfigInvalid => Self::Auth(err.to_string()),
            ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::TransientIo(err.to_string()),
        }
    }

    /// 写入对象时的错误映射：权限类错误只影响该对象
    pub fn from_upload(path: &str, err: opendal::Error) -> Self {
        use opendal::ErrorKind;

        if err.is_temporary() {
            return Self::TransientIo(err.to_string());
        }
        match err.kind() {
            ErrorKind::ConfigInvalid => Self::Auth(err.to_string()),
            ErrorKind::NotFound => Self::NotFound(err.to_string()),
            ErrorKind::RateLimited | ErrorKind::Unexpected => Self::TransientIo(err.to_string()),
            _ => Self::PermanentUpload {
                path: path.to_string(),
                reason: err.to_string(),
            },
        }
    }

    /// 本地文件系统错误映射
    pub fn from_io(path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(format!("{}: {}", path, err)),
            io::ErrorKind::PermissionDenied => Self::PermanentUpload {
                path: path.to_string(),
                reason: err.to_string(),
            },
            _ => Self::TransientIo(format!("{}: {}", path, err)),
        }
    }

    /// 是否可以通过重启会话恢复
    pub fn is_restartable(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }

    /// 只影响单个文件的错误
    pub fn is_per_file(&self) -> bool {
        matches!(self, Self::PermanentUpload { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_permission_denied_is_auth() {
        let err = opendal::Error::new(opendal::ErrorKind::PermissionDenied, "403 Forbidden");
        assert!(matches!(SyncError::from_storage(err), SyncError::Auth(_)));
    }

    #[test]
    fn test_upload_permission_denied_is_per_file() {
        let err = opendal::Error::new(opendal::ErrorKind::PermissionDenied, "403 Forbidden");
        let mapped = SyncError::from_upload("Desktop/a.txt", err);
        assert!(mapped.is_per_file());
        assert!(!mapped.is_restartable());
    }

    #[test]
    fn test_temporary_upload_error_is_restartable() {
        let err = opendal::Error::new(opendal::ErrorKind::Unexpected, "connection reset").set_temporary();
        assert!(SyncError::from_upload("Desktop/a.txt", err).is_restartable());
    }

    #[test]
    fn test_io_mapping() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(SyncError::from_io("a", missing), SyncError::NotFound(_)));

        let locked = io::Error::new(io::ErrorKind::Other, "file is locked");
        assert!(SyncError::from_io("a", locked).is_restartable());
    }
}
