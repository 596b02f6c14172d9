//! 错误类型
//!
//! 扫描、探测、传输、配置各自一个枚举，引擎层再用 anyhow 串起来。

use std::path::PathBuf;
use thiserror::Error;

/// 本地扫描错误（致命，发生在任何网络操作之前）
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("本地目录不存在: {0}")]
    RootNotFound(PathBuf),

    #[error("不是目录: {0}")]
    NotADirectory(PathBuf),

    #[error("排除规则无效: {0}")]
    InvalidPattern(String),

    #[error("读取本地目录失败: {0}")]
    Io(#[from] std::io::Error),
}

/// 远程探测错误，与“不存在”严格区分
#[derive(Error, Debug)]
pub enum ProbeError {
    /// 祖先路径上存在同名文件，无法在其下放置文件
    #[error("远程路径不是目录: {0}")]
    NotADirectory(String),

    #[error("探测 {path} 失败: {source}")]
    Transport {
        path: String,
        #[source]
        source: TransportError,
    },
}

impl ProbeError {
    pub fn path(&self) -> &str {
        match self {
            ProbeError::NotADirectory(path) => path,
            ProbeError::Transport { path, .. } => path,
        }
    }
}

/// 传输层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("远程路径不存在: {0}")]
    NotFound(String),

    #[error("远程路径已存在: {0}")]
    AlreadyExists(String),

    #[error("权限不足: {0}")]
    PermissionDenied(String),

    #[error("{op} 超时 ({secs}s)")]
    Timeout { op: String, secs: u64 },

    #[error("认证失败: {0}")]
    Auth(String),

    #[error("连接已断开: {0}")]
    ConnectionLost(String),

    #[error("本地 I/O 错误: {0}")]
    Io(String),

    #[error("远程操作失败: {0}")]
    Remote(String),
}

impl TransportError {
    /// 连接级错误，后续动作都无法执行
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::ConnectionLost(_) | TransportError::Auth(_))
    }

    /// 可以重试的错误
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout { .. } | TransportError::Io(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => TransportError::NotFound(e.to_string()),
            std::io::ErrorKind::AlreadyExists => TransportError::AlreadyExists(e.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                TransportError::PermissionDenied(e.to_string())
            }
            _ => TransportError::Io(e.to_string()),
        }
    }
}

/// 配置与凭据错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("服务器未配置: {0}")]
    UnknownServer(String),

    #[error("配置无效: {0}")]
    Invalid(String),

    #[error("配置文件解析失败: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("读写配置文件失败: {0}")]
    Io(#[from] std::io::Error),
}
