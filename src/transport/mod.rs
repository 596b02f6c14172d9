pub mod local;
pub mod memory;
pub mod sftp;

use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use local::LocalTransport;
pub use memory::MemoryTransport;
pub use sftp::SftpTransport;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, mkdir, 远程命令
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- 上传
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 远程文件元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStat {
    pub is_dir: bool,
    pub size: u64,
    /// 修改时间（Unix 秒）
    pub modified_time: i64,
}

/// 目录列表中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub stat: RemoteStat,
}

/// 远程文件系统接口
///
/// 一个实现对应一条有状态连接，调用方保证同一时刻只有一个操作在进行。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 获取元数据，不存在时返回 `Ok(None)`
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>, TransportError>;

    /// 创建单级目录，已存在时返回 [`TransportError::AlreadyExists`]
    async fn mkdir(&self, path: &str) -> Result<(), TransportError>;

    /// 上传本地文件，返回写入的字节数
    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, TransportError>;

    /// 在远端执行命令，返回退出码（仅用于属主修正）
    async fn run_command(&self, command: &str) -> Result<i32, TransportError>;

    /// 列出目录内容（不含 `.` 和 `..`）
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError>;

    /// 远程路径在命令行中的写法
    fn command_path(&self, path: &str) -> String {
        path.to_string()
    }

    /// 获取传输名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据服务器配置创建传输实例
///
/// `local:` 前缀的主机名表示远程根是本地挂载目录。`op_timeout` 作为
/// SFTP 会话上每次阻塞调用的超时。
pub async fn create_transport(
    server: &crate::config::ServerConfig,
    op_timeout: std::time::Duration,
) -> Result<Arc<dyn Transport>, TransportError> {
    if let Some(base) = server.host.strip_prefix("local:") {
        tracing::info!("初始化本地传输: {}", base);
        return Ok(Arc::new(LocalTransport::new(base)?) as Arc<dyn Transport>);
    }

    tracing::info!(
        "初始化 SFTP 传输: {}@{}:{}",
        server.username,
        server.host,
        server.port
    );
    Ok(Arc::new(SftpTransport::connect(server.clone(), op_timeout).await?) as Arc<dyn Transport>)
}

/// 拼接远程路径（统一使用 /）
pub fn join_remote(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return normalize_remote(base);
    }
    let base = normalize_remote(base);
    if base == "/" {
        format!("/{}", relative)
    } else {
        format!("{}/{}", base, relative)
    }
}

/// 规范化远程路径：反斜杠转为 /，去掉重复与结尾的分隔符
pub fn normalize_remote(path: &str) -> String {
    let path = path.replace('\\', "/");
    let absolute = path.starts_with('/');
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// 远程路径的父目录，根目录没有父目录
pub fn parent_remote(path: &str) -> Option<String> {
    let path = normalize_remote(path);
    if path == "/" || path == "." {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(pos) => Some(path[..pos].to_string()),
        None => Some(".".to_string()),
    }
}

/// `descendant` 是否位于 `ancestor` 之下（不含自身）
pub fn is_descendant(ancestor: &str, descendant: &str) -> bool {
    if ancestor == "/" {
        return descendant.len() > 1 && descendant.starts_with('/');
    }
    descendant.len() > ancestor.len()
        && descendant.starts_with(ancestor)
        && descendant.as_bytes()[ancestor.len()] == b'/'
}
