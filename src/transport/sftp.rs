//! 基于 ssh2 的 SFTP 传输
//!
//! 一条阻塞模式的 SSH 会话，所有调用都放进 `spawn_blocking`，
//! 属主修正走同一会话上的 exec 通道。

use super::{normalize_remote, RemoteEntry, RemoteStat, Transport};
use crate::config::{AuthMethod, ServerConfig};
use crate::error::TransportError;
use async_trait::async_trait;
use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

// libssh2 状态码
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const FX_NO_CONNECTION: i32 = 6;
const FX_CONNECTION_LOST: i32 = 7;
const FX_FILE_ALREADY_EXISTS: i32 = 11;
const ERROR_TIMEOUT: i32 = -9;
const ERROR_AUTHENTICATION_FAILED: i32 = -18;

/// 已连接的会话
struct SftpState {
    session: ssh2::Session,
    sftp: ssh2::Sftp,
    /// 单次阻塞调用的超时（秒）
    timeout_secs: u64,
}

impl SftpState {
    fn map_err(&self, path: &str, e: ssh2::Error) -> TransportError {
        map_ssh_error(path, e, self.timeout_secs)
    }
}

/// SFTP 传输
pub struct SftpTransport {
    config: ServerConfig,
    timeout: Duration,
    state: Arc<Mutex<Option<SftpState>>>,
    name: String,
}

impl SftpTransport {
    /// 建立连接并完成认证，`timeout` 作用于每次阻塞的 SSH 调用
    pub async fn connect(config: ServerConfig, timeout: Duration) -> Result<Self, TransportError> {
        let name = format!("sftp:{}@{}:{}", config.username, config.host, config.port);
        let transport = Self {
            config,
            timeout,
            state: Arc::new(Mutex::new(None)),
            name,
        };
        // 立即连接，认证失败在扫描之前暴露
        transport.with_session("connect", |_| Ok(())).await?;
        Ok(transport)
    }

    fn open_session(config: &ServerConfig, timeout: Duration) -> Result<SftpState, TransportError> {
        let addr = format!("{}:{}", config.host, config.port);
        let tcp = TcpStream::connect(&addr)
            .map_err(|e| TransportError::ConnectionLost(format!("连接 {} 失败: {}", addr, e)))?;

        let mut session =
            ssh2::Session::new().map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(session_timeout_ms(timeout));
        session
            .handshake()
            .map_err(|e| TransportError::ConnectionLost(format!("握手失败: {}", e)))?;

        match config.auth_method {
            AuthMethod::Agent => session
                .userauth_agent(&config.username)
                .map_err(|e| TransportError::Auth(format!("ssh-agent 认证失败: {}", e)))?,
            AuthMethod::Key => {
                let key_path = expand_tilde(config.key_path.as_deref().unwrap_or("~/.ssh/id_rsa"));
                session
                    .userauth_pubkey_file(
                        &config.username,
                        None,
                        &key_path,
                        config.password.as_deref(),
                    )
                    .map_err(|e| TransportError::Auth(format!("密钥认证失败: {}", e)))?
            }
            AuthMethod::Password => session
                .userauth_password(&config.username, config.password.as_deref().unwrap_or(""))
                .map_err(|e| TransportError::Auth(format!("密码认证失败: {}", e)))?,
        }

        if !session.authenticated() {
            return Err(TransportError::Auth("认证未通过".to_string()));
        }

        let sftp = session
            .sftp()
            .map_err(|e| TransportError::ConnectionLost(format!("SFTP 初始化失败: {}", e)))?;

        debug!("SFTP 会话已建立: {}", addr);
        Ok(SftpState {
            session,
            sftp,
            timeout_secs: timeout.as_secs(),
        })
    }

    /// 在阻塞线程中使用会话，必要时先连接；连接级错误会丢弃会话
    async fn with_session<T, F>(&self, op: &'static str, f: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&SftpState) -> Result<T, TransportError> + Send + 'static,
    {
        let state = self.state.clone();
        let config = self.config.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            let mut guard = state
                .lock()
                .map_err(|e| TransportError::Remote(format!("锁定 SFTP 会话失败: {}", e)))?;

            if guard.is_none() {
                *guard = Some(Self::open_session(&config, timeout)?);
            }
            let sftp_state = guard
                .as_ref()
                .ok_or_else(|| TransportError::ConnectionLost("SFTP 未连接".to_string()))?;

            let result = f(sftp_state);
            if let Err(e) = &result {
                if e.is_fatal() {
                    warn!("{} 失败，丢弃 SFTP 会话: {}", op, e);
                    *guard = None;
                }
            }
            result
        })
        .await
        .map_err(|e| TransportError::Remote(format!("任务执行失败: {}", e)))?
    }
}

/// libssh2 的超时以毫秒 u32 表示，0 表示永不超时
fn session_timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis())
        .unwrap_or(u32::MAX)
        .max(1)
}

/// ssh2 错误映射为传输错误
fn map_ssh_error(path: &str, e: ssh2::Error, timeout_secs: u64) -> TransportError {
    match e.code() {
        ssh2::ErrorCode::SFTP(FX_NO_SUCH_FILE) => TransportError::NotFound(path.to_string()),
        ssh2::ErrorCode::SFTP(FX_PERMISSION_DENIED) => {
            TransportError::PermissionDenied(path.to_string())
        }
        ssh2::ErrorCode::SFTP(FX_FILE_ALREADY_EXISTS) => {
            TransportError::AlreadyExists(path.to_string())
        }
        ssh2::ErrorCode::SFTP(FX_NO_CONNECTION) | ssh2::ErrorCode::SFTP(FX_CONNECTION_LOST) => {
            TransportError::ConnectionLost(e.to_string())
        }
        ssh2::ErrorCode::SFTP(_) => TransportError::Remote(format!("{}: {}", path, e)),
        ssh2::ErrorCode::Session(ERROR_TIMEOUT) => TransportError::Timeout {
            op: path.to_string(),
            secs: timeout_secs,
        },
        ssh2::ErrorCode::Session(ERROR_AUTHENTICATION_FAILED) => {
            TransportError::Auth(e.to_string())
        }
        ssh2::ErrorCode::Session(_) => TransportError::ConnectionLost(e.to_string()),
    }
}

fn to_stat(stat: &ssh2::FileStat) -> RemoteStat {
    RemoteStat {
        is_dir: stat.is_dir(),
        size: stat.size.unwrap_or(0),
        modified_time: stat.mtime.map(|t| t as i64).unwrap_or(0),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[async_trait]
impl Transport for SftpTransport {
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>, TransportError> {
        let path = normalize_remote(path);
        self.with_session("stat", move |s| match s.sftp.stat(Path::new(&path)) {
            Ok(stat) => Ok(Some(to_stat(&stat))),
            Err(e) => match s.map_err(&path, e) {
                TransportError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> Result<(), TransportError> {
        let path = normalize_remote(path);
        self.with_session("mkdir", move |s| {
            let p = Path::new(&path);
            match s.sftp.mkdir(p, 0o755) {
                Ok(()) => Ok(()),
                Err(e) => {
                    // 多数服务器对已存在的目录只返回 FAILURE，需要再 stat 一次
                    if let Ok(stat) = s.sftp.stat(p) {
                        if stat.is_dir() {
                            return Err(TransportError::AlreadyExists(path.clone()));
                        }
                    }
                    Err(s.map_err(&path, e))
                }
            }
        })
        .await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, TransportError> {
        let remote = normalize_remote(remote);
        let local = local.to_path_buf();
        self.with_session("upload", move |s| {
            let mut local_file = std::fs::File::open(&local)?;
            let mut remote_file = s
                .sftp
                .create(Path::new(&remote))
                .map_err(|e| s.map_err(&remote, e))?;
            let bytes = std::io::copy(&mut local_file, &mut remote_file)?;
            Ok(bytes)
        })
        .await
    }

    async fn run_command(&self, command: &str) -> Result<i32, TransportError> {
        let command = command.to_string();
        self.with_session("exec", move |s| {
            let mut channel = s
                .session
                .channel_session()
                .map_err(|e| s.map_err("exec", e))?;
            channel.exec(&command).map_err(|e| s.map_err("exec", e))?;

            let mut output = String::new();
            let _ = channel.read_to_string(&mut output);
            channel.wait_close().map_err(|e| s.map_err("exec", e))?;
            let code = channel.exit_status().map_err(|e| s.map_err("exec", e))?;
            if code != 0 {
                debug!("远程命令退出码 {}: {}", code, output.trim());
            }
            Ok(code)
        })
        .await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let dir = normalize_remote(path);
        self.with_session("readdir", move |s| {
            let items = s
                .sftp
                .readdir(Path::new(&dir))
                .map_err(|e| s.map_err(&dir, e))?;

            let mut entries = Vec::new();
            for (pathbuf, stat) in items {
                let name = pathbuf
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if name.is_empty() || name == "." || name == ".." {
                    continue;
                }
                entries.push(RemoteEntry {
                    path: super::join_remote(&dir, &name),
                    name,
                    stat: to_stat(&stat),
                });
            }
            Ok(entries)
        })
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
