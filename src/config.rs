//! 应用配置模块
//!
//! - `config.json`：日志、同步参数、各项目的自动上传设置
//! - `servers.json`：服务器连接信息（凭据来源）

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// 默认属主
pub const DEFAULT_OWNERSHIP: &str = "www-data:www-data";

/// 读取 config.json 中的一个段落，缺失或解析失败时返回 None
pub(crate) fn read_section<T: serde::de::DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join("config.json")).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    serde_json::from_value::<T>(config.get(key)?.clone()).ok()
}

/// 写入 config.json 中的一个段落，保留其它段落
pub(crate) fn write_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    fs::create_dir_all(config_dir)?;
    let config_file = config_dir.join("config.json");

    // 读取现有配置
    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[key] = serde_json::to_value(value).map_err(io::Error::other)?;

    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(&config_file, content)
}

// ============ 同步参数 ============

/// 同步参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// stat / mkdir / 远程命令超时（秒）
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,
    /// 单个文件上传超时（秒）
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    /// 瞬时错误的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒），按指数退避
    #[serde(default = "default_retry_delay")]
    pub retry_base_delay_ms: u64,
    /// 排除规则（glob）
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// 属主修正是否使用 sudo
    #[serde(default = "default_chown_with_sudo")]
    pub chown_with_sudo: bool,
}

fn default_op_timeout() -> u64 {
    crate::transport::OP_TIMEOUT_SECS
}

fn default_io_timeout() -> u64 {
    crate::transport::IO_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_chown_with_sudo() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            op_timeout_secs: default_op_timeout(),
            io_timeout_secs: default_io_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_delay(),
            exclude_patterns: Vec::new(),
            chown_with_sudo: default_chown_with_sudo(),
        }
    }
}

impl SyncSettings {
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "sync").unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "sync", self)
    }
}

// ============ 项目自动上传设置 ============

/// 单个项目的自动上传设置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoUploadSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub remote_path: String,
    #[serde(default = "default_ownership")]
    pub ownership: String,
}

fn default_ownership() -> String {
    DEFAULT_OWNERSHIP.to_string()
}

impl Default for AutoUploadSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            server_name: String::new(),
            remote_path: String::new(),
            ownership: default_ownership(),
        }
    }
}

impl AutoUploadSettings {
    /// 检查启用的设置是否完整
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.server_name.trim().is_empty() {
            return Err(ConfigError::Invalid("未选择服务器".to_string()));
        }
        if self.remote_path.trim().is_empty() {
            return Err(ConfigError::Invalid("未设置远程路径".to_string()));
        }
        if !self.ownership.trim().is_empty() {
            crate::core::executor::validate_ownership(self.ownership.trim())?;
        }
        Ok(())
    }

    /// 读取项目设置，项目目录以规范化后的绝对路径为键
    pub fn load(config_dir: &Path, project_dir: &Path) -> Self {
        let projects: BTreeMap<String, AutoUploadSettings> =
            read_section(config_dir, "projects").unwrap_or_default();
        projects
            .get(&project_key(project_dir))
            .cloned()
            .unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path, project_dir: &Path) -> io::Result<()> {
        let mut projects: BTreeMap<String, AutoUploadSettings> =
            read_section(config_dir, "projects").unwrap_or_default();
        projects.insert(project_key(project_dir), self.clone());
        write_section(config_dir, "projects", &projects)
    }
}

fn project_key(project_dir: &Path) -> String {
    project_dir
        .canonicalize()
        .unwrap_or_else(|_| project_dir.to_path_buf())
        .to_string_lossy()
        .replace('\\', "/")
}

// ============ 服务器与凭据 ============

/// 认证方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Password,
    Key,
    Agent,
}

/// 服务器连接信息
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    /// 密码，密钥认证时为密钥口令
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

fn default_port() -> u16 {
    22
}

// 手写 Debug，避免密码进入日志
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("auth_method", &self.auth_method)
            .field("key_path", &self.key_path)
            .finish()
    }
}

/// 凭据来源：服务器名 -> 连接信息
pub trait CredentialSource {
    fn resolve(&self, server_name: &str) -> Result<ServerConfig, ConfigError>;
}

/// servers.json 中保存的服务器列表
#[derive(Debug, Clone, Default)]
pub struct ServerStore {
    path: PathBuf,
    servers: BTreeMap<String, ServerConfig>,
}

impl ServerStore {
    /// 从配置目录加载，文件不存在时为空
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join("servers.json");
        let servers = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, servers })
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.servers)?)?;
        restrict_permissions(&self.path);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(|s| s.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    pub fn insert(&mut self, name: &str, server: ServerConfig) -> Result<(), ConfigError> {
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid("服务器名称不能为空".to_string()));
        }
        if server.host.trim().is_empty() || server.username.trim().is_empty() {
            return Err(ConfigError::Invalid("主机和用户名不能为空".to_string()));
        }
        self.servers.insert(name.to_string(), server);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<ServerConfig> {
        self.servers.remove(name)
    }
}

impl CredentialSource for ServerStore {
    fn resolve(&self, server_name: &str) -> Result<ServerConfig, ConfigError> {
        self.servers
            .get(server_name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownServer(server_name.to_string()))
    }
}

/// 凭据文件只允许本人读写
#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!("设置 {:?} 权限失败: {}", path, e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerConfig {
        ServerConfig {
            host: "example.org".to_string(),
            port: 2222,
            username: "deploy".to_string(),
            password: Some("hunter2".to_string()),
            auth_method: AuthMethod::Password,
            key_path: None,
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        let printed = format!("{:?}", server());
        assert!(printed.contains("deploy"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_server_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ServerStore::load(dir.path()).unwrap();
        assert_eq!(store.names().count(), 0);

        store.insert("prod", server()).unwrap();
        store.save().unwrap();

        let store = ServerStore::load(dir.path()).unwrap();
        assert_eq!(store.resolve("prod").unwrap(), server());
        assert!(matches!(
            store.resolve("staging"),
            Err(ConfigError::UnknownServer(_))
        ));
    }

    #[test]
    fn test_server_defaults() {
        let parsed: BTreeMap<String, ServerConfig> =
            serde_json::from_str(r#"{"s": {"host": "h", "username": "u"}}"#).unwrap();
        let s = &parsed["s"];
        assert_eq!(s.port, 22);
        assert_eq!(s.auth_method, AuthMethod::Password);
        assert!(s.password.is_none());
    }

    #[test]
    fn test_insert_rejects_incomplete_server() {
        let mut store = ServerStore::default();
        let mut incomplete = server();
        incomplete.host = " ".to_string();
        assert!(store.insert("x", incomplete).is_err());
        assert!(store.insert("", server()).is_err());
    }

    #[test]
    fn test_sections_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();

        let sync = SyncSettings {
            max_retries: 7,
            ..Default::default()
        };
        sync.save(dir.path()).unwrap();

        let auto = AutoUploadSettings {
            enabled: true,
            server_name: "prod".to_string(),
            remote_path: "/var/www/map".to_string(),
            ownership: DEFAULT_OWNERSHIP.to_string(),
        };
        auto.save(dir.path(), project.path()).unwrap();

        assert_eq!(SyncSettings::load(dir.path()).max_retries, 7);
        assert_eq!(AutoUploadSettings::load(dir.path(), project.path()), auto);

        let other = tempfile::tempdir().unwrap();
        assert!(!AutoUploadSettings::load(dir.path(), other.path()).enabled);
    }

    #[test]
    fn test_auto_upload_validation() {
        let mut settings = AutoUploadSettings::default();
        assert!(settings.validate().is_ok());

        settings.enabled = true;
        assert!(settings.validate().is_err());

        settings.server_name = "prod".to_string();
        settings.remote_path = "/var/www".to_string();
        assert!(settings.validate().is_ok());

        settings.ownership = "www-data; reboot".to_string();
        assert!(settings.validate().is_err());
    }
}
