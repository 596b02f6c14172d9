pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod transport;
pub mod watch;

pub use core::{SyncEngine, SyncJob, SyncReport};
pub use error::{ConfigError, ProbeError, ScanError, TransportError};

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }

    /// 应用配置目录，`SFTPSYNC_CONFIG_DIR` 可覆盖
    pub fn app_config_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("SFTPSYNC_CONFIG_DIR").filter(|d| !d.is_empty()) {
            return PathBuf::from(dir);
        }
        config_dir()
            .map(|p| p.join("sftpsync"))
            .unwrap_or_else(|| PathBuf::from(".sftpsync"))
    }
}
