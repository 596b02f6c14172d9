//! 内存传输
//!
//! 不依赖网络的远程文件系统，支持故障注入，用于测试和预演。

use super::{normalize_remote, parent_remote, RemoteEntry, RemoteStat, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct MemFile {
    size: u64,
    modified_time: i64,
}

#[derive(Debug, Default)]
struct MemState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, MemFile>,
    fail_mkdir: HashSet<String>,
    fail_upload: HashSet<String>,
    fail_stat: HashMap<String, TransportError>,
    /// 第 n 次上传之后连接断开
    disconnect_after: Option<usize>,
    upload_delay: Option<Duration>,
    /// 上传后文件的修改时间，None 表示取当前时间
    clock: Option<i64>,
    command_exit_code: i32,
    stat_calls: Vec<String>,
    mkdirs: Vec<String>,
    uploads: Vec<String>,
    commands: Vec<String>,
}

/// 内存中的远程文件系统
pub struct MemoryTransport {
    state: Mutex<MemState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let mut state = MemState::default();
        state.dirs.insert("/".to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        // 锁中毒只会发生在测试线程 panic 时，沿用内部数据即可
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 创建目录及其所有父目录
    pub fn with_dir(self, path: &str) -> Self {
        {
            let mut state = self.lock();
            let mut current = Some(normalize_remote(path));
            while let Some(dir) = current {
                current = parent_remote(&dir);
                state.dirs.insert(dir);
            }
        }
        self
    }

    /// 预置一个远程文件（父目录自动创建）
    pub fn with_file(self, path: &str, size: u64, modified_time: i64) -> Self {
        let path = normalize_remote(path);
        let this = match parent_remote(&path) {
            Some(parent) => self.with_dir(&parent),
            None => self,
        };
        this.lock().files.insert(
            path,
            MemFile {
                size,
                modified_time,
            },
        );
        this
    }

    pub fn fail_mkdir(self, path: &str) -> Self {
        self.lock().fail_mkdir.insert(normalize_remote(path));
        self
    }

    pub fn fail_upload(self, path: &str) -> Self {
        self.lock().fail_upload.insert(normalize_remote(path));
        self
    }

    pub fn fail_stat(self, path: &str, error: TransportError) -> Self {
        self.lock().fail_stat.insert(normalize_remote(path), error);
        self
    }

    pub fn disconnect_after(self, uploads: usize) -> Self {
        self.lock().disconnect_after = Some(uploads);
        self
    }

    pub fn upload_delay(self, delay: Duration) -> Self {
        self.lock().upload_delay = Some(delay);
        self
    }

    /// 固定上传后的修改时间
    pub fn with_clock(self, modified_time: i64) -> Self {
        self.lock().clock = Some(modified_time);
        self
    }

    pub fn command_exit_code(self, code: i32) -> Self {
        self.lock().command_exit_code = code;
        self
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(&normalize_remote(path))
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.lock().files.contains_key(&normalize_remote(path))
    }

    /// 文件的 (大小, 修改时间)
    pub fn file(&self, path: &str) -> Option<(u64, i64)> {
        self.lock()
            .files
            .get(&normalize_remote(path))
            .map(|f| (f.size, f.modified_time))
    }

    pub fn stat_calls(&self) -> Vec<String> {
        self.lock().stat_calls.clone()
    }

    /// 成功创建的目录（按调用顺序）
    pub fn mkdirs(&self) -> Vec<String> {
        self.lock().mkdirs.clone()
    }

    /// 成功上传的文件（按调用顺序）
    pub fn uploads(&self) -> Vec<String> {
        self.lock().uploads.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>, TransportError> {
        let path = normalize_remote(path);
        let mut state = self.lock();
        state.stat_calls.push(path.clone());

        if let Some(err) = state.fail_stat.get(&path) {
            return Err(err.clone());
        }
        if state.dirs.contains(&path) {
            return Ok(Some(RemoteStat {
                is_dir: true,
                size: 0,
                modified_time: 0,
            }));
        }
        Ok(state.files.get(&path).map(|f| RemoteStat {
            is_dir: false,
            size: f.size,
            modified_time: f.modified_time,
        }))
    }

    async fn mkdir(&self, path: &str) -> Result<(), TransportError> {
        let path = normalize_remote(path);
        let mut state = self.lock();

        if state.fail_mkdir.contains(&path) {
            return Err(TransportError::PermissionDenied(path));
        }
        if state.dirs.contains(&path) || state.files.contains_key(&path) {
            return Err(TransportError::AlreadyExists(path));
        }
        if let Some(parent) = parent_remote(&path) {
            if !state.dirs.contains(&parent) {
                return Err(TransportError::NotFound(parent));
            }
        }

        state.dirs.insert(path.clone());
        state.mkdirs.push(path);
        Ok(())
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, TransportError> {
        let remote = normalize_remote(remote);
        let delay = self.lock().upload_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let size = tokio::fs::metadata(local).await?.len();

        let mut state = self.lock();
        if let Some(limit) = state.disconnect_after {
            if state.uploads.len() >= limit {
                return Err(TransportError::ConnectionLost("内存连接已关闭".to_string()));
            }
        }
        if state.fail_upload.contains(&remote) {
            return Err(TransportError::PermissionDenied(remote));
        }
        match parent_remote(&remote) {
            Some(parent) if !state.dirs.contains(&parent) => {
                return Err(TransportError::NotFound(parent));
            }
            _ => {}
        }
        if state.dirs.contains(&remote) {
            return Err(TransportError::Remote(format!("{} 是目录", remote)));
        }

        let modified_time = state.clock.unwrap_or_else(Self::now);
        state.files.insert(
            remote.clone(),
            MemFile {
                size,
                modified_time,
            },
        );
        state.uploads.push(remote);
        Ok(size)
    }

    async fn run_command(&self, command: &str) -> Result<i32, TransportError> {
        let mut state = self.lock();
        state.commands.push(command.to_string());
        Ok(state.command_exit_code)
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let path = normalize_remote(path);
        let state = self.lock();
        if !state.dirs.contains(&path) {
            return Err(TransportError::NotFound(path));
        }

        let mut entries = Vec::new();
        for dir in &state.dirs {
            if parent_remote(dir).as_deref() == Some(path.as_str()) {
                entries.push(RemoteEntry {
                    name: dir.rsplit('/').next().unwrap_or_default().to_string(),
                    path: dir.clone(),
                    stat: RemoteStat {
                        is_dir: true,
                        size: 0,
                        modified_time: 0,
                    },
                });
            }
        }
        for (file, meta) in &state.files {
            if parent_remote(file).as_deref() == Some(path.as_str()) {
                entries.push(RemoteEntry {
                    name: file.rsplit('/').next().unwrap_or_default().to_string(),
                    path: file.clone(),
                    stat: RemoteStat {
                        is_dir: false,
                        size: meta.size,
                        modified_time: meta.modified_time,
                    },
                });
            }
        }
        Ok(entries)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mkdir_requires_parent() {
        let transport = MemoryTransport::new().with_dir("/www");
        assert!(matches!(
            transport.mkdir("/www/site/sub").await,
            Err(TransportError::NotFound(_))
        ));
        transport.mkdir("/www/site").await.unwrap();
        assert!(matches!(
            transport.mkdir("/www/site").await,
            Err(TransportError::AlreadyExists(_))
        ));
        assert_eq!(transport.mkdirs(), vec!["/www/site".to_string()]);
    }

    #[tokio::test]
    async fn test_stat_and_list() {
        let transport = MemoryTransport::new()
            .with_dir("/www/site/sub")
            .with_file("/www/site/a.txt", 3, 100);

        let stat = transport.stat("/www/site/a.txt").await.unwrap().unwrap();
        assert!(!stat.is_dir);
        assert_eq!(stat.modified_time, 100);
        assert!(transport.stat("/www/site/missing").await.unwrap().is_none());

        let mut names: Vec<_> = transport
            .list_dir("/www/site")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "sub"]);
    }

    #[tokio::test]
    async fn test_upload_records_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, "hello").unwrap();

        let transport = MemoryTransport::new().with_dir("/www").with_clock(500);
        let bytes = transport.upload(&local, "/www/a.txt").await.unwrap();
        assert_eq!(bytes, 5);
        assert_eq!(transport.file("/www/a.txt"), Some((5, 500)));
    }
}
