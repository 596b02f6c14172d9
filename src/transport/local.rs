use super::{normalize_remote, RemoteEntry, RemoteStat, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;

/// 远程根为本地挂载目录的传输（NFS、SMB 等）
pub struct LocalTransport {
    base_path: PathBuf,
    name: String,
}

impl LocalTransport {
    pub fn new(path: &str) -> Result<Self, TransportError> {
        let base_path = PathBuf::from(path);
        if !base_path.is_dir() {
            return Err(TransportError::NotFound(path.to_string()));
        }
        let name = format!("local:{}", path);
        Ok(Self { base_path, name })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = normalize_remote(path);
        let path = path.trim_start_matches('/');
        if path.is_empty() || path == "." {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    fn to_stat(metadata: &std::fs::Metadata) -> RemoteStat {
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        RemoteStat {
            is_dir: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified_time: modified,
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>, TransportError> {
        match fs::metadata(self.resolve_path(path)).await {
            Ok(metadata) => Ok(Some(Self::to_stat(&metadata))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<(), TransportError> {
        fs::create_dir(self.resolve_path(path)).await?;
        Ok(())
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, TransportError> {
        let full_path = self.resolve_path(remote);

        // 先写临时文件，再原子重命名
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = full_path.with_file_name(format!(".{}.part", file_name));
        let bytes = fs::copy(local, &temp_path).await?;

        let stamp_path = temp_path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            // 与 SFTP 一致：远程修改时间是上传时间
            let file = std::fs::File::options().write(true).open(&stamp_path)?;
            file.set_modified(SystemTime::now())
        })
        .await
        .map_err(|e| TransportError::Io(format!("任务执行失败: {}", e)))??;

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(bytes)
    }

    async fn run_command(&self, command: &str) -> Result<i32, TransportError> {
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.base_path)
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let dir = normalize_remote(path);
        let mut reader = fs::read_dir(self.resolve_path(&dir)).await?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            entries.push(RemoteEntry {
                path: super::join_remote(&dir, &name),
                name,
                stat: Self::to_stat(&metadata),
            });
        }
        Ok(entries)
    }

    fn command_path(&self, path: &str) -> String {
        self.resolve_path(path).to_string_lossy().to_string()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
