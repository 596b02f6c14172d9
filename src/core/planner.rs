use crate::core::prober::{NodeKind, RemoteProber};
use crate::core::scanner::FileEntry;
use crate::error::ProbeError;
use crate::transport::{join_remote, normalize_remote, parent_remote};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// 动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionKind {
    EnsureDirectory,
    UploadFile,
}

/// 文件相对远端的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Disposition {
    /// 远端不存在
    New,
    /// 本地较新
    Changed,
    /// 远端不比本地旧
    UpToDate,
    /// 需要人工决定
    Conflict,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Disposition::New => "new",
            Disposition::Changed => "changed",
            Disposition::UpToDate => "up-to-date",
            Disposition::Conflict => "conflict",
        };
        write!(f, "{}", s)
    }
}

/// 计划中的一个动作
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAction {
    pub kind: ActionKind,
    pub target: String,
    /// 仅上传动作有
    pub source: Option<FileEntry>,
    /// 目录动作固定为 New
    pub disposition: Disposition,
    /// 远端已有文件的修改时间
    pub remote_modified_time: Option<i64>,
    /// 目标路径探测失败的原因，执行时该文件单独失败
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_error: Option<String>,
}

impl TransferAction {
    pub fn ensure_directory(target: String) -> Self {
        Self {
            kind: ActionKind::EnsureDirectory,
            target,
            source: None,
            disposition: Disposition::New,
            remote_modified_time: None,
            probe_error: None,
        }
    }

    pub fn upload(
        source: FileEntry,
        target: String,
        disposition: Disposition,
        remote_modified_time: Option<i64>,
    ) -> Self {
        Self {
            kind: ActionKind::UploadFile,
            target,
            source: Some(source),
            disposition,
            remote_modified_time,
            probe_error: None,
        }
    }

    pub fn with_probe_error(mut self, error: String) -> Self {
        self.probe_error = Some(error);
        self
    }

    pub fn is_directory(&self) -> bool {
        self.kind == ActionKind::EnsureDirectory
    }
}

/// 计划统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub directories: usize,
    pub new_files: usize,
    pub changed_files: usize,
    pub up_to_date_files: usize,
    pub conflict_files: usize,
    /// 远端状态未知的文件
    pub unresolved_files: usize,
    /// 需要传输的字节数（不含 UpToDate）
    pub transfer_bytes: u64,
}

impl PlanSummary {
    pub fn total_files(&self) -> usize {
        self.new_files
            + self.changed_files
            + self.up_to_date_files
            + self.conflict_files
            + self.unresolved_files
    }
}

/// 传输计划
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPlan {
    pub remote_root: String,
    pub actions: Vec<TransferAction>,
}

impl TransferPlan {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();

        for action in &self.actions {
            if action.is_directory() {
                summary.directories += 1;
                continue;
            }
            if action.probe_error.is_some() {
                summary.unresolved_files += 1;
                continue;
            }
            match action.disposition {
                Disposition::New => summary.new_files += 1,
                Disposition::Changed => summary.changed_files += 1,
                Disposition::UpToDate => summary.up_to_date_files += 1,
                Disposition::Conflict => summary.conflict_files += 1,
            }
            if action.disposition != Disposition::UpToDate {
                summary.transfer_bytes += action.source.as_ref().map(|s| s.size).unwrap_or(0);
            }
        }

        summary
    }
}

/// 远端已有较旧副本时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparePolicy {
    /// 本地较新即覆盖
    #[default]
    LocalWins,
    /// 远端副本较旧时交给调用方决定（Conflict）
    RemoteWins,
}

/// 比较配置
#[derive(Debug, Clone, Default)]
pub struct CompareConfig {
    /// 时间容差（秒），0 表示严格比较
    pub time_tolerance_seconds: i64,
    pub policy: ComparePolicy,
}

/// 同步规划器
///
/// 只读：规划期间只调用探测，目录创建推迟到执行阶段。
pub struct SyncPlanner {
    config: CompareConfig,
}

impl SyncPlanner {
    pub fn new() -> Self {
        Self {
            config: CompareConfig::default(),
        }
    }

    pub fn with_config(config: CompareConfig) -> Self {
        Self { config }
    }

    /// 根据远端修改时间判断文件状态
    pub fn classify(&self, local_mtime: i64, remote_mtime: i64) -> Disposition {
        if remote_mtime + self.config.time_tolerance_seconds < local_mtime {
            match self.config.policy {
                ComparePolicy::LocalWins => Disposition::Changed,
                ComparePolicy::RemoteWins => Disposition::Conflict,
            }
        } else {
            Disposition::UpToDate
        }
    }

    /// 生成传输计划
    ///
    /// 目录动作按深度排在所有上传之前，上传保持扫描顺序。
    pub async fn plan(
        &self,
        entries: &[FileEntry],
        remote_root: &str,
        prober: &mut RemoteProber,
    ) -> Result<TransferPlan, ProbeError> {
        let remote_root = normalize_remote(remote_root);
        info!("开始规划: {} 个文件 -> {}", entries.len(), remote_root);

        let mut directories: Vec<String> = Vec::new();
        let mut uploads: Vec<TransferAction> = Vec::new();

        for entry in entries {
            let target = join_remote(&remote_root, &entry.relative_path);

            // 从远程根到父目录的整条链
            let mut chain = vec![remote_root.clone()];
            let mut current = remote_root.clone();
            let segments: Vec<&str> = entry.relative_path.split('/').collect();
            for segment in &segments[..segments.len().saturating_sub(1)] {
                current = join_remote(&current, segment);
                chain.push(current.clone());
            }

            for dir in &chain {
                self.require_directory(dir, &remote_root, prober, &mut directories)
                    .await?;
            }

            if Self::under_planned(&target, prober) {
                uploads.push(TransferAction::upload(
                    entry.clone(),
                    target,
                    Disposition::New,
                    None,
                ));
                continue;
            }

            let node = match prober.probe(&target).await {
                Ok(node) => node,
                // 单个文件的探测失败只影响该文件，连接级错误仍然中止
                Err(ProbeError::Transport { source, .. }) if !source.is_fatal() => {
                    warn!("探测 {} 失败，该文件将被跳过: {}", target, source);
                    uploads.push(
                        TransferAction::upload(entry.clone(), target, Disposition::New, None)
                            .with_probe_error(source.to_string()),
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let (disposition, remote_mtime) = match node.kind {
                NodeKind::Missing => (Disposition::New, None),
                NodeKind::Directory => {
                    debug!("远端同名路径是目录: {}", target);
                    (Disposition::Conflict, None)
                }
                NodeKind::File => {
                    let remote_mtime = node.modified_time.unwrap_or(0);
                    (
                        self.classify(entry.modified_time, remote_mtime),
                        Some(remote_mtime),
                    )
                }
            };

            uploads.push(TransferAction::upload(
                entry.clone(),
                target,
                disposition,
                remote_mtime,
            ));
        }

        // 稳定排序，同深度保持发现顺序
        directories.sort_by_key(|d| depth(d));

        let mut actions: Vec<TransferAction> = directories
            .into_iter()
            .map(TransferAction::ensure_directory)
            .collect();
        actions.extend(uploads);

        let plan = TransferPlan {
            remote_root,
            actions,
        };
        let summary = plan.summary();
        info!(
            "规划完成: {} 个目录, {} 新增, {} 修改, {} 未变, {} 冲突",
            summary.directories,
            summary.new_files,
            summary.changed_files,
            summary.up_to_date_files,
            summary.conflict_files
        );
        Ok(plan)
    }

    /// 确认目录存在，否则记录一个创建动作
    async fn require_directory(
        &self,
        dir: &str,
        remote_root: &str,
        prober: &mut RemoteProber,
        directories: &mut Vec<String>,
    ) -> Result<(), ProbeError> {
        if prober.is_known_directory(dir) {
            return Ok(());
        }

        let missing = if Self::under_planned(dir, prober) {
            true
        } else {
            let node = prober.probe(dir).await?;
            match node.kind {
                NodeKind::Directory => return Ok(()),
                NodeKind::File => return Err(ProbeError::NotADirectory(dir.to_string())),
                NodeKind::Missing => true,
            }
        };

        if missing && dir == remote_root {
            // 远程根不存在：向上找到第一个存在的祖先
            let mut pending = Vec::new();
            let mut current = parent_remote(dir);
            while let Some(parent) = current {
                if prober.is_known_directory(&parent) {
                    break;
                }
                let node = prober.probe(&parent).await?;
                match node.kind {
                    NodeKind::Directory => break,
                    NodeKind::File => return Err(ProbeError::NotADirectory(parent)),
                    NodeKind::Missing => {
                        current = parent_remote(&parent);
                        pending.push(parent);
                    }
                }
            }
            for parent in pending.into_iter().rev() {
                prober.plan_directory(&parent);
                directories.push(parent);
            }
        }

        debug!("计划创建目录: {}", dir);
        prober.plan_directory(dir);
        directories.push(dir.to_string());
        Ok(())
    }

    /// 父目录尚在计划中，路径必然不存在
    fn under_planned(path: &str, prober: &RemoteProber) -> bool {
        parent_remote(path)
            .map(|parent| prober.is_planned(&parent))
            .unwrap_or(false)
    }
}

impl Default for SyncPlanner {
    fn default() -> Self {
        Self::new()
    }
}

fn depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty() && *s != ".").count()
}
