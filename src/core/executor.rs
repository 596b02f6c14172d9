//! 同步执行器
//!
//! 按计划顺序逐个执行动作，产出事件序列。单连接串行执行，
//! 暂停与停止只在动作之间生效，不会打断正在传输的文件。

use crate::config::SyncSettings;
use crate::core::conflict::{ConfirmRequest, ConfirmationCallback, ConflictGate, OverwriteMode};
use crate::core::control::{RunControl, RunState};
use crate::core::planner::{Disposition, TransferAction, TransferPlan};
use crate::core::prober::RemoteProber;
use crate::error::{ConfigError, TransportError};
use crate::transport::is_descendant;
use futures::Stream;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 执行策略
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// 未变化的文件也重新上传，已存在文件不再确认
    pub force_upload: bool,
    pub overwrite: OverwriteMode,
    /// `user[:group]`，None 表示不修正属主
    pub ownership: Option<String>,
    pub chown_with_sudo: bool,
    /// 远程命令超时
    pub op_timeout: Duration,
    /// 单个文件上传超时
    pub io_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

impl ExecutionPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            force_upload: false,
            overwrite: OverwriteMode::default(),
            ownership: None,
            chown_with_sudo: settings.chown_with_sudo,
            op_timeout: Duration::from_secs(settings.op_timeout_secs),
            io_timeout: Duration::from_secs(settings.io_timeout_secs),
            max_retries: settings.max_retries,
            retry_base_delay_ms: settings.retry_base_delay_ms,
        }
    }

    /// 设置属主，空字符串表示不修正
    pub fn with_ownership(mut self, ownership: &str) -> Self {
        let ownership = ownership.trim();
        self.ownership = if ownership.is_empty() {
            None
        } else {
            Some(ownership.to_string())
        };
        self
    }
}

/// 跳过原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    UpToDate,
    /// 确认时选择不覆盖
    Declined,
}

/// 执行事件，完整序列即传输日志
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutionEvent {
    DirectoryEnsured {
        path: String,
    },
    FailedDirectory {
        path: String,
        error: String,
    },
    Uploaded {
        source: String,
        target: String,
        bytes: u64,
        disposition: Disposition,
    },
    Skipped {
        target: String,
        reason: SkipReason,
    },
    FailedFile {
        source: String,
        target: String,
        error: String,
    },
    /// 属主修正失败，不影响动作本身
    OwnershipFailed {
        path: String,
        error: String,
    },
    /// 在动作边界处停止
    Stopped {
        remaining: usize,
    },
    /// 连接级错误，运行失败
    Aborted {
        error: String,
    },
}

impl ExecutionEvent {
    /// 事件涉及的远程路径
    pub fn path(&self) -> Option<&str> {
        match self {
            ExecutionEvent::DirectoryEnsured { path }
            | ExecutionEvent::FailedDirectory { path, .. }
            | ExecutionEvent::OwnershipFailed { path, .. } => Some(path),
            ExecutionEvent::Uploaded { target, .. }
            | ExecutionEvent::Skipped { target, .. }
            | ExecutionEvent::FailedFile { target, .. } => Some(target),
            ExecutionEvent::Stopped { .. } | ExecutionEvent::Aborted { .. } => None,
        }
    }
}

/// 检查属主格式：`user` 或 `user:group`
pub fn validate_ownership(ownership: &str) -> Result<(), ConfigError> {
    static OWNER_RE: OnceLock<Option<regex::Regex>> = OnceLock::new();
    let re = OWNER_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9._-]+(:[A-Za-z0-9._-]+)?$").ok());

    match re {
        Some(re) if re.is_match(ownership) => Ok(()),
        _ => Err(ConfigError::Invalid(format!("属主格式无效: {}", ownership))),
    }
}

/// 生成属主修正命令，路径按单引号转义
pub fn ownership_command(ownership: &str, path: &str, sudo: bool) -> String {
    let quoted = format!("'{}'", path.replace('\'', r"'\''"));
    if sudo {
        format!("sudo chown {} {}", ownership, quoted)
    } else {
        format!("chown {} {}", ownership, quoted)
    }
}

/// 一次同步运行
///
/// 持有探测缓存、计划、运行状态和事件日志。运行结束后不可重启，
/// 重试需要重新规划。
pub struct SyncRun {
    id: String,
    prober: RemoteProber,
    actions: Vec<TransferAction>,
    next: usize,
    policy: ExecutionPolicy,
    gate: ConflictGate,
    control: RunControl,
    state: RunState,
    /// 创建失败的目录及原因
    failed_dirs: Vec<(String, String)>,
    pending: VecDeque<ExecutionEvent>,
    log: Vec<ExecutionEvent>,
}

impl SyncRun {
    pub fn new(
        plan: TransferPlan,
        prober: RemoteProber,
        policy: ExecutionPolicy,
        confirm: Box<dyn ConfirmationCallback>,
        control: RunControl,
    ) -> Result<Self, ConfigError> {
        if let Some(owner) = &policy.ownership {
            validate_ownership(owner)?;
        }

        let id = uuid::Uuid::new_v4().to_string();
        info!(
            "创建同步运行 {}: {} 个动作 -> {}",
            id,
            plan.len(),
            plan.remote_root
        );

        Ok(Self {
            id,
            prober,
            actions: plan.actions,
            next: 0,
            gate: ConflictGate::new(policy.overwrite, confirm),
            policy,
            control,
            state: RunState::Running,
            failed_dirs: Vec::new(),
            pending: VecDeque::new(),
            log: Vec::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// 已产出的全部事件
    pub fn log(&self) -> &[ExecutionEvent] {
        &self.log
    }

    /// 尚未开始的动作数
    pub fn remaining(&self) -> usize {
        self.actions.len() - self.next
    }

    pub fn prober(&self) -> &RemoteProber {
        &self.prober
    }

    /// 获取下一个事件，运行结束后返回 None
    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.log.push(event.clone());
                return Some(event);
            }
            if self.state.is_terminal() {
                return None;
            }

            if self.next >= self.actions.len() {
                info!("同步运行 {} 完成", self.id);
                self.state = RunState::Completed;
                return None;
            }

            // 动作边界
            if self.control.is_stopped() {
                let remaining = self.remaining();
                info!("同步运行 {} 已停止，剩余 {} 个动作", self.id, remaining);
                self.state = RunState::Stopped;
                self.pending.push_back(ExecutionEvent::Stopped { remaining });
                continue;
            }
            if self.control.is_paused() {
                if self.state != RunState::Paused {
                    info!("同步运行 {} 已暂停", self.id);
                    self.state = RunState::Paused;
                }
                self.control.wait_while_paused().await;
                continue;
            }
            if self.state == RunState::Paused {
                info!("同步运行 {} 继续", self.id);
            }
            self.state = RunState::Running;

            let Some(action) = self.actions.get(self.next).cloned() else {
                self.state = RunState::Completed;
                return None;
            };
            self.next += 1;

            let result = if action.is_directory() {
                self.execute_directory(&action).await
            } else {
                self.execute_upload(&action).await
            };

            if let Err(e) = result {
                error!("连接错误，同步运行 {} 失败: {}", self.id, e);
                self.state = RunState::Failed;
                self.pending.push_back(ExecutionEvent::Aborted {
                    error: format!("{}: {}", action.target, e),
                });
            }
        }
    }

    /// 转换为事件流
    pub fn into_stream(self) -> impl Stream<Item = ExecutionEvent> {
        futures::stream::unfold(self, |mut run| async move {
            run.next_event().await.map(|event| (event, run))
        })
    }

    /// 执行剩余全部动作，返回完整日志
    pub async fn run_to_end(&mut self) -> Vec<ExecutionEvent> {
        while self.next_event().await.is_some() {}
        self.log.clone()
    }

    /// 路径所在的失败目录
    fn blocked_by(&self, path: &str) -> Option<&(String, String)> {
        self.failed_dirs
            .iter()
            .find(|(dir, _)| is_descendant(dir, path))
    }

    /// 只有连接级错误返回 Err
    async fn execute_directory(&mut self, action: &TransferAction) -> Result<(), TransportError> {
        let path = action.target.clone();

        if let Some((dir, cause)) = self.blocked_by(&path) {
            let error = format!("上级目录 {} 创建失败: {}", dir, cause);
            warn!("跳过目录 {}: {}", path, error);
            self.failed_dirs.push((path.clone(), error.clone()));
            self.pending
                .push_back(ExecutionEvent::FailedDirectory { path, error });
            return Ok(());
        }

        let mut attempt = 0;
        let result = loop {
            match self.prober.ensure_directory(&path).await {
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    self.backoff(&path, attempt, &e).await;
                    attempt += 1;
                }
                other => break other,
            }
        };

        match result {
            Ok(()) => {
                debug!("目录已就绪: {}", path);
                self.pending
                    .push_back(ExecutionEvent::DirectoryEnsured { path: path.clone() });
                self.fix_ownership(&path).await;
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("创建目录失败 {}: {}", path, e);
                self.failed_dirs.push((path.clone(), e.to_string()));
                self.pending.push_back(ExecutionEvent::FailedDirectory {
                    path,
                    error: e.to_string(),
                });
                Ok(())
            }
        }
    }

    async fn execute_upload(&mut self, action: &TransferAction) -> Result<(), TransportError> {
        let target = action.target.clone();
        let Some(source) = action.source.as_ref() else {
            self.pending.push_back(ExecutionEvent::FailedFile {
                source: String::new(),
                target,
                error: "缺少本地文件".to_string(),
            });
            return Ok(());
        };

        if let Some((dir, cause)) = self.blocked_by(&target) {
            let error = format!("目录 {} 创建失败: {}", dir, cause);
            self.pending.push_back(ExecutionEvent::FailedFile {
                source: source.relative_path.clone(),
                target,
                error,
            });
            return Ok(());
        }

        if let Some(error) = &action.probe_error {
            warn!("远端状态未知，跳过 {}: {}", target, error);
            self.pending.push_back(ExecutionEvent::FailedFile {
                source: source.relative_path.clone(),
                target,
                error: format!("探测失败: {}", error),
            });
            return Ok(());
        }

        match action.disposition {
            Disposition::UpToDate if !self.policy.force_upload => {
                debug!("跳过未变化文件: {}", target);
                self.pending.push_back(ExecutionEvent::Skipped {
                    target,
                    reason: SkipReason::UpToDate,
                });
                return Ok(());
            }
            Disposition::Changed | Disposition::Conflict if !self.policy.force_upload => {
                let request = ConfirmRequest {
                    target: target.clone(),
                    local_modified_time: source.modified_time,
                    remote_modified_time: action.remote_modified_time,
                    disposition: action.disposition,
                };
                if !self.gate.allow(&request) {
                    debug!("不覆盖: {}", target);
                    self.pending.push_back(ExecutionEvent::Skipped {
                        target,
                        reason: SkipReason::Declined,
                    });
                    return Ok(());
                }
            }
            _ => {}
        }

        let transport = self.prober.transport().clone();
        let io_timeout = self.policy.io_timeout;
        let mut attempt = 0;
        let result = loop {
            let upload = transport.upload(&source.absolute_path, &target);
            let outcome = match tokio::time::timeout(io_timeout, upload).await {
                Ok(r) => r,
                Err(_) => Err(TransportError::Timeout {
                    op: format!("上传 {}", target),
                    secs: io_timeout.as_secs(),
                }),
            };
            match outcome {
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    self.backoff(&target, attempt, &e).await;
                    attempt += 1;
                }
                other => break other,
            }
        };

        match result {
            Ok(bytes) => {
                info!("已上传 {} -> {} ({} 字节)", source.relative_path, target, bytes);
                self.pending.push_back(ExecutionEvent::Uploaded {
                    source: source.relative_path.clone(),
                    target: target.clone(),
                    bytes,
                    disposition: action.disposition,
                });
                self.fix_ownership(&target).await;
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("上传失败 {}: {}", target, e);
                self.pending.push_back(ExecutionEvent::FailedFile {
                    source: source.relative_path.clone(),
                    target,
                    error: e.to_string(),
                });
                Ok(())
            }
        }
    }

    /// 属主修正，失败只记录事件
    async fn fix_ownership(&mut self, path: &str) {
        let Some(owner) = self.policy.ownership.as_deref() else {
            return;
        };

        let transport = self.prober.transport().clone();
        let command = ownership_command(
            owner,
            &transport.command_path(path),
            self.policy.chown_with_sudo,
        );
        debug!("属主修正: {}", command);

        let error = match tokio::time::timeout(self.policy.op_timeout, transport.run_command(&command))
            .await
        {
            Ok(Ok(0)) => return,
            Ok(Ok(code)) => format!("chown 退出码 {}", code),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("chown 超时 ({}s)", self.policy.op_timeout.as_secs()),
        };

        warn!("属主修正失败 {}: {}", path, error);
        self.pending.push_back(ExecutionEvent::OwnershipFailed {
            path: path.to_string(),
            error,
        });
    }

    /// 指数退避
    fn backoff(&self, path: &str, attempt: u32, e: &TransportError) -> tokio::time::Sleep {
        let delay = self.policy.retry_base_delay_ms * 2_u64.pow(attempt);
        warn!(
            "操作失败，{}ms 后重试 ({}/{}) {}: {}",
            delay,
            attempt + 1,
            self.policy.max_retries,
            path,
            e
        );
        tokio::time::sleep(Duration::from_millis(delay))
    }
}
