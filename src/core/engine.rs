use crate::core::conflict::ConfirmationCallback;
use crate::core::control::{RunControl, RunState};
use crate::core::executor::{ExecutionEvent, ExecutionPolicy, SyncRun};
use crate::core::planner::{CompareConfig, SyncPlanner, TransferPlan};
use crate::core::prober::RemoteProber;
use crate::core::scanner::{FileScanner, ScanConfig, ScanResult};
use crate::error::ScanError;
use crate::transport::Transport;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// 一次同步的输入
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub local_root: PathBuf,
    pub remote_root: String,
    pub scan: ScanConfig,
    pub compare: CompareConfig,
    pub policy: ExecutionPolicy,
}

impl SyncJob {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: &str) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root: remote_root.to_string(),
            scan: ScanConfig::default(),
            compare: CompareConfig::default(),
            policy: ExecutionPolicy::default(),
        }
    }
}

/// 同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Scanning,
    Planning,
    Transferring,
    Finished,
}

/// 进度
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub run_id: String,
    pub phase: SyncPhase,
    pub actions_total: usize,
    pub actions_done: usize,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    /// 最近一个执行事件
    pub event: Option<ExecutionEvent>,
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub state: RunState,
    pub files_scanned: usize,
    pub files_uploaded: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub directories_created: usize,
    pub directories_failed: usize,
    pub bytes_transferred: u64,
    /// 耗时（毫秒）
    pub duration: u64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn new(run_id: &str, start_time: i64) -> Self {
        Self {
            run_id: run_id.to_string(),
            start_time,
            end_time: start_time,
            state: RunState::Running,
            files_scanned: 0,
            files_uploaded: 0,
            files_skipped: 0,
            files_failed: 0,
            directories_created: 0,
            directories_failed: 0,
            bytes_transferred: 0,
            duration: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// 按事件累计统计
    pub fn record(&mut self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::DirectoryEnsured { .. } => self.directories_created += 1,
            ExecutionEvent::FailedDirectory { path, error } => {
                self.directories_failed += 1;
                self.errors.push(format!("{}: {}", path, error));
            }
            ExecutionEvent::Uploaded { bytes, .. } => {
                self.files_uploaded += 1;
                self.bytes_transferred += bytes;
            }
            ExecutionEvent::Skipped { .. } => self.files_skipped += 1,
            ExecutionEvent::FailedFile { target, error, .. } => {
                self.files_failed += 1;
                self.errors.push(format!("{}: {}", target, error));
            }
            ExecutionEvent::OwnershipFailed { path, error } => {
                self.warnings.push(format!("{}: {}", path, error));
            }
            ExecutionEvent::Stopped { .. } => {}
            ExecutionEvent::Aborted { error } => self.errors.push(error.clone()),
        }
    }

    fn finish(mut self, state: RunState, started: Instant) -> Self {
        self.state = state;
        self.end_time = chrono::Utc::now().timestamp();
        self.duration = started.elapsed().as_millis() as u64;
        self
    }

    /// 是否有任何失败
    pub fn has_failures(&self) -> bool {
        self.state == RunState::Failed || self.files_failed > 0 || self.directories_failed > 0
    }
}

/// 同步引擎：扫描 → 规划 → 执行
pub struct SyncEngine {
    transport: Arc<dyn Transport>,
}

impl SyncEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// 新的探测器，缓存只属于一次运行；超时与执行策略一致
    fn prober(&self, job: &SyncJob) -> RemoteProber {
        RemoteProber::new(self.transport.clone()).with_timeout(job.policy.op_timeout)
    }

    /// 在阻塞线程中扫描本地目录
    pub async fn scan(&self, job: &SyncJob, control: &RunControl) -> Result<ScanResult> {
        let scanner = FileScanner::with_config(job.scan.clone())?.with_cancel(control.cancel_flag());
        let root = job.local_root.clone();
        let result = tokio::task::spawn_blocking(move || scanner.scan(&root))
            .await
            .context("扫描任务执行失败")??;
        Ok(result)
    }

    /// 只规划不执行
    pub async fn preview(&self, job: &SyncJob) -> Result<(ScanResult, TransferPlan)> {
        let scan = self.scan(job, &RunControl::new()).await?;
        let mut prober = self.prober(job);
        let plan = SyncPlanner::with_config(job.compare.clone())
            .plan(&scan.entries, &job.remote_root, &mut prober)
            .await?;
        Ok((scan, plan))
    }

    /// 运行同步任务
    ///
    /// 扫描和规划失败得到 Failed 报告；只有调用方参数错误才返回 Err。
    pub async fn run_sync(
        &self,
        job: &SyncJob,
        confirm: Box<dyn ConfirmationCallback>,
        control: RunControl,
        progress_tx: Option<mpsc::Sender<SyncProgress>>,
    ) -> Result<SyncReport> {
        let started = Instant::now();
        let pending_id = uuid::Uuid::new_v4().to_string();
        let mut report = SyncReport::new(&pending_id, chrono::Utc::now().timestamp());

        info!(
            "开始同步: {:?} -> {} ({})",
            job.local_root,
            job.remote_root,
            self.transport.name()
        );

        // 扫描
        self.send_progress(&progress_tx, &report, SyncPhase::Scanning, 0, 0, 0, None)
            .await;
        let scan = match self.scan(job, &control).await {
            Ok(scan) => scan,
            Err(e) if control.is_stopped() => {
                info!("扫描期间停止: {}", e);
                return Ok(report.finish(RunState::Stopped, started));
            }
            Err(e) => {
                error!("扫描本地目录失败: {}", e);
                if e.downcast_ref::<ScanError>().is_none() {
                    return Err(e);
                }
                report.errors.push(format!("扫描失败: {}", e));
                return Ok(report.finish(RunState::Failed, started));
            }
        };
        report.files_scanned = scan.entries.len();
        report.warnings.extend(
            scan.warnings
                .iter()
                .map(|w| format!("{}: {}", w.path.display(), w.message)),
        );

        if control.is_stopped() {
            return Ok(report.finish(RunState::Stopped, started));
        }

        // 规划
        self.send_progress(&progress_tx, &report, SyncPhase::Planning, 0, 0, 0, None)
            .await;
        let mut prober = self.prober(job);
        let plan = match SyncPlanner::with_config(job.compare.clone())
            .plan(&scan.entries, &job.remote_root, &mut prober)
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                error!("规划失败: {}", e);
                report.errors.push(format!("远程状态探测失败: {}", e));
                return Ok(report.finish(RunState::Failed, started));
            }
        };

        if control.is_stopped() {
            return Ok(report.finish(RunState::Stopped, started));
        }

        // 执行
        let summary = plan.summary();
        let actions_total = plan.len();
        let mut run = SyncRun::new(plan, prober, job.policy.clone(), confirm, control)?;
        report.run_id = run.id().to_string();

        let mut actions_done = 0;
        self.send_progress(
            &progress_tx,
            &report,
            SyncPhase::Transferring,
            0,
            actions_total,
            summary.transfer_bytes,
            None,
        )
        .await;

        while let Some(event) = run.next_event().await {
            report.record(&event);
            if !matches!(
                event,
                ExecutionEvent::OwnershipFailed { .. }
                    | ExecutionEvent::Stopped { .. }
                    | ExecutionEvent::Aborted { .. }
            ) {
                actions_done += 1;
            }
            self.send_progress(
                &progress_tx,
                &report,
                SyncPhase::Transferring,
                actions_done,
                actions_total,
                summary.transfer_bytes,
                Some(event),
            )
            .await;
        }

        let report = report.finish(run.state(), started);
        self.send_progress(
            &progress_tx,
            &report,
            SyncPhase::Finished,
            actions_done,
            actions_total,
            summary.transfer_bytes,
            None,
        )
        .await;

        if report.has_failures() {
            warn!(
                "同步结束 ({}): {} 上传, {} 跳过, {} 失败",
                report.state, report.files_uploaded, report.files_skipped, report.files_failed
            );
        } else {
            info!(
                "同步结束 ({}): {} 上传, {} 跳过, 耗时 {}ms",
                report.state, report.files_uploaded, report.files_skipped, report.duration
            );
        }

        Ok(report)
    }

    /// 发送进度（接收端关闭时忽略）
    #[allow(clippy::too_many_arguments)]
    async fn send_progress(
        &self,
        progress_tx: &Option<mpsc::Sender<SyncProgress>>,
        report: &SyncReport,
        phase: SyncPhase,
        actions_done: usize,
        actions_total: usize,
        bytes_total: u64,
        event: Option<ExecutionEvent>,
    ) {
        if let Some(tx) = progress_tx {
            let _ = tx
                .send(SyncProgress {
                    run_id: report.run_id.clone(),
                    phase,
                    actions_total,
                    actions_done,
                    bytes_transferred: report.bytes_transferred,
                    bytes_total,
                    event,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conflict::AlwaysOverwrite;
    use crate::transport::MemoryTransport;
    use std::fs;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "aaaa").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), "bb").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_run_sync_report_and_progress() {
        let dir = project();
        let memory = Arc::new(MemoryTransport::new().with_dir("/www/site"));
        let engine = SyncEngine::new(memory.clone());
        let job = SyncJob::new(dir.path(), "/www/site");

        let (tx, mut rx) = mpsc::channel(64);
        let report = engine
            .run_sync(&job, Box::new(AlwaysOverwrite), RunControl::new(), Some(tx))
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.files_uploaded, 2);
        assert_eq!(report.directories_created, 1);
        assert_eq!(report.bytes_transferred, 6);
        assert!(!report.has_failures());

        let mut phases = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            phases.push(progress.phase);
        }
        assert_eq!(phases.first(), Some(&SyncPhase::Scanning));
        assert_eq!(phases.last(), Some(&SyncPhase::Finished));
    }

    #[tokio::test]
    async fn test_missing_local_root_fails_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryTransport::new());
        let engine = SyncEngine::new(memory.clone());
        let job = SyncJob::new(dir.path().join("missing"), "/www/site");

        let report = engine
            .run_sync(&job, Box::new(AlwaysOverwrite), RunControl::new(), None)
            .await
            .unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.errors.len(), 1);
        assert!(memory.stat_calls().is_empty());
    }

    #[tokio::test]
    async fn test_planning_uses_job_op_timeout() {
        struct StallingStat;

        #[async_trait::async_trait]
        impl Transport for StallingStat {
            async fn stat(
                &self,
                _path: &str,
            ) -> Result<Option<crate::transport::RemoteStat>, crate::error::TransportError>
            {
                futures::future::pending().await
            }
            async fn mkdir(&self, _path: &str) -> Result<(), crate::error::TransportError> {
                Ok(())
            }
            async fn upload(
                &self,
                _local: &std::path::Path,
                _remote: &str,
            ) -> Result<u64, crate::error::TransportError> {
                Ok(0)
            }
            async fn run_command(&self, _command: &str) -> Result<i32, crate::error::TransportError> {
                Ok(0)
            }
            async fn list_dir(
                &self,
                _path: &str,
            ) -> Result<Vec<crate::transport::RemoteEntry>, crate::error::TransportError> {
                Ok(Vec::new())
            }
            fn name(&self) -> &str {
                "stalling"
            }
        }

        let dir = project();
        let engine = SyncEngine::new(Arc::new(StallingStat));
        let mut job = SyncJob::new(dir.path(), "/www/site");
        job.policy.op_timeout = std::time::Duration::from_millis(20);

        let report = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            engine.run_sync(&job, Box::new(AlwaysOverwrite), RunControl::new(), None),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert!(report.errors[0].contains("超时"));
    }

    #[tokio::test]
    async fn test_probe_failure_fails_run() {
        let dir = project();
        let memory = Arc::new(MemoryTransport::new().fail_stat(
            "/www/site",
            crate::error::TransportError::PermissionDenied("/www/site".into()),
        ));
        let engine = SyncEngine::new(memory.clone());
        let job = SyncJob::new(dir.path(), "/www/site");

        let report = engine
            .run_sync(&job, Box::new(AlwaysOverwrite), RunControl::new(), None)
            .await
            .unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert!(memory.mkdirs().is_empty());
        assert!(memory.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_preview_has_no_side_effects() {
        let dir = project();
        let memory = Arc::new(MemoryTransport::new().with_dir("/www"));
        let engine = SyncEngine::new(memory.clone());
        let job = SyncJob::new(dir.path(), "/www/site");

        let (scan, plan) = engine.preview(&job).await.unwrap();
        assert_eq!(scan.entries.len(), 2);
        assert_eq!(plan.summary().directories, 2);
        assert_eq!(plan.summary().new_files, 2);
        assert!(memory.mkdirs().is_empty());
    }

    #[tokio::test]
    async fn test_stopped_before_start() {
        let dir = project();
        let memory = Arc::new(MemoryTransport::new().with_dir("/www/site"));
        let engine = SyncEngine::new(memory.clone());
        let job = SyncJob::new(dir.path(), "/www/site");
        let control = RunControl::new();
        control.stop();

        let report = engine
            .run_sync(&job, Box::new(AlwaysOverwrite), control, None)
            .await
            .unwrap();
        assert_eq!(report.state, RunState::Stopped);
        assert!(memory.uploads().is_empty());
    }

    #[test]
    fn test_report_record() {
        let mut report = SyncReport::new("r", 0);
        report.record(&ExecutionEvent::Uploaded {
            source: "a".into(),
            target: "/a".into(),
            bytes: 10,
            disposition: crate::core::planner::Disposition::New,
        });
        report.record(&ExecutionEvent::FailedFile {
            source: "b".into(),
            target: "/b".into(),
            error: "权限不足".into(),
        });
        report.record(&ExecutionEvent::OwnershipFailed {
            path: "/a".into(),
            error: "exit 1".into(),
        });
        assert_eq!(report.files_uploaded, 1);
        assert_eq!(report.files_failed, 1);
        assert_eq!(report.bytes_transferred, 10);
        assert_eq!(report.errors, vec!["/b: 权限不足".to_string()]);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.has_failures());
    }
}
