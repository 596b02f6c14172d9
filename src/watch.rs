//! 自动上传
//!
//! 项目保存后按持久化的设置上传新增和修改过的文件；`watch_project`
//! 监听项目目录，变化平息后触发一次自动上传。

use crate::config::{AutoUploadSettings, CredentialSource, ServerStore, SyncSettings};
use crate::core::conflict::{AlwaysOverwrite, OverwriteMode};
use crate::core::control::RunControl;
use crate::core::engine::{SyncEngine, SyncJob, SyncProgress, SyncReport};
use crate::core::executor::ExecutionPolicy;
use crate::core::planner::CompareConfig;
use crate::core::scanner::ScanConfig;
use crate::transport::create_transport;
use anyhow::{Context, Result};
use notify::{recommended_watcher, EventKind, RecursiveMode, Watcher};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 默认的防抖间隔
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// 停止检查间隔
const STOP_POLL: Duration = Duration::from_millis(500);

/// 按项目设置构造同步任务（无人值守：只传新增和修改的文件，不确认）
pub fn auto_upload_job(
    project_dir: &Path,
    settings: &AutoUploadSettings,
    sync: &SyncSettings,
) -> SyncJob {
    let mut policy = ExecutionPolicy::from_settings(sync).with_ownership(&settings.ownership);
    policy.overwrite = OverwriteMode::Always;

    SyncJob {
        local_root: project_dir.to_path_buf(),
        remote_root: settings.remote_path.clone(),
        scan: ScanConfig {
            exclude_patterns: sync.exclude_patterns.clone(),
            ..Default::default()
        },
        compare: CompareConfig::default(),
        policy,
    }
}

/// 执行一次自动上传，项目未启用时返回 None
pub async fn auto_upload(
    config_dir: &Path,
    project_dir: &Path,
    control: RunControl,
    progress_tx: Option<mpsc::Sender<SyncProgress>>,
) -> Result<Option<SyncReport>> {
    let settings = AutoUploadSettings::load(config_dir, project_dir);
    if !settings.enabled {
        debug!("项目未启用自动上传: {:?}", project_dir);
        return Ok(None);
    }
    settings.validate()?;

    let server = ServerStore::load(config_dir)?.resolve(&settings.server_name)?;
    let sync = SyncSettings::load(config_dir);
    let transport = create_transport(&server, Duration::from_secs(sync.op_timeout_secs))
        .await
        .with_context(|| format!("连接服务器 {} 失败", settings.server_name))?;

    info!(
        "自动上传 {:?} -> {}:{}",
        project_dir, settings.server_name, settings.remote_path
    );
    let engine = SyncEngine::new(transport);
    let job = auto_upload_job(project_dir, &settings, &sync);
    let report = engine
        .run_sync(&job, Box::new(AlwaysOverwrite), control, progress_tx)
        .await?;
    Ok(Some(report))
}

/// 是否值得触发上传
fn is_relevant(event: &notify::Event) -> bool {
    if matches!(event.kind, EventKind::Access(_) | EventKind::Other) {
        return false;
    }
    // 编辑器的临时文件和锁文件
    event.paths.iter().any(|p| {
        let name = p
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        !(name.ends_with('~')
            || name.starts_with(".#")
            || name.ends_with(".swp")
            || name.ends_with(".qgs.lock")
            || name.ends_with(".part"))
    })
}

/// 合并连续的变化：收到变化后等待 `debounce` 内无新变化再触发
///
/// 停止后返回触发次数。
pub async fn debounce_changes<F, Fut>(
    mut rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    control: RunControl,
    mut on_change: F,
) -> usize
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut triggered = 0;

    loop {
        // 等待第一个变化
        match tokio::time::timeout(STOP_POLL, rx.recv()).await {
            Ok(Some(())) => {}
            Ok(None) => return triggered,
            Err(_) => {
                if control.is_stopped() {
                    return triggered;
                }
                continue;
            }
        }

        // 等待变化平息
        let mut closed = false;
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        if control.is_stopped() {
            return triggered;
        }
        on_change().await;
        triggered += 1;

        if closed {
            return triggered;
        }
    }
}

/// 监听项目目录，变化后自动上传，直到 `control` 被停止
pub async fn watch_project(
    config_dir: PathBuf,
    project_dir: PathBuf,
    debounce: Duration,
    control: RunControl,
) -> Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) if is_relevant(&event) => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!("监听错误: {}", e),
        }
    })
    .context("创建目录监听失败")?;
    watcher
        .watch(&project_dir, RecursiveMode::Recursive)
        .with_context(|| format!("监听 {:?} 失败", project_dir))?;

    info!("开始监听 {:?}", project_dir);

    let count = debounce_changes(rx, debounce, control.clone(), || {
        let config_dir = config_dir.clone();
        let project_dir = project_dir.clone();
        // 上传共用监听的控制句柄，停止请求在下一个动作边界生效
        let control = control.clone();
        async move {
            if control.is_stopped() {
                return;
            }
            match auto_upload(&config_dir, &project_dir, control, None).await {
                Ok(Some(report)) => info!(
                    "自动上传完成 ({}): {} 上传, {} 跳过, {} 失败",
                    report.state, report.files_uploaded, report.files_skipped, report.files_failed
                ),
                Ok(None) => info!("自动上传未启用，忽略变化"),
                Err(e) => warn!("自动上传失败: {:#}", e),
            }
        }
    })
    .await;

    info!("停止监听 {:?}，共触发 {} 次上传", project_dir, count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMethod, ServerConfig};
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(kind: EventKind, path: &str) -> notify::Event {
        notify::Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_is_relevant() {
        assert!(is_relevant(&event(
            EventKind::Modify(ModifyKind::Any),
            "/p/map.qgs"
        )));
        assert!(is_relevant(&event(
            EventKind::Create(CreateKind::File),
            "/p/data/layer.gpkg"
        )));
        assert!(!is_relevant(&event(
            EventKind::Access(AccessKind::Any),
            "/p/map.qgs"
        )));
        assert!(!is_relevant(&event(
            EventKind::Modify(ModifyKind::Any),
            "/p/map.qgs~"
        )));
    }

    #[tokio::test]
    async fn test_debounce_merges_bursts() {
        let (tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        for _ in 0..5 {
            tx.send(()).unwrap();
        }
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send(()).unwrap();
            tx.send(()).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(tx);
        });

        let triggered = debounce_changes(rx, Duration::from_millis(50), RunControl::new(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        sender.await.unwrap();

        assert_eq!(triggered, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_debounce_returns_on_stop() {
        let (_tx, rx) = mpsc::unbounded_channel::<()>();
        let control = RunControl::new();
        control.stop();

        let triggered = tokio::time::timeout(
            Duration::from_secs(2),
            debounce_changes(rx, Duration::from_millis(10), control, || async {}),
        )
        .await
        .unwrap();
        assert_eq!(triggered, 0);
    }

    #[tokio::test]
    async fn test_auto_upload_disabled_is_noop() {
        let config = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let report = auto_upload(config.path(), project.path(), RunControl::new(), None)
            .await
            .unwrap();
        assert!(report.is_none());
    }

    /// 登记指向本地挂载目录的服务器，并为项目启用自动上传到 /site
    fn enable_mount(config: &Path, project: &Path, remote: &Path) {
        let mut store = ServerStore::load(config).unwrap();
        store
            .insert(
                "mount",
                ServerConfig {
                    host: format!("local:{}", remote.display()),
                    port: 22,
                    username: "me".to_string(),
                    password: None,
                    auth_method: AuthMethod::Password,
                    key_path: None,
                },
            )
            .unwrap();
        store.save().unwrap();

        AutoUploadSettings {
            enabled: true,
            server_name: "mount".to_string(),
            remote_path: "/site".to_string(),
            ownership: String::new(),
        }
        .save(config, project)
        .unwrap();
    }

    #[tokio::test]
    async fn test_auto_upload_to_local_mount() {
        let config = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("map.qgs"), "<qgis/>").unwrap();
        enable_mount(config.path(), project.path(), remote.path());

        let report = auto_upload(config.path(), project.path(), RunControl::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.files_uploaded, 1);
        assert_eq!(report.directories_created, 1);
        assert!(remote.path().join("site/map.qgs").is_file());

        // 第二次只剩未变化的文件
        let report = auto_upload(config.path(), project.path(), RunControl::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.files_uploaded, 0);
        assert_eq!(report.files_skipped, 1);
    }

    #[tokio::test]
    async fn test_stop_reaches_running_auto_upload() {
        let config = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(project.path().join(format!("layer{}.gpkg", i)), "data").unwrap();
        }
        enable_mount(config.path(), project.path(), remote.path());

        // 与监听循环共用同一个控制句柄
        let control = RunControl::new();
        let (progress_tx, mut progress_rx) = mpsc::channel::<SyncProgress>(1);
        let upload = {
            let config = config.path().to_path_buf();
            let project = project.path().to_path_buf();
            let control = control.clone();
            tokio::spawn(async move {
                auto_upload(&config, &project, control, Some(progress_tx)).await
            })
        };

        // 第一个执行事件之后按下停止
        while let Some(progress) = progress_rx.recv().await {
            if progress.event.is_some() && !control.is_stopped() {
                control.stop();
            }
        }

        let report = upload.await.unwrap().unwrap().unwrap();
        assert_eq!(report.state, crate::core::control::RunState::Stopped);
        assert!(report.files_uploaded < 5);
    }
}
