use sftpsync_lib::core::{
    AlwaysOverwrite, ExecutionEvent, FileScanner, RemoteProber, RunControl, RunState, SyncPlanner,
    SyncRun,
};
use sftpsync_lib::transport::{LocalTransport, MemoryTransport, Transport};
use sftpsync_lib::{SyncEngine, SyncJob, TransportError};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

fn write_tree(root: &Path) {
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("a.txt"), "alpha").unwrap();
    fs::write(root.join("sub/b.txt"), "beta").unwrap();
}

fn set_mtime(path: &Path, secs: i64) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs as u64))
        .unwrap();
}

fn job(local: &Path, remote: &str) -> SyncJob {
    let mut job = SyncJob::new(local, remote);
    job.policy.retry_base_delay_ms = 1;
    job
}

#[tokio::test]
async fn uploads_new_tree_into_existing_root() {
    let local = tempfile::tempdir().unwrap();
    write_tree(local.path());
    let remote = Arc::new(MemoryTransport::new().with_dir("/www/site"));

    let engine = SyncEngine::new(remote.clone());
    let report = engine
        .run_sync(
            &job(local.path(), "/www/site"),
            Box::new(AlwaysOverwrite),
            RunControl::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.files_scanned, 2);
    assert_eq!(report.files_uploaded, 2);
    assert_eq!(report.directories_created, 1);
    assert_eq!(report.bytes_transferred, 9);
    assert!(!report.has_failures());

    assert_eq!(remote.mkdirs(), vec!["/www/site/sub"]);
    assert_eq!(
        remote.uploads(),
        vec!["/www/site/a.txt", "/www/site/sub/b.txt"]
    );
    assert!(remote.commands().is_empty());
}

#[tokio::test]
async fn second_run_against_mounted_remote_is_a_noop() {
    let local = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    write_tree(local.path());

    let remote: Arc<dyn Transport> =
        Arc::new(LocalTransport::new(&mount.path().to_string_lossy()).unwrap());
    let engine = SyncEngine::new(remote);

    let first = engine
        .run_sync(
            &job(local.path(), "/site"),
            Box::new(AlwaysOverwrite),
            RunControl::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(first.files_uploaded, 2);
    assert_eq!(first.directories_created, 2);
    assert_eq!(
        fs::read_to_string(mount.path().join("site/sub/b.txt")).unwrap(),
        "beta"
    );

    let second = engine
        .run_sync(
            &job(local.path(), "/site"),
            Box::new(AlwaysOverwrite),
            RunControl::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(second.state, RunState::Completed);
    assert_eq!(second.files_uploaded, 0);
    assert_eq!(second.files_skipped, 2);
    assert_eq!(second.directories_created, 0);
}

#[tokio::test]
async fn equal_timestamps_are_up_to_date() {
    let local = tempfile::tempdir().unwrap();
    fs::write(local.path().join("same.txt"), "same").unwrap();
    fs::write(local.path().join("newer.txt"), "newer").unwrap();
    set_mtime(&local.path().join("same.txt"), 1_700_000_000);
    set_mtime(&local.path().join("newer.txt"), 1_700_000_000);

    let remote = Arc::new(
        MemoryTransport::new()
            .with_file("/r/same.txt", 4, 1_700_000_000)
            .with_file("/r/newer.txt", 5, 1_699_999_999),
    );
    let engine = SyncEngine::new(remote.clone());
    let report = engine
        .run_sync(
            &job(local.path(), "/r"),
            Box::new(AlwaysOverwrite),
            RunControl::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.files_uploaded, 1);
    assert_eq!(report.files_skipped, 1);
    assert_eq!(remote.uploads(), vec!["/r/newer.txt"]);
}

#[tokio::test]
async fn failed_directory_only_affects_its_subtree() {
    let local = tempfile::tempdir().unwrap();
    write_tree(local.path());
    let remote = Arc::new(
        MemoryTransport::new()
            .with_dir("/www/site")
            .fail_mkdir("/www/site/sub"),
    );

    let report = SyncEngine::new(remote.clone())
        .run_sync(
            &job(local.path(), "/www/site"),
            Box::new(AlwaysOverwrite),
            RunControl::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.directories_failed, 1);
    assert_eq!(report.files_failed, 1);
    assert_eq!(report.files_uploaded, 1);
    assert!(report.has_failures());
    assert_eq!(remote.uploads(), vec!["/www/site/a.txt"]);
}

#[tokio::test]
async fn unreadable_remote_file_fails_alone() {
    let local = tempfile::tempdir().unwrap();
    fs::write(local.path().join("a.txt"), "alpha").unwrap();
    fs::write(local.path().join("b.txt"), "beta").unwrap();
    let remote = Arc::new(
        MemoryTransport::new()
            .with_dir("/www/site")
            .fail_stat(
                "/www/site/a.txt",
                TransportError::PermissionDenied("/www/site/a.txt".to_string()),
            ),
    );

    let report = SyncEngine::new(remote.clone())
        .run_sync(
            &job(local.path(), "/www/site"),
            Box::new(AlwaysOverwrite),
            RunControl::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.files_failed, 1);
    assert_eq!(report.files_uploaded, 1);
    assert_eq!(remote.uploads(), vec!["/www/site/b.txt"]);
}

#[tokio::test]
async fn lost_connection_fails_the_run() {
    let local = tempfile::tempdir().unwrap();
    write_tree(local.path());
    let remote = Arc::new(
        MemoryTransport::new()
            .with_dir("/www/site/sub")
            .disconnect_after(1),
    );

    let report = SyncEngine::new(remote.clone())
        .run_sync(
            &job(local.path(), "/www/site"),
            Box::new(AlwaysOverwrite),
            RunControl::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.files_uploaded, 1);
    assert!(!report.errors.is_empty());
}

#[tokio::test]
async fn stop_takes_effect_at_action_boundary() {
    let local = tempfile::tempdir().unwrap();
    write_tree(local.path());
    let remote = Arc::new(MemoryTransport::new().with_dir("/www/site"));

    let scan = FileScanner::new().scan(local.path()).unwrap();
    let mut prober = RemoteProber::new(remote.clone());
    let plan = SyncPlanner::new()
        .plan(&scan.entries, "/www/site", &mut prober)
        .await
        .unwrap();
    assert_eq!(plan.len(), 3);

    let control = RunControl::new();
    let mut run = SyncRun::new(
        plan,
        prober,
        Default::default(),
        Box::new(AlwaysOverwrite),
        control.clone(),
    )
    .unwrap();

    let first = run.next_event().await.unwrap();
    assert_eq!(
        first,
        ExecutionEvent::DirectoryEnsured {
            path: "/www/site/sub".to_string()
        }
    );

    control.stop();
    let rest = run.run_to_end().await;
    assert_eq!(rest, vec![ExecutionEvent::Stopped { remaining: 2 }]);
    assert_eq!(run.state(), RunState::Stopped);
    assert!(remote.uploads().is_empty());
}

#[tokio::test]
async fn preview_leaves_remote_untouched() {
    let local = tempfile::tempdir().unwrap();
    write_tree(local.path());
    let remote = Arc::new(MemoryTransport::new().with_file("/www/site/a.txt", 5, 4_000_000_000));

    let (scan, plan) = SyncEngine::new(remote.clone())
        .preview(&job(local.path(), "/www/site"))
        .await
        .unwrap();

    assert_eq!(scan.entries.len(), 2);
    let summary = plan.summary();
    assert_eq!(summary.directories, 1);
    assert_eq!(summary.new_files, 1);
    assert_eq!(summary.up_to_date_files, 1);
    assert!(remote.mkdirs().is_empty());
    assert!(remote.uploads().is_empty());

    // 预览之后真正执行，未变化的文件被跳过
    let report = SyncEngine::new(remote.clone())
        .run_sync(
            &job(local.path(), "/www/site"),
            Box::new(AlwaysOverwrite),
            RunControl::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(report.files_skipped, 1);
    assert_eq!(remote.uploads(), vec!["/www/site/sub/b.txt"]);
}
