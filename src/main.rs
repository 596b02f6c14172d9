use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use sftpsync_lib::config::{
    AuthMethod, AutoUploadSettings, CredentialSource, ServerConfig, ServerStore, SyncSettings,
    DEFAULT_OWNERSHIP,
};
use sftpsync_lib::core::{
    ComparePolicy, ConfirmRequest, ConfirmationCallback, Decision, ExecutionEvent,
    ExecutionPolicy, NodeKind, OverwriteMode, RemoteProber, RunControl, RunState, SyncPhase,
    SyncProgress,
};
use sftpsync_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use sftpsync_lib::transport::{create_transport, Transport};
use sftpsync_lib::{dirs, watch, SyncEngine, SyncJob, SyncReport};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(
    name = "sftpsync",
    version,
    about = "Upload a project directory to a remote server over SFTP, only sending what changed"
)]
struct Cli {
    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,
    /// 只输出错误
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 上传项目目录
    Upload(UploadArgs),
    /// 按项目设置执行一次自动上传
    Auto(ProjectArgs),
    /// 监听项目目录，变化后自动上传
    Watch(WatchArgs),
    /// 查看或修改项目的自动上传设置
    Settings(SettingsArgs),
    /// 浏览远程目录
    Ls(LsArgs),
    /// 管理服务器
    #[command(subcommand)]
    Servers(ServersCommand),
}

#[derive(Args)]
struct ProjectArgs {
    /// 项目目录，默认当前目录
    #[arg(long, default_value = ".")]
    project: PathBuf,
}

#[derive(Args)]
struct UploadArgs {
    #[arg(long)]
    server: String,
    /// 远程目标目录
    #[arg(long)]
    remote: String,
    #[arg(long, default_value = ".")]
    project: PathBuf,
    /// 上传后修正属主（user[:group]），传空字符串关闭
    #[arg(long, default_value = DEFAULT_OWNERSHIP)]
    ownership: String,
    /// 忽略修改时间，上传所有文件
    #[arg(long)]
    force: bool,
    /// 不确认，直接覆盖
    #[arg(short = 'y', long)]
    yes: bool,
    /// 只显示计划
    #[arg(long)]
    dry_run: bool,
    /// 远程较旧的文件也需要确认
    #[arg(long)]
    remote_wins: bool,
    /// 修改时间容差（秒）
    #[arg(long, default_value_t = 0)]
    tolerance: i64,
}

#[derive(Args)]
struct WatchArgs {
    #[arg(long, default_value = ".")]
    project: PathBuf,
    /// 防抖间隔（毫秒）
    #[arg(long, default_value_t = 2000)]
    debounce_ms: u64,
}

#[derive(Args)]
struct SettingsArgs {
    #[arg(long, default_value = ".")]
    project: PathBuf,
    #[arg(long, conflicts_with = "disable")]
    enable: bool,
    #[arg(long)]
    disable: bool,
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    remote: Option<String>,
    #[arg(long)]
    ownership: Option<String>,
}

#[derive(Args)]
struct LsArgs {
    #[arg(long)]
    server: String,
    #[arg(default_value = "/")]
    path: String,
}

#[derive(Subcommand)]
enum ServersCommand {
    /// 列出已保存的服务器
    List,
    /// 添加或替换服务器
    Add(ServerAddArgs),
    /// 删除服务器
    Remove { name: String },
    /// 测试连接
    Test { name: String },
}

#[derive(Args)]
struct ServerAddArgs {
    name: String,
    #[arg(long)]
    host: String,
    #[arg(long, default_value_t = 22)]
    port: u16,
    #[arg(long)]
    username: String,
    /// 密码或密钥口令
    #[arg(long, env = "SFTPSYNC_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// 私钥路径，指定后使用密钥认证
    #[arg(long)]
    key: Option<String>,
    /// 使用 ssh-agent
    #[arg(long, conflicts_with = "key")]
    agent: bool,
}

/// 初始化日志系统：文件按配置，终端按 -v / -q
fn init_logging(config_dir: &Path, verbose: bool, quiet: bool) {
    let console_level = if verbose {
        LevelFilter::DEBUG
    } else if quiet {
        LevelFilter::ERROR
    } else {
        LevelFilter::INFO
    };
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(console_level);

    let config = LogConfig::load(config_dir);
    let file_layer = if config.enabled {
        let mut env_filter = tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(config.tracing_level().into());
        if let Ok(directive) = "ssh2=warn".parse() {
            env_filter = env_filter.add_directive(directive);
        }
        match SizeRotatingWriter::new(&get_log_dir(config_dir), config.max_size_mb) {
            Ok(writer) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(env_filter),
            ),
            Err(e) => {
                eprintln!("无法创建日志文件: {}", e);
                None
            }
        }
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 在终端上询问是否覆盖
struct TerminalPrompt;

impl ConfirmationCallback for TerminalPrompt {
    fn decide(&mut self, request: &ConfirmRequest) -> Decision {
        let remote = request
            .remote_modified_time
            .map(format_time)
            .unwrap_or_else(|| "-".to_string());
        let question = format!(
            "远程文件 {} ({})\n  本地修改于 {}，远程修改于 {}\n覆盖? [y]是 [n]否 [a]全部覆盖 [s]跳过其余: ",
            request.target,
            request.disposition,
            format_time(request.local_modified_time),
            remote
        );

        // 回调在异步任务中同步调用
        tokio::task::block_in_place(|| {
            eprint!("{}", question);
            let _ = io::stderr().flush();
            let mut answer = String::new();
            match io::stdin().lock().read_line(&mut answer) {
                Ok(0) | Err(_) => Decision::Skip,
                Ok(_) => Decision::from(answer.as_str()),
            }
        })
    }
}

fn format_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| timestamp.to_string())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Ctrl-C 请求在动作边界处停止，再次 Ctrl-C 立即退出
fn stop_on_ctrl_c(control: RunControl) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断，当前动作完成后停止（再按一次立即退出）");
            control.stop();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

async fn connect(config_dir: &Path, server_name: &str) -> Result<Arc<dyn Transport>> {
    let server = ServerStore::load(config_dir)?.resolve(server_name)?;
    let op_timeout = Duration::from_secs(SyncSettings::load(config_dir).op_timeout_secs);
    let transport = create_transport(&server, op_timeout)
        .await
        .with_context(|| format!("连接服务器 {} 失败", server_name))?;
    Ok(transport)
}

/// 在终端打印进度，返回发送端和打印任务
fn progress_printer() -> (mpsc::Sender<SyncProgress>, tokio::task::JoinHandle<()>) {
    let (progress_tx, mut progress_rx) = mpsc::channel::<SyncProgress>(64);
    let printer = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            match (&progress.phase, &progress.event) {
                (SyncPhase::Scanning, None) => info!("扫描本地目录..."),
                (SyncPhase::Planning, None) => info!("检查远程状态..."),
                (SyncPhase::Transferring, None) => info!(
                    "共 {} 项，待传输 {}",
                    progress.actions_total,
                    format_bytes(progress.bytes_total)
                ),
                (_, Some(event)) => print_event(event),
                _ => {}
            }
        }
    });
    (progress_tx, printer)
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::DirectoryEnsured { path } => println!("  mkdir   {}", path),
        ExecutionEvent::FailedDirectory { path, error } => {
            println!("  FAILED  {}/ ({})", path, error)
        }
        ExecutionEvent::Uploaded {
            target,
            bytes,
            disposition,
            ..
        } => println!("  upload  {} [{}, {}]", target, disposition, format_bytes(*bytes)),
        ExecutionEvent::Skipped { target, reason } => {
            println!("  skip    {} ({:?})", target, reason)
        }
        ExecutionEvent::FailedFile { target, error, .. } => {
            println!("  FAILED  {} ({})", target, error)
        }
        ExecutionEvent::OwnershipFailed { path, error } => {
            println!("  chown   {} 失败 ({})", path, error)
        }
        ExecutionEvent::Stopped { remaining } => println!("已停止，剩余 {} 项未执行", remaining),
        ExecutionEvent::Aborted { error } => println!("连接中断: {}", error),
    }
}

fn print_report(report: &SyncReport) {
    println!(
        "{}: {} 上传, {} 跳过, {} 失败, {} 个目录已创建, {} 个目录失败, {}, 耗时 {:.1}s",
        report.state,
        report.files_uploaded,
        report.files_skipped,
        report.files_failed,
        report.directories_created,
        report.directories_failed,
        format_bytes(report.bytes_transferred),
        report.duration as f64 / 1000.0
    );
    for warning in &report.warnings {
        println!("  警告: {}", warning);
    }
    for error in &report.errors {
        println!("  错误: {}", error);
    }
}

fn exit_code(report: &SyncReport) -> i32 {
    match report.state {
        RunState::Stopped => 130,
        _ if report.has_failures() => 1,
        _ => 0,
    }
}

async fn handle_upload(config_dir: &Path, args: UploadArgs) -> Result<i32> {
    let sync = SyncSettings::load(config_dir);
    let transport = connect(config_dir, &args.server).await?;
    let engine = SyncEngine::new(transport);

    let mut job = SyncJob::new(args.project.clone(), &args.remote);
    job.scan.exclude_patterns = sync.exclude_patterns.clone();
    job.compare.time_tolerance_seconds = args.tolerance;
    if args.remote_wins {
        job.compare.policy = ComparePolicy::RemoteWins;
    }
    job.policy = ExecutionPolicy::from_settings(&sync)
        .with_ownership(args.ownership.trim());
    job.policy.force_upload = args.force;
    job.policy.overwrite = if args.yes {
        OverwriteMode::Always
    } else {
        OverwriteMode::Ask
    };

    if args.dry_run {
        let (scan, plan) = engine.preview(&job).await?;
        for action in &plan.actions {
            if action.is_directory() {
                println!("  mkdir   {}", action.target);
            } else {
                println!("  {:<7} {}", action.disposition.to_string(), action.target);
            }
        }
        let summary = plan.summary();
        println!(
            "{} 个文件: {} 新增, {} 修改, {} 未变, {} 冲突; {} 个目录待创建, 共 {}",
            scan.entries.len(),
            summary.new_files,
            summary.changed_files,
            summary.up_to_date_files,
            summary.conflict_files,
            summary.directories,
            format_bytes(summary.transfer_bytes)
        );
        return Ok(0);
    }

    let control = RunControl::new();
    stop_on_ctrl_c(control.clone());

    let (progress_tx, printer) = progress_printer();
    let report = engine
        .run_sync(&job, Box::new(TerminalPrompt), control, Some(progress_tx))
        .await?;
    let _ = printer.await;

    print_report(&report);
    Ok(exit_code(&report))
}

async fn handle_auto(config_dir: &Path, args: ProjectArgs) -> Result<i32> {
    let control = RunControl::new();
    stop_on_ctrl_c(control.clone());
    let (progress_tx, printer) = progress_printer();
    let report = watch::auto_upload(config_dir, &args.project, control, Some(progress_tx)).await?;
    let _ = printer.await;
    match report {
        Some(report) => {
            print_report(&report);
            Ok(exit_code(&report))
        }
        None => {
            println!("该项目未启用自动上传");
            Ok(0)
        }
    }
}

async fn handle_watch(config_dir: &Path, args: WatchArgs) -> Result<i32> {
    let settings = AutoUploadSettings::load(config_dir, &args.project);
    if !settings.enabled {
        bail!("该项目未启用自动上传，先运行 `sftpsync settings --enable`");
    }
    settings.validate()?;

    let control = RunControl::new();
    stop_on_ctrl_c(control.clone());
    watch::watch_project(
        config_dir.to_path_buf(),
        args.project,
        Duration::from_millis(args.debounce_ms),
        control,
    )
    .await?;
    Ok(0)
}

fn handle_settings(config_dir: &Path, args: SettingsArgs) -> Result<i32> {
    let mut settings = AutoUploadSettings::load(config_dir, &args.project);
    let changed = args.enable
        || args.disable
        || args.server.is_some()
        || args.remote.is_some()
        || args.ownership.is_some();

    if args.enable {
        settings.enabled = true;
    }
    if args.disable {
        settings.enabled = false;
    }
    if let Some(server) = args.server {
        settings.server_name = server;
    }
    if let Some(remote) = args.remote {
        settings.remote_path = remote;
    }
    if let Some(ownership) = args.ownership {
        settings.ownership = ownership.trim().to_string();
    }

    if changed {
        settings.validate()?;
        if settings.enabled {
            ServerStore::load(config_dir)?.resolve(&settings.server_name)?;
        }
        settings.save(config_dir, &args.project)?;
    }

    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(0)
}

async fn handle_ls(config_dir: &Path, args: LsArgs) -> Result<i32> {
    let transport = connect(config_dir, &args.server).await?;
    let mut prober = RemoteProber::new(transport);
    for node in prober.list(&args.path).await? {
        match node.kind {
            NodeKind::Directory => println!("{}/", node.path),
            _ => println!(
                "{}  {}  {}",
                node.path,
                node.size.map(format_bytes).unwrap_or_default(),
                node.modified_time.map(format_time).unwrap_or_default()
            ),
        }
    }
    Ok(0)
}

async fn handle_servers(config_dir: &Path, command: ServersCommand) -> Result<i32> {
    match command {
        ServersCommand::List => {
            let store = ServerStore::load(config_dir)?;
            for name in store.names() {
                if let Some(server) = store.get(name) {
                    println!(
                        "{}  {}@{}:{} ({:?})",
                        name, server.username, server.host, server.port, server.auth_method
                    );
                }
            }
        }
        ServersCommand::Add(args) => {
            let auth_method = if args.agent {
                AuthMethod::Agent
            } else if args.key.is_some() {
                AuthMethod::Key
            } else {
                AuthMethod::Password
            };
            let mut store = ServerStore::load(config_dir)?;
            store.insert(
                &args.name,
                ServerConfig {
                    host: args.host,
                    port: args.port,
                    username: args.username,
                    password: args.password,
                    auth_method,
                    key_path: args.key,
                },
            )?;
            store.save()?;
            println!("已保存服务器 {}", args.name);
        }
        ServersCommand::Remove { name } => {
            let mut store = ServerStore::load(config_dir)?;
            if store.remove(&name).is_none() {
                bail!("服务器不存在: {}", name);
            }
            store.save()?;
            println!("已删除服务器 {}", name);
        }
        ServersCommand::Test { name } => {
            let transport = connect(config_dir, &name).await?;
            let mut prober = RemoteProber::new(transport.clone());
            let root = prober.probe("/").await?;
            println!("连接成功: {} ({:?})", transport.name(), root.kind);
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_dir = dirs::app_config_dir();
    init_logging(&config_dir, cli.verbose, cli.quiet);

    let result = match cli.command {
        Command::Upload(args) => handle_upload(&config_dir, args).await,
        Command::Auto(args) => handle_auto(&config_dir, args).await,
        Command::Watch(args) => handle_watch(&config_dir, args).await,
        Command::Settings(args) => handle_settings(&config_dir, args),
        Command::Ls(args) => handle_ls(&config_dir, args).await,
        Command::Servers(command) => handle_servers(&config_dir, command).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
