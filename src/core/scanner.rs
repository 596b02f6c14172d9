use crate::error::ScanError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 扫描到的本地文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// 相对扫描根的路径，统一使用 /
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
    /// 修改时间（Unix 秒，舍弃亚秒部分）
    pub modified_time: i64,
}

/// 扫描警告（单个文件不可读，不中断扫描）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub message: String,
}

/// 扫描结果
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub entries: Vec<FileEntry>,
    pub warnings: Vec<ScanWarning>,
    pub excluded: usize,
}

impl ScanResult {
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// 文件扫描器配置
#[derive(Debug, Clone, Default)]
pub struct ScanConfig {
    /// 排除规则（glob patterns）
    pub exclude_patterns: Vec<String>,
    /// 最大文件大小（0 表示不限制）
    pub max_file_size: u64,
    /// 仅包含的扩展名（空表示不限制）
    pub include_extensions: Vec<String>,
}

/// 文件扫描器
pub struct FileScanner {
    config: ScanConfig,
    /// 预编译的排除规则
    patterns: Vec<Pattern>,
    cancel_flag: Option<Arc<AtomicBool>>,
}

#[derive(Debug)]
enum Pattern {
    /// 含 ** 的前缀/后缀规则
    Recursive { prefix: String, suffix: String },
    Glob(regex::Regex),
    Exact(String),
}

impl FileScanner {
    pub fn new() -> Self {
        Self {
            config: ScanConfig::default(),
            patterns: Vec::new(),
            cancel_flag: None,
        }
    }

    pub fn with_config(config: ScanConfig) -> Result<Self, ScanError> {
        let patterns = config
            .exclude_patterns
            .iter()
            .map(|p| Self::compile_pattern(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            config,
            patterns,
            cancel_flag: None,
        })
    }

    /// 设置取消标志
    pub fn with_cancel(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(cancel_flag);
        self
    }

    /// 检查是否已取消
    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn compile_pattern(pattern: &str) -> Result<Pattern, ScanError> {
        let pattern = pattern.to_lowercase();

        // 处理 ** 通配符
        if pattern.contains("**") {
            let parts: Vec<&str> = pattern.split("**").collect();
            if parts.len() == 2 {
                return Ok(Pattern::Recursive {
                    prefix: parts[0].trim_end_matches('/').to_string(),
                    suffix: parts[1].trim_start_matches('/').to_string(),
                });
            }
        }

        // 处理 * 通配符
        if pattern.contains('*') {
            let regex_pattern = regex::escape(&pattern).replace("\\*", ".*");
            return regex::Regex::new(&format!("^{}$", regex_pattern))
                .map(Pattern::Glob)
                .map_err(|e| ScanError::InvalidPattern(format!("{}: {}", pattern, e)));
        }

        Ok(Pattern::Exact(pattern))
    }

    /// 检查相对路径是否应该被排除
    fn should_exclude(&self, path: &str) -> bool {
        let path = path.to_lowercase();
        let file_name = path.rsplit('/').next().unwrap_or(&path);

        for pattern in &self.patterns {
            let matched = match pattern {
                Pattern::Recursive { prefix, suffix } => {
                    (prefix.is_empty() || path == *prefix || path.starts_with(&format!("{}/", prefix)))
                        && (suffix.is_empty() || path.ends_with(suffix.as_str()))
                }
                Pattern::Glob(re) => re.is_match(&path) || re.is_match(file_name),
                // 精确匹配
                Pattern::Exact(p) => path == *p || path.ends_with(&format!("/{}", p)),
            };
            if matched {
                return true;
            }
        }

        // 检查扩展名
        if !self.config.include_extensions.is_empty() {
            let ext = Path::new(&path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();

            if !self
                .config
                .include_extensions
                .iter()
                .any(|e| e.trim_start_matches('.').to_lowercase() == ext)
            {
                return true;
            }
        }

        false
    }

    /// 扫描本地目录
    ///
    /// 深度优先、同级按文件名排序，未修改的目录树每次得到相同顺序。
    /// 只收集普通文件，符号链接和特殊文件被忽略。
    pub fn scan(&self, root: &Path) -> Result<ScanResult, ScanError> {
        let metadata = match std::fs::metadata(root) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ScanError::RootNotFound(root.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_dir() {
            return Err(ScanError::NotADirectory(root.to_path_buf()));
        }

        info!("开始扫描本地目录: {:?}", root);

        let mut result = ScanResult::default();

        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
        {
            // 每处理一定数量检查一次取消状态
            if result.entries.len() % 100 == 0 && self.is_cancelled() {
                return Err(ScanError::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "操作已取消",
                )));
            }

            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                    warn!("跳过不可读条目 {:?}: {}", path, e);
                    result.warnings.push(ScanWarning {
                        path,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let relative_path = match entry.path().strip_prefix(root) {
                Ok(p) => p
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
                Err(_) => continue,
            };

            if self.should_exclude(&relative_path) {
                debug!("排除文件: {}", relative_path);
                result.excluded += 1;
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("读取元数据失败 {:?}: {}", entry.path(), e);
                    result.warnings.push(ScanWarning {
                        path: entry.path().to_path_buf(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            // 检查文件大小
            if self.config.max_file_size > 0 && metadata.len() > self.config.max_file_size {
                debug!("跳过大文件: {} ({})", relative_path, metadata.len());
                result.excluded += 1;
                continue;
            }

            let modified_time = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            result.entries.push(FileEntry {
                relative_path,
                absolute_path: entry.path().to_path_buf(),
                size: metadata.len(),
                modified_time,
            });
        }

        info!(
            "扫描完成: {} 个文件, {} 个被排除, {} 个警告",
            result.entries.len(),
            result.excluded,
            result.warnings.len()
        );

        Ok(result)
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new()
    }
}
