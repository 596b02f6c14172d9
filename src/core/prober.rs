//! 远程状态探测
//!
//! 探测结果按路径缓存，只在一次同步运行内有效。

use crate::error::{ProbeError, TransportError};
use crate::transport::{normalize_remote, Transport};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 远程节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Directory,
    File,
    /// 已探测，确认不存在
    Missing,
}

/// 远程路径的已知状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNode {
    pub path: String,
    pub kind: NodeKind,
    /// 仅文件有
    pub modified_time: Option<i64>,
    pub size: Option<u64>,
}

impl RemoteNode {
    pub fn directory(path: &str) -> Self {
        Self {
            path: path.to_string(),
            kind: NodeKind::Directory,
            modified_time: None,
            size: None,
        }
    }

    pub fn missing(path: &str) -> Self {
        Self {
            path: path.to_string(),
            kind: NodeKind::Missing,
            modified_time: None,
            size: None,
        }
    }

    pub fn file(path: &str, size: u64, modified_time: i64) -> Self {
        Self {
            path: path.to_string(),
            kind: NodeKind::File,
            modified_time: Some(modified_time),
            size: Some(size),
        }
    }
}

/// 远程状态探测器
pub struct RemoteProber {
    transport: Arc<dyn Transport>,
    cache: HashMap<String, RemoteNode>,
    /// 计划中会创建、但尚未真正创建的目录
    planned: HashSet<String>,
    op_timeout: Duration,
    probes: usize,
}

impl RemoteProber {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            cache: HashMap::new(),
            planned: HashSet::new(),
            op_timeout: Duration::from_secs(crate::transport::OP_TIMEOUT_SECS),
            probes: 0,
        }
    }

    pub fn with_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// 实际发出的 stat 次数
    pub fn probe_count(&self) -> usize {
        self.probes
    }

    pub fn cached(&self, path: &str) -> Option<&RemoteNode> {
        self.cache.get(&normalize_remote(path))
    }

    /// 目录已确认存在，或已在计划中
    pub fn is_known_directory(&self, path: &str) -> bool {
        let path = normalize_remote(path);
        self.planned.contains(&path)
            || matches!(self.cache.get(&path), Some(n) if n.kind == NodeKind::Directory)
    }

    /// 目录仅在计划中，远端尚不存在
    pub fn is_planned(&self, path: &str) -> bool {
        self.planned.contains(&normalize_remote(path))
    }

    /// 探测远程路径，命中缓存时不发请求
    pub async fn probe(&mut self, path: &str) -> Result<RemoteNode, ProbeError> {
        let path = normalize_remote(path);
        if let Some(node) = self.cache.get(&path) {
            return Ok(node.clone());
        }

        self.probes += 1;
        let stat = self
            .with_timeout_op("stat", self.transport.stat(&path))
            .await
            .map_err(|source| ProbeError::Transport {
                path: path.clone(),
                source,
            })?;

        let node = match stat {
            Some(s) if s.is_dir => RemoteNode::directory(&path),
            Some(s) => RemoteNode::file(&path, s.size, s.modified_time),
            None => RemoteNode::missing(&path),
        };
        debug!("探测 {}: {:?}", path, node.kind);
        self.cache.insert(path, node.clone());
        Ok(node)
    }

    /// 标记目录将在执行阶段创建（规划期间的推测，不发请求）
    pub fn plan_directory(&mut self, path: &str) {
        self.planned.insert(normalize_remote(path));
    }

    /// 创建目录；已存在时吸收错误并视为成功
    ///
    /// 父目录由计划顺序保证已存在。
    pub async fn ensure_directory(&mut self, path: &str) -> Result<(), TransportError> {
        let path = normalize_remote(path);
        if matches!(self.cache.get(&path), Some(n) if n.kind == NodeKind::Directory) {
            self.planned.remove(&path);
            return Ok(());
        }

        match self
            .with_timeout_op("mkdir", self.transport.mkdir(&path))
            .await
        {
            Ok(()) => {}
            Err(TransportError::AlreadyExists(_)) => {
                debug!("目录已存在: {}", path);
            }
            Err(e) => return Err(e),
        }

        self.planned.remove(&path);
        self.cache.insert(path.clone(), RemoteNode::directory(&path));
        Ok(())
    }

    /// 列出目录子项并写入缓存
    pub async fn list(&mut self, path: &str) -> Result<Vec<RemoteNode>, ProbeError> {
        let path = normalize_remote(path);
        let entries = self
            .with_timeout_op("readdir", self.transport.list_dir(&path))
            .await
            .map_err(|source| ProbeError::Transport {
                path: path.clone(),
                source,
            })?;

        self.cache
            .insert(path.clone(), RemoteNode::directory(&path));

        let mut nodes: Vec<RemoteNode> = entries
            .into_iter()
            .map(|e| {
                if e.stat.is_dir {
                    RemoteNode::directory(&e.path)
                } else {
                    RemoteNode::file(&e.path, e.stat.size, e.stat.modified_time)
                }
            })
            .collect();

        // 目录在前，按名称排序
        nodes.sort_by(|a, b| {
            (b.kind == NodeKind::Directory)
                .cmp(&(a.kind == NodeKind::Directory))
                .then_with(|| a.path.to_lowercase().cmp(&b.path.to_lowercase()))
        });

        for node in &nodes {
            self.cache.insert(node.path.clone(), node.clone());
        }
        Ok(nodes)
    }

    async fn with_timeout_op<T>(
        &self,
        op: &str,
        fut: impl std::future::Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                op: op.to_string(),
                secs: self.op_timeout.as_secs(),
            }),
        }
    }
}
