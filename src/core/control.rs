//! 运行状态与外部控制（暂停 / 继续 / 停止）

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// 同步运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
    Completed,
    Stopped,
    Failed,
}

impl RunState {
    /// 终态，运行不可再继续
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Stopped | RunState::Failed
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Paused => write!(f, "paused"),
            RunState::Completed => write!(f, "completed"),
            RunState::Stopped => write!(f, "stopped"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

impl From<&str> for RunState {
    fn from(s: &str) -> Self {
        match s {
            "running" => RunState::Running,
            "paused" => RunState::Paused,
            "completed" => RunState::Completed,
            "stopped" => RunState::Stopped,
            _ => RunState::Failed,
        }
    }
}

struct ControlInner {
    paused: AtomicBool,
    stopped: Arc<AtomicBool>,
    notify: Notify,
}

/// 运行控制句柄
///
/// 可克隆，任意线程调用；执行器只在动作之间检查。
#[derive(Clone)]
pub struct RunControl {
    inner: Arc<ControlInner>,
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                paused: AtomicBool::new(false),
                stopped: Arc::new(AtomicBool::new(false)),
                notify: Notify::new(),
            }),
        }
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// 停止标志，供扫描器共享
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.inner.stopped.clone()
    }

    /// 暂停期间阻塞，继续或停止时返回
    pub async fn wait_while_paused(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // 先登记再检查，避免错过唤醒
            notified.as_mut().enable();

            if !self.is_paused() || self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_run_state_round_trip() {
        for state in [
            RunState::Running,
            RunState::Paused,
            RunState::Completed,
            RunState::Stopped,
            RunState::Failed,
        ] {
            assert_eq!(RunState::from(state.to_string().as_str()), state);
        }
        assert!(RunState::Stopped.is_terminal());
        assert!(!RunState::Paused.is_terminal());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_running() {
        let control = RunControl::new();
        tokio::time::timeout(Duration::from_secs(1), control.wait_while_paused())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resume_wakes_waiter() {
        let control = RunControl::new();
        control.pause();

        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_while_paused().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        control.resume();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_releases_paused_waiter() {
        let control = RunControl::new();
        control.pause();
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_while_paused().await });

        control.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(control.cancel_flag().load(Ordering::SeqCst));
    }
}
