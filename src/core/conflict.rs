use crate::core::planner::Disposition;
use serde::{Deserialize, Serialize};
use tracing::info;

/// 覆盖确认的答复
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Overwrite,
    Skip,
    /// 本次运行剩余文件全部覆盖
    OverwriteAll,
    /// 本次运行剩余待确认文件全部跳过
    SkipRemaining,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Overwrite => write!(f, "overwrite"),
            Decision::Skip => write!(f, "skip"),
            Decision::OverwriteAll => write!(f, "overwrite_all"),
            Decision::SkipRemaining => write!(f, "skip_remaining"),
        }
    }
}

impl From<&str> for Decision {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "y" | "yes" | "overwrite" => Decision::Overwrite,
            "a" | "all" | "overwrite_all" => Decision::OverwriteAll,
            "s" | "skip_remaining" => Decision::SkipRemaining,
            _ => Decision::Skip,
        }
    }
}

/// 需要确认的文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub target: String,
    pub local_modified_time: i64,
    pub remote_modified_time: Option<i64>,
    pub disposition: Disposition,
}

/// 覆盖确认回调
///
/// 同步调用，执行器在回调返回前不会继续。
pub trait ConfirmationCallback: Send {
    fn decide(&mut self, request: &ConfirmRequest) -> Decision;
}

impl<F> ConfirmationCallback for F
where
    F: FnMut(&ConfirmRequest) -> Decision + Send,
{
    fn decide(&mut self, request: &ConfirmRequest) -> Decision {
        self(request)
    }
}

/// 总是覆盖
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOverwrite;

impl ConfirmationCallback for AlwaysOverwrite {
    fn decide(&mut self, _request: &ConfirmRequest) -> Decision {
        Decision::Overwrite
    }
}

/// 总是跳过
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysSkip;

impl ConfirmationCallback for AlwaysSkip {
    fn decide(&mut self, _request: &ConfirmRequest) -> Decision {
        Decision::Skip
    }
}

/// 已存在文件的覆盖方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwriteMode {
    /// 逐个询问
    Ask,
    #[default]
    Always,
    Never,
}

/// 覆盖决策，批量答复会粘住直到运行结束
pub struct ConflictGate {
    mode: OverwriteMode,
    callback: Box<dyn ConfirmationCallback>,
}

impl ConflictGate {
    pub fn new(mode: OverwriteMode, callback: Box<dyn ConfirmationCallback>) -> Self {
        Self { mode, callback }
    }

    pub fn mode(&self) -> OverwriteMode {
        self.mode
    }

    /// 是否上传该文件
    pub fn allow(&mut self, request: &ConfirmRequest) -> bool {
        match self.mode {
            OverwriteMode::Always => return true,
            OverwriteMode::Never => return false,
            OverwriteMode::Ask => {}
        }

        match self.callback.decide(request) {
            Decision::Overwrite => true,
            Decision::Skip => false,
            Decision::OverwriteAll => {
                info!("后续文件全部覆盖");
                self.mode = OverwriteMode::Always;
                true
            }
            Decision::SkipRemaining => {
                info!("后续待确认文件全部跳过");
                self.mode = OverwriteMode::Never;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request(target: &str) -> ConfirmRequest {
        ConfirmRequest {
            target: target.to_string(),
            local_modified_time: 200,
            remote_modified_time: Some(100),
            disposition: Disposition::Changed,
        }
    }

    #[test]
    fn test_decision_from_str() {
        assert_eq!(Decision::from("y"), Decision::Overwrite);
        assert_eq!(Decision::from(" A "), Decision::OverwriteAll);
        assert_eq!(Decision::from("s"), Decision::SkipRemaining);
        assert_eq!(Decision::from("n"), Decision::Skip);
        assert_eq!(Decision::from(""), Decision::Skip);
        assert_eq!(Decision::from(Decision::OverwriteAll.to_string().as_str()), Decision::OverwriteAll);
    }

    #[test]
    fn test_fixed_modes_never_ask() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback = move |_: &ConfirmRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            Decision::Skip
        };

        let mut gate = ConflictGate::new(OverwriteMode::Always, Box::new(callback));
        assert!(gate.allow(&request("/a")));
        let mut gate = ConflictGate::new(OverwriteMode::Never, Box::new(AlwaysOverwrite));
        assert!(!gate.allow(&request("/a")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_overwrite_all_is_sticky() {
        let mut answers = vec![Decision::Skip, Decision::OverwriteAll].into_iter();
        let mut asked = Vec::new();
        let callback = move |r: &ConfirmRequest| {
            asked.push(r.target.clone());
            answers.next().unwrap_or(Decision::Skip)
        };
        let mut gate = ConflictGate::new(OverwriteMode::Ask, Box::new(callback));

        assert!(!gate.allow(&request("/a")));
        assert!(gate.allow(&request("/b")));
        assert_eq!(gate.mode(), OverwriteMode::Always);
        // 不再询问
        assert!(gate.allow(&request("/c")));
    }

    #[test]
    fn test_skip_remaining_is_sticky() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback = move |_: &ConfirmRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            Decision::SkipRemaining
        };
        let mut gate = ConflictGate::new(OverwriteMode::Ask, Box::new(callback));

        assert!(!gate.allow(&request("/a")));
        assert!(!gate.allow(&request("/b")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.mode(), OverwriteMode::Never);
    }

    #[test]
    fn test_always_skip_policy() {
        let mut gate = ConflictGate::new(OverwriteMode::Ask, Box::new(AlwaysSkip));
        assert!(!gate.allow(&request("/a")));
        assert_eq!(gate.mode(), OverwriteMode::Ask);
    }
}
