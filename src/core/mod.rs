pub mod conflict;
pub mod control;
pub mod engine;
pub mod executor;
pub mod planner;
pub mod prober;
pub mod scanner;

pub use conflict::{
    AlwaysOverwrite, AlwaysSkip, ConfirmRequest, ConfirmationCallback, ConflictGate, Decision,
    OverwriteMode,
};
pub use control::{RunControl, RunState};
pub use engine::{SyncEngine, SyncJob, SyncPhase, SyncProgress, SyncReport};
pub use executor::{ExecutionEvent, ExecutionPolicy, SkipReason, SyncRun};
pub use planner::{
    ActionKind, CompareConfig, ComparePolicy, Disposition, PlanSummary, SyncPlanner,
    TransferAction, TransferPlan,
};
pub use prober::{NodeKind, RemoteNode, RemoteProber};
pub use scanner::{FileEntry, FileScanner, ScanConfig, ScanResult, ScanWarning};
