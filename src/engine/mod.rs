// ==========================================
// 配送调度核心 - 引擎层
// ==========================================
// 职责: 订单台账、位置追踪、地理聚类、派单、会合点、交接
// 红线: Engine 不拼 SQL, 所有拒绝必须输出 reason
// ==========================================

pub mod assignment;
pub mod clusterer;
pub mod error;
pub mod events;
pub mod handover;
pub mod ledger;
pub mod meeting_point;
pub mod orchestrator;
pub mod tracker;

// 重导出核心引擎
pub use assignment::{AssignmentEngine, AssignmentPlan, OrderAssignmentEntry, UnassignedOrder};
pub use clusterer::GeoClusterer;
pub use error::{DispatchError, DispatchResult};
pub use events::{
    DispatchEvent, DispatchEventPublisher, NoOpEventPublisher, OptionalEventPublisher,
    RecordingEventPublisher,
};
pub use handover::{CompletionPlan, ConfirmOutcome, HandoverCoordinator, HandoverRequest};
pub use ledger::{LedgerSnapshot, OrderLedger};
pub use meeting_point::{DriverTrack, MeetingPointPlanner, MeetingProposal, Trajectory};
pub use orchestrator::{
    apply_pass, run_pass_sync, DispatchOrchestrator, PassOutcome, PassPlan, PassSnapshot,
};
pub use tracker::{LocationTracker, SampleOutcome};
