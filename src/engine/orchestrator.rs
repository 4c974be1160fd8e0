// ==========================================
// 配送调度核心 - 派单轮次编排器
// ==========================================
// 用途: 协调一次快照隔离的 聚类 + 派单 轮次
// 流程:
// 1) 台账快照 + 司机快照 + 位置快照 -> PassSnapshot
// 2) plan_pass: GeoClusterer -> AssignmentEngine（纯计算,可在阻塞线程池执行）
// 3) apply_pass: 台账提交 -> 出站事件 -> 持久化
// 红线: 提交时台账状态已变化则整体丢弃（StalePass）
// ==========================================

use crate::config::dispatch_config::{AssignmentConfig, ClusteringConfig};
use crate::domain::{Cluster, Driver, DriverWorkload, GeoPoint, OrderStatusChange};
use crate::engine::assignment::{AssignmentEngine, AssignmentPlan};
use crate::engine::clusterer::GeoClusterer;
use crate::engine::error::{DispatchError, DispatchResult};
use crate::engine::events::OptionalEventPublisher;
use crate::engine::ledger::{LedgerSnapshot, OrderLedger};
use crate::repository::DispatchRepository;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

// ==========================================
// PassSnapshot - 轮次输入
// ==========================================
#[derive(Debug, Clone)]
pub struct PassSnapshot {
    pub pass_id: String,
    pub ledger: LedgerSnapshot,
    pub drivers: Vec<DriverWorkload>,
    pub positions: HashMap<String, GeoPoint>,
}

impl PassSnapshot {
    /// 由台账与司机登记表构造快照
    pub fn capture(
        pass_id: impl Into<String>,
        ledger: &OrderLedger,
        drivers: &HashMap<String, Driver>,
        positions: HashMap<String, GeoPoint>,
        now: DateTime<Utc>,
    ) -> Self {
        let ledger_snapshot = ledger.snapshot(now);
        let mut driver_list: Vec<DriverWorkload> = drivers
            .values()
            .map(|d| DriverWorkload {
                workload: ledger_snapshot
                    .workloads
                    .get(&d.driver_id)
                    .copied()
                    .unwrap_or(0),
                driver: d.clone(),
            })
            .collect();
        driver_list.sort_by(|a, b| a.driver.driver_id.cmp(&b.driver.driver_id));

        Self {
            pass_id: pass_id.into(),
            ledger: ledger_snapshot,
            drivers: driver_list,
            positions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.is_empty()
    }
}

// ==========================================
// PassPlan - 轮次计算结果（未提交）
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct PassPlan {
    pub pass_id: String,
    pub snapshot_epoch: u64,
    pub clusters: Vec<Cluster>,
    pub assignment: AssignmentPlan,
}

/// 轮次最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// 快照为空,轮次取消
    Empty,
    /// 已提交
    Committed {
        pass_id: String,
        clusters: usize,
        assigned: usize,
        unassigned: usize,
    },
    /// 快照过期,结果已丢弃
    Discarded { pass_id: String },
}

// ==========================================
// DispatchOrchestrator
// ==========================================
pub struct DispatchOrchestrator {
    clusterer: GeoClusterer,
    assigner: AssignmentEngine,
}

impl DispatchOrchestrator {
    pub fn new(clustering: ClusteringConfig, assignment: AssignmentConfig) -> Self {
        Self {
            clusterer: GeoClusterer::new(clustering),
            assigner: AssignmentEngine::new(assignment),
        }
    }

    /// 纯计算: 聚类 + 派单
    #[instrument(skip(self, snapshot), fields(
        pass_id = %snapshot.pass_id,
        pending = snapshot.ledger.pending.len(),
        drivers = snapshot.drivers.len(),
        epoch = snapshot.ledger.status_epoch,
    ))]
    pub fn plan_pass(&self, snapshot: &PassSnapshot) -> PassPlan {
        debug!("步骤1: 地理聚类");
        let clusters = self
            .clusterer
            .cluster_pending(&snapshot.ledger, &snapshot.pass_id);

        debug!(clusters = clusters.len(), "步骤2: 司机派单");
        let assignment = self
            .assigner
            .assign(&clusters, &snapshot.drivers, &snapshot.positions);

        info!(
            assigned = assignment.assignments.len(),
            unassigned = assignment.unassigned.len(),
            "派单轮次计算完成"
        );
        PassPlan {
            pass_id: snapshot.pass_id.clone(),
            snapshot_epoch: snapshot.ledger.status_epoch,
            clusters,
            assignment,
        }
    }
}

impl PassPlan {
    /// 已提交轮次的结果摘要
    pub fn committed_outcome(&self) -> PassOutcome {
        PassOutcome::Committed {
            pass_id: self.pass_id.clone(),
            clusters: self.clusters.len(),
            assigned: self.assignment.assignments.len(),
            unassigned: self.assignment.unassigned.len(),
        }
    }
}

/// 发布轮次事件: 每个落位一条 Assignment,每条状态变更一条 StatusChange
pub fn publish_pass_events(
    publisher: &OptionalEventPublisher,
    pairs: &[(String, String)],
    changes: &[OrderStatusChange],
) {
    for change in changes {
        publisher.emit_status_change(&change.order_id, change.to_status);
    }
    for (order_id, driver_id) in pairs {
        publisher.emit_assignment(order_id, driver_id);
    }
}

/// 提交轮次结果: 台账 -> 事件 -> 持久化
///
/// # 返回
/// - Err(StalePass): 台账已变化,未做任何修改
/// - Err(StorageUnavailable): 台账已提交,持久化失败（内存状态不回滚）
pub fn apply_pass(
    plan: &PassPlan,
    ledger: &mut OrderLedger,
    repo: &dyn DispatchRepository,
    publisher: &OptionalEventPublisher,
    now: DateTime<Utc>,
) -> DispatchResult<PassOutcome> {
    let pairs = plan.assignment.pairs();
    let changes = ledger.commit_pass(plan.snapshot_epoch, &plan.clusters, &pairs, now)?;
    publish_pass_events(publisher, &pairs, &changes);

    for cluster in &plan.clusters {
        let cluster_pairs = plan.assignment.pairs_for_cluster(&cluster.cluster_id);
        if cluster_pairs.is_empty() {
            continue;
        }
        repo.save_cluster_assignment(cluster, &cluster_pairs)
            .map_err(|e| DispatchError::storage("save_cluster_assignment", e))?;
    }
    for change in &changes {
        repo.append_status_change(change)
            .map_err(|e| DispatchError::storage("append_status_change", e))?;
    }

    info!(
        pass_id = %plan.pass_id,
        clusters = plan.clusters.len(),
        assigned = pairs.len(),
        unassigned = plan.assignment.unassigned.len(),
        "派单轮次已提交"
    );
    Ok(plan.committed_outcome())
}

/// 同步执行一次完整轮次（单线程场景与测试）
#[allow(clippy::too_many_arguments)]
pub fn run_pass_sync(
    orchestrator: &DispatchOrchestrator,
    pass_id: &str,
    ledger: &mut OrderLedger,
    drivers: &HashMap<String, Driver>,
    positions: HashMap<String, GeoPoint>,
    repo: &dyn DispatchRepository,
    publisher: &OptionalEventPublisher,
    now: DateTime<Utc>,
) -> DispatchResult<PassOutcome> {
    let snapshot = PassSnapshot::capture(pass_id, ledger, drivers, positions, now);
    if snapshot.is_empty() {
        debug!(pass_id, "快照为空，轮次取消");
        return Ok(PassOutcome::Empty);
    }
    let plan = orchestrator.plan_pass(&snapshot);
    apply_pass(&plan, ledger, repo, publisher, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dispatch_config::FairnessPolicy;
    use crate::domain::{Order, OrderStatus, PriorityTier};
    use crate::engine::events::{DispatchEvent, RecordingEventPublisher};
    use crate::repository::InMemoryDispatchRepository;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn order(id: &str, offset_secs: i64, lat: f64, lon: f64) -> Order {
        let dest = GeoPoint::new(lat, lon);
        Order::new(
            id,
            t0() + Duration::seconds(offset_secs),
            PriorityTier::Normal,
            dest,
            dest,
        )
    }

    fn setup() -> (OrderLedger, HashMap<String, Driver>, HashMap<String, GeoPoint>) {
        let mut ledger = OrderLedger::new(FairnessPolicy::default());
        ledger.enqueue(order("O1", 0, 40.7128, -74.0060)).unwrap();
        ledger.enqueue(order("O2", 10, 40.7130, -74.0062)).unwrap();
        ledger.enqueue(order("O3", 20, 40.7580, -73.9855)).unwrap();

        let mut drivers = HashMap::new();
        drivers.insert("D1".to_string(), Driver::new("D1", 3));
        drivers.insert("D2".to_string(), Driver::new("D2", 3));

        let mut positions = HashMap::new();
        positions.insert("D1".to_string(), GeoPoint::new(40.7100, -74.0050));
        positions.insert("D2".to_string(), GeoPoint::new(40.7590, -73.9850));
        (ledger, drivers, positions)
    }

    fn orchestrator() -> DispatchOrchestrator {
        DispatchOrchestrator::new(ClusteringConfig::default(), AssignmentConfig::default())
    }

    #[test]
    fn test_plan_pass_is_deterministic() {
        let (ledger, drivers, positions) = setup();
        let snapshot = PassSnapshot::capture("P1", &ledger, &drivers, positions, t0());
        let orch = orchestrator();

        let a = orch.plan_pass(&snapshot);
        let b = orch.plan_pass(&snapshot);
        assert_eq!(a, b);
        assert_eq!(a.snapshot_epoch, ledger.status_epoch());
        assert_eq!(a.assignment.driver_of("O3"), Some("D2"));
    }

    #[test]
    fn test_run_pass_commits_persists_and_emits() {
        let (mut ledger, drivers, positions) = setup();
        let repo = InMemoryDispatchRepository::new();
        let recorder = Arc::new(RecordingEventPublisher::new());
        let publisher = OptionalEventPublisher::with_publisher(recorder.clone());

        let outcome = run_pass_sync(
            &orchestrator(),
            "P1",
            &mut ledger,
            &drivers,
            positions,
            &repo,
            &publisher,
            t0(),
        )
        .unwrap();

        match outcome {
            PassOutcome::Committed { assigned, unassigned, .. } => {
                assert_eq!(assigned, 3);
                assert_eq!(unassigned, 0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(ledger.get("O1").unwrap().status, OrderStatus::Assigned);
        assert_eq!(repo.history_of("O1").len(), 2);
        assert!(repo.cluster_count() >= 1);

        // 3 条落位 + 每单 pending->clustered->assigned 两条状态变更
        let events = recorder.events();
        let assignments = events.iter().filter(|e| e.as_str() == "Assignment").count();
        let status_changes: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DispatchEvent::StatusChange { order_id, status } if order_id == "O1" => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(assignments, 3);
        assert_eq!(status_changes, vec![OrderStatus::Clustered, OrderStatus::Assigned]);
    }

    #[test]
    fn test_empty_ledger_yields_empty_outcome() {
        let mut ledger = OrderLedger::new(FairnessPolicy::default());
        let repo = InMemoryDispatchRepository::new();
        let outcome = run_pass_sync(
            &orchestrator(),
            "P1",
            &mut ledger,
            &HashMap::new(),
            HashMap::new(),
            &repo,
            &OptionalEventPublisher::none(),
            t0(),
        )
        .unwrap();
        assert_eq!(outcome, PassOutcome::Empty);
    }

    #[test]
    fn test_stale_plan_is_rejected_without_side_effects() {
        let (mut ledger, drivers, positions) = setup();
        let snapshot = PassSnapshot::capture("P1", &ledger, &drivers, positions, t0());
        let plan = orchestrator().plan_pass(&snapshot);

        ledger.mark_status("O2", OrderStatus::Cancelled, t0()).unwrap();

        let repo = InMemoryDispatchRepository::new();
        let result = apply_pass(&plan, &mut ledger, &repo, &OptionalEventPublisher::none(), t0());
        assert!(matches!(result, Err(DispatchError::StalePass { .. })));
        assert_eq!(ledger.get("O1").unwrap().status, OrderStatus::Pending);
        assert_eq!(repo.cluster_count(), 0);
    }

    #[test]
    fn test_storage_failure_surfaces_after_ledger_commit() {
        let (mut ledger, drivers, positions) = setup();
        let repo = InMemoryDispatchRepository::new();
        repo.set_unavailable(true);

        let result = run_pass_sync(
            &orchestrator(),
            "P1",
            &mut ledger,
            &drivers,
            positions,
            &repo,
            &OptionalEventPublisher::none(),
            t0(),
        );
        assert!(matches!(result, Err(DispatchError::StorageUnavailable { .. })));
        assert_eq!(ledger.get("O1").unwrap().status, OrderStatus::Assigned);
    }
}
