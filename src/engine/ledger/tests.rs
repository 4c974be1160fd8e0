use super::*;
use crate::domain::{GeoPoint, PriorityTier};
use chrono::{Duration, TimeZone};

// ==========================================
// 测试辅助函数
// ==========================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

fn order_at(order_id: &str, offset_secs: i64, priority: PriorityTier) -> Order {
    Order::new(
        order_id,
        t0() + Duration::seconds(offset_secs),
        priority,
        GeoPoint::new(40.7128, -74.0060),
        GeoPoint::new(40.7200, -74.0000),
    )
}

fn ledger_with(policy: FairnessPolicy, orders: Vec<Order>) -> OrderLedger {
    let mut ledger = OrderLedger::new(policy);
    for order in orders {
        ledger.enqueue(order).unwrap();
    }
    ledger
}

fn ids(orders: &[Order]) -> Vec<&str> {
    orders.iter().map(|o| o.order_id.as_str()).collect()
}

fn cluster_of(cluster_id: &str, members: &[&str]) -> Cluster {
    Cluster {
        cluster_id: cluster_id.to_string(),
        pass_id: "P1".to_string(),
        centroid: GeoPoint::new(40.7128, -74.0060),
        radius_km: 1.0,
        member_ids: members.iter().map(|s| s.to_string()).collect(),
        oldest_rank: 0,
        average_rank: 0.0,
        created_at: t0(),
    }
}

// ==========================================
// 入账
// ==========================================

#[test]
fn test_enqueue_returns_fifo_rank() {
    let mut ledger = OrderLedger::new(FairnessPolicy::default());
    assert_eq!(ledger.enqueue(order_at("B", 10, PriorityTier::Normal)).unwrap(), 0);
    assert_eq!(ledger.enqueue(order_at("C", 20, PriorityTier::Normal)).unwrap(), 1);
    // 晚到但 created_at 更早的订单排在前面
    assert_eq!(ledger.enqueue(order_at("A", 5, PriorityTier::Low)).unwrap(), 0);
    assert_eq!(ledger.get("A").unwrap().admission_seq, Some(2));
}

#[test]
fn test_enqueue_rejects_duplicate_and_terminal() {
    let mut ledger = OrderLedger::new(FairnessPolicy::default());
    ledger.enqueue(order_at("A", 0, PriorityTier::Normal)).unwrap();

    let dup = ledger.enqueue(order_at("A", 1, PriorityTier::Normal));
    assert!(matches!(dup, Err(DispatchError::DuplicateOrder(id)) if id == "A"));

    let mut delivered = order_at("B", 0, PriorityTier::Normal);
    delivered.status = OrderStatus::Delivered;
    assert!(matches!(
        ledger.enqueue(delivered),
        Err(DispatchError::InvalidTransition { .. })
    ));
    assert_eq!(ledger.len(), 1);
}

#[test]
fn test_fifo_rank_matches_enqueue_rank() {
    let mut ledger = OrderLedger::new(FairnessPolicy::default());
    assert_eq!(ledger.enqueue(order_at("B", 10, PriorityTier::Normal)).unwrap(), 0);
    assert_eq!(ledger.enqueue(order_at("A", 0, PriorityTier::Urgent)).unwrap(), 0);
    assert_eq!(ledger.enqueue(order_at("C", 20, PriorityTier::Low)).unwrap(), 2);

    assert_eq!(ledger.fifo_rank("A"), Some(0));
    assert_eq!(ledger.fifo_rank("B"), Some(1));
    assert_eq!(ledger.fifo_rank("C"), Some(2));
    assert_eq!(ledger.fifo_rank("Z"), None);

    ledger.mark_status("A", OrderStatus::Cancelled, t0()).unwrap();
    assert_eq!(ledger.fifo_rank("A"), None);
    assert_eq!(ledger.fifo_rank("C"), Some(1));

    // 同一次下单的判定忽略台账分配的序号
    let stored = ledger.get("B").unwrap();
    assert!(stored.same_submission(&order_at("B", 10, PriorityTier::Normal)));
    assert!(!stored.same_submission(&order_at("B", 11, PriorityTier::Normal)));
}

// ==========================================
// 公平排序
// ==========================================

#[test]
fn test_peek_fifo_equal_priority_is_pure_fifo() {
    let ledger = ledger_with(
        FairnessPolicy::default(),
        vec![
            order_at("C", 30, PriorityTier::Normal),
            order_at("A", 10, PriorityTier::Normal),
            order_at("B", 20, PriorityTier::Normal),
            order_at("A2", 10, PriorityTier::Normal),
        ],
    );
    let now = t0() + Duration::seconds(60);
    assert_eq!(ids(&ledger.peek_fifo(10, now)), vec!["A", "A2", "B", "C"]);
    assert_eq!(ids(&ledger.peek_fifo(2, now)), vec!["A", "A2"]);
}

#[test]
fn test_priority_advances_before_ceiling() {
    let ledger = ledger_with(
        FairnessPolicy::default(),
        vec![
            order_at("O1", 0, PriorityTier::Normal),
            order_at("O2", 1, PriorityTier::Urgent),
        ],
    );
    let now = t0() + Duration::minutes(5);
    assert_eq!(ids(&ledger.peek_fifo(10, now)), vec!["O2", "O1"]);
}

#[test]
fn test_order_past_ceiling_served_first_regardless_of_priority() {
    let ledger = ledger_with(
        FairnessPolicy::default(),
        vec![
            order_at("O1", 0, PriorityTier::Normal),
            order_at("O2", 1, PriorityTier::Urgent),
        ],
    );
    // O1 已超过 30 分钟上限, O2 尚未超过
    let now = t0() + Duration::minutes(30) + Duration::milliseconds(500);
    assert_eq!(ids(&ledger.peek_fifo(10, now)), vec!["O1", "O2"]);
}

#[test]
fn test_rank_advance_window_blocks_jump_across_windows() {
    let policy = FairnessPolicy {
        rank_advance_secs: Some(60),
        ..FairnessPolicy::default()
    };
    // t0 对齐整分钟: O1 在窗口 w, O2 在窗口 w+1
    let ledger = ledger_with(
        policy,
        vec![
            order_at("O1", 59, PriorityTier::Normal),
            order_at("O2", 61, PriorityTier::Urgent),
            order_at("O3", 62, PriorityTier::Low),
        ],
    );
    let now = t0() + Duration::minutes(2);
    assert_eq!(ids(&ledger.peek_fifo(10, now)), vec!["O1", "O2", "O3"]);
}

#[test]
fn test_max_rank_advance_positions_caps_jump() {
    let policy = FairnessPolicy {
        max_rank_advance_positions: Some(2),
        ..FairnessPolicy::default()
    };
    let ledger = ledger_with(
        policy,
        vec![
            order_at("A", 0, PriorityTier::Normal),
            order_at("B", 1, PriorityTier::Normal),
            order_at("C", 2, PriorityTier::Normal),
            order_at("D", 3, PriorityTier::Normal),
            order_at("E", 4, PriorityTier::Normal),
            order_at("U", 5, PriorityTier::Urgent),
        ],
    );
    let now = t0() + Duration::minutes(1);
    let order = ledger.peek_fifo(10, now);
    // U 的纯 FIFO 位置为 5,最多前移 2 位 -> 位置 3
    assert_eq!(ids(&order), vec!["A", "B", "C", "U", "D", "E"]);
}

#[test]
fn test_past_ceiling_never_behind_non_past() {
    let mut orders = Vec::new();
    let tiers = [
        PriorityTier::Urgent,
        PriorityTier::Low,
        PriorityTier::High,
        PriorityTier::Normal,
    ];
    for i in 0..40 {
        orders.push(order_at(&format!("O{:02}", i), i * 60, tiers[(i % 4) as usize]));
    }
    let ledger = ledger_with(FairnessPolicy::default(), orders);
    let now = t0() + Duration::minutes(50);
    let ceiling = ledger.reorder_window().fairness_ceiling();

    let peeked = ledger.peek_fifo(100, now);
    assert_eq!(peeked.len(), 40);
    let first_non_past = peeked
        .iter()
        .position(|o| o.age(now) <= ceiling)
        .unwrap_or(peeked.len());
    assert!(peeked[first_non_past..].iter().all(|o| o.age(now) <= ceiling));

    // 再次查询结果稳定
    assert_eq!(ids(&peeked), ids(&ledger.peek_fifo(100, now)));
}

// ==========================================
// 状态变更
// ==========================================

#[test]
fn test_mark_status_follows_transition_table() {
    let mut ledger = ledger_with(
        FairnessPolicy::default(),
        vec![order_at("A", 0, PriorityTier::Normal)],
    );
    let now = t0();
    let epoch = ledger.status_epoch();

    let err = ledger.mark_status("A", OrderStatus::Delivered, now).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    assert_eq!(ledger.status_epoch(), epoch);

    ledger.mark_status("A", OrderStatus::Clustered, now).unwrap();
    ledger.mark_status("A", OrderStatus::Pending, now).unwrap();
    ledger.mark_status("A", OrderStatus::Cancelled, now).unwrap();
    assert_eq!(ledger.status_epoch(), epoch + 3);
    assert_eq!(ledger.history("A").len(), 3);

    // 终态后一切转换都被拒绝
    assert!(ledger.mark_status("A", OrderStatus::Failed, now).is_err());
    assert!(ledger
        .mark_status("missing", OrderStatus::Failed, now)
        .is_err());
}

#[test]
fn test_requeue_clears_cluster_reference() {
    let mut ledger = ledger_with(
        FairnessPolicy::default(),
        vec![order_at("A", 0, PriorityTier::Normal)],
    );
    ledger.mark_status("A", OrderStatus::Clustered, t0()).unwrap();
    ledger.mark_status("A", OrderStatus::Pending, t0()).unwrap();
    assert!(ledger.get("A").unwrap().cluster_id.is_none());
}

// ==========================================
// 派单轮次提交
// ==========================================

#[test]
fn test_commit_pass_assigns_and_keeps_unassigned_pending() {
    let mut ledger = ledger_with(
        FairnessPolicy::default(),
        vec![
            order_at("A", 0, PriorityTier::Normal),
            order_at("B", 1, PriorityTier::Normal),
        ],
    );
    let snapshot = ledger.snapshot(t0());
    let clusters = vec![cluster_of("C1", &["A", "B"])];
    let assignments = vec![("A".to_string(), "D1".to_string())];

    let changes = ledger
        .commit_pass(snapshot.status_epoch, &clusters, &assignments, t0())
        .unwrap();
    assert_eq!(changes.len(), 2);

    let a = ledger.get("A").unwrap();
    assert_eq!(a.status, OrderStatus::Assigned);
    assert_eq!(a.cluster_id.as_deref(), Some("C1"));
    assert_eq!(a.driver_id.as_deref(), Some("D1"));

    let b = ledger.get("B").unwrap();
    assert_eq!(b.status, OrderStatus::Pending);
    assert!(b.cluster_id.is_none());
    assert_eq!(ledger.workload_of("D1"), 1);
}

#[test]
fn test_commit_pass_rejects_stale_snapshot() {
    let mut ledger = ledger_with(
        FairnessPolicy::default(),
        vec![
            order_at("A", 0, PriorityTier::Normal),
            order_at("B", 1, PriorityTier::Normal),
        ],
    );
    let snapshot = ledger.snapshot(t0());
    ledger.mark_status("A", OrderStatus::Cancelled, t0()).unwrap();

    let result = ledger.commit_pass(
        snapshot.status_epoch,
        &[cluster_of("C1", &["A", "B"])],
        &[("B".to_string(), "D1".to_string())],
        t0(),
    );
    assert!(matches!(result, Err(DispatchError::StalePass { .. })));
    assert_eq!(ledger.get("B").unwrap().status, OrderStatus::Pending);
}

#[test]
fn test_enqueue_does_not_invalidate_snapshot() {
    let mut ledger = ledger_with(
        FairnessPolicy::default(),
        vec![order_at("A", 0, PriorityTier::Normal)],
    );
    let snapshot = ledger.snapshot(t0());
    ledger.enqueue(order_at("B", 5, PriorityTier::Normal)).unwrap();

    ledger
        .commit_pass(
            snapshot.status_epoch,
            &[cluster_of("C1", &["A"])],
            &[("A".to_string(), "D1".to_string())],
            t0(),
        )
        .unwrap();
    // 轮次中到达的订单留给下一轮
    assert_eq!(ledger.get("B").unwrap().status, OrderStatus::Pending);
}

// ==========================================
// 交接改派
// ==========================================

fn ledger_with_assigned() -> OrderLedger {
    let mut ledger = ledger_with(
        FairnessPolicy::default(),
        vec![
            order_at("A", 0, PriorityTier::Normal),
            order_at("B", 1, PriorityTier::Normal),
        ],
    );
    let snapshot = ledger.snapshot(t0());
    ledger
        .commit_pass(
            snapshot.status_epoch,
            &[cluster_of("C1", &["A", "B"])],
            &[
                ("A".to_string(), "D1".to_string()),
                ("B".to_string(), "D1".to_string()),
            ],
            t0(),
        )
        .unwrap();
    ledger
}

#[test]
fn test_reassign_for_handover_is_all_or_nothing() {
    let mut ledger = ledger_with_assigned();
    ledger.mark_status("B", OrderStatus::InTransit, t0()).unwrap();
    ledger.mark_status("B", OrderStatus::Delivered, t0()).unwrap();

    let ids = vec!["A".to_string(), "B".to_string()];
    let result = ledger.reassign_for_handover(&ids, "D1", "D2", "H1", t0());
    assert!(result.is_err());
    assert_eq!(ledger.get("A").unwrap().driver_id.as_deref(), Some("D1"));

    let only_a = vec!["A".to_string()];
    let changes = ledger
        .reassign_for_handover(&only_a, "D1", "D2", "H1", t0())
        .unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].from_status, changes[0].to_status);
    assert_eq!(ledger.get("A").unwrap().driver_id.as_deref(), Some("D2"));
    assert_eq!(ledger.workload_of("D2"), 1);
}

#[test]
fn test_restore_drivers_reverts_exactly() {
    let mut ledger = ledger_with_assigned();
    let prior = vec![
        PriorDriver {
            order_id: "A".to_string(),
            driver_id: Some("D1".to_string()),
        },
        PriorDriver {
            order_id: "B".to_string(),
            driver_id: Some("D1".to_string()),
        },
    ];
    let ids = vec!["A".to_string(), "B".to_string()];
    ledger
        .reassign_for_handover(&ids, "D1", "D2", "H1", t0())
        .unwrap();

    let changes = ledger.restore_drivers(&prior, "H1", t0());
    assert_eq!(changes.len(), 2);
    assert_eq!(ledger.get("A").unwrap().driver_id.as_deref(), Some("D1"));
    assert_eq!(ledger.get("B").unwrap().driver_id.as_deref(), Some("D1"));

    // 归属未变时为空操作
    assert!(ledger.restore_drivers(&prior, "H1", t0()).is_empty());
}

#[test]
fn test_status_counts_cover_all_statuses() {
    let ledger = ledger_with_assigned();
    let counts = ledger.status_counts();
    assert_eq!(counts.len(), OrderStatus::ALL.len());
    let assigned = counts
        .iter()
        .find(|(s, _)| *s == OrderStatus::Assigned)
        .map(|(_, n)| *n);
    assert_eq!(assigned, Some(2));
}
