// ==========================================
// 公平派单集成测试
// ==========================================
// 测试目标: 公平上限、优先级前移、跨轮次聚类归属
// ==========================================


use chrono::Duration;
use delivery_dispatch::config::{AssignmentConfig, ClusteringConfig, FairnessPolicy};
use delivery_dispatch::domain::{OrderStatus, PriorityTier};
use delivery_dispatch::engine::events::OptionalEventPublisher;
use delivery_dispatch::engine::orchestrator::{run_pass_sync, DispatchOrchestrator, PassOutcome};
use delivery_dispatch::engine::OrderLedger;
use delivery_dispatch::repository::InMemoryDispatchRepository;
use std::collections::HashMap;
use test_helpers::{driver, manhattan, order_at, order_offset, t0};

fn ids(orders: &[delivery_dispatch::Order]) -> Vec<String> {
    orders.iter().map(|o| o.order_id.clone()).collect()
}

#[test]
fn test_urgent_order_advances_until_older_order_hits_ceiling() {
    let mut ledger = OrderLedger::new(FairnessPolicy::default());
    ledger
        .enqueue(order_at("O1", t0(), PriorityTier::Normal, manhattan(0, 0)))
        .unwrap();
    ledger
        .enqueue(order_at(
            "O2",
            t0() + Duration::seconds(60),
            PriorityTier::Urgent,
            manhattan(1, 1),
        ))
        .unwrap();

    // 两单都在上限内: 紧急单前移
    let early = ledger.peek_fifo(10, t0() + Duration::minutes(10));
    assert_eq!(ids(&early), vec!["O2", "O1"]);

    // O1 超过 30 分钟上限, O2 未超过: O1 必须在前
    let late = ledger.peek_fifo(10, t0() + Duration::minutes(30) + Duration::milliseconds(500));
    assert_eq!(ids(&late), vec!["O1", "O2"]);
}

#[test]
fn test_past_ceiling_orders_always_precede_within_ceiling_orders() {
    let policy = FairnessPolicy {
        fairness_ceiling_secs: 600,
        rank_advance_secs: Some(300),
        max_rank_advance_positions: Some(2),
        ..FairnessPolicy::default()
    };
    let mut ledger = OrderLedger::new(policy.clone());
    let tiers = [
        PriorityTier::Low,
        PriorityTier::Urgent,
        PriorityTier::Normal,
        PriorityTier::High,
    ];
    for i in 0..24 {
        let created = t0() + Duration::seconds(i * 75);
        ledger
            .enqueue(order_at(
                &format!("O{:02}", i),
                created,
                tiers[(i as usize) % tiers.len()],
                manhattan(i as i32, 0),
            ))
            .unwrap();
    }

    let now = t0() + Duration::seconds(24 * 75 / 2 + 600);
    let ordered = ledger.peek_fifo(100, now);
    assert_eq!(ordered.len(), 24);

    let ceiling = policy.fairness_ceiling();
    let first_within = ordered
        .iter()
        .position(|o| o.age(now) <= ceiling)
        .unwrap_or(ordered.len());
    assert!(first_within > 0, "应存在已超上限的订单");
    assert!(
        ordered[first_within..].iter().all(|o| o.age(now) <= ceiling),
        "超上限订单不得排在上限内订单之后"
    );
}

#[test]
fn test_orders_change_cluster_only_through_pending() {
    let mut ledger = OrderLedger::new(FairnessPolicy::default());
    for i in 0..5 {
        ledger
            .enqueue(order_offset(&format!("O{}", i), i * 10, manhattan(i as i32, 0)))
            .unwrap();
    }
    let orchestrator = DispatchOrchestrator::new(ClusteringConfig::default(), AssignmentConfig::default());
    let repo = InMemoryDispatchRepository::new();
    let publisher = OptionalEventPublisher::none();

    let mut drivers = HashMap::new();
    drivers.insert("D1".to_string(), driver("D1", 2));
    let mut positions = HashMap::new();
    positions.insert("D1".to_string(), manhattan(0, 0));

    // 第 1 轮: 容量 2,其余订单保持 pending
    let first = run_pass_sync(
        &orchestrator,
        "P1",
        &mut ledger,
        &drivers,
        positions.clone(),
        &repo,
        &publisher,
        t0(),
    )
    .unwrap();
    assert!(matches!(first, PassOutcome::Committed { assigned: 2, unassigned: 3, .. }));

    let mut pass1_clusters = HashMap::new();
    for i in 0..5 {
        let order = ledger.get(&format!("O{}", i)).unwrap().clone();
        match order.status {
            OrderStatus::Assigned => {
                pass1_clusters.insert(order.order_id.clone(), order.cluster_id.clone().unwrap());
            }
            OrderStatus::Pending => assert!(order.cluster_id.is_none()),
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(pass1_clusters.len(), 2);

    // 第 2 轮: 新司机上线,剩余订单进入新聚类
    drivers.insert("D2".to_string(), driver("D2", 3));
    positions.insert("D2".to_string(), manhattan(3, 0));
    run_pass_sync(
        &orchestrator,
        "P2",
        &mut ledger,
        &drivers,
        positions,
        &repo,
        &publisher,
        t0() + Duration::minutes(1),
    )
    .unwrap();

    for (order_id, cluster_id) in &pass1_clusters {
        assert_eq!(ledger.get(order_id).unwrap().cluster_id.as_ref(), Some(cluster_id));
    }
    for i in 0..5 {
        let order_id = format!("O{}", i);
        let order = ledger.get(&order_id).unwrap();
        assert_eq!(order.status, OrderStatus::Assigned);
        if !pass1_clusters.contains_key(&order_id) {
            assert!(order.cluster_id.as_deref().unwrap().starts_with("P2-"));
        }
        // 每个订单只经历一次 pending -> clustered
        let into_cluster = ledger
            .history(&order_id)
            .iter()
            .filter(|c| c.to_status == OrderStatus::Clustered)
            .count();
        assert_eq!(into_cluster, 1);
    }
}

#[test]
fn test_requeued_order_drops_cluster_before_next_pass() {
    let mut ledger = OrderLedger::new(FairnessPolicy::default());
    ledger.enqueue(order_offset("O1", 0, manhattan(0, 0))).unwrap();
    ledger.mark_status("O1", OrderStatus::Clustered, t0()).unwrap();
    ledger.mark_status("O1", OrderStatus::Pending, t0()).unwrap();

    let order = ledger.get("O1").unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(order.cluster_id.is_none());
    assert_eq!(ledger.peek_fifo(1, t0()).len(), 1);
}
