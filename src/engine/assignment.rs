// ==========================================
// 配送调度核心 - 派单引擎 (AssignmentEngine)
// ==========================================
// 职责: 聚类 -> 司机 映射,满足运力约束并保持 FIFO 聚类顺序
// 输入: 聚类列表 + 司机快照 + 司机当前位置
// 输出: AssignmentPlan（落位列表 + 未落位列表）
// ==========================================
// 规则:
// 1) 聚类按最早成员排位升序处理
// 2) 候选司机: 可接单、位置已知、剩余运力 > 0、距质心 <= service_radius_km
// 3) 综合成本（越小越好）:
//    w_distance * km + w_capacity * (1 / remaining) + w_workload * (workload / capacity)
//    成本相同按 driver_id 升序
// 4) 均衡上限: 最近的候选司机若已有在途订单,且成本与最优差距不超过
//    balancing_threshold,则仍排第一
// 5) 依次填满排名第一的司机,再溢出到下一位
// 6) 无法落位的订单保持 pending,排位不变
// 红线: 纯函数,相同输入必得相同输出
// ==========================================

use crate::config::dispatch_config::AssignmentConfig;
use crate::domain::{Cluster, DriverWorkload, GeoPoint};
use crate::engine::error::DispatchError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

// ==========================================
// 输出结构
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAssignmentEntry {
    pub order_id: String,
    pub driver_id: String,
    pub cluster_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnassignedOrder {
    pub order_id: String,
    pub cluster_id: String,
    pub reason: String,
}

impl UnassignedOrder {
    pub fn to_error(&self) -> DispatchError {
        DispatchError::NoViableAssignment {
            order_id: self.order_id.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentPlan {
    pub assignments: Vec<OrderAssignmentEntry>,
    pub unassigned: Vec<UnassignedOrder>,
}

impl AssignmentPlan {
    /// (order_id, driver_id) 列表
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.assignments
            .iter()
            .map(|a| (a.order_id.clone(), a.driver_id.clone()))
            .collect()
    }

    /// 某个聚类内的落位
    pub fn pairs_for_cluster(&self, cluster_id: &str) -> Vec<(String, String)> {
        self.assignments
            .iter()
            .filter(|a| a.cluster_id == cluster_id)
            .map(|a| (a.order_id.clone(), a.driver_id.clone()))
            .collect()
    }

    pub fn driver_of(&self, order_id: &str) -> Option<&str> {
        self.assignments
            .iter()
            .find(|a| a.order_id == order_id)
            .map(|a| a.driver_id.as_str())
    }
}

// ==========================================
// 候选司机
// ==========================================
#[derive(Debug, Clone)]
struct Candidate {
    driver_id: String,
    distance_km: f64,
    cost: f64,
    workload: u32,
}

/// 本轮内的司机运力状态
#[derive(Debug, Clone)]
struct DriverState {
    capacity: u32,
    workload: u32,
    available: bool,
}

impl DriverState {
    fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.workload)
    }
}

// ==========================================
// AssignmentEngine
// ==========================================
pub struct AssignmentEngine {
    config: AssignmentConfig,
}

impl AssignmentEngine {
    pub fn new(config: AssignmentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssignmentConfig {
        &self.config
    }

    /// 生成派单方案
    pub fn assign(
        &self,
        clusters: &[Cluster],
        drivers: &[DriverWorkload],
        positions: &HashMap<String, GeoPoint>,
    ) -> AssignmentPlan {
        let mut states: HashMap<&str, DriverState> = drivers
            .iter()
            .map(|d| {
                (
                    d.driver.driver_id.as_str(),
                    DriverState {
                        capacity: d.driver.capacity,
                        workload: d.workload,
                        available: d.driver.available,
                    },
                )
            })
            .collect();

        let mut ordered: Vec<&Cluster> = clusters.iter().collect();
        ordered.sort_by(|a, b| {
            a.oldest_rank
                .cmp(&b.oldest_rank)
                .then_with(|| a.cluster_id.cmp(&b.cluster_id))
        });

        let mut plan = AssignmentPlan::default();
        for cluster in ordered {
            let ranked = self.rank_candidates(cluster, &states, positions);
            if ranked.is_empty() {
                for order_id in &cluster.member_ids {
                    self.leave_pending(&mut plan, order_id, cluster, "服务半径内无可用司机");
                }
                continue;
            }

            let mut cursor = 0usize;
            for order_id in &cluster.member_ids {
                // 跳过已满员的司机
                while cursor < ranked.len()
                    && states
                        .get(ranked[cursor].driver_id.as_str())
                        .map_or(true, |s| s.remaining() == 0)
                {
                    cursor += 1;
                }
                let Some(candidate) = ranked.get(cursor) else {
                    self.leave_pending(&mut plan, order_id, cluster, "候选司机运力已用尽");
                    continue;
                };
                if let Some(state) = states.get_mut(candidate.driver_id.as_str()) {
                    state.workload += 1;
                }
                plan.assignments.push(OrderAssignmentEntry {
                    order_id: order_id.clone(),
                    driver_id: candidate.driver_id.clone(),
                    cluster_id: cluster.cluster_id.clone(),
                });
            }

            tracing::debug!(
                cluster_id = %cluster.cluster_id,
                members = cluster.member_ids.len(),
                top_driver = %ranked[0].driver_id,
                top_cost = ranked[0].cost,
                top_distance_km = ranked[0].distance_km,
                "聚类派单完成"
            );
        }
        plan
    }

    fn leave_pending(&self, plan: &mut AssignmentPlan, order_id: &str, cluster: &Cluster, reason: &str) {
        let entry = UnassignedOrder {
            order_id: order_id.to_string(),
            cluster_id: cluster.cluster_id.clone(),
            reason: reason.to_string(),
        };
        tracing::warn!(cluster_id = %cluster.cluster_id, error = %entry.to_error(), "订单本轮未派出");
        plan.unassigned.push(entry);
    }

    /// 为聚类排出候选司机顺序
    fn rank_candidates(
        &self,
        cluster: &Cluster,
        states: &HashMap<&str, DriverState>,
        positions: &HashMap<String, GeoPoint>,
    ) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = states
            .iter()
            .filter(|(_, s)| s.available && s.remaining() > 0 && s.capacity > 0)
            .filter_map(|(driver_id, s)| {
                let position = positions.get(*driver_id)?;
                let distance_km = position.distance_km(&cluster.centroid);
                if distance_km > self.config.service_radius_km {
                    return None;
                }
                Some(Candidate {
                    driver_id: driver_id.to_string(),
                    distance_km,
                    cost: self.cost(distance_km, s),
                    workload: s.workload,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.cost
                .partial_cmp(&b.cost)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        });

        // 均衡上限: 已有在途订单的最近司机,成本差距在阈值内时保持第一
        if let Some(nearest_idx) = candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.distance_km
                    .partial_cmp(&b.distance_km)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.driver_id.cmp(&b.driver_id))
            })
            .map(|(i, _)| i)
        {
            let best_cost = candidates[0].cost;
            let nearest = &candidates[nearest_idx];
            if nearest_idx > 0
                && nearest.workload > 0
                && nearest.cost - best_cost <= self.config.balancing_threshold
            {
                let promoted = candidates.remove(nearest_idx);
                candidates.insert(0, promoted);
            }
        }
        candidates
    }

    fn cost(&self, distance_km: f64, state: &DriverState) -> f64 {
        let remaining = state.remaining().max(1) as f64;
        let load_ratio = state.workload as f64 / state.capacity.max(1) as f64;
        self.config.weight_distance * distance_km
            + self.config.weight_capacity * (1.0 / remaining)
            + self.config.weight_workload * load_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Driver;
    use chrono::{TimeZone, Utc};

    fn cluster(id: &str, oldest_rank: usize, center: GeoPoint, members: &[&str]) -> Cluster {
        Cluster {
            cluster_id: id.to_string(),
            pass_id: "P1".to_string(),
            centroid: center,
            radius_km: 0.5,
            member_ids: members.iter().map(|s| s.to_string()).collect(),
            oldest_rank,
            average_rank: oldest_rank as f64,
            created_at: Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
        }
    }

    fn driver(id: &str, capacity: u32, workload: u32) -> DriverWorkload {
        DriverWorkload {
            driver: Driver::new(id, capacity),
            workload,
        }
    }

    fn engine() -> AssignmentEngine {
        AssignmentEngine::new(AssignmentConfig {
            weight_distance: 1.0,
            weight_capacity: 0.0,
            weight_workload: 0.0,
            balancing_threshold: 0.0,
            service_radius_km: 10.0,
            default_driver_capacity: 3,
        })
    }

    const CENTER: GeoPoint = GeoPoint { lat: 40.75, lon: -73.99 };

    #[test]
    fn test_full_driver_never_gets_extra_order() {
        let clusters = vec![cluster("C1", 0, CENTER, &["O1", "O2"])];
        let drivers = vec![driver("D_NEAR", 3, 3), driver("D_FAR", 3, 0)];
        let positions = HashMap::from([
            ("D_NEAR".to_string(), CENTER),
            ("D_FAR".to_string(), GeoPoint::new(40.78, -73.99)),
        ]);

        let plan = engine().assign(&clusters, &drivers, &positions);
        assert_eq!(plan.driver_of("O1"), Some("D_FAR"));
        assert_eq!(plan.driver_of("O2"), Some("D_FAR"));
        assert!(plan.unassigned.is_empty());
    }

    #[test]
    fn test_spill_then_pending_when_capacity_exhausted() {
        let clusters = vec![cluster("C1", 0, CENTER, &["O1", "O2", "O3", "O4"])];
        let drivers = vec![driver("D1", 3, 1), driver("D2", 1, 0)];
        let positions = HashMap::from([
            ("D1".to_string(), CENTER),
            ("D2".to_string(), GeoPoint::new(40.76, -73.99)),
        ]);

        let plan = engine().assign(&clusters, &drivers, &positions);
        assert_eq!(plan.driver_of("O1"), Some("D1"));
        assert_eq!(plan.driver_of("O2"), Some("D1"));
        assert_eq!(plan.driver_of("O3"), Some("D2"));
        assert_eq!(plan.unassigned.len(), 1);
        assert_eq!(plan.unassigned[0].order_id, "O4");
    }

    #[test]
    fn test_oldest_cluster_served_first() {
        // 唯一司机运力 1: 最早的聚类拿到它
        let clusters = vec![
            cluster("C_NEW", 5, CENTER, &["O6"]),
            cluster("C_OLD", 0, GeoPoint::new(40.76, -73.99), &["O1"]),
        ];
        let drivers = vec![driver("D1", 1, 0)];
        let positions = HashMap::from([("D1".to_string(), CENTER)]);

        let plan = engine().assign(&clusters, &drivers, &positions);
        assert_eq!(plan.driver_of("O1"), Some("D1"));
        assert_eq!(plan.unassigned[0].order_id, "O6");
    }

    #[test]
    fn test_service_radius_and_unknown_location_excluded() {
        let clusters = vec![cluster("C1", 0, CENTER, &["O1"])];
        let drivers = vec![driver("D_FAR", 3, 0), driver("D_UNKNOWN", 3, 0)];
        let positions = HashMap::from([("D_FAR".to_string(), GeoPoint::new(41.50, -73.99))]);

        let plan = engine().assign(&clusters, &drivers, &positions);
        assert!(plan.assignments.is_empty());
        assert!(matches!(
            plan.unassigned[0].to_error(),
            DispatchError::NoViableAssignment { .. }
        ));
    }

    #[test]
    fn test_balancing_threshold_keeps_loaded_nearest_driver_first() {
        let mut cfg = engine().config().clone();
        cfg.weight_workload = 2.0;
        cfg.balancing_threshold = 1.5;
        let clusters = vec![cluster("C1", 0, CENTER, &["O1"])];
        // D_NEAR 距离 0 但已有 2 单: 成本 = 0 + 2*(2/4) = 1.0
        // D_IDLE 距离约 0.56km 空载: 成本约 0.56
        let drivers = vec![driver("D_NEAR", 4, 2), driver("D_IDLE", 4, 0)];
        let positions = HashMap::from([
            ("D_NEAR".to_string(), CENTER),
            ("D_IDLE".to_string(), GeoPoint::new(40.755, -73.99)),
        ]);

        let plan = AssignmentEngine::new(cfg.clone()).assign(&clusters, &drivers, &positions);
        assert_eq!(plan.driver_of("O1"), Some("D_NEAR"));

        cfg.balancing_threshold = 0.1;
        let plan = AssignmentEngine::new(cfg).assign(&clusters, &drivers, &positions);
        assert_eq!(plan.driver_of("O1"), Some("D_IDLE"));
    }

    #[test]
    fn test_assign_is_idempotent() {
        let clusters = vec![
            cluster("C1", 0, CENTER, &["O1", "O2"]),
            cluster("C2", 2, GeoPoint::new(40.76, -73.98), &["O3"]),
        ];
        let drivers = vec![driver("D1", 2, 0), driver("D2", 2, 0), driver("D3", 2, 1)];
        let positions = HashMap::from([
            ("D1".to_string(), CENTER),
            ("D2".to_string(), CENTER),
            ("D3".to_string(), GeoPoint::new(40.76, -73.98)),
        ]);

        let first = engine().assign(&clusters, &drivers, &positions);
        let second = engine().assign(&clusters, &drivers, &positions);
        assert_eq!(first, second);
        // 成本相同按 driver_id
        assert_eq!(first.driver_of("O1"), Some("D1"));
    }
}
