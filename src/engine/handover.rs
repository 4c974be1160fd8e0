// ==========================================
// 配送调度核心 - 交接协调 (HandoverCoordinator)
// ==========================================
// 状态机: pending -> in_progress -> completed
//         pending / in_progress -> cancelled
// 红线: 双方都确认到达后才进入 in_progress; 只有 in_progress 可完成
// 红线: 完成时订单改派全部成功或全部不变
// 红线: completed 之后记录不可变
// ==========================================

use crate::domain::{
    AckSlot, Handover, HandoverStatus, MeetingPoint, Order, PriorDriver,
};
use crate::engine::error::{DispatchError, DispatchResult};
use crate::engine::ledger::{has_duplicates, OrderLedger};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// 排期请求
#[derive(Debug, Clone)]
pub struct HandoverRequest {
    pub from_driver_id: String,
    pub to_driver_id: String,
    pub meeting_point: MeetingPoint,
    pub scheduled_at: DateTime<Utc>,
    pub order_ids: Vec<String>,
}

/// 到达确认结果
#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub handover: Handover,
    /// false = 重复确认,未改变任何状态
    pub newly_recorded: bool,
}

/// 完成交接所需的台账改派指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionPlan {
    pub handover_id: String,
    pub from_driver_id: String,
    pub to_driver_id: String,
    pub order_ids: Vec<String>,
}

#[derive(Default)]
pub struct HandoverCoordinator {
    handovers: HashMap<String, Handover>,
}

impl HandoverCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动恢复: 装载已持久化的交接
    pub fn restore(&mut self, handover: Handover) {
        self.handovers.insert(handover.handover_id.clone(), handover);
    }

    pub fn get(&self, handover_id: &str) -> Option<&Handover> {
        self.handovers.get(handover_id)
    }

    pub fn open_handovers(&self) -> Vec<&Handover> {
        let mut open: Vec<&Handover> = self.handovers.values().filter(|h| h.is_open()).collect();
        open.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.handover_id.cmp(&b.handover_id))
        });
        open
    }

    /// 排期交接
    ///
    /// # 参数
    /// - order_views: 台账中这些订单的当前副本（用于校验与记录原归属）
    ///
    /// # 校验
    /// - 双方司机不同
    /// - 订单非空且不重复
    /// - 订单当前属于 from 司机,状态为 assigned / in_transit
    /// - 订单不在其他未结束的交接中
    pub fn schedule(
        &mut self,
        request: HandoverRequest,
        order_views: &[Order],
        now: DateTime<Utc>,
    ) -> DispatchResult<Handover> {
        if request.from_driver_id == request.to_driver_id {
            return Err(DispatchError::Validation(format!(
                "交接双方不能为同一司机: {}",
                request.from_driver_id
            )));
        }
        if request.order_ids.is_empty() {
            return Err(DispatchError::Validation("交接订单不能为空".to_string()));
        }
        if has_duplicates(&request.order_ids) {
            return Err(DispatchError::Validation("交接订单存在重复".to_string()));
        }

        let views: HashMap<&str, &Order> = order_views
            .iter()
            .map(|o| (o.order_id.as_str(), o))
            .collect();

        let mut prior_drivers = Vec::with_capacity(request.order_ids.len());
        for order_id in &request.order_ids {
            let order = views
                .get(order_id.as_str())
                .ok_or_else(|| DispatchError::NotFound {
                    entity: "order",
                    id: order_id.clone(),
                })?;
            if !order.status.is_active() {
                return Err(DispatchError::Validation(format!(
                    "订单 {} 状态为 {}, 不能交接",
                    order_id, order.status
                )));
            }
            if order.driver_id.as_deref() != Some(request.from_driver_id.as_str()) {
                return Err(DispatchError::Validation(format!(
                    "订单 {} 不属于司机 {}",
                    order_id, request.from_driver_id
                )));
            }
            if let Some(other) = self
                .handovers
                .values()
                .find(|h| h.is_open() && h.order_ids.contains(order_id))
            {
                return Err(DispatchError::Validation(format!(
                    "订单 {} 已在交接 {} 中",
                    order_id, other.handover_id
                )));
            }
            prior_drivers.push(PriorDriver {
                order_id: order_id.clone(),
                driver_id: order.driver_id.clone(),
            });
        }

        let handover = Handover {
            handover_id: Uuid::new_v4().to_string(),
            from_driver_id: request.from_driver_id,
            to_driver_id: request.to_driver_id,
            meeting_point: request.meeting_point,
            scheduled_at: request.scheduled_at,
            status: HandoverStatus::Pending,
            order_ids: request.order_ids,
            prior_drivers,
            acks: Default::default(),
            created_at: now,
            completed_at: None,
            cancelled_at: None,
        };

        tracing::info!(
            handover_id = %handover.handover_id,
            from = %handover.from_driver_id,
            to = %handover.to_driver_id,
            orders = handover.order_ids.len(),
            meeting_point_id = %handover.meeting_point.meeting_point_id,
            "交接已排期"
        );
        self.handovers
            .insert(handover.handover_id.clone(), handover.clone());
        Ok(handover)
    }

    /// 司机确认到达（幂等、与顺序无关）
    pub fn confirm_arrival(
        &mut self,
        handover_id: &str,
        driver_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<ConfirmOutcome> {
        let handover = self.get_mut(handover_id)?;
        let slot = handover.slot_of(driver_id).ok_or_else(|| {
            DispatchError::Validation(format!(
                "司机 {} 不是交接 {} 的参与方",
                driver_id, handover_id
            ))
        })?;

        match handover.status {
            HandoverStatus::Cancelled => {
                return Err(invalid(handover, HandoverStatus::InProgress));
            }
            HandoverStatus::Completed => {
                // 完成后的迟到重复确认
                return Ok(ConfirmOutcome {
                    handover: handover.clone(),
                    newly_recorded: false,
                });
            }
            HandoverStatus::Pending | HandoverStatus::InProgress => {}
        }

        let newly_recorded = handover.acks.record(slot, now);
        if handover.acks.both_confirmed() && handover.status == HandoverStatus::Pending {
            handover.status = HandoverStatus::InProgress;
            tracing::info!(handover_id, "双方均已到达，交接进行中");
        } else if newly_recorded {
            tracing::debug!(handover_id, driver_id, slot = ?slot, "到达确认已记录");
        }

        Ok(ConfirmOutcome {
            handover: handover.clone(),
            newly_recorded,
        })
    }

    /// 完成前校验并生成改派指令（不修改状态）
    pub fn completion_plan(&self, handover_id: &str) -> DispatchResult<CompletionPlan> {
        let handover = self
            .handovers
            .get(handover_id)
            .ok_or_else(|| not_found(handover_id))?;
        if handover.status != HandoverStatus::InProgress {
            return Err(invalid(handover, HandoverStatus::Completed));
        }
        debug_assert!(handover.acks.is_confirmed(AckSlot::From) && handover.acks.is_confirmed(AckSlot::To));
        Ok(CompletionPlan {
            handover_id: handover.handover_id.clone(),
            from_driver_id: handover.from_driver_id.clone(),
            to_driver_id: handover.to_driver_id.clone(),
            order_ids: handover.order_ids.clone(),
        })
    }

    /// 台账改派成功后标记完成
    pub fn mark_completed(&mut self, handover_id: &str, now: DateTime<Utc>) -> DispatchResult<Handover> {
        let handover = self.get_mut(handover_id)?;
        if !handover.status.can_transition_to(HandoverStatus::Completed) {
            return Err(invalid(handover, HandoverStatus::Completed));
        }
        handover.status = HandoverStatus::Completed;
        handover.completed_at = Some(now);
        tracing::info!(handover_id, "交接完成");
        Ok(handover.clone())
    }

    /// 完成交接（同步版本: 校验 -> 台账改派 -> 标记完成）
    pub fn complete(
        &mut self,
        handover_id: &str,
        ledger: &mut OrderLedger,
        now: DateTime<Utc>,
    ) -> DispatchResult<Handover> {
        let plan = self.completion_plan(handover_id)?;
        ledger.reassign_for_handover(
            &plan.order_ids,
            &plan.from_driver_id,
            &plan.to_driver_id,
            &plan.handover_id,
            now,
        )?;
        self.mark_completed(handover_id, now)
    }

    /// 取消前校验,返回需恢复的原归属（不修改状态）
    pub fn cancellation_plan(&self, handover_id: &str) -> DispatchResult<Vec<PriorDriver>> {
        let handover = self
            .handovers
            .get(handover_id)
            .ok_or_else(|| not_found(handover_id))?;
        if !handover.status.can_transition_to(HandoverStatus::Cancelled) {
            return Err(invalid(handover, HandoverStatus::Cancelled));
        }
        Ok(handover.prior_drivers.clone())
    }

    /// 台账恢复后标记取消
    pub fn mark_cancelled(&mut self, handover_id: &str, now: DateTime<Utc>) -> DispatchResult<Handover> {
        let handover = self.get_mut(handover_id)?;
        if !handover.status.can_transition_to(HandoverStatus::Cancelled) {
            return Err(invalid(handover, HandoverStatus::Cancelled));
        }
        handover.status = HandoverStatus::Cancelled;
        handover.cancelled_at = Some(now);
        tracing::info!(handover_id, "交接已取消");
        Ok(handover.clone())
    }

    /// 取消交接（同步版本: 校验 -> 恢复原归属 -> 标记取消）
    pub fn cancel(
        &mut self,
        handover_id: &str,
        ledger: &mut OrderLedger,
        now: DateTime<Utc>,
    ) -> DispatchResult<Handover> {
        let prior = self.cancellation_plan(handover_id)?;
        ledger.restore_drivers(&prior, handover_id, now);
        self.mark_cancelled(handover_id, now)
    }

    fn get_mut(&mut self, handover_id: &str) -> DispatchResult<&mut Handover> {
        self.handovers
            .get_mut(handover_id)
            .ok_or_else(|| not_found(handover_id))
    }
}

fn not_found(handover_id: &str) -> DispatchError {
    DispatchError::NotFound {
        entity: "handover",
        id: handover_id.to_string(),
    }
}

fn invalid(handover: &Handover, to: HandoverStatus) -> DispatchError {
    DispatchError::InvalidTransition {
        entity: "handover",
        id: handover.handover_id.clone(),
        from: handover.status.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dispatch_config::FairnessPolicy;
    use crate::domain::{Cluster, GeoPoint, OrderStatus, PriorityTier};
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap() + Duration::seconds(secs)
    }

    /// 台账中 O1, O2 派给 D1, O3 派给 D3
    fn setup() -> (OrderLedger, HandoverCoordinator) {
        let mut ledger = OrderLedger::new(FairnessPolicy::default());
        for (i, id) in ["O1", "O2", "O3"].iter().enumerate() {
            ledger
                .enqueue(Order::new(
                    *id,
                    t(i as i64),
                    PriorityTier::Normal,
                    GeoPoint::new(40.75, -73.99),
                    GeoPoint::new(40.76, -73.98),
                ))
                .unwrap();
        }
        let snapshot = ledger.snapshot(t(10));
        let cluster = Cluster {
            cluster_id: "C1".to_string(),
            pass_id: "P1".to_string(),
            centroid: GeoPoint::new(40.76, -73.98),
            radius_km: 0.1,
            member_ids: vec!["O1".into(), "O2".into(), "O3".into()],
            oldest_rank: 0,
            average_rank: 1.0,
            created_at: t(10),
        };
        ledger
            .commit_pass(
                snapshot.status_epoch,
                &[cluster],
                &[
                    ("O1".into(), "D1".into()),
                    ("O2".into(), "D1".into()),
                    ("O3".into(), "D3".into()),
                ],
                t(10),
            )
            .unwrap();
        (ledger, HandoverCoordinator::new())
    }

    fn request(order_ids: &[&str]) -> HandoverRequest {
        HandoverRequest {
            from_driver_id: "D1".to_string(),
            to_driver_id: "D2".to_string(),
            meeting_point: MeetingPoint::registered("MP1", "Store 1", GeoPoint::new(40.755, -73.985)),
            scheduled_at: t(600),
            order_ids: order_ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn schedule(ledger: &OrderLedger, coordinator: &mut HandoverCoordinator, ids: &[&str]) -> Handover {
        let req = request(ids);
        let views = ledger.orders_by_ids(&req.order_ids);
        coordinator.schedule(req, &views, t(20)).unwrap()
    }

    #[test]
    fn test_completed_only_after_both_confirmations() {
        let (mut ledger, mut coordinator) = setup();
        let h = schedule(&ledger, &mut coordinator, &["O1", "O2"]);

        assert!(matches!(
            coordinator.complete(&h.handover_id, &mut ledger, t(30)),
            Err(DispatchError::InvalidTransition { .. })
        ));

        // to 先到, from 后到: 顺序无关
        let first = coordinator.confirm_arrival(&h.handover_id, "D2", t(40)).unwrap();
        assert!(first.newly_recorded);
        assert_eq!(first.handover.status, HandoverStatus::Pending);

        let dup = coordinator.confirm_arrival(&h.handover_id, "D2", t(45)).unwrap();
        assert!(!dup.newly_recorded);
        assert_eq!(dup.handover.acks.to_confirmed_at, Some(t(40)));
        assert_eq!(dup.handover.status, HandoverStatus::Pending);

        let second = coordinator.confirm_arrival(&h.handover_id, "D1", t(50)).unwrap();
        assert_eq!(second.handover.status, HandoverStatus::InProgress);

        let done = coordinator.complete(&h.handover_id, &mut ledger, t(60)).unwrap();
        assert_eq!(done.status, HandoverStatus::Completed);
        assert_eq!(ledger.get("O1").unwrap().driver_id.as_deref(), Some("D2"));
        assert_eq!(ledger.get("O2").unwrap().driver_id.as_deref(), Some("D2"));
        assert_eq!(ledger.history("O1").last().unwrap().note.as_deref().map(|n| n.starts_with("handover")), Some(true));

        // 完成后的迟到确认为空操作
        let late = coordinator.confirm_arrival(&h.handover_id, "D1", t(70)).unwrap();
        assert!(!late.newly_recorded);
        assert_eq!(late.handover, done);
        // 完成后不可取消
        assert!(coordinator.cancel(&h.handover_id, &mut ledger, t(80)).is_err());
    }

    #[test]
    fn test_cancel_pending_restores_drivers_exactly() {
        let (mut ledger, mut coordinator) = setup();
        let before: Vec<Option<String>> = ["O1", "O2", "O3"]
            .iter()
            .map(|id| ledger.get(id).unwrap().driver_id.clone())
            .collect();

        let h = schedule(&ledger, &mut coordinator, &["O1", "O2"]);
        coordinator.confirm_arrival(&h.handover_id, "D1", t(30)).unwrap();
        let cancelled = coordinator.cancel(&h.handover_id, &mut ledger, t(40)).unwrap();
        assert_eq!(cancelled.status, HandoverStatus::Cancelled);
        assert_eq!(cancelled.cancelled_at, Some(t(40)));

        let after: Vec<Option<String>> = ["O1", "O2", "O3"]
            .iter()
            .map(|id| ledger.get(id).unwrap().driver_id.clone())
            .collect();
        assert_eq!(before, after);

        // 取消后的确认是非法转换
        assert!(matches!(
            coordinator.confirm_arrival(&h.handover_id, "D2", t(50)),
            Err(DispatchError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_schedule_validation() {
        let (mut ledger, mut coordinator) = setup();

        // 不属于 from 司机
        let req = request(&["O3"]);
        let views = ledger.orders_by_ids(&req.order_ids);
        assert!(coordinator.schedule(req, &views, t(20)).is_err());

        // 同一司机
        let mut req = request(&["O1"]);
        req.to_driver_id = "D1".to_string();
        let views = ledger.orders_by_ids(&req.order_ids);
        assert!(coordinator.schedule(req, &views, t(20)).is_err());

        // 已在其他未结束交接中
        schedule(&ledger, &mut coordinator, &["O1"]);
        let req = request(&["O1", "O2"]);
        let views = ledger.orders_by_ids(&req.order_ids);
        assert!(coordinator.schedule(req, &views, t(20)).is_err());

        // 终态订单
        ledger.mark_status("O2", OrderStatus::Failed, t(25)).unwrap();
        let req = request(&["O2"]);
        let views = ledger.orders_by_ids(&req.order_ids);
        assert!(coordinator.schedule(req, &views, t(30)).is_err());

        // 非参与方确认
        let open = coordinator.open_handovers()[0].handover_id.clone();
        assert!(matches!(
            coordinator.confirm_arrival(&open, "D9", t(40)),
            Err(DispatchError::Validation(_))
        ));
    }

    #[test]
    fn test_complete_is_all_or_nothing_when_order_delivered_meanwhile() {
        let (mut ledger, mut coordinator) = setup();
        let h = schedule(&ledger, &mut coordinator, &["O1", "O2"]);
        coordinator.confirm_arrival(&h.handover_id, "D1", t(30)).unwrap();
        coordinator.confirm_arrival(&h.handover_id, "D2", t(31)).unwrap();

        ledger.mark_status("O2", OrderStatus::InTransit, t(32)).unwrap();
        ledger.mark_status("O2", OrderStatus::Delivered, t(33)).unwrap();

        assert!(coordinator.complete(&h.handover_id, &mut ledger, t(40)).is_err());
        assert_eq!(ledger.get("O1").unwrap().driver_id.as_deref(), Some("D1"));
        assert_eq!(
            coordinator.get(&h.handover_id).unwrap().status,
            HandoverStatus::InProgress
        );
    }
}
