// ==========================================
// 配送调度核心 - 订单台账 (OrderLedger)
// ==========================================
// 职责: 订单状态与 FIFO 排位的唯一所有者
// 红线: 订单状态只能经由本模块修改（单写者）
// 红线: 终态订单不得重新入账
// ==========================================
// 排序键（稳定全序）:
// 1) 超过公平上限 (fairness ceiling) 的订单在前
// 2) 入账时间窗 (admission window) 升序
// 3) 优先级权重降序
// 4) created_at 升序
// 5) order_id 升序
// 若配置了 max_rank_advance_positions = N,则在各自的上限分组内
// 按贪心方式输出: 任何订单都不会比其纯 FIFO 位置提前超过 N 位。
// ==========================================

use crate::config::dispatch_config::FairnessPolicy;
use crate::domain::{Cluster, Order, OrderStatus, OrderStatusChange, PriorDriver};
use crate::engine::error::{DispatchError, DispatchResult};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

#[cfg(test)]
mod tests;

// ==========================================
// LedgerSnapshot - 派单轮次输入快照
// ==========================================
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub status_epoch: u64,
    pub taken_at: DateTime<Utc>,
    /// pending 订单,按公平排序（下标即排位）
    pub pending: Vec<Order>,
    /// driver_id -> 进行中订单数
    pub workloads: HashMap<String, u32>,
}

impl LedgerSnapshot {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ==========================================
// OrderLedger
// ==========================================
pub struct OrderLedger {
    orders: HashMap<String, Order>,
    history: HashMap<String, Vec<OrderStatusChange>>,
    policy: FairnessPolicy,
    next_seq: u64,
    status_epoch: u64,
}

impl OrderLedger {
    pub fn new(policy: FairnessPolicy) -> Self {
        Self {
            orders: HashMap::new(),
            history: HashMap::new(),
            policy,
            next_seq: 0,
            status_epoch: 0,
        }
    }

    // ==========================================
    // 入账
    // ==========================================

    /// 新订单入账
    ///
    /// # 返回
    /// - Ok(rank): 该订单在 pending 集合中的纯 FIFO 排位（0 起）
    /// - Err(DuplicateOrder): order_id 已存在
    /// - Err(InvalidTransition): 订单已是终态
    /// - Err(Validation): 新订单状态不是 pending
    pub fn enqueue(&mut self, mut order: Order) -> DispatchResult<usize> {
        if self.orders.contains_key(&order.order_id) {
            return Err(DispatchError::DuplicateOrder(order.order_id));
        }
        if order.status.is_terminal() {
            return Err(DispatchError::InvalidTransition {
                entity: "order",
                id: order.order_id,
                from: order.status.to_string(),
                to: OrderStatus::Pending.to_string(),
            });
        }
        if order.status != OrderStatus::Pending {
            return Err(DispatchError::Validation(format!(
                "新订单 {} 状态必须为 pending, 实际为 {}",
                order.order_id, order.status
            )));
        }

        order.admission_seq = Some(self.next_seq);
        self.next_seq += 1;

        let rank = self.rank_before(&order);

        tracing::debug!(order_id = %order.order_id, rank, "订单入账");
        self.orders.insert(order.order_id.clone(), order);
        Ok(rank)
    }

    /// 启动恢复: 按原状态装载非终态订单,不记历史、不推进 epoch
    pub fn restore(&mut self, mut order: Order) -> DispatchResult<()> {
        if order.status.is_terminal() {
            return Err(DispatchError::InvalidTransition {
                entity: "order",
                id: order.order_id,
                from: order.status.to_string(),
                to: OrderStatus::Pending.to_string(),
            });
        }
        if self.orders.contains_key(&order.order_id) {
            return Err(DispatchError::DuplicateOrder(order.order_id));
        }
        order.admission_seq = Some(self.next_seq);
        self.next_seq += 1;
        self.orders.insert(order.order_id.clone(), order);
        Ok(())
    }

    // ==========================================
    // 查询
    // ==========================================

    /// 按公平排序返回前 limit 个 pending 订单
    pub fn peek_fifo(&self, limit: usize, now: DateTime<Utc>) -> Vec<Order> {
        let mut ordered = self.fairness_order(now);
        ordered.truncate(limit);
        ordered.into_iter().cloned().collect()
    }

    /// 当前公平策略
    pub fn reorder_window(&self) -> &FairnessPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: FairnessPolicy) {
        self.policy = policy;
    }

    /// pending 订单的纯 FIFO 排位（0 起）; 订单不存在或不在 pending 返回 None
    pub fn fifo_rank(&self, order_id: &str) -> Option<usize> {
        self.orders
            .get(order_id)
            .filter(|o| o.status == OrderStatus::Pending)
            .map(|o| self.rank_before(o))
    }

    fn rank_before(&self, order: &Order) -> usize {
        self.orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.order_id != order.order_id)
            .filter(|o| fifo_cmp(o, order) == Ordering::Less)
            .count()
    }

    pub fn get(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    /// 按给定顺序返回订单副本,缺失的 id 被跳过
    pub fn orders_by_ids(&self, order_ids: &[String]) -> Vec<Order> {
        order_ids
            .iter()
            .filter_map(|id| self.orders.get(id).cloned())
            .collect()
    }

    /// 司机进行中订单数（assigned + in_transit）
    pub fn workload_of(&self, driver_id: &str) -> u32 {
        self.orders
            .values()
            .filter(|o| o.status.is_active() && o.driver_id.as_deref() == Some(driver_id))
            .count() as u32
    }

    /// 全部司机的进行中订单数
    pub fn workloads(&self) -> HashMap<String, u32> {
        let mut map = HashMap::new();
        for order in self.orders.values().filter(|o| o.status.is_active()) {
            if let Some(driver_id) = &order.driver_id {
                *map.entry(driver_id.clone()).or_insert(0) += 1;
            }
        }
        map
    }

    pub fn history(&self, order_id: &str) -> &[OrderStatusChange] {
        self.history
            .get(order_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn pending_count(&self) -> usize {
        self.orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// 各状态订单数（按 OrderStatus::ALL 顺序,包含 0）
    pub fn status_counts(&self) -> Vec<(OrderStatus, usize)> {
        OrderStatus::ALL
            .iter()
            .map(|status| {
                let n = self.orders.values().filter(|o| o.status == *status).count();
                (*status, n)
            })
            .collect()
    }

    pub fn status_epoch(&self) -> u64 {
        self.status_epoch
    }

    /// 派单轮次快照
    pub fn snapshot(&self, now: DateTime<Utc>) -> LedgerSnapshot {
        LedgerSnapshot {
            status_epoch: self.status_epoch,
            taken_at: now,
            pending: self.fairness_order(now).into_iter().cloned().collect(),
            workloads: self.workloads(),
        }
    }

    // ==========================================
    // 状态变更
    // ==========================================

    /// 单个订单状态转换
    ///
    /// # 返回
    /// - Err(NotFound): 订单不存在
    /// - Err(InvalidTransition): 违反状态转换表
    pub fn mark_status(
        &mut self,
        order_id: &str,
        new_status: OrderStatus,
        now: DateTime<Utc>,
    ) -> DispatchResult<OrderStatusChange> {
        let order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| DispatchError::NotFound {
                entity: "order",
                id: order_id.to_string(),
            })?;

        if !order.status.can_transition_to(new_status) {
            return Err(DispatchError::InvalidTransition {
                entity: "order",
                id: order_id.to_string(),
                from: order.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let from = order.status;
        order.status = new_status;
        if new_status == OrderStatus::Pending {
            // 回退到 pending 时释放聚类
            order.cluster_id = None;
        }

        let change = OrderStatusChange {
            order_id: order_id.to_string(),
            from_status: from,
            to_status: new_status,
            driver_id: order.driver_id.clone(),
            changed_at: now,
            note: None,
        };
        self.push_history(change.clone());
        self.status_epoch += 1;

        tracing::info!(order_id, from = %from, to = %new_status, "订单状态变更");
        Ok(change)
    }

    /// 提交一次派单轮次
    ///
    /// 已落位订单依次经过 pending -> clustered -> assigned;
    /// 未落位订单保持 pending,cluster_id 保持为空。
    ///
    /// # 返回
    /// - Err(StalePass): 快照之后台账状态已变化
    /// - Ok(changes): 本次提交产生的状态变更记录
    pub fn commit_pass(
        &mut self,
        snapshot_epoch: u64,
        clusters: &[Cluster],
        assignments: &[(String, String)],
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<OrderStatusChange>> {
        if snapshot_epoch != self.status_epoch {
            return Err(DispatchError::StalePass {
                snapshot_epoch,
                current_epoch: self.status_epoch,
            });
        }

        let cluster_of: HashMap<&str, &str> = clusters
            .iter()
            .flat_map(|c| {
                c.member_ids
                    .iter()
                    .map(move |id| (id.as_str(), c.cluster_id.as_str()))
            })
            .collect();

        // 先整体校验,再统一落账
        for (order_id, _) in assignments {
            let order = self
                .orders
                .get(order_id)
                .ok_or_else(|| DispatchError::NotFound {
                    entity: "order",
                    id: order_id.clone(),
                })?;
            if order.status != OrderStatus::Pending {
                return Err(DispatchError::StalePass {
                    snapshot_epoch,
                    current_epoch: self.status_epoch,
                });
            }
            if !cluster_of.contains_key(order_id.as_str()) {
                return Err(DispatchError::Validation(format!(
                    "订单 {} 不属于本轮任何聚类",
                    order_id
                )));
            }
        }

        let mut changes = Vec::with_capacity(assignments.len() * 2);
        for (order_id, driver_id) in assignments {
            let cluster_id = cluster_of
                .get(order_id.as_str())
                .map(|s| s.to_string());
            if let Some(order) = self.orders.get_mut(order_id) {
                order.cluster_id = cluster_id;
                order.status = OrderStatus::Clustered;
                changes.push(OrderStatusChange {
                    order_id: order_id.clone(),
                    from_status: OrderStatus::Pending,
                    to_status: OrderStatus::Clustered,
                    driver_id: None,
                    changed_at: now,
                    note: order.cluster_id.clone(),
                });

                order.driver_id = Some(driver_id.clone());
                order.status = OrderStatus::Assigned;
                changes.push(OrderStatusChange {
                    order_id: order_id.clone(),
                    from_status: OrderStatus::Clustered,
                    to_status: OrderStatus::Assigned,
                    driver_id: Some(driver_id.clone()),
                    changed_at: now,
                    note: None,
                });
            }
        }

        for change in &changes {
            self.push_history(change.clone());
        }
        if !assignments.is_empty() {
            self.status_epoch += 1;
        }
        Ok(changes)
    }

    /// 交接完成: 批量改派订单（全部成功或全部不变）
    ///
    /// 订单状态不变,仅 driver 变化,每单追加一条历史记录。
    pub fn reassign_for_handover(
        &mut self,
        order_ids: &[String],
        from_driver_id: &str,
        to_driver_id: &str,
        handover_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<OrderStatusChange>> {
        for order_id in order_ids {
            let order = self
                .orders
                .get(order_id)
                .ok_or_else(|| DispatchError::NotFound {
                    entity: "order",
                    id: order_id.clone(),
                })?;
            if !order.status.is_active() {
                return Err(DispatchError::InvalidTransition {
                    entity: "order",
                    id: order_id.clone(),
                    from: order.status.to_string(),
                    to: order.status.to_string(),
                });
            }
            if order.driver_id.as_deref() != Some(from_driver_id) {
                return Err(DispatchError::Validation(format!(
                    "订单 {} 当前不属于司机 {}",
                    order_id, from_driver_id
                )));
            }
        }

        let mut changes = Vec::with_capacity(order_ids.len());
        for order_id in order_ids {
            if let Some(order) = self.orders.get_mut(order_id) {
                order.driver_id = Some(to_driver_id.to_string());
                changes.push(OrderStatusChange {
                    order_id: order_id.clone(),
                    from_status: order.status,
                    to_status: order.status,
                    driver_id: Some(to_driver_id.to_string()),
                    changed_at: now,
                    note: Some(format!("handover {}", handover_id)),
                });
            }
        }
        for change in &changes {
            self.push_history(change.clone());
        }
        self.status_epoch += 1;

        tracing::info!(
            handover_id,
            from = from_driver_id,
            to = to_driver_id,
            count = changes.len(),
            "交接改派完成"
        );
        Ok(changes)
    }

    /// 交接取消: 恢复排期时记录的订单归属
    ///
    /// 已进入终态或不存在的订单跳过; 归属未变的订单不记历史。
    pub fn restore_drivers(
        &mut self,
        prior: &[PriorDriver],
        handover_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<OrderStatusChange> {
        let mut changes = Vec::new();
        for entry in prior {
            let Some(order) = self.orders.get_mut(&entry.order_id) else {
                continue;
            };
            if order.status.is_terminal() || order.driver_id == entry.driver_id {
                continue;
            }
            order.driver_id = entry.driver_id.clone();
            changes.push(OrderStatusChange {
                order_id: entry.order_id.clone(),
                from_status: order.status,
                to_status: order.status,
                driver_id: entry.driver_id.clone(),
                changed_at: now,
                note: Some(format!("handover {} cancelled", handover_id)),
            });
        }
        if !changes.is_empty() {
            for change in &changes {
                self.push_history(change.clone());
            }
            self.status_epoch += 1;
        }
        changes
    }

    fn push_history(&mut self, change: OrderStatusChange) {
        self.history
            .entry(change.order_id.clone())
            .or_default()
            .push(change);
    }

    // ==========================================
    // 公平排序
    // ==========================================

    fn is_past_ceiling(&self, order: &Order, now: DateTime<Utc>) -> bool {
        order.age(now) > self.policy.fairness_ceiling()
    }

    fn admission_window(&self, order: &Order) -> i64 {
        match self.policy.rank_advance_secs {
            Some(secs) if secs > 0 => order.created_at.timestamp().div_euclid(secs),
            _ => 0,
        }
    }

    /// 同一上限分组内的排序键比较
    fn class_cmp(&self, a: &Order, b: &Order) -> Ordering {
        let weights = &self.policy.priority_weights;
        self.admission_window(a)
            .cmp(&self.admission_window(b))
            .then_with(|| weights.weight_of(b.priority).cmp(&weights.weight_of(a.priority)))
            .then_with(|| fifo_cmp(a, b))
    }

    fn fairness_order(&self, now: DateTime<Utc>) -> Vec<&Order> {
        let mut pending: Vec<&Order> = self
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .collect();
        pending.sort_by(|a, b| fifo_cmp(a, b));

        let (past, within): (Vec<&Order>, Vec<&Order>) = pending
            .into_iter()
            .partition(|o| self.is_past_ceiling(o, now));

        let mut ordered = self.order_class(past);
        ordered.extend(self.order_class(within));
        ordered
    }

    /// 对一个上限分组排序（输入为纯 FIFO 顺序）
    fn order_class<'a>(&self, fifo: Vec<&'a Order>) -> Vec<&'a Order> {
        match self.policy.max_rank_advance_positions {
            None => {
                let mut sorted = fifo;
                sorted.sort_by(|a, b| self.class_cmp(a, b));
                sorted
            }
            Some(max_advance) => {
                // 贪心: 第 p 个输出位置只从 FIFO 下标 <= p + N 的剩余订单中选最优
                let mut remaining: Vec<(usize, &'a Order)> = fifo.into_iter().enumerate().collect();
                let mut out = Vec::with_capacity(remaining.len());
                let mut position = 0usize;
                while !remaining.is_empty() {
                    let horizon = position.saturating_add(max_advance);
                    let best = remaining
                        .iter()
                        .enumerate()
                        .filter(|(_, (fifo_idx, _))| *fifo_idx <= horizon)
                        .min_by(|(_, (_, a)), (_, (_, b))| self.class_cmp(a, b))
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    out.push(remaining.remove(best).1);
                    position += 1;
                }
                out
            }
        }
    }
}

/// 纯 FIFO 比较: created_at 升序, order_id 升序
pub fn fifo_cmp(a: &Order, b: &Order) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.order_id.cmp(&b.order_id))
}

/// 订单 id 集合中是否有重复
pub(crate) fn has_duplicates(ids: &[String]) -> bool {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().any(|id| !seen.insert(id.as_str()))
}
