// ==========================================
// 配送调度核心 - 内存 Repository
// ==========================================
// 用途: 单元/集成测试与无持久化运行
// 故障开关: set_unavailable(true) 后所有写操作返回 Unavailable
// ==========================================

use crate::domain::{Cluster, Driver, Handover, MeetingPoint, Order, OrderStatus, OrderStatusChange};
use crate::repository::dispatch_repo::{DispatchRepository, OrderAssignment};
use crate::repository::error::{RepositoryError, RepositoryResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MemoryState {
    orders: BTreeMap<String, Order>,
    history: Vec<OrderStatusChange>,
    clusters: BTreeMap<String, (Cluster, Vec<OrderAssignment>)>,
    drivers: BTreeMap<String, Driver>,
    meeting_points: BTreeMap<String, MeetingPoint>,
    handovers: BTreeMap<String, Handover>,
}

#[derive(Debug, Default)]
pub struct InMemoryDispatchRepository {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl InMemoryDispatchRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开/关闭故障开关
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> RepositoryResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn lock_for_write(&self, operation: &str) -> RepositoryResult<MutexGuard<'_, MemoryState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable(format!(
                "内存仓储已关闭: {}",
                operation
            )));
        }
        self.lock()
    }

    // ===== 测试观察接口 =====

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.lock().ok()?.orders.get(order_id).cloned()
    }

    pub fn handover(&self, handover_id: &str) -> Option<Handover> {
        self.lock().ok()?.handovers.get(handover_id).cloned()
    }

    pub fn history_of(&self, order_id: &str) -> Vec<OrderStatusChange> {
        self.lock()
            .map(|s| {
                s.history
                    .iter()
                    .filter(|c| c.order_id == order_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn cluster_count(&self) -> usize {
        self.lock().map(|s| s.clusters.len()).unwrap_or(0)
    }
}

fn sort_fifo(orders: &mut [Order]) {
    orders.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.order_id.cmp(&b.order_id))
    });
}

impl DispatchRepository for InMemoryDispatchRepository {
    fn load_pending_orders(&self) -> RepositoryResult<Vec<Order>> {
        let state = self.lock()?;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .cloned()
            .collect();
        sort_fifo(&mut orders);
        Ok(orders)
    }

    fn load_open_orders(&self) -> RepositoryResult<Vec<Order>> {
        let state = self.lock()?;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect();
        sort_fifo(&mut orders);
        Ok(orders)
    }

    fn save_order(&self, order: &Order) -> RepositoryResult<()> {
        let mut state = self.lock_for_write("save_order")?;
        state.orders.insert(order.order_id.clone(), order.clone());
        Ok(())
    }

    fn save_order_status(&self, order_id: &str, status: OrderStatus) -> RepositoryResult<()> {
        let mut state = self.lock_for_write("save_order_status")?;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "Order".to_string(),
                id: order_id.to_string(),
            })?;
        order.status = status;
        Ok(())
    }

    fn append_status_change(&self, change: &OrderStatusChange) -> RepositoryResult<()> {
        let mut state = self.lock_for_write("append_status_change")?;
        state.history.push(change.clone());
        Ok(())
    }

    fn save_cluster_assignment(
        &self,
        cluster: &Cluster,
        assignments: &[OrderAssignment],
    ) -> RepositoryResult<()> {
        let mut state = self.lock_for_write("save_cluster_assignment")?;
        for (order_id, driver_id) in assignments {
            if let Some(order) = state.orders.get_mut(order_id) {
                order.status = OrderStatus::Assigned;
                order.cluster_id = Some(cluster.cluster_id.clone());
                order.driver_id = Some(driver_id.clone());
            }
        }
        state.clusters.insert(
            cluster.cluster_id.clone(),
            (cluster.clone(), assignments.to_vec()),
        );
        Ok(())
    }

    fn load_drivers(&self) -> RepositoryResult<Vec<Driver>> {
        Ok(self.lock()?.drivers.values().cloned().collect())
    }

    fn save_driver(&self, driver: &Driver) -> RepositoryResult<()> {
        let mut state = self.lock_for_write("save_driver")?;
        state.drivers.insert(driver.driver_id.clone(), driver.clone());
        Ok(())
    }

    fn load_meeting_points(&self) -> RepositoryResult<Vec<MeetingPoint>> {
        Ok(self.lock()?.meeting_points.values().cloned().collect())
    }

    fn save_meeting_point(&self, meeting_point: &MeetingPoint) -> RepositoryResult<()> {
        let mut state = self.lock_for_write("save_meeting_point")?;
        state
            .meeting_points
            .insert(meeting_point.meeting_point_id.clone(), meeting_point.clone());
        Ok(())
    }

    fn save_handover(&self, handover: &Handover) -> RepositoryResult<()> {
        let mut state = self.lock_for_write("save_handover")?;
        state
            .handovers
            .insert(handover.handover_id.clone(), handover.clone());
        Ok(())
    }

    fn load_open_handovers(&self) -> RepositoryResult<Vec<Handover>> {
        Ok(self
            .lock()?
            .handovers
            .values()
            .filter(|h| h.is_open())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GeoPoint, PriorityTier};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_fail_switch_blocks_writes_only() {
        let repo = InMemoryDispatchRepository::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let order = Order::new(
            "O1",
            t0,
            PriorityTier::Normal,
            GeoPoint::new(40.0, -74.0),
            GeoPoint::new(40.01, -74.01),
        );
        repo.save_order(&order).unwrap();

        repo.set_unavailable(true);
        assert!(matches!(
            repo.save_order_status("O1", OrderStatus::Cancelled),
            Err(RepositoryError::Unavailable(_))
        ));
        assert_eq!(repo.load_pending_orders().unwrap().len(), 1);

        repo.set_unavailable(false);
        repo.save_order_status("O1", OrderStatus::Cancelled).unwrap();
        assert!(repo.load_open_orders().unwrap().is_empty());
    }
}
