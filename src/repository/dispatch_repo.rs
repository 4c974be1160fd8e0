// ==========================================
// 配送调度核心 - 调度数据 Repository Trait
// ==========================================
// 职责: 定义调度核心所需的窄持久化接口（不包含业务逻辑）
// 红线: Repository 不含业务规则，只做数据读写
// 实现者: SqliteDispatchRepository / InMemoryDispatchRepository
// ==========================================

use crate::domain::{Cluster, Driver, Handover, MeetingPoint, Order, OrderStatus, OrderStatusChange};
use crate::repository::error::RepositoryResult;

/// 单条派单落位: (order_id, driver_id)
pub type OrderAssignment = (String, String);

pub trait DispatchRepository: Send + Sync {
    // ===== 订单 =====

    /// 读取全部 pending 订单（按 created_at, order_id 升序）
    fn load_pending_orders(&self) -> RepositoryResult<Vec<Order>>;

    /// 读取全部非终态订单（启动时重建台账）
    fn load_open_orders(&self) -> RepositoryResult<Vec<Order>>;

    /// 新增或整行覆盖订单
    fn save_order(&self, order: &Order) -> RepositoryResult<()>;

    /// 仅更新订单状态
    fn save_order_status(&self, order_id: &str, status: OrderStatus) -> RepositoryResult<()>;

    /// 追加状态变更记录
    fn append_status_change(&self, change: &OrderStatusChange) -> RepositoryResult<()>;

    // ===== 聚类与派单 =====

    /// 保存一个聚类及其成员的派单结果（单事务）
    ///
    /// # 参数
    /// - cluster: 聚类（成员按 FIFO 顺序）
    /// - assignments: 本聚类内已落位的 (order_id, driver_id)
    fn save_cluster_assignment(
        &self,
        cluster: &Cluster,
        assignments: &[OrderAssignment],
    ) -> RepositoryResult<()>;

    // ===== 司机 =====

    fn load_drivers(&self) -> RepositoryResult<Vec<Driver>>;

    fn save_driver(&self, driver: &Driver) -> RepositoryResult<()>;

    // ===== 会合点与交接 =====

    /// 读取全部固定会合点（含停用）
    fn load_meeting_points(&self) -> RepositoryResult<Vec<MeetingPoint>>;

    fn save_meeting_point(&self, meeting_point: &MeetingPoint) -> RepositoryResult<()>;

    /// 新增或覆盖交接记录
    fn save_handover(&self, handover: &Handover) -> RepositoryResult<()>;

    /// 读取全部未结束的交接
    fn load_open_handovers(&self) -> RepositoryResult<Vec<Handover>>;
}
