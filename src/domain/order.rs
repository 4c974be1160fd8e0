// ==========================================
// 配送调度核心 - 订单领域模型
// ==========================================
// 红线: created_at 不可变,是 FIFO 排位的唯一时间口径
// 红线: status 只能由 OrderLedger 修改
// ==========================================

use crate::domain::geo::GeoPoint;
use crate::domain::types::{OrderStatus, PriorityTier};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// Order - 配送订单
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    // ===== 主键 =====
    pub order_id: String,

    // ===== FIFO 口径 =====
    pub created_at: DateTime<Utc>,     // 创建时间（不可变）
    pub admission_seq: Option<u64>,    // 入账序号（由 OrderLedger 分配）

    // ===== 状态 =====
    pub status: OrderStatus,
    pub priority: PriorityTier,

    // ===== 地理信息 =====
    pub origin: GeoPoint,      // 取件点（门店/仓库）
    pub destination: GeoPoint, // 送达点（客户）

    // ===== 货物信息（仅展示,不参与调度）=====
    pub items: u32,
    pub weight_kg: f64,

    // ===== 派单落位 =====
    pub cluster_id: Option<String>,
    pub driver_id: Option<String>,
}

impl Order {
    /// 创建待派订单
    pub fn new(
        order_id: impl Into<String>,
        created_at: DateTime<Utc>,
        priority: PriorityTier,
        origin: GeoPoint,
        destination: GeoPoint,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            created_at,
            admission_seq: None,
            status: OrderStatus::Pending,
            priority,
            origin,
            destination,
            items: 1,
            weight_kg: 0.0,
            cluster_id: None,
            driver_id: None,
        }
    }

    /// 订单等待时长（now 早于 created_at 时按 0 计）
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let age = now - self.created_at;
        if age < Duration::zero() {
            Duration::zero()
        } else {
            age
        }
    }

    /// 是否为同一次下单（忽略台账分配的序号与派单落位）
    pub fn same_submission(&self, other: &Order) -> bool {
        self.order_id == other.order_id
            && self.created_at == other.created_at
            && self.priority == other.priority
            && self.origin == other.origin
            && self.destination == other.destination
            && self.items == other.items
            && self.weight_kg == other.weight_kg
    }

    /// 坐标是否可用于聚类
    pub fn has_valid_coordinates(&self) -> bool {
        self.origin.is_valid() && self.destination.is_valid()
    }
}

// ==========================================
// OrderStatusChange - 订单状态/落位变更记录
// ==========================================
// 用途: 审计追踪; 交接完成时 from == to,仅 driver 变化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusChange {
    pub order_id: String,
    pub from_status: OrderStatus,
    pub to_status: OrderStatus,
    pub driver_id: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub note: Option<String>,
}
