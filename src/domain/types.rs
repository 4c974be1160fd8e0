// ==========================================
// 配送调度核心 - 领域类型定义
// ==========================================
// 红线: 状态是封闭枚举 + 显式转换表,不接受任意字符串状态
// 序列化格式: snake_case (与存储层一致)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ==========================================
// 订单状态 (Order Status)
// ==========================================
// 主序列: pending -> clustered -> assigned -> in_transit -> delivered
// failed / cancelled: 任意非终态可达,且只可达一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,   // 待派
    Clustered, // 已聚类
    Assigned,  // 已派单
    InTransit, // 配送中
    Delivered, // 已送达
    Failed,    // 失败
    Cancelled, // 已取消
}

/// 主序列上允许的转换（不含 failed/cancelled）
///
/// clustered -> pending 是唯一的回退边: 聚类后未能派出的订单重新排队,
/// 排位不变。
const ORDER_FORWARD_TRANSITIONS: &[(OrderStatus, OrderStatus)] = &[
    (OrderStatus::Pending, OrderStatus::Clustered),
    (OrderStatus::Clustered, OrderStatus::Assigned),
    (OrderStatus::Clustered, OrderStatus::Pending),
    (OrderStatus::Assigned, OrderStatus::InTransit),
    (OrderStatus::InTransit, OrderStatus::Delivered),
];

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Pending,
        OrderStatus::Clustered,
        OrderStatus::Assigned,
        OrderStatus::InTransit,
        OrderStatus::Delivered,
        OrderStatus::Failed,
        OrderStatus::Cancelled,
    ];

    /// 是否终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Failed | OrderStatus::Cancelled
        )
    }

    /// 是否占用司机运力（计入 workload）
    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Assigned | OrderStatus::InTransit)
    }

    /// 查询转换表
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, OrderStatus::Failed | OrderStatus::Cancelled) {
            return true;
        }
        ORDER_FORWARD_TRANSITIONS
            .iter()
            .any(|(from, to)| *from == *self && *to == next)
    }

    /// 转换为数据库存储的字符串
    pub fn to_db_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Clustered => "clustered",
            OrderStatus::Assigned => "assigned",
            OrderStatus::InTransit => "in_transit",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "clustered" => Ok(OrderStatus::Clustered),
            "assigned" => Ok(OrderStatus::Assigned),
            "in_transit" | "intransit" => Ok(OrderStatus::InTransit),
            "delivered" => Ok(OrderStatus::Delivered),
            "failed" => Ok(OrderStatus::Failed),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("未知订单状态: {}", other)),
        }
    }
}

// ==========================================
// 优先级 (Priority Tier)
// ==========================================
// 顺序: Low < Normal < High < Urgent
// 权重由 FairnessPolicy 配置,这里不写死数值
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Low,
    Normal,
    High,
    Urgent,
}

impl PriorityTier {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            PriorityTier::Low => "low",
            PriorityTier::Normal => "normal",
            PriorityTier::High => "high",
            PriorityTier::Urgent => "urgent",
        }
    }
}

impl Default for PriorityTier {
    fn default() -> Self {
        PriorityTier::Normal
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_str())
    }
}

impl FromStr for PriorityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(PriorityTier::Low),
            // 源数据中存在 "Medium" 写法,按 normal 处理
            "normal" | "medium" | "standard" => Ok(PriorityTier::Normal),
            "high" => Ok(PriorityTier::High),
            "urgent" => Ok(PriorityTier::Urgent),
            other => Err(format!("未知优先级: {}", other)),
        }
    }
}

// ==========================================
// 交接状态 (Handover Status)
// ==========================================
// pending -> in_progress -> completed
// pending / in_progress -> cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoverStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl HandoverStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandoverStatus::Completed | HandoverStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: HandoverStatus) -> bool {
        matches!(
            (self, next),
            (HandoverStatus::Pending, HandoverStatus::InProgress)
                | (HandoverStatus::InProgress, HandoverStatus::Completed)
                | (HandoverStatus::Pending, HandoverStatus::Cancelled)
                | (HandoverStatus::InProgress, HandoverStatus::Cancelled)
        )
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            HandoverStatus::Pending => "pending",
            HandoverStatus::InProgress => "in_progress",
            HandoverStatus::Completed => "completed",
            HandoverStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for HandoverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_str())
    }
}

impl FromStr for HandoverStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(HandoverStatus::Pending),
            "in_progress" => Ok(HandoverStatus::InProgress),
            "completed" => Ok(HandoverStatus::Completed),
            "cancelled" => Ok(HandoverStatus::Cancelled),
            other => Err(format!("未知交接状态: {}", other)),
        }
    }
}

// ==========================================
// 聚类方法 (Clustering Method)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringMethod {
    ThresholdRadius, // 阈值半径贪心分组
    KMeans,          // 确定性 k-means
    Grid,            // 经纬度网格分箱
}

impl ClusteringMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusteringMethod::ThresholdRadius => "threshold_radius",
            ClusteringMethod::KMeans => "k_means",
            ClusteringMethod::Grid => "grid",
        }
    }
}

impl Default for ClusteringMethod {
    fn default() -> Self {
        ClusteringMethod::ThresholdRadius
    }
}

impl FromStr for ClusteringMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "threshold_radius" | "threshold-radius" | "radius" => {
                Ok(ClusteringMethod::ThresholdRadius)
            }
            "k_means" | "kmeans" | "k-means" => Ok(ClusteringMethod::KMeans),
            "grid" => Ok(ClusteringMethod::Grid),
            other => Err(format!("未知聚类方法: {}", other)),
        }
    }
}

// ==========================================
// 会合点目标函数 (Detour Objective)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetourObjective {
    Sum, // 两司机绕行之和最小
    Max, // 两司机绕行最大值最小
}

impl DetourObjective {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetourObjective::Sum => "sum",
            DetourObjective::Max => "max",
        }
    }

    /// 按目标函数合成两段绕行距离
    pub fn combine(&self, a_km: f64, b_km: f64) -> f64 {
        match self {
            DetourObjective::Sum => a_km + b_km,
            DetourObjective::Max => a_km.max(b_km),
        }
    }
}

impl Default for DetourObjective {
    fn default() -> Self {
        DetourObjective::Sum
    }
}

impl FromStr for DetourObjective {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sum" => Ok(DetourObjective::Sum),
            "max" => Ok(DetourObjective::Max),
            other => Err(format!("未知绕行目标: {}", other)),
        }
    }
}
