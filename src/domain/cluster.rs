// ==========================================
// 配送调度核心 - 聚类领域模型
// ==========================================
// 红线: member_ids 按 FIFO 排位追加,单次聚类内只追加不剔除
// 红线: 聚类提交后成员不可变,直到下一次聚类
// ==========================================

use crate::domain::geo::GeoPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: String,
    pub pass_id: String,          // 所属派单轮次
    pub centroid: GeoPoint,
    pub radius_km: f64,           // 成员到质心的最大距离
    pub member_ids: Vec<String>,  // FIFO 顺序
    pub oldest_rank: usize,       // 最早成员的 FIFO 排位
    pub average_rank: f64,        // 成员平均 FIFO 排位
    pub created_at: DateTime<Utc>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.member_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.member_ids.iter().any(|id| id == order_id)
    }
}
