// ==========================================
// 配送调度核心 - 调度配置
// ==========================================
// 职责: 汇总所有可调参数,提供默认值与校验
// 存储口径: 时长以秒/毫秒整数存储,读取时转换为 chrono / std Duration
// 红线: 公平性边界不写死,全部来自 FairnessPolicy
// ==========================================

use crate::domain::types::{ClusteringMethod, DetourObjective, PriorityTier};
use serde::{Deserialize, Serialize};

/// 时长类参数上限（一年）
pub const MAX_DURATION_SECS: i64 = 365 * 24 * 60 * 60;

/// 秒数转 chrono 时长,超出可表示范围时饱和
fn seconds(secs: i64) -> chrono::Duration {
    chrono::Duration::try_seconds(secs).unwrap_or(if secs < 0 {
        chrono::Duration::MIN
    } else {
        chrono::Duration::MAX
    })
}

// ==========================================
// PriorityWeights - 优先级权重
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub low: i32,
    pub normal: i32,
    pub high: i32,
    pub urgent: i32,
}

impl PriorityWeights {
    pub fn weight_of(&self, tier: PriorityTier) -> i32 {
        match tier {
            PriorityTier::Low => self.low,
            PriorityTier::Normal => self.normal,
            PriorityTier::High => self.high,
            PriorityTier::Urgent => self.urgent,
        }
    }
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            low: 0,
            normal: 1,
            high: 2,
            urgent: 3,
        }
    }
}

// ==========================================
// FairnessPolicy - 有界优先级反转策略
// ==========================================
// 规则:
// 1. 等待超过 fairness_ceiling 的订单一律排在未超限订单之前
// 2. rank_advance_secs: 优先级只能在同一时间窗内前移（时间等价上限）
// 3. max_rank_advance_positions: 相对纯 FIFO 位置最多前移 N 位
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairnessPolicy {
    pub fairness_ceiling_secs: i64,
    pub rank_advance_secs: Option<i64>,
    pub max_rank_advance_positions: Option<usize>,
    pub priority_weights: PriorityWeights,
}

impl FairnessPolicy {
    pub fn fairness_ceiling(&self) -> chrono::Duration {
        seconds(self.fairness_ceiling_secs)
    }

    pub fn rank_advance(&self) -> Option<chrono::Duration> {
        self.rank_advance_secs.map(seconds)
    }
}

impl Default for FairnessPolicy {
    fn default() -> Self {
        Self {
            fairness_ceiling_secs: 30 * 60,
            rank_advance_secs: None,
            max_rank_advance_positions: None,
            priority_weights: PriorityWeights::default(),
        }
    }
}

// ==========================================
// ClusteringConfig - 聚类参数
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringConfig {
    pub method: ClusteringMethod,
    pub num_clusters: usize,          // k_means 的 k
    pub proximity_threshold_km: f64,  // threshold_radius 的半径
    pub overlap_distance_km: f64,     // 边界订单判定距离
    pub min_orders_per_pass: usize,
    pub max_cluster_size: Option<usize>,
    pub grid_cell_deg: f64,           // grid 网格边长（度）
    pub kmeans_max_iterations: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            method: ClusteringMethod::ThresholdRadius,
            num_clusters: 5,
            proximity_threshold_km: 3.0,
            overlap_distance_km: 0.5,
            min_orders_per_pass: 1,
            max_cluster_size: None,
            grid_cell_deg: 0.02,
            kmeans_max_iterations: 50,
        }
    }
}

// ==========================================
// AssignmentConfig - 派单参数
// ==========================================
// 综合成本（越小越好）:
//   w_distance * km + w_capacity * (1 / remaining) + w_workload * (workload / capacity)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentConfig {
    pub weight_distance: f64,
    pub weight_capacity: f64,
    pub weight_workload: f64,
    pub balancing_threshold: f64,
    pub service_radius_km: f64,
    pub default_driver_capacity: u32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            weight_distance: 1.0,
            weight_capacity: 0.5,
            weight_workload: 1.0,
            balancing_threshold: 0.5,
            service_radius_km: 15.0,
            default_driver_capacity: 3,
        }
    }
}

// ==========================================
// TrackingConfig - 定位样本保留
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub retention_horizon_secs: i64,
}

impl TrackingConfig {
    pub fn retention_horizon(&self) -> chrono::Duration {
        seconds(self.retention_horizon_secs)
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            retention_horizon_secs: 15 * 60,
        }
    }
}

// ==========================================
// MeetingPointConfig - 会合点参数
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingPointConfig {
    pub max_detour_km: f64,       // 单个司机绕行上限
    pub tolerance_radius_km: f64, // 固定会合点搜索半径
    pub objective: DetourObjective,
    pub lookahead_secs: i64,      // 轨迹外推时长
}

impl MeetingPointConfig {
    pub fn lookahead(&self) -> chrono::Duration {
        seconds(self.lookahead_secs)
    }
}

impl Default for MeetingPointConfig {
    fn default() -> Self {
        Self {
            max_detour_km: 3.0,
            tolerance_radius_km: 2.0,
            objective: DetourObjective::Sum,
            lookahead_secs: 10 * 60,
        }
    }
}

// ==========================================
// RuntimeConfig - 运行时参数
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub pass_interval_secs: Option<u64>, // None = 仅显式触发
    pub pass_timeout_ms: u64,
    pub channel_capacity: usize,
}

impl RuntimeConfig {
    pub fn pass_interval(&self) -> Option<std::time::Duration> {
        self.pass_interval_secs
            .filter(|secs| *secs > 0)
            .map(std::time::Duration::from_secs)
    }

    pub fn pass_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.pass_timeout_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pass_interval_secs: None,
            pass_timeout_ms: 5_000,
            channel_capacity: 1024,
        }
    }
}

// ==========================================
// DispatchConfig - 调度配置全集
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub fairness: FairnessPolicy,
    pub clustering: ClusteringConfig,
    pub assignment: AssignmentConfig,
    pub tracking: TrackingConfig,
    pub meeting_point: MeetingPointConfig,
    pub runtime: RuntimeConfig,
}

impl DispatchConfig {
    /// 校验配置取值范围
    ///
    /// # 返回
    /// - Ok(()): 全部合法
    /// - Err(Vec<String>): 所有违规项（中文描述）
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();

        if self.fairness.fairness_ceiling_secs <= 0 {
            violations.push("fairness_ceiling_secs 必须大于 0".to_string());
        }
        if matches!(self.fairness.rank_advance_secs, Some(secs) if secs <= 0) {
            violations.push("rank_advance_secs 必须大于 0".to_string());
        }

        // 时长上限: 防止时间运算溢出
        let max_secs = MAX_DURATION_SECS;
        for (name, secs) in [
            ("fairness_ceiling_secs", Some(self.fairness.fairness_ceiling_secs)),
            ("rank_advance_secs", self.fairness.rank_advance_secs),
            ("retention_horizon_secs", Some(self.tracking.retention_horizon_secs)),
            ("lookahead_secs", Some(self.meeting_point.lookahead_secs)),
            (
                "pass_interval_secs",
                self.runtime
                    .pass_interval_secs
                    .map(|v| i64::try_from(v).unwrap_or(i64::MAX)),
            ),
            (
                "pass_timeout_ms",
                Some(i64::try_from(self.runtime.pass_timeout_ms / 1000).unwrap_or(i64::MAX)),
            ),
        ] {
            if matches!(secs, Some(v) if v > max_secs) {
                violations.push(format!("{} 不能超过 {} 秒", name, max_secs));
            }
        }

        let c = &self.clustering;
        if c.num_clusters == 0 {
            violations.push("num_clusters 必须大于 0".to_string());
        }
        if !(c.proximity_threshold_km > 0.0) {
            violations.push("proximity_threshold_km 必须大于 0".to_string());
        }
        if c.overlap_distance_km < 0.0 {
            violations.push("overlap_distance_km 不能为负".to_string());
        }
        if c.max_cluster_size == Some(0) {
            violations.push("max_cluster_size 不能为 0".to_string());
        }
        if !(c.grid_cell_deg > 0.0) {
            violations.push("grid_cell_deg 必须大于 0".to_string());
        }

        let a = &self.assignment;
        for (name, w) in [
            ("weight_distance", a.weight_distance),
            ("weight_capacity", a.weight_capacity),
            ("weight_workload", a.weight_workload),
            ("balancing_threshold", a.balancing_threshold),
        ] {
            if w < 0.0 || !w.is_finite() {
                violations.push(format!("{} 必须为非负有限数", name));
            }
        }
        if !(a.service_radius_km > 0.0) {
            violations.push("service_radius_km 必须大于 0".to_string());
        }

        if self.tracking.retention_horizon_secs <= 0 {
            violations.push("retention_horizon_secs 必须大于 0".to_string());
        }

        let m = &self.meeting_point;
        if m.max_detour_km < 0.0 {
            violations.push("max_detour_km 不能为负".to_string());
        }
        if m.tolerance_radius_km < 0.0 {
            violations.push("tolerance_radius_km 不能为负".to_string());
        }
        if m.lookahead_secs < 0 {
            violations.push("lookahead_secs 不能为负".to_string());
        }

        if self.runtime.pass_timeout_ms == 0 {
            violations.push("pass_timeout_ms 必须大于 0".to_string());
        }
        if self.runtime.channel_capacity == 0 {
            violations.push("channel_capacity 必须大于 0".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}
