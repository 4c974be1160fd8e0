// ==========================================
// 配送调度核心 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (scope_id + key + value)
// 口径: 缺失或格式错误的键回退默认值并告警
// ==========================================

use crate::config::config_reader_trait::{ConfigReadError, DispatchConfigReader};
use crate::config::dispatch_config::{
    AssignmentConfig, ClusteringConfig, FairnessPolicy, MeetingPointConfig, PriorityWeights,
    RuntimeConfig, TrackingConfig,
};
use crate::db::open_sqlite_connection;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::json;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> Result<Self, ConfigReadError> {
        let conn = open_sqlite_connection(db_path)?;
        crate::db::ensure_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self, ConfigReadError> {
        {
            let conn_guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
            crate::db::ensure_schema(&conn_guard)?;
        }

        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    fn get_config_value(&self, key: &str) -> Result<Option<String>, ConfigReadError> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    /// 读取 global scope 的配置值（公开方法，供其他模块复用）
    pub fn get_global_config_value(&self, key: &str) -> Result<Option<String>, ConfigReadError> {
        self.get_config_value(key)
    }

    /// 写入 global scope 的配置值（UPSERT）
    pub fn set_global_config_value(&self, key: &str, value: &str) -> Result<(), ConfigReadError> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    /// 读取并解析配置,缺失时用默认值,格式错误时告警后用默认值
    fn get_parsed_or_default<T>(&self, key: &str, default: T) -> Result<T, ConfigReadError>
    where
        T: FromStr + Display,
    {
        match self.get_config_value(key)? {
            None => Ok(default),
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(v) => Ok(v),
                Err(_) => {
                    tracing::warn!(
                        config_key = key,
                        raw_value = %raw,
                        default = %default,
                        "配置格式错误，使用默认值"
                    );
                    Ok(default)
                }
            },
        }
    }

    /// 读取可选数值配置: 缺失、空串、"none"、"0" 均视为未配置
    fn get_optional<T>(&self, key: &str, default: Option<T>) -> Result<Option<T>, ConfigReadError>
    where
        T: FromStr + PartialEq + Default,
    {
        let raw = match self.get_config_value(key)? {
            None => return Ok(default),
            Some(raw) => raw,
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        match trimmed.parse::<T>() {
            Ok(v) if v == T::default() => Ok(None),
            Ok(v) => Ok(Some(v)),
            Err(_) => {
                tracing::warn!(
                    config_key = key,
                    raw_value = %raw,
                    "可选配置格式错误，按未配置处理"
                );
                Ok(default)
            }
        }
    }

    /// 获取所有配置的快照（JSON格式）
    ///
    /// # 用途
    /// - 服务启动时记录生效配置
    pub fn get_config_snapshot(&self) -> Result<String, ConfigReadError> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let mut stmt =
            conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")?;

        let mut config_map: HashMap<String, String> = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (key, value) = row?;
            config_map.insert(key, value);
        }

        let json_value = json!(config_map);
        Ok(serde_json::to_string(&json_value)?)
    }
}

// ==========================================
// DispatchConfigReader Trait 实现
// ==========================================
#[async_trait]
impl DispatchConfigReader for ConfigManager {
    async fn get_fairness_policy(&self) -> Result<FairnessPolicy, ConfigReadError> {
        let d = FairnessPolicy::default();
        let w = d.priority_weights;
        Ok(FairnessPolicy {
            fairness_ceiling_secs: self
                .get_parsed_or_default(config_keys::FAIRNESS_CEILING_SECS, d.fairness_ceiling_secs)?,
            rank_advance_secs: self
                .get_optional(config_keys::RANK_ADVANCE_SECS, d.rank_advance_secs)?,
            max_rank_advance_positions: self.get_optional(
                config_keys::MAX_RANK_ADVANCE_POSITIONS,
                d.max_rank_advance_positions,
            )?,
            priority_weights: PriorityWeights {
                low: self.get_parsed_or_default(config_keys::PRIORITY_WEIGHT_LOW, w.low)?,
                normal: self.get_parsed_or_default(config_keys::PRIORITY_WEIGHT_NORMAL, w.normal)?,
                high: self.get_parsed_or_default(config_keys::PRIORITY_WEIGHT_HIGH, w.high)?,
                urgent: self.get_parsed_or_default(config_keys::PRIORITY_WEIGHT_URGENT, w.urgent)?,
            },
        })
    }

    async fn get_clustering_config(&self) -> Result<ClusteringConfig, ConfigReadError> {
        let d = ClusteringConfig::default();
        let method = match self.get_config_value(config_keys::CLUSTERING_METHOD)? {
            None => d.method,
            Some(raw) => raw.parse().unwrap_or_else(|e: String| {
                tracing::warn!(config_key = config_keys::CLUSTERING_METHOD, error = %e, "聚类方法配置错误，使用默认值");
                d.method
            }),
        };
        Ok(ClusteringConfig {
            method,
            num_clusters: self.get_parsed_or_default(config_keys::NUM_CLUSTERS, d.num_clusters)?,
            proximity_threshold_km: self
                .get_parsed_or_default(config_keys::PROXIMITY_THRESHOLD_KM, d.proximity_threshold_km)?,
            overlap_distance_km: self
                .get_parsed_or_default(config_keys::OVERLAP_DISTANCE_KM, d.overlap_distance_km)?,
            min_orders_per_pass: self
                .get_parsed_or_default(config_keys::MIN_ORDERS_PER_PASS, d.min_orders_per_pass)?,
            max_cluster_size: self.get_optional(config_keys::MAX_CLUSTER_SIZE, d.max_cluster_size)?,
            grid_cell_deg: self.get_parsed_or_default(config_keys::GRID_CELL_DEG, d.grid_cell_deg)?,
            kmeans_max_iterations: self
                .get_parsed_or_default(config_keys::KMEANS_MAX_ITERATIONS, d.kmeans_max_iterations)?,
        })
    }

    async fn get_assignment_config(&self) -> Result<AssignmentConfig, ConfigReadError> {
        let d = AssignmentConfig::default();
        Ok(AssignmentConfig {
            weight_distance: self.get_parsed_or_default(config_keys::WEIGHT_DISTANCE, d.weight_distance)?,
            weight_capacity: self.get_parsed_or_default(config_keys::WEIGHT_CAPACITY, d.weight_capacity)?,
            weight_workload: self.get_parsed_or_default(config_keys::WEIGHT_WORKLOAD, d.weight_workload)?,
            balancing_threshold: self
                .get_parsed_or_default(config_keys::BALANCING_THRESHOLD, d.balancing_threshold)?,
            service_radius_km: self
                .get_parsed_or_default(config_keys::SERVICE_RADIUS_KM, d.service_radius_km)?,
            default_driver_capacity: self
                .get_parsed_or_default(config_keys::DEFAULT_DRIVER_CAPACITY, d.default_driver_capacity)?,
        })
    }

    async fn get_tracking_config(&self) -> Result<TrackingConfig, ConfigReadError> {
        let d = TrackingConfig::default();
        Ok(TrackingConfig {
            retention_horizon_secs: self
                .get_parsed_or_default(config_keys::RETENTION_HORIZON_SECS, d.retention_horizon_secs)?,
        })
    }

    async fn get_meeting_point_config(&self) -> Result<MeetingPointConfig, ConfigReadError> {
        let d = MeetingPointConfig::default();
        let objective = match self.get_config_value(config_keys::DETOUR_OBJECTIVE)? {
            None => d.objective,
            Some(raw) => raw.parse().unwrap_or_else(|e: String| {
                tracing::warn!(config_key = config_keys::DETOUR_OBJECTIVE, error = %e, "绕行目标配置错误，使用默认值");
                d.objective
            }),
        };
        Ok(MeetingPointConfig {
            max_detour_km: self.get_parsed_or_default(config_keys::MAX_DETOUR_KM, d.max_detour_km)?,
            tolerance_radius_km: self
                .get_parsed_or_default(config_keys::TOLERANCE_RADIUS_KM, d.tolerance_radius_km)?,
            objective,
            lookahead_secs: self.get_parsed_or_default(config_keys::LOOKAHEAD_SECS, d.lookahead_secs)?,
        })
    }

    async fn get_runtime_config(&self) -> Result<RuntimeConfig, ConfigReadError> {
        let d = RuntimeConfig::default();
        Ok(RuntimeConfig {
            pass_interval_secs: self.get_optional(config_keys::PASS_INTERVAL_SECS, d.pass_interval_secs)?,
            pass_timeout_ms: self.get_parsed_or_default(config_keys::PASS_TIMEOUT_MS, d.pass_timeout_ms)?,
            channel_capacity: self.get_parsed_or_default(config_keys::CHANNEL_CAPACITY, d.channel_capacity)?,
        })
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 公平性
    pub const FAIRNESS_CEILING_SECS: &str = "fairness_ceiling_secs";
    pub const RANK_ADVANCE_SECS: &str = "rank_advance_secs";
    pub const MAX_RANK_ADVANCE_POSITIONS: &str = "max_rank_advance_positions";
    pub const PRIORITY_WEIGHT_LOW: &str = "priority_weight_low";
    pub const PRIORITY_WEIGHT_NORMAL: &str = "priority_weight_normal";
    pub const PRIORITY_WEIGHT_HIGH: &str = "priority_weight_high";
    pub const PRIORITY_WEIGHT_URGENT: &str = "priority_weight_urgent";

    // 聚类
    pub const CLUSTERING_METHOD: &str = "clustering_method";
    pub const NUM_CLUSTERS: &str = "num_clusters";
    pub const PROXIMITY_THRESHOLD_KM: &str = "proximity_threshold_km";
    pub const OVERLAP_DISTANCE_KM: &str = "overlap_distance_km";
    pub const MIN_ORDERS_PER_PASS: &str = "min_orders_per_pass";
    pub const MAX_CLUSTER_SIZE: &str = "max_cluster_size";
    pub const GRID_CELL_DEG: &str = "grid_cell_deg";
    pub const KMEANS_MAX_ITERATIONS: &str = "kmeans_max_iterations";

    // 派单
    pub const WEIGHT_DISTANCE: &str = "weight_distance";
    pub const WEIGHT_CAPACITY: &str = "weight_capacity";
    pub const WEIGHT_WORKLOAD: &str = "weight_workload";
    pub const BALANCING_THRESHOLD: &str = "balancing_threshold";
    pub const SERVICE_RADIUS_KM: &str = "service_radius_km";
    pub const DEFAULT_DRIVER_CAPACITY: &str = "default_driver_capacity";

    // 定位
    pub const RETENTION_HORIZON_SECS: &str = "retention_horizon_secs";

    // 会合点
    pub const MAX_DETOUR_KM: &str = "max_detour_km";
    pub const TOLERANCE_RADIUS_KM: &str = "tolerance_radius_km";
    pub const DETOUR_OBJECTIVE: &str = "detour_objective";
    pub const LOOKAHEAD_SECS: &str = "lookahead_secs";

    // 运行时
    pub const PASS_INTERVAL_SECS: &str = "pass_interval_secs";
    pub const PASS_TIMEOUT_MS: &str = "pass_timeout_ms";
    pub const CHANNEL_CAPACITY: &str = "channel_capacity";
}
