// ==========================================
// 配送调度核心 - 调度配置读取 Trait
// ==========================================
// 职责: 定义运行时所需的配置读取接口（不包含实现）
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use crate::config::dispatch_config::{
    AssignmentConfig, ClusteringConfig, DispatchConfig, FairnessPolicy, MeetingPointConfig,
    RuntimeConfig, TrackingConfig,
};
use async_trait::async_trait;
use std::error::Error;

pub type ConfigReadError = Box<dyn Error + Send + Sync>;

// ==========================================
// DispatchConfigReader Trait
// ==========================================
// 实现者: ConfigManager（从 config_kv 表读取）
#[async_trait]
pub trait DispatchConfigReader: Send + Sync {
    /// 公平性策略（ceiling / rank advance / 优先级权重）
    async fn get_fairness_policy(&self) -> Result<FairnessPolicy, ConfigReadError>;

    /// 聚类参数
    async fn get_clustering_config(&self) -> Result<ClusteringConfig, ConfigReadError>;

    /// 派单参数
    async fn get_assignment_config(&self) -> Result<AssignmentConfig, ConfigReadError>;

    /// 定位样本保留参数
    async fn get_tracking_config(&self) -> Result<TrackingConfig, ConfigReadError>;

    /// 会合点参数
    async fn get_meeting_point_config(&self) -> Result<MeetingPointConfig, ConfigReadError>;

    /// 运行时参数
    async fn get_runtime_config(&self) -> Result<RuntimeConfig, ConfigReadError>;

    /// 读取完整配置并校验
    ///
    /// # 返回
    /// - Err: 任一分区读取失败,或校验未通过（违规项合并为一条消息）
    async fn load_dispatch_config(&self) -> Result<DispatchConfig, ConfigReadError> {
        let config = DispatchConfig {
            fairness: self.get_fairness_policy().await?,
            clustering: self.get_clustering_config().await?,
            assignment: self.get_assignment_config().await?,
            tracking: self.get_tracking_config().await?,
            meeting_point: self.get_meeting_point_config().await?,
            runtime: self.get_runtime_config().await?,
        };

        config
            .validate()
            .map_err(|violations| format!("配置校验失败: {}", violations.join("; ")))?;

        Ok(config)
    }
}
