// ==========================================
// 配送调度核心 - 配置层
// ==========================================
// 职责: 调度参数定义、读取与覆写
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod config_reader_trait;
pub mod dispatch_config;

// 重导出核心配置类型
pub use config_manager::{config_keys, ConfigManager};
pub use config_reader_trait::{ConfigReadError, DispatchConfigReader};
pub use dispatch_config::{
    AssignmentConfig, ClusteringConfig, DispatchConfig, FairnessPolicy, MeetingPointConfig,
    PriorityWeights, RuntimeConfig, TrackingConfig,
};
