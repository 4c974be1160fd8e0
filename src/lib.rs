// ==========================================
// 配送调度核心 - 核心库
// ==========================================
// 技术栈: Rust + tokio + SQLite
// 系统定位: 订单公平派单 / 地理聚类 / 司机交接
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 调度规则
pub mod engine;

// 服务层 - 异步运行时
pub mod services;

// 导入层 - 外部数据
pub mod importer;

// 配置层 - 系统配置
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 日志系统
pub mod logging;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::{
    ClusteringMethod, DetourObjective, HandoverStatus, OrderStatus, PriorityTier,
};

// 领域实体
pub use domain::{
    Cluster, Driver, DriverWorkload, GeoPoint, Handover, LocationSample, MeetingPoint, Order,
    OrderStatusChange,
};

// 配置
pub use config::{ConfigManager, DispatchConfig, DispatchConfigReader};

// 引擎
pub use engine::{
    AssignmentEngine, DispatchError, DispatchOrchestrator, DispatchResult, GeoClusterer,
    HandoverCoordinator, LocationTracker, MeetingPointPlanner, OrderLedger, PassOutcome,
};

// 仓储
pub use repository::{DispatchRepository, InMemoryDispatchRepository, SqliteDispatchRepository};

// 运行时
pub use services::{DispatchHandle, DispatchRuntime};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "配送调度核心";
