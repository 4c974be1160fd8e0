// ==========================================
// 配送调度核心 - 领域模型层
// ==========================================
// 职责: 定义领域实体、值对象、状态枚举
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod cluster;
pub mod driver;
pub mod geo;
pub mod handover;
pub mod order;
pub mod types;

// 重导出核心类型
pub use cluster::Cluster;
pub use driver::{Driver, DriverWorkload, LocationSample};
pub use geo::GeoPoint;
pub use handover::{AckSlot, ArrivalAcks, Handover, MeetingPoint, PriorDriver};
pub use order::{Order, OrderStatusChange};
pub use types::{ClusteringMethod, DetourObjective, HandoverStatus, OrderStatus, PriorityTier};
