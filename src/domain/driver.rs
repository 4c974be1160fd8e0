// ==========================================
// 配送调度核心 - 司机与定位样本
// ==========================================
// 红线: 司机位置归 LocationTracker 所有,其他组件只持有副本
// ==========================================

use crate::domain::geo::GeoPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// Driver - 司机主数据
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub driver_id: String,
    pub name: String,
    pub capacity: u32,                // 最大并发订单数
    pub available: bool,              // 是否可接单
    pub vehicle_type: Option<String>, // Car / Van / Motorcycle / Truck
}

impl Driver {
    pub fn new(driver_id: impl Into<String>, capacity: u32) -> Self {
        let driver_id = driver_id.into();
        Self {
            name: driver_id.clone(),
            driver_id,
            capacity,
            available: true,
            vehicle_type: None,
        }
    }
}

// ==========================================
// DriverWorkload - 派单轮次开始时的司机快照
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverWorkload {
    pub driver: Driver,
    pub workload: u32, // 进行中订单数（assigned + in_transit）
}

impl DriverWorkload {
    /// 剩余运力
    pub fn remaining_capacity(&self) -> u32 {
        self.driver.capacity.saturating_sub(self.workload)
    }
}

// ==========================================
// LocationSample - 定位样本
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub driver_id: String,
    pub position: GeoPoint,
    pub recorded_at: DateTime<Utc>,
    pub speed_kmh: f64,
    pub battery_pct: Option<f64>,
    pub accuracy_m: f64,
}

impl LocationSample {
    pub fn new(driver_id: impl Into<String>, position: GeoPoint, recorded_at: DateTime<Utc>) -> Self {
        Self {
            driver_id: driver_id.into(),
            position,
            recorded_at,
            speed_kmh: 0.0,
            battery_pct: None,
            accuracy_m: 0.0,
        }
    }
}
