// ==========================================
// 配送调度核心 - 交接与会合点领域模型
// ==========================================
// 红线: 双方到达确认使用两槽记录,幂等由结构保证
// 红线: completed 之后交接记录不可变
// ==========================================

use crate::domain::geo::GeoPoint;
use crate::domain::types::HandoverStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// MeetingPoint - 会合点
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingPoint {
    pub meeting_point_id: String,
    pub name: String,
    pub position: GeoPoint,
    pub active: bool,
    pub ad_hoc: bool, // true = 按轨迹临时合成的点
}

impl MeetingPoint {
    /// 预注册的固定会合点
    pub fn registered(id: impl Into<String>, name: impl Into<String>, position: GeoPoint) -> Self {
        Self {
            meeting_point_id: id.into(),
            name: name.into(),
            position,
            active: true,
            ad_hoc: false,
        }
    }
}

// ==========================================
// ArrivalAcks - 两槽到达确认
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckSlot {
    From,
    To,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrivalAcks {
    pub from_confirmed_at: Option<DateTime<Utc>>,
    pub to_confirmed_at: Option<DateTime<Utc>>,
}

impl ArrivalAcks {
    /// 记录确认
    ///
    /// # 返回
    /// - true: 本次为首次确认
    /// - false: 该槽位已确认过（保留首次时间）
    pub fn record(&mut self, slot: AckSlot, at: DateTime<Utc>) -> bool {
        let cell = match slot {
            AckSlot::From => &mut self.from_confirmed_at,
            AckSlot::To => &mut self.to_confirmed_at,
        };
        if cell.is_some() {
            return false;
        }
        *cell = Some(at);
        true
    }

    pub fn is_confirmed(&self, slot: AckSlot) -> bool {
        match slot {
            AckSlot::From => self.from_confirmed_at.is_some(),
            AckSlot::To => self.to_confirmed_at.is_some(),
        }
    }

    pub fn both_confirmed(&self) -> bool {
        self.from_confirmed_at.is_some() && self.to_confirmed_at.is_some()
    }
}

// ==========================================
// PriorDriver - 交接前的订单归属
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorDriver {
    pub order_id: String,
    pub driver_id: Option<String>,
}

// ==========================================
// Handover - 司机间交接
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handover {
    pub handover_id: String,
    pub from_driver_id: String,
    pub to_driver_id: String,
    pub meeting_point: MeetingPoint,
    pub scheduled_at: DateTime<Utc>,
    pub status: HandoverStatus,
    pub order_ids: Vec<String>,         // 移交订单（有序）
    pub prior_drivers: Vec<PriorDriver>, // 排期时的订单归属快照
    pub acks: ArrivalAcks,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Handover {
    /// 司机在本次交接中的槽位
    pub fn slot_of(&self, driver_id: &str) -> Option<AckSlot> {
        if driver_id == self.from_driver_id {
            Some(AckSlot::From)
        } else if driver_id == self.to_driver_id {
            Some(AckSlot::To)
        } else {
            None
        }
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}
