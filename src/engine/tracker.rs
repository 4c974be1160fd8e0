// ==========================================
// 配送调度核心 - 司机定位跟踪 (LocationTracker)
// ==========================================
// 职责: 接收并保留近期司机定位样本
// 红线: 每个司机的样本按 recorded_at 严格递增,乱序/重复样本静默丢弃
// 保留: 相对该司机最新样本超过 retention_horizon 的样本在下次写入时淘汰
// ==========================================

use crate::config::dispatch_config::TrackingConfig;
use crate::domain::{GeoPoint, LocationSample};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// 样本写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Accepted,
    /// 时间戳不晚于已有最新样本
    DroppedOutOfOrder,
    /// 坐标非法
    Rejected,
}

pub struct LocationTracker {
    tracks: HashMap<String, VecDeque<LocationSample>>,
    retention_horizon: Duration,
}

impl LocationTracker {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            tracks: HashMap::new(),
            retention_horizon: config.retention_horizon(),
        }
    }

    /// 记录一条定位样本
    pub fn record_sample(&mut self, driver_id: &str, mut sample: LocationSample) -> SampleOutcome {
        if !sample.position.is_valid() {
            tracing::warn!(driver_id, lat = sample.position.lat, lon = sample.position.lon, "定位坐标非法，拒收");
            return SampleOutcome::Rejected;
        }
        sample.driver_id = driver_id.to_string();

        let track = self.tracks.entry(driver_id.to_string()).or_default();
        if let Some(latest) = track.back() {
            if sample.recorded_at <= latest.recorded_at {
                tracing::trace!(driver_id, recorded_at = %sample.recorded_at, "乱序定位样本，丢弃");
                return SampleOutcome::DroppedOutOfOrder;
            }
        }

        let newest = sample.recorded_at;
        track.push_back(sample);

        // 保留窗口超出可表示时间范围时全部保留
        if let Some(cutoff) = newest.checked_sub_signed(self.retention_horizon) {
            while track.front().is_some_and(|s| s.recorded_at < cutoff) {
                track.pop_front();
            }
        }
        SampleOutcome::Accepted
    }

    /// 司机最新位置
    pub fn current_location(&self, driver_id: &str) -> Option<LocationSample> {
        self.tracks.get(driver_id).and_then(|t| t.back()).cloned()
    }

    /// 近 window 时长内的轨迹（按时间升序）
    pub fn recent_track(
        &self,
        driver_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Vec<LocationSample> {
        let since = now
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.tracks
            .get(driver_id)
            .map(|t| {
                t.iter()
                    .filter(|s| s.recorded_at >= since && s.recorded_at <= now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 已保留的全部样本（按时间升序）
    pub fn retained(&self, driver_id: &str) -> Vec<LocationSample> {
        self.tracks
            .get(driver_id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 全部司机当前位置快照
    pub fn positions(&self) -> HashMap<String, GeoPoint> {
        self.tracks
            .iter()
            .filter_map(|(id, t)| t.back().map(|s| (id.clone(), s.position)))
            .collect()
    }

    pub fn tracked_drivers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tracks.keys().cloned().collect();
        ids.sort();
        ids
    }
}
