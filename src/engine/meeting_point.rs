// ==========================================
// 配送调度核心 - 会合点规划 (MeetingPointPlanner)
// ==========================================
// 职责: 为两名司机的在途路线选择交接会合点
// 轨迹: 当前位置 X 沿最近两个样本的方向外推 lookahead 得到 X'（样本不足两个视为静止）
// 绕行: detour(P) = d(X,P) + d(P,X') - d(X,X')
// 选点: 优先固定会合点（距两车中点 tolerance_radius_km 内）,否则在轨迹候选点中取目标函数最小者
// 红线: 任一司机绕行超过 max_detour_km 的点不可选,宁可失败也不越界
// ==========================================

use crate::config::dispatch_config::MeetingPointConfig;
use crate::domain::{GeoPoint, LocationSample, MeetingPoint};
use crate::engine::error::{DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// 司机近期轨迹（按时间升序）
#[derive(Debug, Clone, Copy)]
pub struct DriverTrack<'a> {
    pub driver_id: &'a str,
    pub samples: &'a [LocationSample],
}

/// 外推后的行驶段
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trajectory {
    pub current: GeoPoint,
    pub projected: GeoPoint,
}

impl Trajectory {
    /// 经过 point 的额外行驶距离
    pub fn detour_km(&self, point: &GeoPoint) -> f64 {
        let via = self.current.distance_km(point) + point.distance_km(&self.projected);
        (via - self.current.distance_km(&self.projected)).max(0.0)
    }
}

/// 会合点方案
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingProposal {
    pub meeting_point: MeetingPoint,
    pub detour_a_km: f64,
    pub detour_b_km: f64,
    pub objective_km: f64,
}

pub struct MeetingPointPlanner {
    config: MeetingPointConfig,
    registered: BTreeMap<String, MeetingPoint>,
}

impl MeetingPointPlanner {
    pub fn new(config: MeetingPointConfig) -> Self {
        Self {
            config,
            registered: BTreeMap::new(),
        }
    }

    /// 注册或覆盖固定会合点
    pub fn register_point(&mut self, point: MeetingPoint) {
        self.registered.insert(point.meeting_point_id.clone(), point);
    }

    /// 启用/停用固定会合点
    pub fn set_active(&mut self, meeting_point_id: &str, active: bool) -> DispatchResult<MeetingPoint> {
        let point = self
            .registered
            .get_mut(meeting_point_id)
            .ok_or_else(|| DispatchError::NotFound {
                entity: "meeting_point",
                id: meeting_point_id.to_string(),
            })?;
        point.active = active;
        Ok(point.clone())
    }

    pub fn registered_points(&self) -> impl Iterator<Item = &MeetingPoint> {
        self.registered.values()
    }

    /// 由轨迹样本推出行驶段
    pub fn trajectory(&self, samples: &[LocationSample]) -> Option<Trajectory> {
        let last = samples.last()?;
        let current = last.position;
        let projected = match samples.len() {
            0 | 1 => current,
            n => {
                let prev = &samples[n - 2];
                let dt = (last.recorded_at - prev.recorded_at).num_milliseconds() as f64;
                if dt <= 0.0 {
                    current
                } else {
                    let ahead = self.config.lookahead().num_milliseconds() as f64;
                    prev.position.extrapolate(&current, (dt + ahead) / dt)
                }
            }
        };
        Some(Trajectory { current, projected })
    }

    /// 计算会合点
    ///
    /// # 返回
    /// - Err(NoViableMeetingPoint): 订单为空、任一司机无位置、或没有预算内的点
    /// - Err(Validation): 两个司机相同
    pub fn propose_meeting_point(
        &self,
        driver_a: DriverTrack<'_>,
        driver_b: DriverTrack<'_>,
        order_ids: &[String],
    ) -> DispatchResult<MeetingProposal> {
        if driver_a.driver_id == driver_b.driver_id {
            return Err(DispatchError::Validation(format!(
                "交接双方不能为同一司机: {}",
                driver_a.driver_id
            )));
        }
        if order_ids.is_empty() {
            return Err(DispatchError::NoViableMeetingPoint {
                reason: "待交接订单为空".to_string(),
            });
        }
        let traj_a = self.trajectory(driver_a.samples).ok_or_else(|| no_location(driver_a.driver_id))?;
        let traj_b = self.trajectory(driver_b.samples).ok_or_else(|| no_location(driver_b.driver_id))?;

        let midpoint = traj_a.current.midpoint(&traj_b.current);

        // 1) 中点附近的固定会合点
        let best_registered = self
            .registered
            .values()
            .filter(|p| p.active && p.position.distance_km(&midpoint) <= self.config.tolerance_radius_km)
            .filter_map(|p| self.evaluate(p.clone(), &traj_a, &traj_b))
            .min_by(|a, b| {
                a.objective_km
                    .partial_cmp(&b.objective_km)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.meeting_point.meeting_point_id.cmp(&b.meeting_point.meeting_point_id))
            });
        if let Some(proposal) = best_registered {
            tracing::info!(
                driver_a = driver_a.driver_id,
                driver_b = driver_b.driver_id,
                meeting_point_id = %proposal.meeting_point.meeting_point_id,
                objective_km = proposal.objective_km,
                "选定固定会合点"
            );
            return Ok(proposal);
        }

        // 2) 临时会合点: 在候选点中取目标函数最小且在预算内的点
        let stamp = driver_a
            .samples
            .last()
            .map(|s| s.recorded_at)
            .max(driver_b.samples.last().map(|s| s.recorded_at))
            .map(|t| t.timestamp())
            .unwrap_or_default();
        let best_ad_hoc = ad_hoc_candidates(&traj_a, &traj_b, midpoint)
            .into_iter()
            .filter_map(|position| {
                let point = MeetingPoint {
                    meeting_point_id: format!(
                        "ADHOC-{}-{}-{}",
                        driver_a.driver_id, driver_b.driver_id, stamp
                    ),
                    name: format!("{} / {} 临时会合点", driver_a.driver_id, driver_b.driver_id),
                    position,
                    active: true,
                    ad_hoc: true,
                };
                self.evaluate(point, &traj_a, &traj_b)
            })
            .min_by(|a, b| {
                a.objective_km
                    .partial_cmp(&b.objective_km)
                    .unwrap_or(Ordering::Equal)
            });

        match best_ad_hoc {
            Some(proposal) => {
                tracing::info!(
                    driver_a = driver_a.driver_id,
                    driver_b = driver_b.driver_id,
                    objective_km = proposal.objective_km,
                    detour_a_km = proposal.detour_a_km,
                    detour_b_km = proposal.detour_b_km,
                    "选定临时会合点"
                );
                Ok(proposal)
            }
            None => {
                let reason = format!(
                    "{} 与 {} 的轨迹无预算 {:.2}km 内的会合点 (中点 detour_a={:.2}km, detour_b={:.2}km)",
                    driver_a.driver_id,
                    driver_b.driver_id,
                    self.config.max_detour_km,
                    traj_a.detour_km(&midpoint),
                    traj_b.detour_km(&midpoint),
                );
                tracing::warn!(%reason, "无可行会合点");
                Err(DispatchError::NoViableMeetingPoint { reason })
            }
        }
    }

    /// 预算内返回方案,否则 None
    fn evaluate(&self, point: MeetingPoint, a: &Trajectory, b: &Trajectory) -> Option<MeetingProposal> {
        let detour_a_km = a.detour_km(&point.position);
        let detour_b_km = b.detour_km(&point.position);
        if detour_a_km > self.config.max_detour_km || detour_b_km > self.config.max_detour_km {
            return None;
        }
        Some(MeetingProposal {
            objective_km: self.config.objective.combine(detour_a_km, detour_b_km),
            meeting_point: point,
            detour_a_km,
            detour_b_km,
        })
    }
}

fn no_location(driver_id: &str) -> DispatchError {
    DispatchError::NoViableMeetingPoint {
        reason: format!("司机 {} 无已知位置", driver_id),
    }
}

/// 每段候选采样份数
const SEGMENT_STEPS: usize = 10;

/// 临时会合点候选: 中点、两车当前/外推位置、两条行驶段上的等分点、
/// 两车当前位置之间和外推位置之间的加权中点
fn ad_hoc_candidates(a: &Trajectory, b: &Trajectory, midpoint: GeoPoint) -> Vec<GeoPoint> {
    let mut candidates = vec![midpoint, a.current, b.current, a.projected, b.projected];
    let segments = [
        (a.current, a.projected),
        (b.current, b.projected),
        (a.current, b.current),
        (a.projected, b.projected),
    ];
    for (from, to) in segments {
        if from == to {
            continue;
        }
        for step in 1..SEGMENT_STEPS {
            candidates.push(from.extrapolate(&to, step as f64 / SEGMENT_STEPS as f64));
        }
    }
    candidates
}
