// ==========================================
// 配送调度核心 - 交接 worker
// ==========================================
// 职责: 独占 HandoverCoordinator 与 MeetingPointPlanner
// 排期: 司机轨迹 -> 会合点 -> 台账订单视图 -> 协调器校验 -> 持久化 -> 事件
// 完成: 协调器校验 -> 台账改派（全有或全无）-> 标记完成 -> 持久化
// 取消: 协调器校验 -> 恢复原归属 -> 标记取消 -> 持久化
// 重试: 落盘失败的交接记入待同步集合,调用方重试同一操作时只补写不重做
// ==========================================

use crate::domain::{Handover, HandoverStatus, MeetingPoint};
use crate::engine::error::{DispatchError, DispatchResult};
use crate::engine::events::OptionalEventPublisher;
use crate::engine::handover::{ConfirmOutcome, HandoverCoordinator, HandoverRequest};
use crate::engine::meeting_point::{DriverTrack, MeetingPointPlanner};
use crate::repository::DispatchRepository;
use crate::services::ingestion_worker::IngestionCommand;
use crate::services::ledger_worker::LedgerCommand;
use crate::services::request;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

pub enum HandoverCommand {
    Schedule {
        from_driver_id: String,
        to_driver_id: String,
        order_ids: Vec<String>,
        scheduled_at: Option<DateTime<Utc>>,
        reply: oneshot::Sender<DispatchResult<Handover>>,
    },
    Confirm {
        handover_id: String,
        driver_id: String,
        confirmed_at: DateTime<Utc>,
        reply: oneshot::Sender<DispatchResult<ConfirmOutcome>>,
    },
    Complete {
        handover_id: String,
        reply: oneshot::Sender<DispatchResult<Handover>>,
    },
    Cancel {
        handover_id: String,
        reply: oneshot::Sender<DispatchResult<Handover>>,
    },
    Get {
        handover_id: String,
        reply: oneshot::Sender<Option<Handover>>,
    },
    RegisterMeetingPoint {
        point: MeetingPoint,
        reply: oneshot::Sender<DispatchResult<()>>,
    },
    SetMeetingPointActive {
        meeting_point_id: String,
        active: bool,
        reply: oneshot::Sender<DispatchResult<MeetingPoint>>,
    },
}

pub struct HandoverWorker {
    coordinator: HandoverCoordinator,
    planner: MeetingPointPlanner,
    repo: Arc<dyn DispatchRepository>,
    publisher: OptionalEventPublisher,
    ledger_tx: mpsc::Sender<LedgerCommand>,
    ingestion_tx: mpsc::Sender<IngestionCommand>,
    rx: mpsc::Receiver<HandoverCommand>,
    shutdown: watch::Receiver<bool>,
    /// 最近一次落盘失败的交接
    unsynced: BTreeSet<String>,
}

impl HandoverWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: HandoverCoordinator,
        planner: MeetingPointPlanner,
        repo: Arc<dyn DispatchRepository>,
        publisher: OptionalEventPublisher,
        ledger_tx: mpsc::Sender<LedgerCommand>,
        ingestion_tx: mpsc::Sender<IngestionCommand>,
        rx: mpsc::Receiver<HandoverCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            coordinator,
            planner,
            repo,
            publisher,
            ledger_tx,
            ingestion_tx,
            rx,
            shutdown,
            unsynced: BTreeSet::new(),
        }
    }

    pub async fn run(mut self) {
        info!(
            open = self.coordinator.open_handovers().len(),
            meeting_points = self.planner.registered_points().count(),
            "交接 worker 启动"
        );
        loop {
            tokio::select! {
                biased;
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.rx.close();
        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd).await;
        }
        info!("交接 worker 退出");
    }

    async fn handle(&mut self, cmd: HandoverCommand) {
        match cmd {
            HandoverCommand::Schedule {
                from_driver_id,
                to_driver_id,
                order_ids,
                scheduled_at,
                reply,
            } => {
                let result = self
                    .schedule(from_driver_id, to_driver_id, order_ids, scheduled_at)
                    .await;
                let _ = reply.send(result);
            }
            HandoverCommand::Confirm {
                handover_id,
                driver_id,
                confirmed_at,
                reply,
            } => {
                let _ = reply.send(self.confirm(&handover_id, &driver_id, confirmed_at));
            }
            HandoverCommand::Complete { handover_id, reply } => {
                let _ = reply.send(self.complete(&handover_id).await);
            }
            HandoverCommand::Cancel { handover_id, reply } => {
                let _ = reply.send(self.cancel(&handover_id).await);
            }
            HandoverCommand::Get { handover_id, reply } => {
                let _ = reply.send(self.coordinator.get(&handover_id).cloned());
            }
            HandoverCommand::RegisterMeetingPoint { point, reply } => {
                let _ = reply.send(self.register_meeting_point(point));
            }
            HandoverCommand::SetMeetingPointActive {
                meeting_point_id,
                active,
                reply,
            } => {
                let _ = reply.send(self.set_meeting_point_active(&meeting_point_id, active));
            }
        }
    }

    async fn schedule(
        &mut self,
        from_driver_id: String,
        to_driver_id: String,
        order_ids: Vec<String>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> DispatchResult<Handover> {
        if let Some(handover) =
            self.unsynced_schedule(&from_driver_id, &to_driver_id, &order_ids)
        {
            info!(handover_id = %handover.handover_id, "重复排期按重试处理");
            self.persist(&handover)?;
            return Ok(handover);
        }

        let (from_samples, to_samples) = request(&self.ingestion_tx, |reply| {
            IngestionCommand::Tracks {
                driver_ids: (from_driver_id.clone(), to_driver_id.clone()),
                reply,
            }
        })
        .await?;

        let proposal = self.planner.propose_meeting_point(
            DriverTrack {
                driver_id: &from_driver_id,
                samples: &from_samples,
            },
            DriverTrack {
                driver_id: &to_driver_id,
                samples: &to_samples,
            },
            &order_ids,
        )?;

        let views = request(&self.ledger_tx, |reply| LedgerCommand::OrderViews {
            order_ids: order_ids.clone(),
            reply,
        })
        .await?;

        let now = Utc::now();
        let handover = self.coordinator.schedule(
            HandoverRequest {
                from_driver_id,
                to_driver_id,
                meeting_point: proposal.meeting_point,
                scheduled_at: scheduled_at.unwrap_or(now),
                order_ids,
            },
            &views,
            now,
        )?;
        self.publisher.emit_handover_scheduled(&handover);
        self.persist(&handover)?;
        Ok(handover)
    }

    /// 落盘失败、尚未开始的同一交接
    fn unsynced_schedule(
        &self,
        from_driver_id: &str,
        to_driver_id: &str,
        order_ids: &[String],
    ) -> Option<Handover> {
        self.unsynced
            .iter()
            .filter_map(|id| self.coordinator.get(id))
            .find(|h| {
                h.status == HandoverStatus::Pending
                    && h.from_driver_id == from_driver_id
                    && h.to_driver_id == to_driver_id
                    && h.order_ids == order_ids
            })
            .cloned()
    }

    /// 交接已处于 status 且上次落盘失败
    fn unsynced_in(&self, handover_id: &str, status: HandoverStatus) -> Option<Handover> {
        if !self.unsynced.contains(handover_id) {
            return None;
        }
        self.coordinator
            .get(handover_id)
            .filter(|h| h.status == status)
            .cloned()
    }

    fn confirm(
        &mut self,
        handover_id: &str,
        driver_id: &str,
        confirmed_at: DateTime<Utc>,
    ) -> DispatchResult<ConfirmOutcome> {
        let outcome = self
            .coordinator
            .confirm_arrival(handover_id, driver_id, confirmed_at)?;
        if outcome.newly_recorded || self.unsynced.contains(handover_id) {
            self.persist(&outcome.handover)?;
        }
        Ok(outcome)
    }

    async fn complete(&mut self, handover_id: &str) -> DispatchResult<Handover> {
        if let Some(handover) = self.unsynced_in(handover_id, HandoverStatus::Completed) {
            self.persist(&handover)?;
            return Ok(handover);
        }
        let plan = self.coordinator.completion_plan(handover_id)?;
        request(&self.ledger_tx, |reply| LedgerCommand::ReassignForHandover {
            plan,
            reply,
        })
        .await??;
        let handover = self.coordinator.mark_completed(handover_id, Utc::now())?;
        self.persist(&handover)?;
        Ok(handover)
    }

    async fn cancel(&mut self, handover_id: &str) -> DispatchResult<Handover> {
        if let Some(handover) = self.unsynced_in(handover_id, HandoverStatus::Cancelled) {
            self.persist(&handover)?;
            return Ok(handover);
        }
        let prior = self.coordinator.cancellation_plan(handover_id)?;
        request(&self.ledger_tx, |reply| LedgerCommand::RestoreDrivers {
            handover_id: handover_id.to_string(),
            prior,
            reply,
        })
        .await??;
        let handover = self.coordinator.mark_cancelled(handover_id, Utc::now())?;
        self.persist(&handover)?;
        Ok(handover)
    }

    fn register_meeting_point(&mut self, point: MeetingPoint) -> DispatchResult<()> {
        if !point.position.is_valid() {
            return Err(DispatchError::Validation(format!(
                "会合点坐标非法: {}",
                point.meeting_point_id
            )));
        }
        self.planner.register_point(point.clone());
        self.repo
            .save_meeting_point(&point)
            .map_err(|e| DispatchError::storage("save_meeting_point", e))
    }

    fn set_meeting_point_active(
        &mut self,
        meeting_point_id: &str,
        active: bool,
    ) -> DispatchResult<MeetingPoint> {
        let point = self.planner.set_active(meeting_point_id, active)?;
        info!(meeting_point_id, active, "会合点启用状态变更");
        self.repo
            .save_meeting_point(&point)
            .map_err(|e| DispatchError::storage("save_meeting_point", e))?;
        Ok(point)
    }

    fn persist(&mut self, handover: &Handover) -> DispatchResult<()> {
        match self.repo.save_handover(handover) {
            Ok(()) => {
                self.unsynced.remove(&handover.handover_id);
                Ok(())
            }
            Err(e) => {
                warn!(handover_id = %handover.handover_id, error = %e, "交接持久化失败");
                self.unsynced.insert(handover.handover_id.clone());
                Err(DispatchError::storage("save_handover", e))
            }
        }
    }
}
