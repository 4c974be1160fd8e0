// ==========================================
// 配送调度核心 - 调度运行时
// ==========================================
// 职责: 从仓储恢复状态,启动各 worker,对外提供 DispatchHandle
// worker:
// - ingestion: LocationTracker
// - ledger: OrderLedger + 司机登记表（唯一写者）
// - pass: 聚类 + 派单轮次
// - handover: HandoverCoordinator + MeetingPointPlanner
// 关闭: watch 广播 -> worker 排空退出 -> join_all
// ==========================================

use crate::config::DispatchConfig;
use crate::domain::{
    Driver, Handover, LocationSample, MeetingPoint, Order, OrderStatus, OrderStatusChange,
};
use crate::engine::error::{DispatchError, DispatchResult};
use crate::engine::events::OptionalEventPublisher;
use crate::engine::handover::{ConfirmOutcome, HandoverCoordinator};
use crate::engine::ledger::OrderLedger;
use crate::engine::meeting_point::MeetingPointPlanner;
use crate::engine::orchestrator::{DispatchOrchestrator, PassOutcome};
use crate::engine::tracker::{LocationTracker, SampleOutcome};
use crate::repository::DispatchRepository;
use crate::services::handover_worker::{HandoverCommand, HandoverWorker};
use crate::services::ingestion_worker::{IngestionCommand, IngestionWorker};
use crate::services::ledger_worker::{LedgerCommand, LedgerWorker};
use crate::services::pass_queue::{PassTrigger, TriggerReason};
use crate::services::pass_worker::PassWorker;
use crate::services::request;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

// ==========================================
// DispatchHandle - 对外入口（可克隆）
// ==========================================
#[derive(Clone)]
pub struct DispatchHandle {
    ingestion_tx: mpsc::Sender<IngestionCommand>,
    ledger_tx: mpsc::Sender<LedgerCommand>,
    pass_tx: mpsc::Sender<PassTrigger>,
    handover_tx: mpsc::Sender<HandoverCommand>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl DispatchHandle {
    // ===== 入站推送 =====

    /// 司机定位样本
    pub async fn on_location_sample(&self, sample: LocationSample) -> DispatchResult<SampleOutcome> {
        request(&self.ingestion_tx, |reply| IngestionCommand::Sample {
            sample,
            reply: Some(reply),
        })
        .await
    }

    /// 新订单入账,返回当前公平排位
    pub async fn on_order_created(&self, order: Order) -> DispatchResult<usize> {
        request(&self.ledger_tx, |reply| LedgerCommand::CreateOrder { order, reply }).await?
    }

    /// 司机确认到达交接点
    pub async fn on_handover_confirmation(
        &self,
        handover_id: &str,
        driver_id: &str,
        confirmed_at: DateTime<Utc>,
    ) -> DispatchResult<ConfirmOutcome> {
        request(&self.handover_tx, |reply| HandoverCommand::Confirm {
            handover_id: handover_id.to_string(),
            driver_id: driver_id.to_string(),
            confirmed_at,
            reply,
        })
        .await?
    }

    // ===== 登记与状态 =====

    pub async fn register_driver(&self, driver: Driver) -> DispatchResult<()> {
        request(&self.ledger_tx, |reply| LedgerCommand::RegisterDriver { driver, reply }).await?
    }

    pub async fn register_meeting_point(&self, point: MeetingPoint) -> DispatchResult<()> {
        request(&self.handover_tx, |reply| HandoverCommand::RegisterMeetingPoint {
            point,
            reply,
        })
        .await?
    }

    /// 启用/停用固定会合点,返回更新后的会合点
    pub async fn set_meeting_point_active(
        &self,
        meeting_point_id: &str,
        active: bool,
    ) -> DispatchResult<MeetingPoint> {
        request(&self.handover_tx, |reply| HandoverCommand::SetMeetingPointActive {
            meeting_point_id: meeting_point_id.to_string(),
            active,
            reply,
        })
        .await?
    }

    /// 外部状态推进（取货、送达、失败、取消）
    pub async fn mark_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> DispatchResult<OrderStatusChange> {
        request(&self.ledger_tx, |reply| LedgerCommand::MarkStatus {
            order_id: order_id.to_string(),
            status,
            reply,
        })
        .await?
    }

    // ===== 派单轮次 =====

    /// 触发一次派单轮次并等待结果（与进行中的触发合并）
    pub async fn trigger_pass(&self) -> DispatchResult<PassOutcome> {
        let (reply, rx) = oneshot::channel();
        self.pass_tx
            .send(PassTrigger {
                reason: TriggerReason::Manual,
                reply: Some(reply),
            })
            .await
            .map_err(|_| DispatchError::RuntimeUnavailable("派单轮次 worker 已关闭".to_string()))?;
        rx.await
            .map_err(|_| DispatchError::RuntimeUnavailable("派单轮次 worker 未回复".to_string()))?
    }

    /// 触发派单轮次,不等待结果
    pub fn request_pass(&self) -> DispatchResult<()> {
        match self
            .pass_tx
            .try_send(PassTrigger::fire_and_forget(TriggerReason::Manual))
        {
            // 队列已满说明已有待执行的触发
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::RuntimeUnavailable(
                "派单轮次 worker 已关闭".to_string(),
            )),
        }
    }

    // ===== 交接 =====

    pub async fn schedule_handover(
        &self,
        from_driver_id: &str,
        to_driver_id: &str,
        order_ids: Vec<String>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> DispatchResult<Handover> {
        request(&self.handover_tx, |reply| HandoverCommand::Schedule {
            from_driver_id: from_driver_id.to_string(),
            to_driver_id: to_driver_id.to_string(),
            order_ids,
            scheduled_at,
            reply,
        })
        .await?
    }

    pub async fn complete_handover(&self, handover_id: &str) -> DispatchResult<Handover> {
        request(&self.handover_tx, |reply| HandoverCommand::Complete {
            handover_id: handover_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn cancel_handover(&self, handover_id: &str) -> DispatchResult<Handover> {
        request(&self.handover_tx, |reply| HandoverCommand::Cancel {
            handover_id: handover_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn get_handover(&self, handover_id: &str) -> DispatchResult<Option<Handover>> {
        request(&self.handover_tx, |reply| HandoverCommand::Get {
            handover_id: handover_id.to_string(),
            reply,
        })
        .await
    }

    // ===== 查询 =====

    /// 公平排序下的前 limit 个 pending 订单
    pub async fn peek_fifo(&self, limit: usize) -> DispatchResult<Vec<Order>> {
        request(&self.ledger_tx, |reply| LedgerCommand::PeekFifo { limit, reply }).await
    }

    pub async fn order_views(&self, order_ids: Vec<String>) -> DispatchResult<Vec<Order>> {
        request(&self.ledger_tx, |reply| LedgerCommand::OrderViews { order_ids, reply }).await
    }

    pub async fn current_location(&self, driver_id: &str) -> DispatchResult<Option<LocationSample>> {
        request(&self.ingestion_tx, |reply| IngestionCommand::CurrentLocation {
            driver_id: driver_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn status_counts(&self) -> DispatchResult<Vec<(OrderStatus, usize)>> {
        request(&self.ledger_tx, |reply| LedgerCommand::StatusCounts { reply }).await
    }

    /// 广播关闭信号（不等待 worker 退出）
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ==========================================
// DispatchRuntime
// ==========================================
pub struct DispatchRuntime {
    handle: DispatchHandle,
    shutdown_tx: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatchRuntime {
    /// 恢复状态并启动全部 worker（需在 tokio 运行时内调用）
    pub async fn start(
        config: DispatchConfig,
        repo: Arc<dyn DispatchRepository>,
        publisher: OptionalEventPublisher,
    ) -> DispatchResult<Self> {
        config
            .validate()
            .map_err(|errors| DispatchError::Validation(errors.join("; ")))?;

        // ===== 步骤1: 从仓储恢复 =====
        let mut ledger = OrderLedger::new(config.fairness.clone());
        let open_orders = repo
            .load_open_orders()
            .map_err(|e| DispatchError::storage("load_open_orders", e))?;
        let mut skipped = 0usize;
        for order in open_orders {
            let order_id = order.order_id.clone();
            if let Err(e) = ledger.restore(order) {
                skipped += 1;
                warn!(order_id = %order_id, error = %e, "恢复订单失败，跳过");
            }
        }

        let drivers: HashMap<String, Driver> = repo
            .load_drivers()
            .map_err(|e| DispatchError::storage("load_drivers", e))?
            .into_iter()
            .map(|d| (d.driver_id.clone(), d))
            .collect();

        let mut planner = MeetingPointPlanner::new(config.meeting_point.clone());
        for point in repo
            .load_meeting_points()
            .map_err(|e| DispatchError::storage("load_meeting_points", e))?
        {
            planner.register_point(point);
        }

        let mut coordinator = HandoverCoordinator::new();
        for handover in repo
            .load_open_handovers()
            .map_err(|e| DispatchError::storage("load_open_handovers", e))?
        {
            coordinator.restore(handover);
        }

        info!(
            orders = ledger.len(),
            pending = ledger.pending_count(),
            skipped,
            drivers = drivers.len(),
            "调度状态已恢复"
        );

        // ===== 步骤2: 启动 worker =====
        let capacity = config.runtime.channel_capacity.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let (ingestion_tx, ingestion_rx) = mpsc::channel(capacity);
        let (ledger_tx, ledger_rx) = mpsc::channel(capacity);
        let (pass_tx, pass_rx) = mpsc::channel(capacity);
        let (handover_tx, handover_rx) = mpsc::channel(capacity);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            IngestionWorker::new(
                LocationTracker::new(&config.tracking),
                ingestion_rx,
                shutdown_rx.clone(),
            )
            .run(),
        ));
        tasks.push(tokio::spawn(
            LedgerWorker::new(
                ledger,
                drivers,
                config.assignment.default_driver_capacity,
                Arc::clone(&repo),
                publisher.clone(),
                ledger_rx,
                shutdown_rx.clone(),
            )
            .run(),
        ));
        tasks.push(tokio::spawn(
            PassWorker::new(
                Arc::new(DispatchOrchestrator::new(
                    config.clustering.clone(),
                    config.assignment.clone(),
                )),
                ledger_tx.clone(),
                ingestion_tx.clone(),
                pass_rx,
                shutdown_rx.clone(),
                config.runtime.pass_timeout(),
            )
            .run(),
        ));
        tasks.push(tokio::spawn(
            HandoverWorker::new(
                coordinator,
                planner,
                Arc::clone(&repo),
                publisher,
                ledger_tx.clone(),
                ingestion_tx.clone(),
                handover_rx,
                shutdown_rx.clone(),
            )
            .run(),
        ));

        // 定时触发只投递触发消息
        if let Some(period) = config.runtime.pass_interval() {
            tasks.push(tokio::spawn(run_pass_ticker(
                period,
                pass_tx.clone(),
                shutdown_rx,
            )));
        }

        info!(workers = tasks.len(), "调度运行时已启动");
        Ok(Self {
            handle: DispatchHandle {
                ingestion_tx,
                ledger_tx,
                pass_tx,
                handover_tx,
                shutdown_tx: Arc::clone(&shutdown_tx),
            },
            shutdown_tx,
            tasks,
        })
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// 广播关闭并等待全部 worker 退出
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let results = futures::future::join_all(self.tasks).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(failed, "部分 worker 异常退出");
        }
        info!("调度运行时已关闭");
    }
}

async fn run_pass_ticker(
    period: std::time::Duration,
    pass_tx: mpsc::Sender<PassTrigger>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 首次 tick 立即返回,跳过
    ticker.tick().await;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(mpsc::error::TrySendError::Closed(_)) =
                    pass_tx.try_send(PassTrigger::fire_and_forget(TriggerReason::Interval))
                {
                    break;
                }
            }
        }
    }
}
