// ==========================================
// 配送调度核心 - 台账 worker（单写者）
// ==========================================
// 职责: 独占 OrderLedger 与司机登记表,串行执行全部台账写入
// 顺序: 内存变更 -> 出站事件 -> 持久化
// 红线: 持久化失败向上传播 StorageUnavailable,内存状态不回滚
// 补写: 未落盘的订单行/历史/聚类留在待同步表,后续写入或调用方重试时补写
// 重试: 相同订单重复入账、重复的状态推进、重复的交接改派均按幂等处理
// ==========================================

use crate::domain::{
    Cluster, Driver, GeoPoint, Order, OrderStatus, OrderStatusChange, PriorDriver,
};
use crate::engine::error::{DispatchError, DispatchResult};
use crate::engine::events::OptionalEventPublisher;
use crate::engine::handover::CompletionPlan;
use crate::engine::ledger::OrderLedger;
use crate::engine::orchestrator::{publish_pass_events, PassOutcome, PassPlan, PassSnapshot};
use crate::repository::{DispatchRepository, OrderAssignment};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

pub enum LedgerCommand {
    CreateOrder {
        order: Order,
        reply: oneshot::Sender<DispatchResult<usize>>,
    },
    RegisterDriver {
        driver: Driver,
        reply: oneshot::Sender<DispatchResult<()>>,
    },
    MarkStatus {
        order_id: String,
        status: OrderStatus,
        reply: oneshot::Sender<DispatchResult<OrderStatusChange>>,
    },
    PeekFifo {
        limit: usize,
        reply: oneshot::Sender<Vec<Order>>,
    },
    StatusCounts {
        reply: oneshot::Sender<Vec<(OrderStatus, usize)>>,
    },
    OrderViews {
        order_ids: Vec<String>,
        reply: oneshot::Sender<Vec<Order>>,
    },
    CapturePass {
        pass_id: String,
        positions: HashMap<String, GeoPoint>,
        reply: oneshot::Sender<PassSnapshot>,
    },
    CommitPass {
        plan: Box<PassPlan>,
        reply: oneshot::Sender<DispatchResult<PassOutcome>>,
    },
    ReassignForHandover {
        plan: CompletionPlan,
        reply: oneshot::Sender<DispatchResult<Vec<OrderStatusChange>>>,
    },
    RestoreDrivers {
        handover_id: String,
        prior: Vec<PriorDriver>,
        reply: oneshot::Sender<DispatchResult<Vec<OrderStatusChange>>>,
    },
}

/// 订单行的补写方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowWrite {
    /// 仅状态列
    Status,
    /// 整行覆盖（新订单、落位、改派）
    Full,
}

/// 单个订单尚未落盘的写入
#[derive(Debug)]
struct UnsyncedOrder {
    row: RowWrite,
    history: VecDeque<OrderStatusChange>,
}

pub struct LedgerWorker {
    ledger: OrderLedger,
    unsynced_orders: BTreeMap<String, UnsyncedOrder>,
    unsynced_clusters: VecDeque<(Cluster, Vec<OrderAssignment>)>,
    drivers: HashMap<String, Driver>,
    default_capacity: u32,
    repo: Arc<dyn DispatchRepository>,
    publisher: OptionalEventPublisher,
    rx: mpsc::Receiver<LedgerCommand>,
    shutdown: watch::Receiver<bool>,
}

impl LedgerWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: OrderLedger,
        drivers: HashMap<String, Driver>,
        default_capacity: u32,
        repo: Arc<dyn DispatchRepository>,
        publisher: OptionalEventPublisher,
        rx: mpsc::Receiver<LedgerCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ledger,
            unsynced_orders: BTreeMap::new(),
            unsynced_clusters: VecDeque::new(),
            drivers,
            default_capacity,
            repo,
            publisher,
            rx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            orders = self.ledger.len(),
            drivers = self.drivers.len(),
            "台账 worker 启动"
        );
        loop {
            tokio::select! {
                biased;
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
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
            self.handle(cmd);
        }
        if !self.unsynced_orders.is_empty() || !self.unsynced_clusters.is_empty() {
            warn!(
                orders = self.unsynced_orders.len(),
                clusters = self.unsynced_clusters.len(),
                "台账 worker 退出时仍有未落盘写入"
            );
        }
        info!(orders = self.ledger.len(), "台账 worker 退出");
    }

    fn handle(&mut self, cmd: LedgerCommand) {
        let now = Utc::now();
        match cmd {
            LedgerCommand::CreateOrder { order, reply } => {
                let _ = reply.send(self.create_order(order));
            }
            LedgerCommand::RegisterDriver { driver, reply } => {
                let _ = reply.send(self.register_driver(driver));
            }
            LedgerCommand::MarkStatus {
                order_id,
                status,
                reply,
            } => {
                let _ = reply.send(self.mark_status(&order_id, status, now));
            }
            LedgerCommand::PeekFifo { limit, reply } => {
                let _ = reply.send(self.ledger.peek_fifo(limit, now));
            }
            LedgerCommand::StatusCounts { reply } => {
                let _ = reply.send(self.ledger.status_counts());
            }
            LedgerCommand::OrderViews { order_ids, reply } => {
                let _ = reply.send(self.ledger.orders_by_ids(&order_ids));
            }
            LedgerCommand::CapturePass {
                pass_id,
                positions,
                reply,
            } => {
                let snapshot =
                    PassSnapshot::capture(pass_id, &self.ledger, &self.drivers, positions, now);
                let _ = reply.send(snapshot);
            }
            LedgerCommand::CommitPass { plan, reply } => {
                let _ = reply.send(self.commit_pass(&plan, now));
            }
            LedgerCommand::ReassignForHandover { plan, reply } => {
                let _ = reply.send(self.reassign_for_handover(&plan, now));
            }
            LedgerCommand::RestoreDrivers {
                handover_id,
                prior,
                reply,
            } => {
                let _ = reply.send(self.restore_drivers(&handover_id, &prior, now));
            }
        }
    }

    fn create_order(&mut self, order: Order) -> DispatchResult<usize> {
        let order_id = order.order_id.clone();
        if let Some(stored) = self.ledger.get(&order_id) {
            if !stored.same_submission(&order) {
                return Err(DispatchError::DuplicateOrder(order_id));
            }
            // 同一订单的重试: 补写后返回当前排位（已离开 pending 时为 0）
            debug!(order_id = %order_id, "重复入账按重试处理");
            self.sync_order(&order_id)?;
            return Ok(self.ledger.fifo_rank(&order_id).unwrap_or(0));
        }

        let rank = self.ledger.enqueue(order)?;
        self.stage_order(&order_id, RowWrite::Full, Vec::new());
        self.sync_order(&order_id)?;
        Ok(rank)
    }

    fn register_driver(&mut self, mut driver: Driver) -> DispatchResult<()> {
        if driver.driver_id.trim().is_empty() {
            return Err(DispatchError::Validation("driver_id 不能为空".to_string()));
        }
        if driver.capacity == 0 {
            driver.capacity = self.default_capacity;
        }
        info!(
            driver_id = %driver.driver_id,
            capacity = driver.capacity,
            available = driver.available,
            "登记司机"
        );
        self.drivers.insert(driver.driver_id.clone(), driver.clone());
        self.repo
            .save_driver(&driver)
            .map_err(|e| DispatchError::storage("save_driver", e))
    }

    fn mark_status(
        &mut self,
        order_id: &str,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> DispatchResult<OrderStatusChange> {
        if let Some(change) = self.repeated_status(order_id, status) {
            debug!(order_id, status = %status, "重复的状态推进按重试处理");
            self.sync_order(order_id)?;
            return Ok(change);
        }

        let change = self.ledger.mark_status(order_id, status, now)?;
        self.publisher.emit_status_change(order_id, status);
        // 回退到 pending 会清空聚类,需整行覆盖
        let row = if status == OrderStatus::Pending {
            RowWrite::Full
        } else {
            RowWrite::Status
        };
        self.stage_order(order_id, row, vec![change.clone()]);
        self.sync_order(order_id)?;
        Ok(change)
    }

    /// 订单当前状态已是 status,且最后一条历史正是推进到 status 的记录
    fn repeated_status(&self, order_id: &str, status: OrderStatus) -> Option<OrderStatusChange> {
        let order = self.ledger.get(order_id)?;
        if order.status != status {
            return None;
        }
        self.ledger
            .history(order_id)
            .last()
            .filter(|c| c.to_status == status && c.from_status != status)
            .cloned()
    }

    fn commit_pass(&mut self, plan: &PassPlan, now: DateTime<Utc>) -> DispatchResult<PassOutcome> {
        let pairs = plan.assignment.pairs();
        let changes = self
            .ledger
            .commit_pass(plan.snapshot_epoch, &plan.clusters, &pairs, now)?;
        publish_pass_events(&self.publisher, &pairs, &changes);

        for change in changes {
            let order_id = change.order_id.clone();
            self.stage_order(&order_id, RowWrite::Full, vec![change]);
        }
        for cluster in &plan.clusters {
            let cluster_pairs = plan.assignment.pairs_for_cluster(&cluster.cluster_id);
            if !cluster_pairs.is_empty() {
                self.unsynced_clusters.push_back((cluster.clone(), cluster_pairs));
            }
        }
        // 顺带补写此前失败的写入
        self.sync_all()?;

        info!(
            pass_id = %plan.pass_id,
            clusters = plan.clusters.len(),
            assigned = pairs.len(),
            unassigned = plan.assignment.unassigned.len(),
            "派单轮次已提交"
        );
        Ok(plan.committed_outcome())
    }

    fn reassign_for_handover(
        &mut self,
        plan: &CompletionPlan,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<OrderStatusChange>> {
        if let Some(changes) = self.repeated_reassignment(plan) {
            debug!(handover_id = %plan.handover_id, "重复的交接改派按重试处理");
            self.sync_orders(&plan.order_ids)?;
            return Ok(changes);
        }

        let changes = self.ledger.reassign_for_handover(
            &plan.order_ids,
            &plan.from_driver_id,
            &plan.to_driver_id,
            &plan.handover_id,
            now,
        )?;
        for change in &changes {
            self.publisher
                .emit_assignment(&change.order_id, &plan.to_driver_id);
        }
        self.stage_changes(&changes);
        self.sync_orders(&plan.order_ids)?;
        Ok(changes)
    }

    /// 全部订单已归属接收方,且最后一条历史来自同一交接
    fn repeated_reassignment(&self, plan: &CompletionPlan) -> Option<Vec<OrderStatusChange>> {
        let note = format!("handover {}", plan.handover_id);
        plan.order_ids
            .iter()
            .map(|order_id| {
                let order = self.ledger.get(order_id)?;
                if order.driver_id.as_deref() != Some(plan.to_driver_id.as_str()) {
                    return None;
                }
                self.ledger
                    .history(order_id)
                    .last()
                    .filter(|c| c.note.as_deref() == Some(note.as_str()))
                    .cloned()
            })
            .collect()
    }

    fn restore_drivers(
        &mut self,
        handover_id: &str,
        prior: &[PriorDriver],
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<OrderStatusChange>> {
        let changes = self.ledger.restore_drivers(prior, handover_id, now);
        if !changes.is_empty() {
            warn!(handover_id, restored = changes.len(), "交接取消，订单归属已恢复");
        }
        self.stage_changes(&changes);
        let order_ids: Vec<String> = prior.iter().map(|p| p.order_id.clone()).collect();
        self.sync_orders(&order_ids)?;
        Ok(changes)
    }

    // ==========================================
    // 落盘与补写
    // ==========================================

    fn stage_order(&mut self, order_id: &str, row: RowWrite, history: Vec<OrderStatusChange>) {
        let entry = self
            .unsynced_orders
            .entry(order_id.to_string())
            .or_insert_with(|| UnsyncedOrder {
                row,
                history: VecDeque::new(),
            });
        if row == RowWrite::Full {
            entry.row = RowWrite::Full;
        }
        entry.history.extend(history);
    }

    /// 改派类变更: 整行覆盖
    fn stage_changes(&mut self, changes: &[OrderStatusChange]) {
        for change in changes {
            let order_id = change.order_id.clone();
            self.stage_order(&order_id, RowWrite::Full, vec![change.clone()]);
        }
    }

    fn sync_orders(&mut self, order_ids: &[String]) -> DispatchResult<()> {
        for order_id in order_ids {
            self.sync_order(order_id)?;
        }
        Ok(())
    }

    /// 写出单个订单的待同步内容; 失败时未写部分保留
    fn sync_order(&mut self, order_id: &str) -> DispatchResult<()> {
        let Some(pending) = self.unsynced_orders.get_mut(order_id) else {
            return Ok(());
        };
        if let Some(order) = self.ledger.get(order_id) {
            match pending.row {
                RowWrite::Full => self
                    .repo
                    .save_order(order)
                    .map_err(|e| DispatchError::storage("save_order", e))?,
                RowWrite::Status => self
                    .repo
                    .save_order_status(order_id, order.status)
                    .map_err(|e| DispatchError::storage("save_order_status", e))?,
            }
            // 行已落盘,后续只剩历史
            pending.row = RowWrite::Status;
        }
        while let Some(change) = pending.history.front() {
            self.repo
                .append_status_change(change)
                .map_err(|e| DispatchError::storage("append_status_change", e))?;
            pending.history.pop_front();
        }
        self.unsynced_orders.remove(order_id);
        Ok(())
    }

    /// 按写入顺序补写全部订单与聚类
    fn sync_all(&mut self) -> DispatchResult<()> {
        let order_ids: Vec<String> = self.unsynced_orders.keys().cloned().collect();
        self.sync_orders(&order_ids)?;
        while let Some((cluster, pairs)) = self.unsynced_clusters.front() {
            self.repo
                .save_cluster_assignment(cluster, pairs)
                .map_err(|e| DispatchError::storage("save_cluster_assignment", e))?;
            self.unsynced_clusters.pop_front();
        }
        Ok(())
    }
}
