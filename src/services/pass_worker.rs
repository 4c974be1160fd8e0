// ==========================================
// 配送调度核心 - 派单轮次 worker
// ==========================================
// 流程:
// 1) 合并触发 (PassQueue)
// 2) 位置快照 + 台账快照
// 3) spawn_blocking 执行聚类 + 派单,受 pass_timeout 约束
// 4) 交台账 worker 提交; 过期则丢弃并排队补跑（连续补跑有上限）
// 红线: 同一时刻最多一个轮次在跑
// 红线: 超时的轮次不修改台账
// ==========================================

use crate::engine::error::{DispatchError, DispatchResult};
use crate::engine::orchestrator::{DispatchOrchestrator, PassOutcome};
use crate::services::ingestion_worker::IngestionCommand;
use crate::services::ledger_worker::LedgerCommand;
use crate::services::pass_queue::{PassQueue, PassTrigger, MAX_CONSECUTIVE_STALE_RETRIES};
use crate::services::request;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct PassWorker {
    orchestrator: Arc<DispatchOrchestrator>,
    ledger_tx: mpsc::Sender<LedgerCommand>,
    ingestion_tx: mpsc::Sender<IngestionCommand>,
    rx: mpsc::Receiver<PassTrigger>,
    shutdown: watch::Receiver<bool>,
    pass_timeout: Duration,
    queue: PassQueue,
    pass_seq: u64,
}

impl PassWorker {
    pub fn new(
        orchestrator: Arc<DispatchOrchestrator>,
        ledger_tx: mpsc::Sender<LedgerCommand>,
        ingestion_tx: mpsc::Sender<IngestionCommand>,
        rx: mpsc::Receiver<PassTrigger>,
        shutdown: watch::Receiver<bool>,
        pass_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            ledger_tx,
            ingestion_tx,
            rx,
            shutdown,
            pass_timeout,
            queue: PassQueue::new(),
            pass_seq: 0,
        }
    }

    pub async fn run(mut self) {
        info!(timeout_ms = self.pass_timeout.as_millis() as u64, "派单轮次 worker 启动");
        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                trigger = self.rx.recv() => match trigger {
                    Some(trigger) => self.queue.push(trigger),
                    None => break,
                },
            }
            self.drain_pending();

            while let Some(batch) = self.queue.take() {
                debug!(reasons = ?batch.reasons, waiters = batch.waiters.len(), "执行合并后的派单轮次");
                let outcome = self.run_once().await;
                let retried = self.queue.record_outcome(&outcome);
                if let Ok(PassOutcome::Discarded { pass_id }) = &outcome {
                    if retried {
                        debug!(pass_id = %pass_id, "轮次结果过期，排队补跑");
                    } else {
                        warn!(
                            pass_id = %pass_id,
                            limit = MAX_CONSECUTIVE_STALE_RETRIES,
                            "连续过期达到上限，等待下一次触发"
                        );
                    }
                }
                batch.reply_all(&outcome);
                if *self.shutdown.borrow() {
                    break;
                }
                // 轮次进行中到达的触发合并为一次后续轮次
                self.drain_pending();
            }
        }

        // 退出前未执行的触发统一回复
        self.rx.close();
        self.drain_pending();
        if let Some(batch) = self.queue.take() {
            batch.reply_all(&Err(DispatchError::RuntimeUnavailable(
                "调度运行时正在关闭".to_string(),
            )));
        }
        info!(passes = self.pass_seq, "派单轮次 worker 退出");
    }

    fn drain_pending(&mut self) {
        while let Ok(trigger) = self.rx.try_recv() {
            self.queue.push(trigger);
        }
    }

    async fn run_once(&mut self) -> DispatchResult<PassOutcome> {
        self.pass_seq += 1;
        let pass_id = format!("PASS-{:06}", self.pass_seq);

        let positions =
            request(&self.ingestion_tx, |reply| IngestionCommand::Positions { reply }).await?;
        let snapshot = request(&self.ledger_tx, |reply| LedgerCommand::CapturePass {
            pass_id: pass_id.clone(),
            positions,
            reply,
        })
        .await?;
        if snapshot.is_empty() {
            debug!(pass_id = %pass_id, "快照无待派订单，轮次取消");
            return Ok(PassOutcome::Empty);
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let task = tokio::task::spawn_blocking(move || orchestrator.plan_pass(&snapshot));
        let plan = match tokio::time::timeout(self.pass_timeout, task).await {
            Ok(Ok(plan)) => plan,
            Ok(Err(join_err)) => {
                return Err(DispatchError::RuntimeUnavailable(format!(
                    "派单轮次计算异常退出: {}",
                    join_err
                )));
            }
            Err(_) => {
                let timeout_ms = self.pass_timeout.as_millis() as u64;
                warn!(pass_id = %pass_id, timeout_ms, "派单轮次超时，结果丢弃");
                return Err(DispatchError::PassTimeout { timeout_ms });
            }
        };

        let committed = request(&self.ledger_tx, |reply| LedgerCommand::CommitPass {
            plan: Box::new(plan),
            reply,
        })
        .await?;
        match committed {
            Err(DispatchError::StalePass {
                snapshot_epoch,
                current_epoch,
            }) => {
                debug!(pass_id = %pass_id, snapshot_epoch, current_epoch, "台账已变化，丢弃本轮结果");
                Ok(PassOutcome::Discarded { pass_id })
            }
            other => other,
        }
    }
}
