// ==========================================
// 配送调度核心 - 位置采集 worker
// ==========================================
// 职责: 独占 LocationTracker,串行处理定位样本与位置查询
// 红线: 定位写入从不等待派单轮次
// ==========================================

use crate::domain::{GeoPoint, LocationSample};
use crate::engine::tracker::{LocationTracker, SampleOutcome};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

pub enum IngestionCommand {
    Sample {
        sample: LocationSample,
        reply: Option<oneshot::Sender<SampleOutcome>>,
    },
    CurrentLocation {
        driver_id: String,
        reply: oneshot::Sender<Option<LocationSample>>,
    },
    Positions {
        reply: oneshot::Sender<HashMap<String, GeoPoint>>,
    },
    /// 交接规划用: 两名司机的保留轨迹
    Tracks {
        driver_ids: (String, String),
        reply: oneshot::Sender<(Vec<LocationSample>, Vec<LocationSample>)>,
    },
}

pub struct IngestionWorker {
    tracker: LocationTracker,
    rx: mpsc::Receiver<IngestionCommand>,
    shutdown: watch::Receiver<bool>,
}

impl IngestionWorker {
    pub fn new(
        tracker: LocationTracker,
        rx: mpsc::Receiver<IngestionCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            tracker,
            rx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("位置采集 worker 启动");
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
        // 排空已入队的样本
        self.rx.close();
        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd);
        }
        info!("位置采集 worker 退出");
    }

    fn handle(&mut self, cmd: IngestionCommand) {
        match cmd {
            IngestionCommand::Sample { sample, reply } => {
                let driver_id = sample.driver_id.clone();
                let outcome = self.tracker.record_sample(&driver_id, sample);
                if outcome != SampleOutcome::Accepted {
                    debug!(driver_id = %driver_id, outcome = ?outcome, "定位样本未采纳");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            IngestionCommand::CurrentLocation { driver_id, reply } => {
                let _ = reply.send(self.tracker.current_location(&driver_id));
            }
            IngestionCommand::Positions { reply } => {
                let _ = reply.send(self.tracker.positions());
            }
            IngestionCommand::Tracks { driver_ids, reply } => {
                let a = self.tracker.retained(&driver_ids.0);
                let b = self.tracker.retained(&driver_ids.1);
                let _ = reply.send((a, b));
            }
        }
    }
}
