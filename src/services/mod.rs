// ==========================================
// 配送调度核心 - 服务层（异步运行时）
// ==========================================
// 职责: 以 worker + 消息通道驱动引擎层
// 红线: 引擎状态只归各自 worker 所有,跨 worker 只传消息
// ==========================================

pub mod handover_worker;
pub mod ingestion_worker;
pub mod ledger_worker;
pub mod pass_queue;
pub mod pass_worker;
pub mod runtime;

pub use pass_queue::{PassQueue, PassTrigger, TriggerReason};
pub use runtime::{DispatchHandle, DispatchRuntime};

use crate::engine::error::{DispatchError, DispatchResult};
use tokio::sync::{mpsc, oneshot};

/// 向 worker 发送命令并等待回复
pub(crate) async fn request<C, T>(
    tx: &mpsc::Sender<C>,
    make: impl FnOnce(oneshot::Sender<T>) -> C,
) -> DispatchResult<T> {
    let (reply, rx) = oneshot::channel();
    tx.send(make(reply))
        .await
        .map_err(|_| DispatchError::RuntimeUnavailable("worker 已关闭".to_string()))?;
    rx.await
        .map_err(|_| DispatchError::RuntimeUnavailable("worker 未回复".to_string()))
}
