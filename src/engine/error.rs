// ==========================================
// 配送调度核心 - 引擎层错误类型
// ==========================================
// 处理口径:
// - InvalidTransition: 直接返回调用方,不重试
// - NoViableAssignment: 记录日志,订单保持 pending
// - NoViableMeetingPoint: 返回调用方,由调用方改期或放弃交接
// - StorageUnavailable: 向上传播,内存状态不回滚
// - StalePass: 丢弃本轮结果,排队下一轮
// ==========================================

use crate::repository::error::RepositoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    // ===== 状态机 =====
    #[error("非法状态转换: {entity} {id} {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    // ===== 派单 / 会合点 =====
    #[error("无可行派单: order_id={order_id}, 原因={reason}")]
    NoViableAssignment { order_id: String, reason: String },

    #[error("无可行会合点: {reason}")]
    NoViableMeetingPoint { reason: String },

    // ===== 轮次 =====
    #[error("派单轮次已过期: snapshot_epoch={snapshot_epoch}, current_epoch={current_epoch}")]
    StalePass {
        snapshot_epoch: u64,
        current_epoch: u64,
    },

    #[error("派单轮次超时: {timeout_ms}ms")]
    PassTimeout { timeout_ms: u64 },

    // ===== 存储 =====
    #[error("存储不可用 ({operation}): {source}")]
    StorageUnavailable {
        operation: &'static str,
        #[source]
        source: RepositoryError,
    },

    // ===== 输入 =====
    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: &'static str, id: String },

    #[error("订单已存在: {0}")]
    DuplicateOrder(String),

    #[error("数据验证失败: {0}")]
    Validation(String),

    // ===== 运行时 =====
    #[error("调度运行时不可用: {0}")]
    RuntimeUnavailable(String),
}

impl DispatchError {
    /// 附带操作名的存储错误
    pub fn storage(operation: &'static str, source: RepositoryError) -> Self {
        DispatchError::StorageUnavailable { operation, source }
    }

    /// 复制一份错误（合并触发的多个等待方共享同一轮结果）
    ///
    /// 存储错误的底层来源不可克隆,以文本形式保留
    pub fn replicate(&self) -> Self {
        match self {
            DispatchError::InvalidTransition { entity, id, from, to } => {
                DispatchError::InvalidTransition {
                    entity: *entity,
                    id: id.clone(),
                    from: from.clone(),
                    to: to.clone(),
                }
            }
            DispatchError::NoViableAssignment { order_id, reason } => {
                DispatchError::NoViableAssignment {
                    order_id: order_id.clone(),
                    reason: reason.clone(),
                }
            }
            DispatchError::NoViableMeetingPoint { reason } => DispatchError::NoViableMeetingPoint {
                reason: reason.clone(),
            },
            DispatchError::StalePass {
                snapshot_epoch,
                current_epoch,
            } => DispatchError::StalePass {
                snapshot_epoch: *snapshot_epoch,
                current_epoch: *current_epoch,
            },
            DispatchError::PassTimeout { timeout_ms } => DispatchError::PassTimeout {
                timeout_ms: *timeout_ms,
            },
            DispatchError::StorageUnavailable { operation, source } => {
                DispatchError::StorageUnavailable {
                    operation: *operation,
                    source: RepositoryError::Unavailable(source.to_string()),
                }
            }
            DispatchError::NotFound { entity, id } => DispatchError::NotFound {
                entity: *entity,
                id: id.clone(),
            },
            DispatchError::DuplicateOrder(id) => DispatchError::DuplicateOrder(id.clone()),
            DispatchError::Validation(msg) => DispatchError::Validation(msg.clone()),
            DispatchError::RuntimeUnavailable(msg) => DispatchError::RuntimeUnavailable(msg.clone()),
        }
    }
}

impl From<RepositoryError> for DispatchError {
    fn from(err: RepositoryError) -> Self {
        DispatchError::StorageUnavailable {
            operation: "repository",
            source: err,
        }
    }
}

/// Result 类型别名
pub type DispatchResult<T> = Result<T, DispatchError>;
