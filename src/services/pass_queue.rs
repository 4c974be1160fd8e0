// ==========================================
// 配送调度核心 - 派单轮次触发队列
// ==========================================
// 职责: 合并轮次触发,保证同一时刻最多一个轮次在跑
// 规则: 轮次进行中到达的任意多次触发,只产生一次后续轮次
// 规则: 过期丢弃的轮次自动补跑,连续补跑不超过 MAX_CONSECUTIVE_STALE_RETRIES 次
// ==========================================

use crate::engine::error::DispatchResult;
use crate::engine::orchestrator::PassOutcome;
use tokio::sync::oneshot;

pub type PassReply = oneshot::Sender<DispatchResult<PassOutcome>>;

/// 连续过期补跑上限; 达到后等待下一次外部或定时触发
pub const MAX_CONSECUTIVE_STALE_RETRIES: u32 = 3;

/// 触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// 外部显式触发
    Manual,
    /// pass_interval 定时触发
    Interval,
    /// 上一轮提交过期后的补跑
    StaleRetry,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Manual => "manual",
            TriggerReason::Interval => "interval",
            TriggerReason::StaleRetry => "stale_retry",
        }
    }
}

/// 一次轮次触发
pub struct PassTrigger {
    pub reason: TriggerReason,
    pub reply: Option<PassReply>,
}

impl PassTrigger {
    pub fn fire_and_forget(reason: TriggerReason) -> Self {
        Self {
            reason,
            reply: None,
        }
    }
}

/// 合并后的一批触发（共享同一轮结果）
pub struct PassBatch {
    pub reasons: Vec<TriggerReason>,
    pub waiters: Vec<PassReply>,
}

impl PassBatch {
    /// 把同一轮结果回复给全部等待方
    pub fn reply_all(self, outcome: &DispatchResult<PassOutcome>) {
        for waiter in self.waiters {
            let copy = match outcome {
                Ok(o) => Ok(o.clone()),
                Err(e) => Err(e.replicate()),
            };
            // 等待方已放弃则忽略
            let _ = waiter.send(copy);
        }
    }
}

#[derive(Default)]
pub struct PassQueue {
    reasons: Vec<TriggerReason>,
    waiters: Vec<PassReply>,
    stale_streak: u32,
}

impl PassQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, trigger: PassTrigger) {
        if !self.reasons.contains(&trigger.reason) {
            self.reasons.push(trigger.reason);
        }
        if let Some(reply) = trigger.reply {
            self.waiters.push(reply);
        }
    }

    /// 记录一轮结果; 过期丢弃且未达连续上限时排队补跑
    ///
    /// # 返回
    /// - true: 已排队补跑
    pub fn record_outcome(&mut self, outcome: &DispatchResult<PassOutcome>) -> bool {
        match outcome {
            Ok(PassOutcome::Discarded { .. }) => {
                if self.stale_streak >= MAX_CONSECUTIVE_STALE_RETRIES {
                    return false;
                }
                self.stale_streak += 1;
                self.push(PassTrigger::fire_and_forget(TriggerReason::StaleRetry));
                true
            }
            _ => {
                self.stale_streak = 0;
                false
            }
        }
    }

    /// 是否有待执行的触发
    pub fn is_pending(&self) -> bool {
        !self.reasons.is_empty()
    }

    /// 取出合并后的一批触发; 队列为空返回 None
    pub fn take(&mut self) -> Option<PassBatch> {
        if !self.is_pending() {
            return None;
        }
        Some(PassBatch {
            reasons: std::mem::take(&mut self.reasons),
            waiters: std::mem::take(&mut self.waiters),
        })
    }
}
