// ==========================================
// 配送调度核心 - 引擎层事件发布
// ==========================================
// 职责: 定义调度出站事件 trait（派单、交接排期、状态变更）
// 说明: Engine 层定义 trait，推送通道由外部实现
// 红线: 事件发布失败只记日志，不回滚已提交的台账状态
// ==========================================

use crate::domain::{Handover, OrderStatus};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::{Arc, Mutex};

// ==========================================
// 调度事件
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// 订单派给司机
    Assignment { order_id: String, driver_id: String },
    /// 交接已排期
    HandoverScheduled { handover: Box<Handover> },
    /// 订单状态变更
    StatusChange { order_id: String, status: OrderStatus },
}

impl DispatchEvent {
    /// 转换为字符串标识
    pub fn as_str(&self) -> &str {
        match self {
            DispatchEvent::Assignment { .. } => "Assignment",
            DispatchEvent::HandoverScheduled { .. } => "HandoverScheduled",
            DispatchEvent::StatusChange { .. } => "StatusChange",
        }
    }
}

pub type PublishError = Box<dyn Error + Send + Sync>;

// ==========================================
// 事件发布 Trait
// ==========================================

/// 调度事件发布者 Trait
///
/// 实现者负责把事件推送到司机端/下游系统
pub trait DispatchEventPublisher: Send + Sync {
    /// 发布调度事件
    fn publish(&self, event: DispatchEvent) -> Result<(), PublishError>;

    fn emit_assignment(&self, order_id: &str, driver_id: &str) -> Result<(), PublishError> {
        self.publish(DispatchEvent::Assignment {
            order_id: order_id.to_string(),
            driver_id: driver_id.to_string(),
        })
    }

    fn emit_handover_scheduled(&self, handover: &Handover) -> Result<(), PublishError> {
        self.publish(DispatchEvent::HandoverScheduled {
            handover: Box::new(handover.clone()),
        })
    }

    fn emit_status_change(&self, order_id: &str, status: OrderStatus) -> Result<(), PublishError> {
        self.publish(DispatchEvent::StatusChange {
            order_id: order_id.to_string(),
            status,
        })
    }
}

/// 空操作事件发布者
///
/// 用于不需要事件发布的场景（如单元测试）
#[derive(Debug, Clone, Default)]
pub struct NoOpEventPublisher;

impl DispatchEventPublisher for NoOpEventPublisher {
    fn publish(&self, event: DispatchEvent) -> Result<(), PublishError> {
        tracing::debug!(event_type = event.as_str(), "NoOpEventPublisher: 跳过事件发布");
        Ok(())
    }
}

/// 记录型事件发布者（测试观察与调试）
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<DispatchEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已记录事件的副本
    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl DispatchEventPublisher for RecordingEventPublisher {
    fn publish(&self, event: DispatchEvent) -> Result<(), PublishError> {
        self.events
            .lock()
            .map_err(|e| format!("锁获取失败: {}", e))?
            .push(event);
        Ok(())
    }
}

/// 可选的事件发布者包装
///
/// 简化 Option<Arc<dyn DispatchEventPublisher>> 的使用；发布失败仅告警
#[derive(Clone, Default)]
pub struct OptionalEventPublisher {
    inner: Option<Arc<dyn DispatchEventPublisher>>,
}

impl OptionalEventPublisher {
    /// 创建带发布者的实例
    pub fn with_publisher(publisher: Arc<dyn DispatchEventPublisher>) -> Self {
        Self {
            inner: Some(publisher),
        }
    }

    /// 创建空实例（不发布事件）
    pub fn none() -> Self {
        Self { inner: None }
    }

    /// 发布事件（如果有发布者）
    pub fn publish(&self, event: DispatchEvent) {
        let event_type = event.as_str().to_string();
        self.forward(&event_type, |publisher| publisher.publish(event));
    }

    /// 订单派给司机
    pub fn emit_assignment(&self, order_id: &str, driver_id: &str) {
        self.forward("Assignment", |publisher| {
            publisher.emit_assignment(order_id, driver_id)
        });
    }

    /// 交接已排期
    pub fn emit_handover_scheduled(&self, handover: &Handover) {
        self.forward("HandoverScheduled", |publisher| {
            publisher.emit_handover_scheduled(handover)
        });
    }

    /// 订单状态变更
    pub fn emit_status_change(&self, order_id: &str, status: OrderStatus) {
        self.forward("StatusChange", |publisher| {
            publisher.emit_status_change(order_id, status)
        });
    }

    fn forward(
        &self,
        event_type: &str,
        send: impl FnOnce(&dyn DispatchEventPublisher) -> Result<(), PublishError>,
    ) {
        match &self.inner {
            Some(publisher) => {
                if let Err(e) = send(publisher.as_ref()) {
                    tracing::warn!(event_type, error = %e, "调度事件发布失败");
                }
            }
            None => {
                tracing::debug!(event_type, "OptionalEventPublisher: 未配置发布者，跳过事件");
            }
        }
    }

    /// 检查是否配置了发布者
    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_publisher() {
        let publisher = NoOpEventPublisher;
        assert!(publisher.emit_assignment("O1", "D1").is_ok());
    }

    #[test]
    fn test_optional_publisher_forwards_to_recorder() {
        let recorder = Arc::new(RecordingEventPublisher::new());
        let publisher = OptionalEventPublisher::with_publisher(recorder.clone());
        assert!(publisher.is_configured());

        publisher.emit_status_change("O1", OrderStatus::Delivered);
        publisher.emit_assignment("O2", "D1");
        let events = recorder.events();
        assert_eq!(
            events,
            vec![
                DispatchEvent::StatusChange {
                    order_id: "O1".to_string(),
                    status: OrderStatus::Delivered,
                },
                DispatchEvent::Assignment {
                    order_id: "O2".to_string(),
                    driver_id: "D1".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_optional_publisher_none() {
        let publisher = OptionalEventPublisher::none();
        assert!(!publisher.is_configured());
        publisher.emit_assignment("O1", "D1");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = DispatchEvent::Assignment {
            order_id: "O1".to_string(),
            driver_id: "D1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "assignment");
    }
}
