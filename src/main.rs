// ==========================================
// 配送调度核心 - 服务主入口
// ==========================================
// 用法: delivery-dispatch [db_path]
// 流程: 日志 -> 配置 -> 仓储 -> 运行时 -> 等待 Ctrl+C -> 关闭
// ==========================================

use anyhow::Context;
use delivery_dispatch::config::{ConfigManager, DispatchConfigReader};
use delivery_dispatch::engine::events::{
    DispatchEvent, DispatchEventPublisher, OptionalEventPublisher, PublishError,
};
use delivery_dispatch::repository::SqliteDispatchRepository;
use delivery_dispatch::services::DispatchRuntime;
use delivery_dispatch::{db, logging};
use std::sync::Arc;

/// 服务模式下未配置 pass_interval_secs 时的定时派单间隔
const SERVICE_PASS_INTERVAL_SECS: u64 = 30;

/// 把出站事件写入日志（JSON）
struct LogEventPublisher;

impl DispatchEventPublisher for LogEventPublisher {
    fn publish(&self, event: DispatchEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(&event)?;
        tracing::info!(target: "dispatch_events", event_type = event.as_str(), %payload, "调度事件");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    tracing::info!("==================================================");
    tracing::info!("{} v{}", delivery_dispatch::APP_NAME, delivery_dispatch::VERSION);
    tracing::info!("==================================================");

    let db_path = std::env::args()
        .nth(1)
        .unwrap_or_else(db::default_db_path);
    tracing::info!("使用数据库: {}", db_path);

    // ===== 配置 =====
    let config_manager = ConfigManager::new(&db_path)
        .map_err(|e| anyhow::anyhow!(e))
        .context("无法打开配置存储")?;
    let mut config = config_manager
        .load_dispatch_config()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("调度配置加载失败")?;
    if let Ok(snapshot) = config_manager.get_config_snapshot() {
        tracing::debug!(config = %snapshot, "当前调度配置");
    }
    // 服务没有入站触发适配器,轮次只能靠定时触发
    if config.runtime.pass_interval().is_none() {
        tracing::info!(
            interval_secs = SERVICE_PASS_INTERVAL_SECS,
            "未配置 pass_interval_secs，服务模式使用默认定时派单"
        );
        config.runtime.pass_interval_secs = Some(SERVICE_PASS_INTERVAL_SECS);
    }

    // ===== 仓储与运行时 =====
    let repo = SqliteDispatchRepository::new(&db_path).context("无法打开调度数据库")?;
    let runtime = DispatchRuntime::start(
        config,
        Arc::new(repo),
        OptionalEventPublisher::with_publisher(Arc::new(LogEventPublisher)),
    )
    .await
    .context("调度运行时启动失败")?;

    let handle = runtime.handle();
    match handle.status_counts().await {
        Ok(counts) => {
            for (status, count) in counts {
                tracing::info!(status = %status, count, "订单状态分布");
            }
        }
        Err(e) => tracing::warn!(error = %e, "订单状态分布读取失败"),
    }
    // 启动后立即处理恢复出来的 pending 订单
    if let Err(e) = handle.request_pass() {
        tracing::warn!(error = %e, "启动派单轮次触发失败");
    }

    tokio::signal::ctrl_c()
        .await
        .context("无法监听 Ctrl+C 信号")?;
    tracing::info!("收到退出信号，正在关闭");
    runtime.shutdown().await;
    Ok(())
}
