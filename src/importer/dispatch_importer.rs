// ==========================================
// 配送调度核心 - 调度主数据 CSV 导入器
// ==========================================
// 支持: 司机 / 固定会合点 / 订单
// 流程: 读取 CSV -> 行映射 + 校验 -> 批内去重 -> 写入仓储
// 红线: 坏行只跳过并记录原因,不中断整批导入
// 红线: 写入仓储失败立即返回
// ==========================================

use crate::domain::{Driver, GeoPoint, MeetingPoint, Order, OrderStatus, PriorityTier};
use crate::importer::csv_reader::{read_csv_records, RawRecord};
use crate::importer::error::{ImportError, ImportResult};
use crate::repository::DispatchRepository;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

// ==========================================
// 列定义
// ==========================================
pub const DRIVER_COLUMNS: &[&str] = &["driver_id", "capacity"];
pub const MEETING_POINT_COLUMNS: &[&str] = &["meeting_point_id", "lat", "lon"];
pub const ORDER_COLUMNS: &[&str] = &[
    "order_id",
    "created_at",
    "pickup_lat",
    "pickup_lon",
    "delivery_lat",
    "delivery_lon",
];

// ==========================================
// ImportSummary - 单文件导入结果
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportSummary {
    pub total_rows: usize,
    pub imported: usize,
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRow {
    pub row: usize,
    pub reason: String,
}

impl ImportSummary {
    fn reject(&mut self, row: usize, err: &ImportError) {
        warn!(row, error = %err, "行数据被拒绝");
        self.rejected.push(RejectedRow {
            row,
            reason: err.to_string(),
        });
    }
}

// ==========================================
// 行映射
// ==========================================

pub fn map_driver(record: &RawRecord) -> ImportResult<Driver> {
    let driver_id = record.required("driver_id")?.to_string();
    let capacity: u32 = record.parse("capacity")?;
    if capacity == 0 {
        return Err(ImportError::ValueRangeError {
            row: record.row,
            field: "capacity".to_string(),
            value: 0.0,
            min: 1.0,
            max: f64::from(u32::MAX),
        });
    }
    Ok(Driver {
        name: record
            .optional("name")
            .map(str::to_string)
            .unwrap_or_else(|| driver_id.clone()),
        driver_id,
        capacity,
        available: record.parse_bool_or("available", true)?,
        vehicle_type: record.optional("vehicle_type").map(str::to_string),
    })
}

pub fn map_meeting_point(record: &RawRecord) -> ImportResult<MeetingPoint> {
    let id = record.required("meeting_point_id")?.to_string();
    let position = GeoPoint::new(
        record.parse_in_range("lat", -90.0, 90.0)?,
        record.parse_in_range("lon", -180.0, 180.0)?,
    );
    let mut point = MeetingPoint::registered(
        id.clone(),
        record.optional("name").unwrap_or(id.as_str()),
        position,
    );
    point.active = record.parse_bool_or("active", true)?;
    Ok(point)
}

pub fn map_order(record: &RawRecord) -> ImportResult<Order> {
    let order_id = record.required("order_id")?.to_string();
    let created_at = record.parse_timestamp("created_at")?;
    let priority = record.parse_or("priority", PriorityTier::Normal)?;
    let origin = GeoPoint::new(
        record.parse_in_range("pickup_lat", -90.0, 90.0)?,
        record.parse_in_range("pickup_lon", -180.0, 180.0)?,
    );
    let destination = GeoPoint::new(
        record.parse_in_range("delivery_lat", -90.0, 90.0)?,
        record.parse_in_range("delivery_lon", -180.0, 180.0)?,
    );

    let mut order = Order::new(order_id, created_at, priority, origin, destination);
    order.items = record.parse_or("items", 1u32)?;
    order.weight_kg = record.parse_or("weight_kg", 0.0f64)?;
    if order.weight_kg < 0.0 {
        return Err(ImportError::ValueRangeError {
            row: record.row,
            field: "weight_kg".to_string(),
            value: order.weight_kg,
            min: 0.0,
            max: f64::MAX,
        });
    }

    // 历史导出可能带状态; 只接受 pending,其余由调度流程产生
    let status = record.parse_or("status", OrderStatus::Pending)?;
    if status != OrderStatus::Pending {
        return Err(ImportError::TypeConversionError {
            row: record.row,
            field: "status".to_string(),
            message: format!("仅可导入 pending 订单, 实际 {}", status),
        });
    }
    Ok(order)
}

// ==========================================
// DispatchCsvImporter
// ==========================================
pub struct DispatchCsvImporter<'a> {
    repo: &'a dyn DispatchRepository,
}

impl<'a> DispatchCsvImporter<'a> {
    pub fn new(repo: &'a dyn DispatchRepository) -> Self {
        Self { repo }
    }

    pub fn import_drivers(&self, path: &Path) -> ImportResult<ImportSummary> {
        info!(file = %path.display(), "开始导入司机");
        let summary = self.import_with(path, DRIVER_COLUMNS, map_driver, |d| d.driver_id.clone(), |d| {
            self.repo.save_driver(d)
        })?;
        info!(imported = summary.imported, rejected = summary.rejected.len(), "司机导入完成");
        Ok(summary)
    }

    pub fn import_meeting_points(&self, path: &Path) -> ImportResult<ImportSummary> {
        info!(file = %path.display(), "开始导入会合点");
        let summary = self.import_with(
            path,
            MEETING_POINT_COLUMNS,
            map_meeting_point,
            |p| p.meeting_point_id.clone(),
            |p| self.repo.save_meeting_point(p),
        )?;
        info!(imported = summary.imported, rejected = summary.rejected.len(), "会合点导入完成");
        Ok(summary)
    }

    pub fn import_orders(&self, path: &Path) -> ImportResult<ImportSummary> {
        info!(file = %path.display(), "开始导入订单");
        let summary = self.import_with(path, ORDER_COLUMNS, map_order, |o| o.order_id.clone(), |o| {
            self.repo.save_order(o)
        })?;
        info!(imported = summary.imported, rejected = summary.rejected.len(), "订单导入完成");
        Ok(summary)
    }

    fn import_with<T>(
        &self,
        path: &Path,
        columns: &[&str],
        map: impl Fn(&RawRecord) -> ImportResult<T>,
        key_of: impl Fn(&T) -> String,
        save: impl Fn(&T) -> crate::repository::RepositoryResult<()>,
    ) -> ImportResult<ImportSummary> {
        let records = read_csv_records(path, columns)?;
        let mut summary = ImportSummary {
            total_rows: records.len(),
            ..Default::default()
        };
        let mut seen = HashSet::new();

        for record in &records {
            let item = match map(record) {
                Ok(item) => item,
                Err(e) => {
                    summary.reject(record.row, &e);
                    continue;
                }
            };
            let key = key_of(&item);
            if !seen.insert(key.clone()) {
                summary.reject(record.row, &ImportError::DuplicateKey { row: record.row, id: key });
                continue;
            }
            save(&item)?;
            summary.imported += 1;
        }
        Ok(summary)
    }
}
