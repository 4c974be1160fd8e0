// ==========================================
// 配送调度核心 - SQLite Repository
// ==========================================
// 红线: Repository 不含业务逻辑
// 约束: 所有查询使用参数化; 多行写入使用事务
// 时间: DateTime<Utc> 通过 rusqlite chrono 特性以 RFC3339 文本存储
// ==========================================

use crate::db::{ensure_schema, open_sqlite_connection};
use crate::domain::{
    ArrivalAcks, Cluster, Driver, GeoPoint, Handover, MeetingPoint, Order, OrderStatus,
    OrderStatusChange, PriorDriver,
};
use crate::repository::dispatch_repo::{DispatchRepository, OrderAssignment};
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

// ==========================================
// SqliteDispatchRepository
// ==========================================
pub struct SqliteDispatchRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDispatchRepository {
    /// 打开数据库并建表
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = open_sqlite_connection(db_path)?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建仓储实例（与 ConfigManager 共享连接）
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        {
            let guard = conn
                .lock()
                .map_err(|e| RepositoryError::LockError(e.to_string()))?;
            ensure_schema(&guard)?;
        }
        Ok(Self { conn })
    }

    /// 共享连接句柄
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 读取订单状态变更历史（按写入顺序）
    pub fn load_status_history(&self, order_id: &str) -> RepositoryResult<Vec<OrderStatusChange>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT order_id, from_status, to_status, driver_id, changed_at, note
            FROM order_status_history
            WHERE order_id = ?1
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![order_id], |row| {
            Ok(OrderStatusChange {
                order_id: row.get(0)?,
                from_status: parse_text(row, 1)?,
                to_status: parse_text(row, 2)?,
                driver_id: row.get(3)?,
                changed_at: row.get(4)?,
                note: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// 读取聚类成员（按 FIFO 顺序）
    pub fn load_cluster_members(&self, cluster_id: &str) -> RepositoryResult<Vec<(String, Option<String>)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT order_id, driver_id FROM cluster_members WHERE cluster_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![cluster_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// 按主键读取交接记录
    pub fn find_handover(&self, handover_id: &str) -> RepositoryResult<Option<Handover>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE handover_id = ?1", HANDOVER_SELECT))?;
        let mut rows = stmt.query_map(params![handover_id], map_handover_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

// ==========================================
// 行映射
// ==========================================

const ORDER_SELECT: &str = r#"
    SELECT order_id, created_at, status, priority,
           origin_lat, origin_lon, dest_lat, dest_lon,
           items, weight_kg, cluster_id, driver_id
    FROM orders
"#;

const HANDOVER_SELECT: &str = r#"
    SELECT handover_id, from_driver_id, to_driver_id,
           meeting_point_id, meeting_point_name, meeting_lat, meeting_lon, ad_hoc,
           scheduled_at, status, order_ids_json, prior_drivers_json,
           from_confirmed_at, to_confirmed_at, created_at, completed_at, cancelled_at
    FROM handovers
"#;

/// 文本列解析为枚举
fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// JSON 文本列反序列化
fn parse_json<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn map_order_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        order_id: row.get(0)?,
        created_at: row.get(1)?,
        admission_seq: None,
        status: parse_text(row, 2)?,
        priority: parse_text(row, 3)?,
        origin: GeoPoint::new(row.get(4)?, row.get(5)?),
        destination: GeoPoint::new(row.get(6)?, row.get(7)?),
        items: row.get(8)?,
        weight_kg: row.get(9)?,
        cluster_id: row.get(10)?,
        driver_id: row.get(11)?,
    })
}

fn map_handover_row(row: &Row<'_>) -> rusqlite::Result<Handover> {
    let order_ids: Vec<String> = parse_json(row, 10)?;
    let prior_drivers: Vec<PriorDriver> = parse_json(row, 11)?;
    Ok(Handover {
        handover_id: row.get(0)?,
        from_driver_id: row.get(1)?,
        to_driver_id: row.get(2)?,
        meeting_point: MeetingPoint {
            meeting_point_id: row.get(3)?,
            name: row.get(4)?,
            position: GeoPoint::new(row.get(5)?, row.get(6)?),
            active: true,
            ad_hoc: row.get(7)?,
        },
        scheduled_at: row.get(8)?,
        status: parse_text(row, 9)?,
        order_ids,
        prior_drivers,
        acks: ArrivalAcks {
            from_confirmed_at: row.get(12)?,
            to_confirmed_at: row.get(13)?,
        },
        created_at: row.get(14)?,
        completed_at: row.get(15)?,
        cancelled_at: row.get(16)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> RepositoryResult<String> {
    serde_json::to_string(value).map_err(|e| RepositoryError::FieldValueError {
        field: "json".to_string(),
        message: e.to_string(),
    })
}

// ==========================================
// DispatchRepository 实现
// ==========================================
impl DispatchRepository for SqliteDispatchRepository {
    fn load_pending_orders(&self) -> RepositoryResult<Vec<Order>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status = ?1 ORDER BY created_at, order_id",
            ORDER_SELECT
        ))?;
        let rows = stmt.query_map(params![OrderStatus::Pending.to_db_str()], map_order_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn load_open_orders(&self) -> RepositoryResult<Vec<Order>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status NOT IN (?1, ?2, ?3) ORDER BY created_at, order_id",
            ORDER_SELECT
        ))?;
        let rows = stmt.query_map(
            params![
                OrderStatus::Delivered.to_db_str(),
                OrderStatus::Failed.to_db_str(),
                OrderStatus::Cancelled.to_db_str(),
            ],
            map_order_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn save_order(&self, order: &Order) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO orders (
                order_id, created_at, status, priority,
                origin_lat, origin_lon, dest_lat, dest_lon,
                items, weight_kg, cluster_id, driver_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(order_id) DO UPDATE SET
                status = excluded.status,
                priority = excluded.priority,
                origin_lat = excluded.origin_lat,
                origin_lon = excluded.origin_lon,
                dest_lat = excluded.dest_lat,
                dest_lon = excluded.dest_lon,
                items = excluded.items,
                weight_kg = excluded.weight_kg,
                cluster_id = excluded.cluster_id,
                driver_id = excluded.driver_id
            "#,
            params![
                order.order_id,
                order.created_at,
                order.status.to_db_str(),
                order.priority.to_db_str(),
                order.origin.lat,
                order.origin.lon,
                order.destination.lat,
                order.destination.lon,
                order.items,
                order.weight_kg,
                order.cluster_id,
                order.driver_id,
            ],
        )?;
        Ok(())
    }

    fn save_order_status(&self, order_id: &str, status: OrderStatus) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE orders SET status = ?1 WHERE order_id = ?2",
            params![status.to_db_str(), order_id],
        )?;
        if affected == 0 {
            return Err(RepositoryError::NotFound {
                entity: "Order".to_string(),
                id: order_id.to_string(),
            });
        }
        Ok(())
    }

    fn append_status_change(&self, change: &OrderStatusChange) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO order_status_history (order_id, from_status, to_status, driver_id, note, changed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                change.order_id,
                change.from_status.to_db_str(),
                change.to_status.to_db_str(),
                change.driver_id,
                change.note,
                change.changed_at,
            ],
        )?;
        Ok(())
    }

    fn save_cluster_assignment(
        &self,
        cluster: &Cluster,
        assignments: &[OrderAssignment],
    ) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT OR REPLACE INTO clusters (cluster_id, pass_id, centroid_lat, centroid_lon, radius_km, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                cluster.cluster_id,
                cluster.pass_id,
                cluster.centroid.lat,
                cluster.centroid.lon,
                cluster.radius_km,
                cluster.created_at,
            ],
        )?;
        tx.execute(
            "DELETE FROM cluster_members WHERE cluster_id = ?1",
            params![cluster.cluster_id],
        )?;

        {
            let mut insert_member = tx.prepare(
                "INSERT INTO cluster_members (cluster_id, seq, order_id, driver_id) VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut update_order = tx.prepare(
                "UPDATE orders SET status = ?1, cluster_id = ?2, driver_id = ?3 WHERE order_id = ?4",
            )?;

            for (seq, order_id) in cluster.member_ids.iter().enumerate() {
                let driver_id = assignments
                    .iter()
                    .find(|(id, _)| id == order_id)
                    .map(|(_, d)| d.as_str());
                insert_member.execute(params![cluster.cluster_id, seq as i64, order_id, driver_id])?;

                if let Some(driver_id) = driver_id {
                    update_order.execute(params![
                        OrderStatus::Assigned.to_db_str(),
                        cluster.cluster_id,
                        driver_id,
                        order_id
                    ])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn load_drivers(&self) -> RepositoryResult<Vec<Driver>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT driver_id, name, capacity, available, vehicle_type FROM drivers ORDER BY driver_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Driver {
                driver_id: row.get(0)?,
                name: row.get(1)?,
                capacity: row.get(2)?,
                available: row.get(3)?,
                vehicle_type: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn save_driver(&self, driver: &Driver) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO drivers (driver_id, name, capacity, available, vehicle_type)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(driver_id) DO UPDATE SET
                name = excluded.name,
                capacity = excluded.capacity,
                available = excluded.available,
                vehicle_type = excluded.vehicle_type
            "#,
            params![
                driver.driver_id,
                driver.name,
                driver.capacity,
                driver.available,
                driver.vehicle_type,
            ],
        )?;
        Ok(())
    }

    fn load_meeting_points(&self) -> RepositoryResult<Vec<MeetingPoint>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT meeting_point_id, name, lat, lon, active FROM meeting_points ORDER BY meeting_point_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MeetingPoint {
                meeting_point_id: row.get(0)?,
                name: row.get(1)?,
                position: GeoPoint::new(row.get(2)?, row.get(3)?),
                active: row.get(4)?,
                ad_hoc: false,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn save_meeting_point(&self, meeting_point: &MeetingPoint) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO meeting_points (meeting_point_id, name, lat, lon, active)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                meeting_point.meeting_point_id,
                meeting_point.name,
                meeting_point.position.lat,
                meeting_point.position.lon,
                meeting_point.active,
            ],
        )?;
        Ok(())
    }

    fn save_handover(&self, handover: &Handover) -> RepositoryResult<()> {
        let order_ids_json = to_json(&handover.order_ids)?;
        let prior_drivers_json = to_json(&handover.prior_drivers)?;

        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO handovers (
                handover_id, from_driver_id, to_driver_id,
                meeting_point_id, meeting_point_name, meeting_lat, meeting_lon, ad_hoc,
                scheduled_at, status, order_ids_json, prior_drivers_json,
                from_confirmed_at, to_confirmed_at, created_at, completed_at, cancelled_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                handover.handover_id,
                handover.from_driver_id,
                handover.to_driver_id,
                handover.meeting_point.meeting_point_id,
                handover.meeting_point.name,
                handover.meeting_point.position.lat,
                handover.meeting_point.position.lon,
                handover.meeting_point.ad_hoc,
                handover.scheduled_at,
                handover.status.to_db_str(),
                order_ids_json,
                prior_drivers_json,
                handover.acks.from_confirmed_at,
                handover.acks.to_confirmed_at,
                handover.created_at,
                handover.completed_at,
                handover.cancelled_at,
            ],
        )?;
        Ok(())
    }

    fn load_open_handovers(&self) -> RepositoryResult<Vec<Handover>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status IN ('pending', 'in_progress') ORDER BY created_at, handover_id",
            HANDOVER_SELECT
        ))?;
        let rows = stmt.query_map([], map_handover_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
