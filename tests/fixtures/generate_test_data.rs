// ==========================================
// 测试数据生成器
// ==========================================
// 用途: 生成调度主数据 CSV（确定性,按序号推导,无随机数）
// 输出: <out_dir>/drivers.csv, meeting_points.csv, orders.csv, orders_with_issues.csv
// 用法: generate_test_data [out_dir] [orders]
// ==========================================

use chrono::{Duration, TimeZone, Utc};
use csv::Writer;
use std::error::Error;
use std::fs::{self, File};
use std::path::Path;

// 基准城市（纬度, 经度, 名称）
const CITIES: &[(f64, f64, &str)] = &[
    (40.7128, -74.0060, "New York"),
    (34.0522, -118.2437, "Los Angeles"),
    (41.8781, -87.6298, "Chicago"),
    (29.7604, -95.3698, "Houston"),
    (33.4484, -112.0740, "Phoenix"),
];

const VEHICLES: &[&str] = &["Car", "Van", "Motorcycle", "Truck"];
const PRIORITIES: &[&str] = &["low", "normal", "normal", "high", "urgent"];

const DRIVER_HEADER: &[&str] = &["driver_id", "name", "capacity", "available", "vehicle_type"];
const MEETING_POINT_HEADER: &[&str] = &["meeting_point_id", "name", "lat", "lon", "active"];
const ORDER_HEADER: &[&str] = &[
    "order_id",
    "created_at",
    "priority",
    "pickup_lat",
    "pickup_lon",
    "delivery_lat",
    "delivery_lon",
    "items",
    "weight_kg",
];

/// 确定性抖动: 返回 [-spread, spread] 内的偏移
fn jitter(index: usize, salt: usize, spread: f64) -> f64 {
    let h = (index.wrapping_mul(2_654_435_761) ^ salt.wrapping_mul(40_503)) % 10_000;
    (h as f64 / 10_000.0 * 2.0 - 1.0) * spread
}

fn city_point(index: usize, spread: f64) -> (f64, f64, &'static str) {
    let (lat, lon, name) = CITIES[index % CITIES.len()];
    (
        lat + jitter(index, 1, spread),
        lon + jitter(index, 2, spread),
        name,
    )
}

fn generate_drivers(dir: &Path, count: usize) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(dir.join("drivers.csv"))?);
    wtr.write_record(DRIVER_HEADER)?;
    for i in 0..count {
        let (_, _, city) = city_point(i, 0.0);
        wtr.write_record(&[
            format!("D{:04}", i + 1),
            format!("Agent{} ({})", i + 1, city),
            format!("{}", 3 + i % 5),
            // 每 10 名司机有 1 名休息
            (i % 10 != 9).to_string(),
            VEHICLES[i % VEHICLES.len()].to_string(),
        ])?;
    }
    wtr.flush()?;
    println!("✓ 生成 drivers.csv ({}条)", count);
    Ok(())
}

fn generate_meeting_points(dir: &Path, count: usize) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(dir.join("meeting_points.csv"))?);
    wtr.write_record(MEETING_POINT_HEADER)?;
    for i in 0..count {
        let (lat, lon, city) = city_point(i, 0.05);
        wtr.write_record(&[
            format!("MP{:04}", i + 1),
            format!("Store {} #{}", city, i + 1),
            format!("{:.6}", lat),
            format!("{:.6}", lon),
            (i % 10 != 0).to_string(),
        ])?;
    }
    wtr.flush()?;
    println!("✓ 生成 meeting_points.csv ({}条)", count);
    Ok(())
}

fn order_row(i: usize, stores: usize) -> Vec<String> {
    let base = Utc
        .with_ymd_and_hms(2026, 3, 2, 8, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let created_at = base + Duration::seconds((i * 37) as i64);
    let store = i % stores.max(1);
    let (p_lat, p_lon, _) = city_point(store, 0.05);
    // 客户位置围绕门店所在城市
    let (d_lat, d_lon, _) = city_point(store, 0.02);
    vec![
        format!("O{:06}", i + 1),
        created_at.to_rfc3339(),
        PRIORITIES[i % PRIORITIES.len()].to_string(),
        format!("{:.6}", p_lat),
        format!("{:.6}", p_lon),
        format!("{:.6}", d_lat + jitter(i, 3, 0.02)),
        format!("{:.6}", d_lon + jitter(i, 4, 0.02)),
        format!("{}", 1 + i % 10),
        format!("{:.2}", 0.5 + (i % 100) as f64 * 0.495),
    ]
}

fn generate_orders(dir: &Path, count: usize, stores: usize) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(dir.join("orders.csv"))?);
    wtr.write_record(ORDER_HEADER)?;
    for i in 0..count {
        wtr.write_record(&order_row(i, stores))?;
    }
    wtr.flush()?;
    println!("✓ 生成 orders.csv ({}条)", count);
    Ok(())
}

/// 混合问题数据: 重复主键 / 坐标越界 / 时间格式错误 / 缺失字段
fn generate_orders_with_issues(dir: &Path, stores: usize) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(dir.join("orders_with_issues.csv"))?);
    wtr.write_record(ORDER_HEADER)?;
    for i in 0..10 {
        wtr.write_record(&order_row(i, stores))?;
    }
    // 重复主键
    wtr.write_record(&order_row(0, stores))?;
    // 坐标越界
    let mut bad_lat = order_row(10, stores);
    bad_lat[5] = "123.0".to_string();
    wtr.write_record(&bad_lat)?;
    // 时间格式错误
    let mut bad_time = order_row(11, stores);
    bad_time[1] = "2026/03/02 08:00".to_string();
    wtr.write_record(&bad_time)?;
    // 缺失主键
    let mut missing_id = order_row(12, stores);
    missing_id[0] = String::new();
    wtr.write_record(&missing_id)?;
    wtr.flush()?;
    println!("✓ 生成 orders_with_issues.csv (14条, 其中4条问题数据)");
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let out_dir = args
        .next()
        .unwrap_or_else(|| "tests/fixtures/datasets".to_string());
    let orders: usize = match args.next() {
        Some(n) => n.parse()?,
        None => 500,
    };

    println!("开始生成测试数据集 -> {}", out_dir);
    let dir = Path::new(&out_dir);
    fs::create_dir_all(dir)?;

    let drivers = 50;
    let stores = 100;
    generate_drivers(dir, drivers)?;
    generate_meeting_points(dir, stores)?;
    generate_orders(dir, orders, stores)?;
    generate_orders_with_issues(dir, stores)?;

    println!("✓ 所有测试数据集生成完成！");
    Ok(())
}
