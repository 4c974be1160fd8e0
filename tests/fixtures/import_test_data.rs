// ==========================================
// 导入测试数据到数据库
// ==========================================
// 用法: import_test_data [data_dir] [db_path]
// 顺序: 司机 -> 会合点 -> 订单
// ==========================================

use anyhow::Context;
use delivery_dispatch::importer::{DispatchCsvImporter, ImportSummary};
use delivery_dispatch::repository::SqliteDispatchRepository;
use delivery_dispatch::{db, logging};
use std::path::Path;

fn report(kind: &str, summary: &ImportSummary) {
    println!(
        "✓ {}: 共 {} 行, 导入 {} 行, 拒绝 {} 行",
        kind,
        summary.total_rows,
        summary.imported,
        summary.rejected.len()
    );
    for rejected in &summary.rejected {
        println!("    行 {}: {}", rejected.row, rejected.reason);
    }
}

fn main() -> anyhow::Result<()> {
    logging::init();

    let mut args = std::env::args().skip(1);
    let data_dir = args
        .next()
        .unwrap_or_else(|| "tests/fixtures/datasets".to_string());
    let db_path = args.next().unwrap_or_else(db::default_db_path);

    println!("开始导入测试数据: {} -> {}", data_dir, db_path);
    let repo = SqliteDispatchRepository::new(&db_path).context("无法打开调度数据库")?;
    let importer = DispatchCsvImporter::new(&repo);
    let dir = Path::new(&data_dir);

    let drivers = importer
        .import_drivers(&dir.join("drivers.csv"))
        .context("司机导入失败")?;
    report("司机", &drivers);

    let points = importer
        .import_meeting_points(&dir.join("meeting_points.csv"))
        .context("会合点导入失败")?;
    report("会合点", &points);

    let orders = importer
        .import_orders(&dir.join("orders.csv"))
        .context("订单导入失败")?;
    report("订单", &orders);

    println!("✓ 测试数据导入完成");
    Ok(())
}
