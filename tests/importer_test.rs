// ==========================================
// CSV 导入集成测试
// ==========================================
// 测试目标: 坏行跳过、批内去重、文件级错误、导入后可被运行时恢复
// ==========================================


use delivery_dispatch::domain::PriorityTier;
use delivery_dispatch::importer::{DispatchCsvImporter, ImportError};
use delivery_dispatch::repository::{
    DispatchRepository, InMemoryDispatchRepository, SqliteDispatchRepository,
};
use tempfile::TempDir;
use test_helpers::{create_test_db, write_csv};

const ORDERS: &str = "\
order_id,created_at,pickup_lat,pickup_lon,delivery_lat,delivery_lon,priority,items,weight_kg
O1,2026-03-02T08:00:00Z,40.7128,-74.0060,40.7200,-74.0100,High,2,3.5
O2,2026-03-02T08:01:00Z,40.7128,-74.0060,40.7300,-74.0000,Urgent,1,1.0
O1,2026-03-02T08:02:00Z,40.7128,-74.0060,40.7300,-74.0000,Low,1,1.0
O3,not-a-time,40.7128,-74.0060,40.7300,-74.0000,Low,1,1.0
O4,2026-03-02T08:03:00Z,123.0,-74.0060,40.7300,-74.0000,Low,1,1.0
,2026-03-02T08:04:00Z,40.7128,-74.0060,40.7300,-74.0000,Low,1,1.0
O5,2026-03-02T08:05:00Z,40.7128,-74.0060,40.7300,-74.0000,,,
";

#[test]
fn test_order_import_skips_bad_rows() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(dir.path(), "orders.csv", ORDERS);
    let repo = InMemoryDispatchRepository::new();

    let summary = DispatchCsvImporter::new(&repo).import_orders(&path).unwrap();
    assert_eq!(summary.total_rows, 7);
    assert_eq!(summary.imported, 3);
    let rejected_rows: Vec<_> = summary.rejected.iter().map(|r| r.row).collect();
    assert_eq!(rejected_rows, vec![3, 4, 5, 6]);

    // 批内重复保留第一行
    let o1 = repo.order("O1").unwrap();
    assert_eq!(o1.priority, PriorityTier::High);
    assert_eq!(o1.items, 2);

    // 空列取默认值
    let o5 = repo.order("O5").unwrap();
    assert_eq!(o5.priority, PriorityTier::Normal);
    assert_eq!(o5.items, 1);

    let pending: Vec<_> = repo
        .load_pending_orders()
        .unwrap()
        .into_iter()
        .map(|o| o.order_id)
        .collect();
    assert_eq!(pending, vec!["O1", "O2", "O5"]);
}

#[test]
fn test_file_level_errors() {
    let dir = TempDir::new().unwrap();
    let repo = InMemoryDispatchRepository::new();
    let importer = DispatchCsvImporter::new(&repo);

    let missing = dir.path().join("absent.csv");
    assert!(matches!(
        importer.import_orders(&missing),
        Err(ImportError::FileNotFound(_))
    ));

    let xlsx = write_csv(dir.path(), "orders.xlsx", "order_id\n");
    assert!(matches!(
        importer.import_orders(&xlsx),
        Err(ImportError::UnsupportedFormat(_))
    ));

    let no_capacity = write_csv(dir.path(), "drivers.csv", "driver_id,name\nD1,Ann\n");
    assert!(matches!(
        importer.import_drivers(&no_capacity),
        Err(ImportError::MissingColumn(col)) if col == "capacity"
    ));
}

#[test]
fn test_repository_failure_aborts_import() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(dir.path(), "drivers.csv", "driver_id,capacity\nD1,3\nD2,4\n");
    let repo = InMemoryDispatchRepository::new();
    repo.set_unavailable(true);

    let result = DispatchCsvImporter::new(&repo).import_drivers(&path);
    assert!(matches!(result, Err(ImportError::Repository(_))));
}

#[test]
fn test_import_into_sqlite() {
    let dir = TempDir::new().unwrap();
    let (_db, db_path) = create_test_db().unwrap();
    let repo = SqliteDispatchRepository::new(&db_path).unwrap();
    let importer = DispatchCsvImporter::new(&repo);

    let drivers = write_csv(
        dir.path(),
        "drivers.csv",
        "driver_id,name,capacity,available,vehicle_type\n\
         D1,Ann,3,true,Car\n\
         D2,Bo,0,true,Van\n\
         D3,Cy,5,false,Truck\n",
    );
    let points = write_csv(
        dir.path(),
        "meeting_points.csv",
        "meeting_point_id,name,lat,lon,active\n\
         MP1,Depot,40.71,-74.00,true\n\
         MP2,Mall,40.75,-200.0,true\n",
    );
    let orders = write_csv(dir.path(), "orders.csv", ORDERS);

    let d = importer.import_drivers(&drivers).unwrap();
    assert_eq!((d.imported, d.rejected.len()), (2, 1));
    let p = importer.import_meeting_points(&points).unwrap();
    assert_eq!((p.imported, p.rejected.len()), (1, 1));
    let o = importer.import_orders(&orders).unwrap();
    assert_eq!(o.imported, 3);

    let loaded = repo.load_drivers().unwrap();
    assert_eq!(loaded.len(), 2);
    assert!(!loaded[1].available);
    assert_eq!(repo.load_meeting_points().unwrap()[0].name, "Depot");
    assert_eq!(repo.load_open_orders().unwrap().len(), 3);

    // 重复导入为覆盖写
    let again = importer.import_orders(&orders).unwrap();
    assert_eq!(again.imported, 3);
    assert_eq!(repo.load_open_orders().unwrap().len(), 3);
}
