// ==========================================
// 配送调度核心 - 导入层
// ==========================================
// 职责: 外部 CSV 主数据导入（司机 / 会合点 / 订单）
// ==========================================

pub mod csv_reader;
pub mod dispatch_importer;
pub mod error;

pub use csv_reader::{read_csv_records, RawRecord};
pub use dispatch_importer::{DispatchCsvImporter, ImportSummary, RejectedRow};
pub use error::{ImportError, ImportResult};
