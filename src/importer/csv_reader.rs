// ==========================================
// 配送调度核心 - CSV 读取
// ==========================================
// 输出: 按表头映射的原始行（去首尾空白,跳过全空行）
// ==========================================

use crate::importer::error::{ImportError, ImportResult};
use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

/// 一行原始记录
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// 数据行号（从 1 开始,不含表头）
    pub row: usize,
    pub fields: HashMap<String, String>,
}

impl RawRecord {
    /// 非空字段值
    pub fn optional(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn required(&self, field: &str) -> ImportResult<&str> {
        self.optional(field).ok_or_else(|| ImportError::MissingField {
            row: self.row,
            field: field.to_string(),
        })
    }

    pub fn parse<T>(&self, field: &str) -> ImportResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.required(field)?;
        raw.parse::<T>().map_err(|e| ImportError::TypeConversionError {
            row: self.row,
            field: field.to_string(),
            message: format!("{} ({})", e, raw),
        })
    }

    pub fn parse_or<T>(&self, field: &str, default: T) -> ImportResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(field) {
            Some(_) => self.parse(field),
            None => Ok(default),
        }
    }

    pub fn parse_bool_or(&self, field: &str, default: bool) -> ImportResult<bool> {
        match self.optional(field) {
            None => Ok(default),
            Some(raw) => match raw.to_lowercase().as_str() {
                "true" | "1" | "yes" | "y" | "active" => Ok(true),
                "false" | "0" | "no" | "n" | "inactive" => Ok(false),
                _ => Err(ImportError::TypeConversionError {
                    row: self.row,
                    field: field.to_string(),
                    message: format!("无法识别的布尔值: {}", raw),
                }),
            },
        }
    }

    pub fn parse_timestamp(&self, field: &str) -> ImportResult<DateTime<Utc>> {
        let raw = self.required(field)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| ImportError::DateFormatError {
                row: self.row,
                field: field.to_string(),
                value: raw.to_string(),
            })
    }

    pub fn parse_in_range(&self, field: &str, min: f64, max: f64) -> ImportResult<f64> {
        let value: f64 = self.parse(field)?;
        if !(min..=max).contains(&value) {
            return Err(ImportError::ValueRangeError {
                row: self.row,
                field: field.to_string(),
                value,
                min,
                max,
            });
        }
        Ok(value)
    }
}

/// 读取 CSV 文件
///
/// # 参数
/// - required_columns: 表头必须包含的列
pub fn read_csv_records(path: &Path, required_columns: &[&str]) -> ImportResult<Vec<RawRecord>> {
    if !path.exists() {
        return Err(ImportError::FileNotFound(path.display().to_string()));
    }
    if let Some(ext) = path.extension() {
        if ext != "csv" {
            return Err(ImportError::UnsupportedFormat(
                ext.to_string_lossy().to_string(),
            ));
        }
    }

    let file = File::open(path)?;
    read_csv_from(file, required_columns)
}

/// 从任意 reader 读取（便于测试）
pub fn read_csv_from<R: std::io::Read>(
    reader: R,
    required_columns: &[&str],
) -> ImportResult<Vec<RawRecord>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true) // 允许行长度不一致
        .from_reader(reader);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    for column in required_columns {
        if !headers.iter().any(|h| h == column) {
            return Err(ImportError::MissingColumn(column.to_string()));
        }
    }

    let mut records = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result?;
        let mut fields = HashMap::new();
        for (col_idx, value) in record.iter().enumerate() {
            if let Some(header) = headers.get(col_idx) {
                fields.insert(header.clone(), value.trim().to_string());
            }
        }

        // 跳过完全空白的行
        if fields.values().all(|v| v.is_empty()) {
            continue;
        }
        records.push(RawRecord {
            row: idx + 1,
            fields,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_trimmed_rows_and_skips_blank_lines() {
        let data = "id, lat ,lon\nA, 1.5 ,2\n,,\nB,3,4\n";
        let records = read_csv_from(data.as_bytes(), &["id", "lat"]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].required("lat").unwrap(), "1.5");
        assert_eq!(records[1].row, 3);
    }

    #[test]
    fn test_missing_column_rejected() {
        let data = "id,lat\nA,1\n";
        let err = read_csv_from(data.as_bytes(), &["id", "lon"]).unwrap_err();
        assert!(matches!(err, ImportError::MissingColumn(c) if c == "lon"));
    }

    #[test]
    fn test_field_parsers() {
        let data = "n,flag,ts,lat\nx,yes,2026-03-02T08:00:00Z,95\n";
        let records = read_csv_from(data.as_bytes(), &[]).unwrap();
        let r = &records[0];
        assert!(matches!(
            r.parse::<u32>("n"),
            Err(ImportError::TypeConversionError { .. })
        ));
        assert!(r.parse_bool_or("flag", false).unwrap());
        assert!(r.parse_bool_or("missing", true).unwrap());
        assert!(r.parse_timestamp("ts").is_ok());
        assert!(matches!(
            r.parse_in_range("lat", -90.0, 90.0),
            Err(ImportError::ValueRangeError { .. })
        ));
        assert_eq!(r.parse_or::<u32>("missing", 7).unwrap(), 7);
    }
}
