use crate::config::{ColumnSpec, ColumnType};
use crate::core::transforms::to_chrono_pattern;
use crate::domain::model::Record;
use crate::utils::error::{EtlError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;

struct CompiledColumn {
    column: String,
    column_type: ColumnType,
    regex: Option<Regex>,
    /// chrono 格式
    date_format: Option<String>,
    /// 設定檔中原始的格式文字，用於錯誤訊息
    raw_format: Option<String>,
}

/// 依欄位設定檢查每筆記錄的型別與格式
pub struct RecordValidator {
    columns: Vec<CompiledColumn>,
}

impl RecordValidator {
    /// 正規表達式在此編譯，錯誤屬於設定錯誤
    pub fn new(columns: &[ColumnSpec]) -> Result<Self> {
        let columns = columns
            .iter()
            .map(|spec| {
                let regex = spec
                    .regex
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| EtlError::InvalidConfigValueError {
                        field: format!("file.columns.{}.regex", spec.column),
                        value: spec.regex.clone().unwrap_or_default(),
                        reason: e.to_string(),
                    })?;

                let raw_format = spec.format.clone().filter(|f| !f.trim().is_empty());
                Ok(CompiledColumn {
                    column: spec.column.clone(),
                    column_type: spec.column_type,
                    regex,
                    date_format: raw_format.as_deref().map(to_chrono_pattern),
                    raw_format,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { columns })
    }

    /// 回傳 `None` 代表通過；否則為拒絕原因
    pub fn validate_record(&self, record: &Record) -> Option<String> {
        for column in &self.columns {
            let Some(value) = record.get(&column.column) else {
                return Some(format!("Column '{}' not found", column.column));
            };

            // 空值允許
            if value.trim().is_empty() {
                continue;
            }

            if let Some(regex) = &column.regex {
                if !regex.is_match(value) {
                    return Some(format!(
                        "Value '{}' is invalid for column '{}'",
                        value, column.column
                    ));
                }
            }

            if let Some(reason) = check_type(column, value) {
                return Some(reason);
            }
        }
        None
    }
}

fn check_type(column: &CompiledColumn, value: &str) -> Option<String> {
    let value = value.trim();
    match column.column_type {
        ColumnType::Date => {
            let format = column.date_format.as_deref()?;
            let parses = NaiveDate::parse_from_str(value, format).is_ok()
                || NaiveDateTime::parse_from_str(value, format).is_ok();
            (!parses).then(|| {
                format!(
                    "Date '{}' does not match format '{}' in column '{}'",
                    value,
                    column.raw_format.as_deref().unwrap_or_default(),
                    column.column
                )
            })
        }
        ColumnType::Integer => value.parse::<i64>().is_err().then(|| {
            format!("Value '{}' is not an integer in column '{}'", value, column.column)
        }),
        ColumnType::Decimal => {
            let normalized = value.replace(',', ".");
            normalized.parse::<f64>().is_err().then(|| {
                format!("Value '{}' is not a decimal in column '{}'", value, column.column)
            })
        }
        ColumnType::Boolean => {
            let known = matches!(
                value.to_lowercase().as_str(),
                "true" | "false" | "1" | "0" | "yes" | "no"
            );
            (!known).then(|| {
                format!("Value '{}' is not a boolean in column '{}'", value, column.column)
            })
        }
        ColumnType::String | ColumnType::Other => None,
    }
}
