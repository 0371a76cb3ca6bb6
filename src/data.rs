use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    error::{IngestError, Result},
    model::ColumnType,
    numeric,
};

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%Y%m%d",
];

/// One typed cell of a transformed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Number(f64),
    Text(String),
    Date(NaiveDate),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_display(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    (*n as i64).to_string()
                } else {
                    n.to_string()
                }
            }
            CellValue::Text(s) => s.clone(),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

pub fn parse_naive_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    // Eight-digit dates only; anything else numeric is not a date.
    if trimmed.chars().all(|c| c.is_ascii_digit()) && trimmed.len() != 8 {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// Converts a raw field to the locked column type. Empty fields become nulls.
pub fn convert_value(value: &str, ty: ColumnType) -> Result<CellValue> {
    if value.is_empty() {
        return Ok(CellValue::Null);
    }
    match ty {
        ColumnType::Number => numeric::to_number(value).map(CellValue::Number),
        ColumnType::Date => parse_naive_date(value)
            .map(CellValue::Date)
            .ok_or_else(|| IngestError::Format {
                value: value.to_string(),
                target: ColumnType::Date,
            }),
        ColumnType::String | ColumnType::Unknown => Ok(CellValue::Text(value.to_string())),
    }
}
