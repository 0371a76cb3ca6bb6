//! Error taxonomy for ingestion runs.
//!
//! [`IngestError`] is what stages return; [`ProcessingError`] is the
//! serializable record collected into a run's result. The [`ErrorKind`] of an
//! error decides how far it propagates: format errors never abort anything,
//! decode and parse errors abort one file, everything else aborts the batch.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ColumnType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    DecodeError,
    ParseError,
    FormatError,
    TableAlreadyExists,
    TableDoesNotExist,
    InvalidTableSet,
    FileAlreadyExists,
    InvalidArgument,
    InfrastructureError,
    ArchivalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DecodeError => "DECODE_ERROR",
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::FormatError => "FORMAT_ERROR",
            ErrorKind::TableAlreadyExists => "TABLE_ALREADY_EXISTS",
            ErrorKind::TableDoesNotExist => "TABLE_DOES_NOT_EXIST",
            ErrorKind::InvalidTableSet => "INVALID_TABLE_SET",
            ErrorKind::FileAlreadyExists => "FILE_ALREADY_EXISTS",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::InfrastructureError => "INFRASTRUCTURE_ERROR",
            ErrorKind::ArchivalError => "ARCHIVAL_ERROR",
        }
    }

    /// Whether an error of this kind stops the whole batch.
    pub fn aborts_batch(&self) -> bool {
        !matches!(
            self,
            ErrorKind::DecodeError | ErrorKind::ParseError | ErrorKind::FormatError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("decode error at byte offset {offset}: {message}")]
    Decode { offset: u64, message: String },
    #[error("parse error on line {line}: {message}")]
    Parse { line: u64, message: String },
    #[error("value '{value}' cannot be converted to {target}")]
    Format { value: String, target: ColumnType },
    #[error("{kind}: {message}")]
    Validation { kind: ErrorKind, message: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{context}: {source:#}")]
    Infrastructure {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(
        "archiving table '{table}' failed ({failed} of {total} object(s)); processing has halted and the table may be left in an inconsistent state"
    )]
    Archival {
        table: String,
        failed: usize,
        total: usize,
        failures: Vec<String>,
    },
}

impl IngestError {
    pub fn infrastructure(context: impl Into<String>, source: anyhow::Error) -> Self {
        IngestError::Infrastructure {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Decode { .. } => ErrorKind::DecodeError,
            IngestError::Parse { .. } => ErrorKind::ParseError,
            IngestError::Format { .. } => ErrorKind::FormatError,
            IngestError::Validation { kind, .. } => *kind,
            IngestError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            IngestError::Infrastructure { .. } => ErrorKind::InfrastructureError,
            IngestError::Archival { .. } => ErrorKind::ArchivalError,
        }
    }

    pub fn aborts_batch(&self) -> bool {
        self.kind().aborts_batch()
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// One error recorded against a file (or the batch) in a run's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingError {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_value: Option<String>,
}

impl ProcessingError {
    pub fn new(file_name: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            file_name: file_name.to_string(),
            table_name: None,
            kind,
            message: message.into(),
            row_index: None,
            column_index: None,
            column_name: None,
            column_value: None,
        }
    }

    pub fn from_error(file_name: &str, table_name: Option<&str>, err: &IngestError) -> Self {
        let mut record = Self::new(file_name, err.kind(), err.to_string());
        record.table_name = table_name.map(str::to_string);
        record
    }

    pub fn with_table(mut self, table_name: &str) -> Self {
        self.table_name = Some(table_name.to_string());
        self
    }

    pub fn with_cell(mut self, row: u64, column: usize, name: &str, value: &str) -> Self {
        self.row_index = Some(row);
        self.column_index = Some(column);
        self.column_name = Some(name.to_string());
        self.column_value = Some(value.to_string());
        self
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.file_name, self.message)?;
        if let Some(row) = self.row_index {
            write!(f, " (row {row}")?;
            if let Some(column) = &self.column_name {
                write!(f, ", column '{column}'")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn only_row_level_kinds_keep_the_batch_running() {
        assert!(!ErrorKind::FormatError.aborts_batch());
        assert!(!ErrorKind::ParseError.aborts_batch());
        assert!(!ErrorKind::DecodeError.aborts_batch());
        assert!(ErrorKind::InfrastructureError.aborts_batch());
        assert!(ErrorKind::TableDoesNotExist.aborts_batch());
    }

    #[test]
    fn infrastructure_message_includes_source_chain() {
        let err = IngestError::infrastructure(
            "Uploading orders/a.parquet",
            anyhow!("connection reset").context("put object"),
        );
        let message = err.to_string();
        assert!(message.contains("Uploading orders/a.parquet"));
        assert!(message.contains("connection reset"));
        assert_eq!(err.kind(), ErrorKind::InfrastructureError);
    }

    #[test]
    fn processing_error_display_mentions_cell() {
        let record = ProcessingError::new("a.csv", ErrorKind::FormatError, "bad number")
            .with_cell(4, 2, "amount", "12x");
        assert_eq!(
            record.to_string(),
            "[FORMAT_ERROR] a.csv: bad number (row 4, column 'amount')"
        );
    }
}
