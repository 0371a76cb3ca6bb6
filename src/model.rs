//! Batch, table and result types shared by every stage of the ingestion run.
//!
//! A batch is a list of [`FileOperation`]s against one dataset. Each processed
//! file produces a [`TableSnapshot`]; squashing folds those into one snapshot
//! per table, and the squashed list is what the manifest persists between runs.

use std::{fmt, fs::File, io::Read, path::PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::ProcessingError, join::JoinForest, storage::ObjectStorage};

/// Name of the synthetic row identifier injected as the first column of every table.
pub const ROW_ID_COLUMN: &str = "__row_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Add,
    Append,
    Replace,
    Delete,
}

impl OperationKind {
    /// Squashing keeps the schema of the contributor with the highest priority.
    pub fn priority(self) -> u8 {
        match self {
            OperationKind::Add | OperationKind::Replace => 2,
            OperationKind::Append => 1,
            OperationKind::Delete => 0,
        }
    }

    /// Operations that change the set or shape of tables behind the view.
    pub fn affects_view(self) -> bool {
        !matches!(self, OperationKind::Append)
    }

    pub fn needs_source(self) -> bool {
        !matches!(self, OperationKind::Delete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            OperationKind::Add => "ADD",
            OperationKind::Append => "APPEND",
            OperationKind::Replace => "REPLACE",
            OperationKind::Delete => "DELETE",
        };
        f.write_str(token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    Number,
    String,
    Date,
    Unknown,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Number => "number",
            ColumnType::String => "string",
            ColumnType::Date => "date",
            ColumnType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub original_name: String,
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, original_name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            original_name: original_name.into(),
            column_type: ty,
            max_length: None,
        }
    }

    pub fn row_id() -> Self {
        Self::new(ROW_ID_COLUMN, ROW_ID_COLUMN, ColumnType::Number)
    }

    pub fn is_row_id(&self) -> bool {
        self.name == ROW_ID_COLUMN
    }
}

/// Where the bytes of a file operation come from.
///
/// Resolved exactly once, when the per-file pipeline opens its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FileSource {
    /// An object already present in object storage, referenced by key.
    Stored(String),
    /// A file on the local filesystem.
    Local(PathBuf),
}

impl FileSource {
    pub fn open(&self, storage: &dyn ObjectStorage) -> Result<Box<dyn Read + Send>> {
        match self {
            FileSource::Stored(key) => storage
                .get_stream(key)
                .with_context(|| format!("Opening stored source '{key}'")),
            FileSource::Local(path) => {
                let file =
                    File::open(path).with_context(|| format!("Opening input file {path:?}"))?;
                Ok(Box::new(file))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    pub table_name: String,
    pub file_name: String,
    #[serde(rename = "operation")]
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<FileSource>,
}

impl FileOperation {
    pub fn new(table: &str, file: &str, kind: OperationKind, source: Option<FileSource>) -> Self {
        Self {
            table_name: table.to_string(),
            file_name: file.to_string(),
            kind,
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub dataset_id: String,
    pub bucket_name: String,
    pub operations: Vec<FileOperation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub table_name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub row_count: u64,
    pub byte_size: u64,
    pub operation: OperationKind,
    pub location: String,
    #[serde(default)]
    pub source_files: Vec<String>,
    #[serde(default)]
    pub max_row_id: u64,
}

impl TableSnapshot {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Columns carrying file data, without the synthetic row id.
    pub fn data_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| !c.is_row_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub dataset_id: String,
    pub tables: Vec<TableSnapshot>,
    #[serde(default)]
    pub view_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub run_id: uuid::Uuid,
    pub dataset_id: String,
    pub status: Status,
    pub tables: Vec<TableSnapshot>,
    pub files: Vec<TableSnapshot>,
    pub errors: Vec<ProcessingError>,
    pub forest: Option<JoinForest>,
    pub ddl: Vec<String>,
    pub view_name: Option<String>,
}

impl ProcessingResult {
    pub fn ddl_text(&self) -> String {
        self.ddl.join(";\n\n")
    }
}

/// Lower-cases a table or dataset name and maps whitespace and punctuation to `_`.
pub fn normalize_table_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            normalized.extend(ch.to_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            normalized.push('_');
            last_was_sep = true;
        }
    }
    normalized.trim_matches('_').to_string()
}
