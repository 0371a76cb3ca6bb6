//! Batch validation and squashing of applied operations.
//!
//! Validation walks the batch once against the prior manifest and collects
//! every conflict instead of stopping at the first. Squashing folds the
//! per-file snapshots of a run into one snapshot per table, starting from the
//! prior manifest.

use std::collections::HashSet;

use log::debug;

use crate::{
    error::{ErrorKind, IngestError, ProcessingError, Result},
    model::{FileOperation, OperationKind, TableSnapshot, normalize_table_name},
    storage::{DatasetLayout, ObjectStorage},
};

/// An operation the orchestrator carried out, with the snapshot it produced.
///
/// `result` is `None` for DELETE and for operations whose file failed.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOperation {
    pub kind: OperationKind,
    pub table_name: String,
    pub result: Option<TableSnapshot>,
}

impl AppliedOperation {
    pub fn new(kind: OperationKind, table_name: &str, result: Option<TableSnapshot>) -> Self {
        Self {
            kind,
            table_name: table_name.to_string(),
            result,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// One snapshot per successfully processed file, in batch order.
    pub files: Vec<TableSnapshot>,
    /// One snapshot per table after squashing.
    pub tables: Vec<TableSnapshot>,
}

fn conflict(operation: &FileOperation, kind: ErrorKind, message: String) -> ProcessingError {
    ProcessingError::new(&operation.file_name, kind, message).with_table(&operation.table_name)
}

/// Checks a batch against the tables that exist before it runs.
///
/// Only storage failures are returned as `Err`; conflicts come back as the
/// list of errors, empty when the batch is valid.
pub fn validate(
    operations: &[FileOperation],
    prior: &[TableSnapshot],
    storage: &dyn ObjectStorage,
    layout: &DatasetLayout,
) -> Result<Vec<ProcessingError>> {
    let mut live: HashSet<String> = prior
        .iter()
        .map(|t| normalize_table_name(&t.table_name))
        .collect();
    let mut added: HashSet<String> = HashSet::new();
    let mut pairs: HashSet<(String, String)> = HashSet::new();
    let mut reported: HashSet<(String, String)> = HashSet::new();
    let mut errors = Vec::new();

    for operation in operations {
        let table = normalize_table_name(&operation.table_name);
        let pair = (table.clone(), operation.file_name.clone());
        if !pairs.insert(pair.clone()) {
            if reported.insert(pair) {
                errors.push(conflict(
                    operation,
                    ErrorKind::InvalidTableSet,
                    format!(
                        "'{}' appears more than once for table '{}'",
                        operation.file_name, operation.table_name
                    ),
                ));
            }
            continue;
        }
        if operation.kind.needs_source() && operation.source.is_none() {
            errors.push(conflict(
                operation,
                ErrorKind::InvalidArgument,
                format!("{} of '{}' has no source", operation.kind, operation.file_name),
            ));
            continue;
        }

        match operation.kind {
            OperationKind::Add => {
                if added.contains(&table) {
                    errors.push(conflict(
                        operation,
                        ErrorKind::InvalidTableSet,
                        format!("table '{}' is added more than once", operation.table_name),
                    ));
                } else if live.contains(&table) {
                    errors.push(conflict(
                        operation,
                        ErrorKind::TableAlreadyExists,
                        format!("table '{}' already exists", operation.table_name),
                    ));
                } else {
                    live.insert(table.clone());
                    added.insert(table);
                }
            }
            OperationKind::Append => {
                if !live.contains(&table) {
                    errors.push(conflict(
                        operation,
                        ErrorKind::TableDoesNotExist,
                        format!("cannot append to missing table '{}'", operation.table_name),
                    ));
                } else {
                    let raw_path = layout.raw_path(&operation.table_name, &operation.file_name);
                    let exists = storage.exists(&raw_path).map_err(|err| {
                        IngestError::infrastructure(format!("Checking '{raw_path}'"), err)
                    })?;
                    if exists {
                        errors.push(conflict(
                            operation,
                            ErrorKind::FileAlreadyExists,
                            format!(
                                "'{}' was already loaded into table '{}'",
                                operation.file_name, operation.table_name
                            ),
                        ));
                    }
                }
            }
            OperationKind::Replace | OperationKind::Delete => {
                if !live.contains(&table) {
                    errors.push(conflict(
                        operation,
                        ErrorKind::TableDoesNotExist,
                        format!(
                            "cannot {} missing table '{}'",
                            operation.kind.to_string().to_lowercase(),
                            operation.table_name
                        ),
                    ));
                } else if operation.kind == OperationKind::Delete {
                    live.remove(&table);
                    added.remove(&table);
                }
            }
        }
    }
    debug!(
        "Validated {} operation(s) with {} conflict(s)",
        operations.len(),
        errors.len()
    );
    Ok(errors)
}

fn merge_append(entry: &mut TableSnapshot, contribution: TableSnapshot) {
    entry.row_count += contribution.row_count;
    entry.byte_size += contribution.byte_size;
    entry.max_row_id = entry.max_row_id.max(contribution.max_row_id);
    for column in &mut entry.columns {
        let longer = contribution
            .columns
            .iter()
            .find(|c| c.name == column.name)
            .and_then(|c| c.max_length);
        if let (Some(current), Some(other)) = (column.max_length, longer) {
            column.max_length = Some(current.max(other));
        }
    }
    entry.source_files.extend(contribution.source_files);
    if contribution.operation.priority() > entry.operation.priority() {
        entry.columns = contribution.columns;
        entry.operation = contribution.operation;
    }
}

/// Folds the applied operations into the prior tables, in order.
pub fn squash(applied: &[AppliedOperation], prior: &[TableSnapshot]) -> Vec<TableSnapshot> {
    let mut entries: Vec<TableSnapshot> = prior
        .iter()
        .cloned()
        .map(|mut table| {
            table.operation = OperationKind::Append;
            table
        })
        .collect();

    for operation in applied {
        let key = normalize_table_name(&operation.table_name);
        let position = entries
            .iter()
            .position(|e| normalize_table_name(&e.table_name) == key);
        match (operation.kind, &operation.result) {
            (OperationKind::Delete, _) | (OperationKind::Replace, None) => {
                if let Some(idx) = position {
                    entries.remove(idx);
                }
            }
            (_, None) => {}
            (OperationKind::Add | OperationKind::Replace, Some(snapshot)) => match position {
                Some(idx) => entries[idx] = snapshot.clone(),
                None => entries.push(snapshot.clone()),
            },
            (OperationKind::Append, Some(snapshot)) => match position {
                Some(idx) => merge_append(&mut entries[idx], snapshot.clone()),
                None => {
                    let mut promoted = snapshot.clone();
                    promoted.operation = OperationKind::Add;
                    entries.push(promoted);
                }
            },
        }
    }
    entries
}

pub fn reconcile(applied: &[AppliedOperation], prior: &[TableSnapshot]) -> Reconciliation {
    Reconciliation {
        files: applied.iter().filter_map(|a| a.result.clone()).collect(),
        tables: squash(applied, prior),
    }
}
