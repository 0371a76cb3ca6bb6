//! Join inference across the tables of a dataset.
//!
//! Tables are visited in order. Each one attaches to the first earlier table
//! that shares a key column (same normalized name and type); tables sharing
//! nothing start a new tree. The result is an ordered forest the view
//! planner walks to build its joins.

use std::collections::HashSet;

use log::debug;
use serde::Serialize;

use crate::{
    error::{IngestError, Result},
    model::{ColumnDescriptor, ColumnType, TableSnapshot, normalize_table_name},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinColumn {
    pub descriptor: ColumnDescriptor,
    pub is_join_column: bool,
    pub is_selected_column: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinNode {
    pub table: TableSnapshot,
    /// Normalized table name, unique within the forest.
    pub name: String,
    pub table_index: usize,
    pub alias: String,
    pub parent: Option<usize>,
    pub columns: Vec<JoinColumn>,
    /// Columns joined to the parent, in the child's column order.
    pub join_keys: Vec<String>,
}

impl JoinNode {
    pub fn selected_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns
            .iter()
            .filter(|c| c.is_selected_column)
            .map(|c| &c.descriptor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JoinForest {
    pub nodes: Vec<JoinNode>,
}

/// Spreadsheet-style alias for a zero-based position: A..Z, AA, AB, ...
pub fn table_alias(index: usize) -> String {
    let mut remaining = index + 1;
    let mut letters = Vec::new();
    while remaining > 0 {
        remaining -= 1;
        letters.push((b'A' + (remaining % 26) as u8) as char);
        remaining /= 26;
    }
    letters.iter().rev().collect()
}

fn is_key_candidate(column: &ColumnDescriptor) -> bool {
    !column.is_row_id() && column.column_type != ColumnType::Date
}

fn shared_keys(child: &TableSnapshot, parent: &TableSnapshot) -> Vec<String> {
    child
        .columns
        .iter()
        .filter(|c| is_key_candidate(c))
        .filter(|c| {
            parent
                .columns
                .iter()
                .any(|p| is_key_candidate(p) && p.name == c.name && p.column_type == c.column_type)
        })
        .map(|c| c.name.clone())
        .collect()
}

impl JoinForest {
    pub fn build(tables: &[TableSnapshot]) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut nodes: Vec<JoinNode> = Vec::with_capacity(tables.len());
        for (table_index, table) in tables.iter().enumerate() {
            let name = normalize_table_name(&table.table_name);
            if !seen.insert(name.clone()) {
                return Err(IngestError::InvalidArgument(format!(
                    "table '{}' normalizes to '{name}', which is already in use",
                    table.table_name
                )));
            }

            let attachment = nodes.iter().enumerate().find_map(|(idx, node)| {
                let keys = shared_keys(table, &node.table);
                (!keys.is_empty()).then_some((idx, keys))
            });
            let (parent, join_keys) = match attachment {
                Some((idx, keys)) => (Some(idx), keys),
                None => (None, Vec::new()),
            };

            let columns = table
                .columns
                .iter()
                .map(|descriptor| {
                    let is_join_column = join_keys.contains(&descriptor.name);
                    JoinColumn {
                        is_join_column,
                        is_selected_column: !descriptor.is_row_id() && !is_join_column,
                        descriptor: descriptor.clone(),
                    }
                })
                .collect();

            if let Some(parent_idx) = parent {
                debug!(
                    "Joining '{name}' to '{}' on [{}]",
                    nodes[parent_idx].name,
                    join_keys.join(", ")
                );
            }
            nodes.push(JoinNode {
                table: table.clone(),
                name,
                table_index,
                alias: table_alias(table_index),
                parent,
                columns,
                join_keys,
            });
        }
        Ok(Self { nodes })
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> impl Iterator<Item = &JoinNode> {
        self.nodes.iter().filter(|n| n.parent.is_none())
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = &JoinNode> {
        self.nodes.iter().filter(move |n| n.parent == Some(index))
    }

    /// `(parent, child)` index pairs in child order.
    pub fn edges(&self) -> Vec<(usize, usize)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, n)| n.parent.map(|p| (p, idx)))
            .collect()
    }
}
