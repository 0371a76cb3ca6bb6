//! Plain-text tables for terminal output.

use std::fmt::Write as _;

use crate::model::{ColumnDescriptor, ColumnType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
}

pub fn render_table(headers: &[&str], rows: &[Vec<String>], align: &[Align]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(sanitize(cell).chars().count());
        }
    }

    let mut output = String::new();
    let header_cells: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let _ = writeln!(output, "{}", format_row(&header_cells, &widths, &[]));
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat((*w).max(3))).collect();
    let _ = writeln!(output, "{}", format_row(&rule, &widths, &[]));
    for row in rows {
        let _ = writeln!(output, "{}", format_row(row, &widths, align));
    }
    output
}

fn format_row(values: &[String], widths: &[usize], align: &[Align]) -> String {
    let cells: Vec<String> = values
        .iter()
        .zip(widths)
        .enumerate()
        .map(|(idx, (value, width))| {
            let value = sanitize(value);
            match align.get(idx).copied().unwrap_or(Align::Left) {
                Align::Left => format!("{value:<width$}"),
                Align::Right => format!("{value:>width$}"),
            }
        })
        .collect();
    cells.join("  ").trim_end().to_string()
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if matches!(c, '\n' | '\r' | '\t') { ' ' } else { c })
        .collect()
}

/// One line per column: position, name, source header, type and longest value.
pub fn render_schema(columns: &[ColumnDescriptor]) -> String {
    let rows: Vec<Vec<String>> = columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let length = match (column.column_type, column.max_length) {
                (ColumnType::String, Some(len)) => len.to_string(),
                _ => String::new(),
            };
            vec![
                idx.to_string(),
                column.name.clone(),
                column.original_name.clone(),
                column.column_type.to_string(),
                length,
            ]
        })
        .collect();
    render_table(
        &["#", "column", "header", "type", "max_length"],
        &rows,
        &[Align::Right, Align::Left, Align::Left, Align::Left, Align::Right],
    )
}
