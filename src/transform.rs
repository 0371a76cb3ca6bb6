//! Row transformer: sample, lock types, then stream typed rows.
//!
//! The first `sample_size` records are buffered while every value feeds its
//! column's [`FieldTypeInferencer`]. When the buffer fills, or the input ends
//! first, the types are locked, one schema record is pushed to the sink,
//! the buffered records follow as typed rows, and everything after that
//! streams straight through.

use log::debug;

use crate::{
    columns::ColumnNameNormalizer,
    data::{CellValue, convert_value},
    error::{IngestError, ProcessingError, Result},
    inference::{FieldTypeInferencer, InferenceSettings},
    model::{ColumnDescriptor, ColumnType},
    parser::Record,
};

#[derive(Debug, Clone, PartialEq)]
pub struct TypedRow {
    pub row_id: u64,
    pub cells: Vec<CellValue>,
}

/// A push-based consumer of transformer output.
pub trait RowSink {
    /// Receives the locked schema, row id column first, exactly once.
    fn schema(&mut self, columns: &[ColumnDescriptor]) -> Result<()>;
    fn row(&mut self, row: &TypedRow) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformEvent {
    Schema(Vec<ColumnDescriptor>),
    Row(TypedRow),
}

impl RowSink for Vec<TransformEvent> {
    fn schema(&mut self, columns: &[ColumnDescriptor]) -> Result<()> {
        self.push(TransformEvent::Schema(columns.to_vec()));
        Ok(())
    }

    fn row(&mut self, row: &TypedRow) -> Result<()> {
        self.push(TransformEvent::Row(row.clone()));
        Ok(())
    }
}

/// Sink that only counts rows; used when the schema is all that matters.
#[derive(Debug, Default)]
pub struct DiscardSink {
    pub rows: u64,
}

impl RowSink for DiscardSink {
    fn schema(&mut self, _columns: &[ColumnDescriptor]) -> Result<()> {
        Ok(())
    }

    fn row(&mut self, _row: &TypedRow) -> Result<()> {
        self.rows += 1;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TransformSummary {
    pub row_count: u64,
    pub column_count: usize,
    /// Final schema with `max_length` filled for STRING columns.
    pub columns: Vec<ColumnDescriptor>,
    /// Largest row id emitted, or `row_id_start - 1` when no rows were seen.
    pub max_row_id: u64,
    pub errors: Vec<ProcessingError>,
}

pub struct RowTransformer {
    file_name: String,
    table_name: String,
    columns: Vec<ColumnDescriptor>,
    inferencers: Vec<FieldTypeInferencer>,
    sample_size: usize,
    buffer: Vec<Record>,
    schema_emitted: bool,
    next_row_id: u64,
    rows: u64,
    max_lengths: Vec<usize>,
    errors: Vec<ProcessingError>,
}

impl RowTransformer {
    pub fn new(
        file_name: &str,
        table_name: &str,
        headers: &[String],
        normalizer: &mut ColumnNameNormalizer,
        settings: &InferenceSettings,
        row_id_start: u64,
    ) -> Self {
        let names = normalizer.normalize_headers(headers);
        let columns = names
            .into_iter()
            .zip(headers)
            .map(|(name, original)| ColumnDescriptor::new(name, original.as_str(), ColumnType::Unknown))
            .collect::<Vec<_>>();
        let inferencers = columns
            .iter()
            .map(|_| FieldTypeInferencer::new(settings))
            .collect();
        Self::build(file_name, table_name, columns, inferencers, settings, row_id_start)
    }

    /// A transformer for rows appended to an existing table: the header must
    /// match the table's columns and their types are locked up front.
    pub fn for_existing(
        file_name: &str,
        table_name: &str,
        headers: &[String],
        existing: &[ColumnDescriptor],
        normalizer: &mut ColumnNameNormalizer,
        settings: &InferenceSettings,
        row_id_start: u64,
    ) -> Result<Self> {
        let names = normalizer.normalize_headers(headers);
        let expected: Vec<&ColumnDescriptor> = existing.iter().filter(|c| !c.is_row_id()).collect();
        let matches = names.len() == expected.len()
            && names.iter().zip(&expected).all(|(name, column)| *name == column.name);
        if !matches {
            return Err(IngestError::Parse {
                line: 1,
                message: format!(
                    "header [{}] does not match the columns of table '{table_name}' [{}]",
                    names.join(", "),
                    expected.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
                ),
            });
        }
        let columns: Vec<ColumnDescriptor> = expected
            .iter()
            .zip(headers)
            .map(|(column, original)| {
                ColumnDescriptor::new(column.name.as_str(), original.as_str(), column.column_type)
            })
            .collect();
        let inferencers = columns
            .iter()
            .map(|c| FieldTypeInferencer::locked(settings, c.column_type))
            .collect();
        Ok(Self::build(file_name, table_name, columns, inferencers, settings, row_id_start))
    }

    fn build(
        file_name: &str,
        table_name: &str,
        columns: Vec<ColumnDescriptor>,
        inferencers: Vec<FieldTypeInferencer>,
        settings: &InferenceSettings,
        row_id_start: u64,
    ) -> Self {
        let width = columns.len();
        Self {
            file_name: file_name.to_string(),
            table_name: table_name.to_string(),
            columns,
            inferencers,
            sample_size: settings.sample_size.max(1),
            buffer: Vec::new(),
            schema_emitted: false,
            next_row_id: row_id_start,
            rows: 0,
            max_lengths: vec![0; width],
            errors: Vec::new(),
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn push<S: RowSink>(&mut self, record: Record, sink: &mut S) -> Result<()> {
        if self.schema_emitted {
            return self.emit(&record, sink);
        }
        for (inferencer, value) in self.inferencers.iter_mut().zip(&record.fields) {
            inferencer.observe(value);
        }
        self.buffer.push(record);
        if self.buffer.len() >= self.sample_size {
            self.release(sink)?;
        }
        Ok(())
    }

    pub fn finish<S: RowSink>(mut self, sink: &mut S) -> Result<TransformSummary> {
        if !self.schema_emitted {
            self.release(sink)?;
        }
        let mut columns = self.schema();
        for (column, max_length) in columns.iter_mut().skip(1).zip(&self.max_lengths) {
            if column.column_type == ColumnType::String {
                column.max_length = Some(*max_length);
            }
        }
        debug!(
            "Transformed {} row(s) across {} column(s) from '{}' with {} format error(s)",
            self.rows,
            columns.len(),
            self.file_name,
            self.errors.len()
        );
        Ok(TransformSummary {
            row_count: self.rows,
            column_count: columns.len(),
            columns,
            max_row_id: self.next_row_id.saturating_sub(1),
            errors: self.errors,
        })
    }

    fn schema(&self) -> Vec<ColumnDescriptor> {
        std::iter::once(ColumnDescriptor::row_id())
            .chain(self.columns.iter().cloned())
            .collect()
    }

    fn release<S: RowSink>(&mut self, sink: &mut S) -> Result<()> {
        for (column, inferencer) in self.columns.iter_mut().zip(self.inferencers.iter_mut()) {
            column.column_type = inferencer.finish();
        }
        self.schema_emitted = true;
        sink.schema(&self.schema())?;
        let buffered = std::mem::take(&mut self.buffer);
        for record in &buffered {
            self.emit(record, sink)?;
        }
        Ok(())
    }

    fn emit<S: RowSink>(&mut self, record: &Record, sink: &mut S) -> Result<()> {
        let mut cells = Vec::with_capacity(self.columns.len());
        for (idx, (column, raw)) in self.columns.iter().zip(&record.fields).enumerate() {
            if column.column_type == ColumnType::String {
                self.max_lengths[idx] = self.max_lengths[idx].max(raw.chars().count());
            }
            match convert_value(raw, column.column_type) {
                Ok(cell) => cells.push(cell),
                Err(err) => {
                    self.errors.push(
                        ProcessingError::from_error(&self.file_name, Some(&self.table_name), &err)
                            .with_cell(record.index, idx, &column.name, raw),
                    );
                    cells.push(CellValue::Null);
                }
            }
        }
        let row = TypedRow {
            row_id: self.next_row_id,
            cells,
        };
        self.next_row_id += 1;
        self.rows += 1;
        sink.row(&row)
    }
}
