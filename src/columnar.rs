//! Parquet output for transformed rows.
//!
//! [`ColumnarWriter`] is a [`RowSink`]: it builds the Arrow schema from the
//! schema record, accumulates rows in column builders and writes a record
//! batch every `batch_rows` rows, so memory stays bounded by one batch.

use std::{io::Write, sync::Arc};

use arrow::{
    array::{ArrayRef, Date32Builder, Float64Builder, Int64Builder, StringBuilder},
    datatypes::{DataType, Field, Schema, SchemaRef},
    record_batch::RecordBatch,
};
use chrono::NaiveDate;
use log::debug;
use parquet::{
    arrow::ArrowWriter,
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};
use serde::{Deserialize, Serialize};

use crate::{
    data::CellValue,
    error::{IngestError, Result},
    model::{ColumnDescriptor, ColumnType},
    transform::{RowSink, TypedRow},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    #[default]
    Snappy,
    Zstd,
    Uncompressed,
}

impl ParquetCompression {
    fn codec(self) -> Compression {
        match self {
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::try_new(1).unwrap_or_default()),
            ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
        }
    }

    /// Value for the `parquet.compression` table property.
    pub fn table_property(self) -> &'static str {
        match self {
            ParquetCompression::Snappy => "SNAPPY",
            ParquetCompression::Zstd => "ZSTD",
            ParquetCompression::Uncompressed => "UNCOMPRESSED",
        }
    }
}

enum ColumnBuilder {
    Number(Float64Builder),
    Text(StringBuilder),
    Date(Date32Builder),
}

impl ColumnBuilder {
    fn for_type(ty: ColumnType) -> Self {
        match ty {
            ColumnType::Number => ColumnBuilder::Number(Float64Builder::new()),
            ColumnType::Date => ColumnBuilder::Date(Date32Builder::new()),
            ColumnType::String | ColumnType::Unknown => ColumnBuilder::Text(StringBuilder::new()),
        }
    }

    fn data_type(ty: ColumnType) -> DataType {
        match ty {
            ColumnType::Number => DataType::Float64,
            ColumnType::Date => DataType::Date32,
            ColumnType::String | ColumnType::Unknown => DataType::Utf8,
        }
    }

    fn append(&mut self, cell: &CellValue) {
        match (self, cell) {
            (ColumnBuilder::Number(b), CellValue::Number(n)) => b.append_value(*n),
            (ColumnBuilder::Text(b), CellValue::Text(s)) => b.append_value(s),
            (ColumnBuilder::Date(b), CellValue::Date(d)) => b.append_value(days_since_epoch(*d)),
            (ColumnBuilder::Text(b), other) if !other.is_null() => b.append_value(other.as_display()),
            (ColumnBuilder::Number(b), _) => b.append_null(),
            (ColumnBuilder::Text(b), _) => b.append_null(),
            (ColumnBuilder::Date(b), _) => b.append_null(),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Number(b) => Arc::new(b.finish()),
            ColumnBuilder::Text(b) => Arc::new(b.finish()),
            ColumnBuilder::Date(b) => Arc::new(b.finish()),
        }
    }
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

fn parquet_error(err: impl std::fmt::Display) -> IngestError {
    IngestError::infrastructure("Writing Parquet output", anyhow::anyhow!(err.to_string()))
}

struct OpenWriter<W: Write + Send> {
    writer: ArrowWriter<W>,
    schema: SchemaRef,
    row_ids: Int64Builder,
    builders: Vec<ColumnBuilder>,
}

pub struct ColumnarWriter<W: Write + Send> {
    output: Option<W>,
    open: Option<OpenWriter<W>>,
    compression: ParquetCompression,
    batch_rows: usize,
    buffered: usize,
    rows_written: u64,
}

impl<W: Write + Send> ColumnarWriter<W> {
    pub fn new(output: W, compression: ParquetCompression, batch_rows: usize) -> Self {
        Self {
            output: Some(output),
            open: None,
            compression,
            batch_rows: batch_rows.max(1),
            buffered: 0,
            rows_written: 0,
        }
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Writes any buffered rows plus the file footer and returns the output.
    pub fn finish(mut self) -> Result<W> {
        self.flush_batch()?;
        match self.open.take() {
            Some(open) => open.writer.into_inner().map_err(parquet_error),
            None => self.output.take().ok_or_else(|| {
                IngestError::infrastructure(
                    "Finishing Parquet output",
                    anyhow::anyhow!("writer has no output"),
                )
            }),
        }
    }

    fn flush_batch(&mut self) -> Result<()> {
        let Some(open) = self.open.as_mut() else {
            return Ok(());
        };
        if self.buffered == 0 {
            return Ok(());
        }
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(open.builders.len() + 1);
        arrays.push(Arc::new(open.row_ids.finish()));
        arrays.extend(open.builders.iter_mut().map(ColumnBuilder::finish));
        let batch = RecordBatch::try_new(Arc::clone(&open.schema), arrays).map_err(parquet_error)?;
        open.writer.write(&batch).map_err(parquet_error)?;
        self.rows_written += self.buffered as u64;
        debug!("Wrote Parquet batch of {} row(s)", self.buffered);
        self.buffered = 0;
        Ok(())
    }
}

impl<W: Write + Send> RowSink for ColumnarWriter<W> {
    fn schema(&mut self, columns: &[ColumnDescriptor]) -> Result<()> {
        let output = self.output.take().ok_or_else(|| {
            IngestError::infrastructure(
                "Starting Parquet output",
                anyhow::anyhow!("schema received twice"),
            )
        })?;
        let fields: Vec<Field> = columns
            .iter()
            .map(|column| {
                if column.is_row_id() {
                    Field::new(&column.name, DataType::Int64, false)
                } else {
                    Field::new(&column.name, ColumnBuilder::data_type(column.column_type), true)
                }
            })
            .collect();
        let schema: SchemaRef = Arc::new(Schema::new(fields));
        let props = WriterProperties::builder()
            .set_compression(self.compression.codec())
            .set_max_row_group_size(128 * 1024)
            .build();
        let writer =
            ArrowWriter::try_new(output, Arc::clone(&schema), Some(props)).map_err(parquet_error)?;
        let builders = columns
            .iter()
            .filter(|c| !c.is_row_id())
            .map(|c| ColumnBuilder::for_type(c.column_type))
            .collect();
        self.open = Some(OpenWriter {
            writer,
            schema,
            row_ids: Int64Builder::new(),
            builders,
        });
        Ok(())
    }

    fn row(&mut self, row: &TypedRow) -> Result<()> {
        let Some(open) = self.open.as_mut() else {
            return Err(IngestError::infrastructure(
                "Writing Parquet row",
                anyhow::anyhow!("row received before schema"),
            ));
        };
        open.row_ids.append_value(row.row_id as i64);
        for (builder, cell) in open.builders.iter_mut().zip(&row.cells) {
            builder.append(cell);
        }
        self.buffered += 1;
        if self.buffered >= self.batch_rows {
            self.flush_batch()?;
        }
        Ok(())
    }
}
