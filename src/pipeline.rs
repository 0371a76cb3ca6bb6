//! Per-file pipeline: source → decoder → parser → transformer → Parquet.
//!
//! Raw bytes are teed into a spooled temporary file while they are decoded,
//! and Parquet output goes into a second one. Both are uploaded once the file
//! has been fully processed, so a file that fails to decode or parse leaves
//! nothing behind in storage.

use std::io::{self, Read, Seek, SeekFrom, Write};

use log::{debug, info};
use tempfile::SpooledTempFile;

use crate::{
    columnar::ColumnarWriter,
    columns::ColumnNameNormalizer,
    config::IngestConfig,
    decoder::CharStream,
    error::{IngestError, ProcessingError, Result},
    model::{FileOperation, TableSnapshot},
    parser::{CsvParser, Record},
    storage::{DatasetLayout, ObjectStorage},
    transform::{DiscardSink, RowSink, RowTransformer, TransformSummary},
};

/// Copies every byte read from `inner` into `copy`.
struct TeeReader<R, W> {
    inner: R,
    copy: W,
}

impl<R: Read, W: Write> Read for TeeReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.copy.write_all(&buf[..read])?;
        Ok(read)
    }
}

#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub snapshot: TableSnapshot,
    /// Values that did not convert to their column's type.
    pub errors: Vec<ProcessingError>,
    pub raw_bytes: u64,
}

pub struct FilePipeline<'a> {
    config: &'a IngestConfig,
    storage: &'a dyn ObjectStorage,
    layout: DatasetLayout,
}

impl<'a> FilePipeline<'a> {
    pub fn new(config: &'a IngestConfig, storage: &'a dyn ObjectStorage, dataset_id: &str) -> Self {
        Self {
            config,
            storage,
            layout: DatasetLayout::new(dataset_id),
        }
    }

    /// Processes one ADD, APPEND or REPLACE operation.
    ///
    /// `existing` carries the table being appended to; its column types are
    /// locked and row ids continue after `row_id_start - 1`.
    pub fn run(
        &self,
        operation: &FileOperation,
        existing: Option<&TableSnapshot>,
        normalizer: &mut ColumnNameNormalizer,
        row_id_start: u64,
    ) -> Result<FileOutcome> {
        let file_name = operation.file_name.as_str();
        let table_name = operation.table_name.as_str();
        let source = operation.source.as_ref().ok_or_else(|| {
            IngestError::InvalidArgument(format!(
                "{} of '{file_name}' into '{table_name}' has no source",
                operation.kind
            ))
        })?;
        let reader = source.open(self.storage).map_err(|err| {
            IngestError::infrastructure(format!("Opening source of '{file_name}'"), err)
        })?;
        info!(
            "Processing '{file_name}' for table '{table_name}' ({})",
            operation.kind
        );

        let mut raw = SpooledTempFile::new(self.config.spool_threshold);
        let mut columnar = ColumnarWriter::new(
            SpooledTempFile::new(self.config.spool_threshold),
            self.config.compression,
            self.config.batch_rows,
        );
        let summary = {
            let tee = TeeReader {
                inner: reader,
                copy: &mut raw,
            };
            let stream = StreamPlan {
                file_name,
                table_name,
                existing,
                row_id_start,
            };
            stream.transform(tee, self.config, normalizer, &mut columnar)?
        };

        let mut parquet = columnar.finish()?;
        let parquet_path = self.layout.parquet_path(table_name, file_name);
        let byte_size = self.upload(&parquet_path, &mut parquet)?;
        let raw_path = self.layout.raw_path(table_name, file_name);
        let raw_bytes = self.upload(&raw_path, &mut raw)?;
        info!(
            "Wrote {} row(s) from '{file_name}' to '{parquet_path}' ({byte_size} byte(s))",
            summary.row_count
        );

        Ok(FileOutcome {
            snapshot: TableSnapshot {
                table_name: table_name.to_string(),
                columns: summary.columns,
                row_count: summary.row_count,
                byte_size,
                operation: operation.kind,
                location: self.layout.table_location(table_name),
                source_files: vec![file_name.to_string()],
                max_row_id: summary.max_row_id,
            },
            errors: summary.errors,
            raw_bytes,
        })
    }

    fn upload(&self, path: &str, spool: &mut SpooledTempFile) -> Result<u64> {
        spool
            .seek(SeekFrom::Start(0))
            .map_err(|err| IngestError::infrastructure(format!("Rewinding '{path}'"), err.into()))?;
        self.storage
            .upload(path, spool)
            .map_err(|err| IngestError::infrastructure(format!("Uploading '{path}'"), err))
    }
}

/// Infers the schema of one file without writing or uploading anything.
pub fn infer_schema<R: Read>(
    reader: R,
    file_name: &str,
    config: &IngestConfig,
) -> Result<TransformSummary> {
    let mut normalizer = ColumnNameNormalizer::new();
    let mut sink = DiscardSink::default();
    let plan = StreamPlan {
        file_name,
        table_name: file_name,
        existing: None,
        row_id_start: 1,
    };
    plan.transform(reader, config, &mut normalizer, &mut sink)
}

struct StreamPlan<'a> {
    file_name: &'a str,
    table_name: &'a str,
    existing: Option<&'a TableSnapshot>,
    row_id_start: u64,
}

impl StreamPlan<'_> {
    /// Decodes, tokenizes and transforms `reader`, pushing rows into `sink`.
    fn transform<R: Read, S: RowSink>(
        &self,
        reader: R,
        config: &IngestConfig,
        normalizer: &mut ColumnNameNormalizer,
        sink: &mut S,
    ) -> Result<TransformSummary> {
        let encoding = config
            .text_encoding()
            .map_err(|err| IngestError::InvalidArgument(format!("{err:#}")))?;
        let mut stream = CharStream::new(reader, encoding, config.chunk_size);
        let mut parser = CsvParser::new(config.parser_options(self.file_name));
        let mut feeder = Feeder {
            file_name: self.file_name,
            table_name: self.table_name,
            existing: self.existing,
            normalizer,
            config,
            row_id_start: self.row_id_start,
            transformer: None,
        };
        let mut records = Vec::new();
        while let Some(chunk) = stream.next_chunk()? {
            parser.push(&chunk, &mut records)?;
            feeder.feed(&parser, &mut records, sink)?;
        }
        parser.finish(&mut records)?;
        feeder.feed(&parser, &mut records, sink)?;
        debug!(
            "Decoded {} byte(s) of '{}' as {}",
            stream.bytes_read(),
            self.file_name,
            encoding.name()
        );
        feeder.finish(sink)
    }
}

/// Creates the transformer once the header is known and forwards records.
struct Feeder<'a, 'n> {
    file_name: &'a str,
    table_name: &'a str,
    existing: Option<&'a TableSnapshot>,
    normalizer: &'n mut ColumnNameNormalizer,
    config: &'a IngestConfig,
    row_id_start: u64,
    transformer: Option<RowTransformer>,
}

impl Feeder<'_, '_> {
    fn feed<S: RowSink>(
        &mut self,
        parser: &CsvParser,
        records: &mut Vec<Record>,
        sink: &mut S,
    ) -> Result<()> {
        if self.transformer.is_none() {
            let Some(headers) = parser.headers() else {
                return Ok(());
            };
            let transformer = match self.existing {
                Some(table) => RowTransformer::for_existing(
                    self.file_name,
                    self.table_name,
                    headers,
                    &table.columns,
                    self.normalizer,
                    &self.config.inference,
                    self.row_id_start,
                )?,
                None => RowTransformer::new(
                    self.file_name,
                    self.table_name,
                    headers,
                    self.normalizer,
                    &self.config.inference,
                    self.row_id_start,
                ),
            };
            self.transformer = Some(transformer);
        }
        if let Some(transformer) = self.transformer.as_mut() {
            for record in records.drain(..) {
                transformer.push(record, sink)?;
            }
        }
        Ok(())
    }

    fn finish<S: RowSink>(self, sink: &mut S) -> Result<TransformSummary> {
        let transformer = self.transformer.ok_or_else(|| IngestError::Parse {
            line: 1,
            message: format!("'{}' has no header row", self.file_name),
        })?;
        transformer.finish(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        model::{FileSource, OperationKind},
        storage::MemoryObjectStorage,
    };

    fn operation(file: &str, key: &str) -> FileOperation {
        FileOperation::new(
            "orders",
            file,
            OperationKind::Add,
            Some(FileSource::Stored(key.to_string())),
        )
    }

    #[test]
    fn uploads_parquet_and_raw_copy() {
        let storage = MemoryObjectStorage::new();
        let contents = "Id,Name\n1,alpha\n2,beta\n";
        storage.put("incoming/orders.csv", contents);
        let config = IngestConfig::default();
        let pipeline = FilePipeline::new(&config, &storage, "Sales");
        let mut normalizer = ColumnNameNormalizer::new();

        let outcome = pipeline
            .run(&operation("orders.csv", "incoming/orders.csv"), None, &mut normalizer, 1)
            .unwrap();

        assert_eq!(outcome.snapshot.row_count, 2);
        assert_eq!(outcome.snapshot.max_row_id, 2);
        assert_eq!(outcome.snapshot.location, "sales/tables/orders");
        assert_eq!(outcome.raw_bytes, contents.len() as u64);
        assert_eq!(
            storage.get("sales/raw/orders/orders.csv").as_deref(),
            Some(contents.as_bytes())
        );
        let parquet = storage.get("sales/tables/orders/orders.csv.parquet").unwrap();
        assert_eq!(parquet.len() as u64, outcome.snapshot.byte_size);
        assert_eq!(&parquet[..4], b"PAR1");
    }

    #[test]
    fn infer_schema_reports_types_without_storage() {
        let config = IngestConfig::default();
        let summary =
            infer_schema("Amount\tDay\n$5\t2024-01-01\n".as_bytes(), "x.tsv", &config).unwrap();
        let types: Vec<_> = summary.columns.iter().map(|c| c.column_type).collect();
        assert_eq!(
            types,
            vec![
                crate::model::ColumnType::Number,
                crate::model::ColumnType::Number,
                crate::model::ColumnType::Date
            ]
        );
        assert_eq!(summary.row_count, 1);
    }

    #[test]
    fn empty_file_is_a_parse_error_and_uploads_nothing() {
        let storage = MemoryObjectStorage::new();
        storage.put("incoming/empty.csv", "");
        let config = IngestConfig::default();
        let pipeline = FilePipeline::new(&config, &storage, "sales");
        let mut normalizer = ColumnNameNormalizer::new();

        let err = pipeline
            .run(&operation("empty.csv", "incoming/empty.csv"), None, &mut normalizer, 1)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
        assert_eq!(storage.keys(), vec!["incoming/empty.csv"]);
    }

    #[test]
    fn missing_source_object_is_an_infrastructure_error() {
        let storage = MemoryObjectStorage::new();
        let config = IngestConfig::default();
        let pipeline = FilePipeline::new(&config, &storage, "sales");
        let mut normalizer = ColumnNameNormalizer::new();
        let err = pipeline
            .run(&operation("a.csv", "nowhere/a.csv"), None, &mut normalizer, 1)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InfrastructureError);
    }
}
