//! Moves a table's objects out of the live prefixes before it is replaced or
//! deleted.
//!
//! Storage offers no multi-object atomicity, so archiving is a sequence of
//! copies followed by removals. Originals are removed only when every copy
//! succeeded; any failure is reported as a single archival error.

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::{
    error::{IngestError, Result},
    storage::{DatasetLayout, ObjectStorage},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub table_name: String,
    pub prefix: String,
    /// Keys of the archived copies.
    pub objects: Vec<String>,
}

pub struct TableArchiver<'a> {
    storage: &'a dyn ObjectStorage,
    layout: DatasetLayout,
}

impl<'a> TableArchiver<'a> {
    pub fn new(storage: &'a dyn ObjectStorage, dataset_id: &str) -> Self {
        Self {
            storage,
            layout: DatasetLayout::new(dataset_id),
        }
    }

    pub fn archive(&self, table_name: &str, at: DateTime<Utc>) -> Result<ArchiveReport> {
        let prefix = self.unused_prefix(table_name, at)?;
        let sources = [
            ("raw", self.layout.raw_prefix(table_name)),
            ("tables", self.layout.tables_prefix(table_name)),
        ];

        let mut moves = Vec::new();
        let mut failures = Vec::new();
        for (area, source_prefix) in &sources {
            match self.storage.list(source_prefix) {
                Ok(keys) => moves.extend(keys.into_iter().map(|key| {
                    let relative = key.strip_prefix(source_prefix.as_str()).unwrap_or(&key);
                    let target = format!("{prefix}{area}/{relative}");
                    (key, target)
                })),
                Err(err) => failures.push(format!("listing '{source_prefix}': {err:#}")),
            }
        }
        if failures.is_empty() {
            for (key, target) in &moves {
                if let Err(err) = self.storage.copy(key, target) {
                    failures.push(format!("copying '{key}': {err:#}"));
                }
            }
        }
        if failures.is_empty() {
            for (key, _) in &moves {
                if let Err(err) = self.storage.remove(key) {
                    failures.push(format!("removing '{key}': {err:#}"));
                }
            }
        }

        if !failures.is_empty() {
            for failure in &failures {
                warn!("Archiving '{table_name}': {failure}");
            }
            return Err(IngestError::Archival {
                table: table_name.to_string(),
                failed: failures.len(),
                total: moves.len(),
                failures,
            });
        }
        info!(
            "Archived {} object(s) of table '{table_name}' to '{prefix}'",
            moves.len()
        );
        Ok(ArchiveReport {
            table_name: table_name.to_string(),
            prefix,
            objects: moves.into_iter().map(|(_, target)| target).collect(),
        })
    }

    /// Picks an archive prefix holding no objects yet, suffixing `-1`, `-2`, ... on reuse.
    fn unused_prefix(&self, table_name: &str, at: DateTime<Utc>) -> Result<String> {
        let timestamp = at.format("%Y%m%dT%H%M%S%.6fZ").to_string();
        let mut attempt = 0u32;
        loop {
            let stamp = match attempt {
                0 => timestamp.clone(),
                n => format!("{timestamp}-{n}"),
            };
            let prefix = self.layout.archive_prefix(&stamp, table_name);
            let taken = self.storage.list(&prefix).map_err(|err| IngestError::Archival {
                table: table_name.to_string(),
                failed: 1,
                total: 0,
                failures: vec![format!("listing '{prefix}': {err:#}")],
            })?;
            if taken.is_empty() {
                return Ok(prefix);
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, storage::MemoryObjectStorage};
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap()
    }

    #[test]
    fn moves_raw_and_parquet_objects_under_archive() {
        let storage = MemoryObjectStorage::new();
        storage.put("ds/raw/orders/a.csv", "a");
        storage.put("ds/tables/orders/a.parquet", "p");
        storage.put("ds/raw/customers/c.csv", "c");

        let report = TableArchiver::new(&storage, "ds").archive("orders", at()).unwrap();
        assert_eq!(report.prefix, "ds/archive/20240304T050607.000000Z/orders/");
        assert_eq!(
            storage.keys(),
            vec![
                "ds/archive/20240304T050607.000000Z/orders/raw/a.csv",
                "ds/archive/20240304T050607.000000Z/orders/tables/a.parquet",
                "ds/raw/customers/c.csv",
            ]
        );
    }

    #[test]
    fn repeated_archive_at_same_instant_keeps_both_copies() {
        let storage = MemoryObjectStorage::new();
        let archiver = TableArchiver::new(&storage, "ds");
        storage.put("ds/raw/orders/a.csv", "first");
        let first = archiver.archive("orders", at()).unwrap();
        storage.put("ds/raw/orders/a.csv", "second");
        let second = archiver.archive("orders", at()).unwrap();

        assert_ne!(first.prefix, second.prefix);
        assert_eq!(second.prefix, "ds/archive/20240304T050607.000000Z-1/orders/");
        assert_eq!(storage.get(&first.objects[0]).unwrap(), b"first");
        assert_eq!(storage.get(&second.objects[0]).unwrap(), b"second");
    }

    #[test]
    fn empty_table_archives_nothing() {
        let storage = MemoryObjectStorage::new();
        let report = TableArchiver::new(&storage, "ds").archive("orders", at()).unwrap();
        assert!(report.objects.is_empty());
    }

    struct BrokenCopy(MemoryObjectStorage);

    impl ObjectStorage for BrokenCopy {
        fn upload(&self, path: &str, _reader: &mut dyn std::io::Read) -> anyhow::Result<u64> {
            Err(anyhow::anyhow!("upload of '{path}' refused"))
        }
        fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
            self.0.list(prefix)
        }
        fn exists(&self, path: &str) -> anyhow::Result<bool> {
            self.0.exists(path)
        }
        fn remove(&self, path: &str) -> anyhow::Result<()> {
            self.0.remove(path)
        }
        fn get_stream(&self, path: &str) -> anyhow::Result<Box<dyn std::io::Read + Send>> {
            self.0.get_stream(path)
        }
    }

    #[test]
    fn copy_failure_keeps_originals_and_reports_once() {
        let inner = MemoryObjectStorage::new();
        inner.put("ds/raw/orders/a.csv", "a");
        let storage = BrokenCopy(inner);
        let err = TableArchiver::new(&storage, "ds")
            .archive("orders", at())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchivalError);
        assert!(err.to_string().contains("inconsistent"));
        assert!(storage.0.exists("ds/raw/orders/a.csv").unwrap());
    }
}
