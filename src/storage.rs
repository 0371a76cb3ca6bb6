//! Object storage abstraction.
//!
//! Keys are `/`-separated paths relative to the store's root, e.g.
//! `sales/raw/orders/orders.csv`. [`LocalObjectStorage`] maps them onto a
//! directory tree and [`MemoryObjectStorage`] keeps them in a map for tests.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufWriter, Cursor, Read},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result, anyhow};
use log::debug;

use crate::model::normalize_table_name;

pub trait ObjectStorage: Send + Sync {
    /// Stores everything `reader` yields under `path`, replacing any existing
    /// object, and returns the number of bytes written.
    fn upload(&self, path: &str, reader: &mut dyn Read) -> Result<u64>;
    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
    fn exists(&self, path: &str) -> Result<bool>;
    fn remove(&self, path: &str) -> Result<()>;
    fn get_stream(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    fn copy(&self, from: &str, to: &str) -> Result<u64> {
        let mut reader = self.get_stream(from)?;
        self.upload(to, &mut reader)
            .with_context(|| format!("Copying '{from}' to '{to}'"))
    }
}

/// Joins key segments with `/`, skipping empty ones.
pub fn object_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Object key layout of one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    dataset: String,
}

impl DatasetLayout {
    pub fn new(dataset_id: &str) -> Self {
        Self {
            dataset: normalize_table_name(dataset_id),
        }
    }

    pub fn raw_prefix(&self, table: &str) -> String {
        format!("{}/", object_key(&[self.dataset.as_str(), "raw", normalize_table_name(table).as_str()]))
    }

    pub fn tables_prefix(&self, table: &str) -> String {
        format!("{}/", object_key(&[self.dataset.as_str(), "tables", normalize_table_name(table).as_str()]))
    }

    /// Location recorded on a table snapshot, without a trailing slash.
    pub fn table_location(&self, table: &str) -> String {
        object_key(&[self.dataset.as_str(), "tables", normalize_table_name(table).as_str()])
    }

    pub fn raw_path(&self, table: &str, file_name: &str) -> String {
        format!("{}{}", self.raw_prefix(table), file_name.trim_matches('/'))
    }

    /// Keyed on the whole file name so `jan.csv` and `jan.tsv` never share an object.
    pub fn parquet_path(&self, table: &str, file_name: &str) -> String {
        format!("{}{}.parquet", self.tables_prefix(table), file_name.trim_matches('/'))
    }

    /// Root for one archival pass, e.g. `sales/archive/20240102T030405.123456Z/orders/`.
    pub fn archive_prefix(&self, timestamp: &str, table: &str) -> String {
        format!(
            "{}/",
            object_key(&[self.dataset.as_str(), "archive", timestamp, normalize_table_name(table).as_str()])
        )
    }
}

#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            if segment == ".." || segment == "." {
                return Err(anyhow!("Invalid object key '{key}'"));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn collect(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir).with_context(|| format!("Listing {dir:?}"))? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect(&path, keys)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl ObjectStorage for LocalObjectStorage {
    fn upload(&self, path: &str, reader: &mut dyn Read) -> Result<u64> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Creating directory {parent:?}"))?;
        }
        let file = File::create(&target).with_context(|| format!("Creating object {target:?}"))?;
        let mut writer = BufWriter::new(file);
        let written =
            io::copy(reader, &mut writer).with_context(|| format!("Writing object '{path}'"))?;
        io::Write::flush(&mut writer).with_context(|| format!("Flushing object '{path}'"))?;
        debug!("Stored {written} byte(s) at '{path}'");
        Ok(written)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        self.collect(&self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.is_file())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        fs::remove_file(&target).with_context(|| format!("Removing object {target:?}"))
    }

    fn get_stream(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let target = self.resolve(path)?;
        let file = File::open(&target).with_context(|| format!("Opening object {target:?}"))?;
        Ok(Box::new(file))
    }
}

#[derive(Debug, Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.lock().insert(path.to_string(), bytes.into());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().get(path).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ObjectStorage for MemoryObjectStorage {
    fn upload(&self, path: &str, reader: &mut dyn Read) -> Result<u64> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .with_context(|| format!("Reading upload for '{path}'"))?;
        let written = bytes.len() as u64;
        self.lock().insert(path.to_string(), bytes);
        Ok(written)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.lock().contains_key(path))
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| anyhow!("Object '{path}' does not exist"))
    }

    fn get_stream(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let bytes = self
            .get(path)
            .ok_or_else(|| anyhow!("Object '{path}' does not exist"))?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_skips_empty_segments() {
        assert_eq!(object_key(&["ds", "", "/raw/", "t"]), "ds/raw/t");
    }

    #[test]
    fn layout_places_raw_and_parquet_objects_per_table() {
        let layout = DatasetLayout::new("Sales");
        assert_eq!(layout.raw_path("Orders", "jan.csv"), "sales/raw/orders/jan.csv");
        assert_eq!(
            layout.parquet_path("Orders", "jan.csv"),
            "sales/tables/orders/jan.csv.parquet"
        );
        assert_ne!(layout.parquet_path("Orders", "jan.tsv"), layout.parquet_path("Orders", "jan.csv"));
        assert_eq!(layout.table_location("Orders"), "sales/tables/orders");
        assert_eq!(
            layout.archive_prefix("20240101T000000Z", "Orders"),
            "sales/archive/20240101T000000Z/orders/"
        );
    }

    #[test]
    fn local_storage_round_trips_and_lists_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path());
        storage.upload("ds/raw/t/a.csv", &mut "a,b\n".as_bytes()).unwrap();
        storage.upload("ds/tables/t/a.parquet", &mut "x".as_bytes()).unwrap();
        assert_eq!(storage.list("ds/raw/").unwrap(), vec!["ds/raw/t/a.csv"]);
        assert!(storage.exists("ds/raw/t/a.csv").unwrap());

        let mut text = String::new();
        storage
            .get_stream("ds/raw/t/a.csv")
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "a,b\n");

        storage.remove("ds/raw/t/a.csv").unwrap();
        assert!(!storage.exists("ds/raw/t/a.csv").unwrap());
    }

    #[test]
    fn local_storage_rejects_parent_segments() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path());
        assert!(storage.exists("../etc/passwd").is_err());
    }

    #[test]
    fn memory_storage_copy_uses_streams() {
        let storage = MemoryObjectStorage::new();
        storage.put("a", b"hello".to_vec());
        assert_eq!(storage.copy("a", "b").unwrap(), 5);
        assert_eq!(storage.get("b").as_deref(), Some(&b"hello"[..]));
        assert!(storage.remove("missing").is_err());
    }
}
