#![allow(dead_code)]

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tabular_ingest::engine::QueryEngine;
use tabular_ingest::model::{BatchRequest, FileOperation, FileSource, OperationKind};
use tabular_ingest::storage::{MemoryObjectStorage, ObjectStorage};
use tempfile::{TempDir, tempdir};

/// Returns the absolute path to a fixture under `tests/data`.
pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

pub fn read_fixture(name: &str) -> String {
    fs::read_to_string(fixture_path(name)).expect("read fixture")
}

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dirs");
        }
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }
}

/// In-memory storage that counts calls and fails on request.
#[derive(Default)]
pub struct RecordingStorage {
    pub inner: MemoryObjectStorage,
    list_calls: AtomicUsize,
    copy_calls: AtomicUsize,
    fail_uploads_under: Mutex<Option<String>>,
    fail_copies: Mutex<bool>,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, contents: &str) {
        self.inner.put(path, contents);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn copy_calls(&self) -> usize {
        self.copy_calls.load(Ordering::SeqCst)
    }

    pub fn fail_uploads_under(&self, prefix: &str) {
        *self.fail_uploads_under.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn fail_copies(&self) {
        *self.fail_copies.lock().unwrap() = true;
    }
}

impl ObjectStorage for RecordingStorage {
    fn upload(&self, path: &str, reader: &mut dyn Read) -> Result<u64> {
        if let Some(prefix) = self.fail_uploads_under.lock().unwrap().as_deref()
            && path.starts_with(prefix)
        {
            return Err(anyhow!("injected upload failure for '{path}'"));
        }
        self.inner.upload(path, reader)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list(prefix)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path)
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.inner.remove(path)
    }

    fn get_stream(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        self.inner.get_stream(path)
    }

    fn copy(&self, from: &str, to: &str) -> Result<u64> {
        self.copy_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_copies.lock().unwrap() {
            return Err(anyhow!("injected copy failure for '{from}'"));
        }
        self.inner.copy(from, to)
    }
}

/// Query engine that records every call and can refuse statements.
#[derive(Default)]
pub struct RecordingEngine {
    statements: Mutex<Vec<String>>,
    dropped_tables: Mutex<Vec<String>>,
    dropped_views: Mutex<Vec<String>>,
    fail_matching: Mutex<Option<String>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn dropped_tables(&self) -> Vec<String> {
        self.dropped_tables.lock().unwrap().clone()
    }

    pub fn dropped_views(&self) -> Vec<String> {
        self.dropped_views.lock().unwrap().clone()
    }

    /// Makes `execute` fail for statements containing `needle`.
    pub fn fail_matching(&self, needle: &str) {
        *self.fail_matching.lock().unwrap() = Some(needle.to_string());
    }
}

impl QueryEngine for RecordingEngine {
    fn execute(&self, ddl: &str, _timeout: Duration) -> Result<Vec<Vec<String>>> {
        if let Some(needle) = self.fail_matching.lock().unwrap().as_deref()
            && ddl.contains(needle)
        {
            return Err(anyhow!("injected failure executing statement"));
        }
        self.statements.lock().unwrap().push(ddl.to_string());
        Ok(Vec::new())
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .statements
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.contains(&format!("`{name}`"))))
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        self.dropped_tables.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn drop_view(&self, name: &str) -> Result<()> {
        self.dropped_views.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

pub fn stored_op(table: &str, file: &str, kind: OperationKind) -> FileOperation {
    FileOperation::new(
        table,
        file,
        kind,
        Some(FileSource::Stored(format!("incoming/{file}"))),
    )
}

pub fn batch(dataset: &str, operations: Vec<FileOperation>) -> BatchRequest {
    BatchRequest {
        dataset_id: dataset.to_string(),
        bucket_name: "lake".to_string(),
        operations,
    }
}
