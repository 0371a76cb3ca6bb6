//! Manifest persistence.
//!
//! The manifest is the squashed table list and view name left behind by the
//! last run for a dataset. [`JsonManifestStore`] keeps one pretty-printed JSON
//! file per dataset; [`MemoryManifestStore`] backs tests.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use chrono::Utc;
use log::debug;

use crate::model::{Manifest, TableSnapshot, normalize_table_name};

pub trait MetadataStore: Send + Sync {
    fn get_manifest(&self, dataset_id: &str) -> Result<Option<Manifest>>;
    fn save_manifest(
        &self,
        dataset_id: &str,
        tables: &[TableSnapshot],
        view_name: Option<&str>,
    ) -> Result<()>;
}

fn build_manifest(dataset_id: &str, tables: &[TableSnapshot], view_name: Option<&str>) -> Manifest {
    Manifest {
        dataset_id: dataset_id.to_string(),
        tables: tables.to_vec(),
        view_name: view_name.map(str::to_string),
        updated_at: Utc::now(),
    }
}

#[derive(Debug, Clone)]
pub struct JsonManifestStore {
    root: PathBuf,
}

impl JsonManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn manifest_path(&self, dataset_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.manifest.json", normalize_table_name(dataset_id)))
    }

    pub fn load(path: &Path) -> Result<Manifest> {
        let file = File::open(path).with_context(|| format!("Opening manifest {path:?}"))?;
        let reader = BufReader::new(file);
        let manifest = serde_json::from_reader(reader).context("Parsing manifest JSON")?;
        Ok(manifest)
    }

    pub fn save(manifest: &Manifest, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Creating directory {parent:?}"))?;
        }
        let file = File::create(path).with_context(|| format!("Creating manifest {path:?}"))?;
        serde_json::to_writer_pretty(file, manifest).context("Writing manifest JSON")
    }
}

impl MetadataStore for JsonManifestStore {
    fn get_manifest(&self, dataset_id: &str) -> Result<Option<Manifest>> {
        let path = self.manifest_path(dataset_id);
        if !path.exists() {
            debug!("No manifest for dataset '{dataset_id}' at {path:?}");
            return Ok(None);
        }
        Self::load(&path).map(Some)
    }

    fn save_manifest(
        &self,
        dataset_id: &str,
        tables: &[TableSnapshot],
        view_name: Option<&str>,
    ) -> Result<()> {
        let manifest = build_manifest(dataset_id, tables, view_name);
        Self::save(&manifest, &self.manifest_path(dataset_id))
    }
}

#[derive(Debug, Default)]
pub struct MemoryManifestStore {
    manifests: Mutex<HashMap<String, Manifest>>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manifest(self, manifest: Manifest) -> Self {
        self.lock().insert(manifest.dataset_id.clone(), manifest);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Manifest>> {
        self.manifests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetadataStore for MemoryManifestStore {
    fn get_manifest(&self, dataset_id: &str) -> Result<Option<Manifest>> {
        Ok(self.lock().get(dataset_id).cloned())
    }

    fn save_manifest(
        &self,
        dataset_id: &str,
        tables: &[TableSnapshot],
        view_name: Option<&str>,
    ) -> Result<()> {
        self.lock().insert(
            dataset_id.to_string(),
            build_manifest(dataset_id, tables, view_name),
        );
        Ok(())
    }
}
