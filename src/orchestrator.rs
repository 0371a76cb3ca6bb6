//! The batch state machine.
//!
//! ```text
//! INIT → VALIDATE → APPLY → RECONCILE → REBUILD → PERSIST → RESULT
//!           │          │                   │          │
//!           └──────────┴───── on error ────┴──────────┴──→ RESULT
//! ```
//!
//! Every stage returns the next one; errors that abort the batch jump
//! straight to RESULT. The caller always gets a [`ProcessingResult`].

use std::fmt;

use chrono::Utc;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    archive::TableArchiver,
    columns::ColumnNameNormalizer,
    config::IngestConfig,
    ddl::{self, physical_table_name},
    engine::QueryEngine,
    error::{IngestError, ProcessingError},
    join::JoinForest,
    metadata::MetadataStore,
    model::{
        BatchRequest, FileOperation, Manifest, OperationKind, ProcessingResult, Status,
        TableSnapshot, normalize_table_name,
    },
    pipeline::FilePipeline,
    reconcile::{self, AppliedOperation},
    sorter::sort_tables,
    storage::{DatasetLayout, ObjectStorage},
};

/// External systems a run talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub storage: &'a dyn ObjectStorage,
    pub engine: &'a dyn QueryEngine,
    pub metadata: &'a dyn MetadataStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Validate,
    Apply,
    Reconcile,
    Rebuild,
    Persist,
    Result,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "INIT",
            Stage::Validate => "VALIDATE",
            Stage::Apply => "APPLY",
            Stage::Reconcile => "RECONCILE",
            Stage::Rebuild => "REBUILD",
            Stage::Persist => "PERSIST",
            Stage::Result => "RESULT",
        };
        f.write_str(name)
    }
}

struct RunState<'b> {
    batch: &'b BatchRequest,
    prior: Option<Manifest>,
    normalizer: ColumnNameNormalizer,
    applied: Vec<AppliedOperation>,
    errors: Vec<ProcessingError>,
    files: Vec<TableSnapshot>,
    tables: Vec<TableSnapshot>,
    forest: Option<JoinForest>,
    ddl: Vec<String>,
    view_name: Option<String>,
    view_dropped: bool,
    failed: bool,
    stages: Vec<Stage>,
}

impl<'b> RunState<'b> {
    fn new(batch: &'b BatchRequest) -> Self {
        Self {
            batch,
            prior: None,
            normalizer: ColumnNameNormalizer::new(),
            applied: Vec::new(),
            errors: Vec::new(),
            files: Vec::new(),
            tables: Vec::new(),
            forest: None,
            ddl: Vec::new(),
            view_name: None,
            view_dropped: false,
            failed: false,
            stages: Vec::new(),
        }
    }

    fn prior_tables(&self) -> &[TableSnapshot] {
        self.prior.as_ref().map(|m| m.tables.as_slice()).unwrap_or_default()
    }

    /// Records a batch-level failure and moves to RESULT.
    fn abort(&mut self, file_name: &str, table_name: Option<&str>, err: &IngestError) -> Stage {
        error!("Batch '{}' aborted: {err}", self.batch.dataset_id);
        self.errors
            .push(ProcessingError::from_error(file_name, table_name, err));
        self.failed = true;
        Stage::Result
    }
}

pub struct Orchestrator<'a> {
    config: &'a IngestConfig,
    collaborators: Collaborators<'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a IngestConfig, collaborators: Collaborators<'a>) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    pub fn run(&self, batch: &BatchRequest) -> ProcessingResult {
        let run_id = Uuid::new_v4();
        info!(
            "Run {run_id}: {} operation(s) for dataset '{}'",
            batch.operations.len(),
            batch.dataset_id
        );
        let mut state = RunState::new(batch);
        let mut stage = Stage::Init;
        while stage != Stage::Result {
            debug!("Run {run_id}: entering {stage}");
            state.stages.push(stage);
            stage = match stage {
                Stage::Init => self.init(&mut state),
                Stage::Validate => self.validate(&mut state),
                Stage::Apply => self.apply(&mut state),
                Stage::Reconcile => self.reconcile(&mut state),
                Stage::Rebuild => self.rebuild(&mut state),
                Stage::Persist => self.persist(&mut state),
                Stage::Result => Stage::Result,
            };
        }
        state.stages.push(Stage::Result);

        let status = if state.failed {
            Status::Error
        } else if !state.errors.is_empty() {
            Status::Warning
        } else {
            Status::Ok
        };
        info!(
            "Run {run_id} finished with {status:?}: {} table(s), {} error(s)",
            state.tables.len(),
            state.errors.len()
        );
        debug!(
            "Run {run_id} stages: {}",
            state
                .stages
                .iter()
                .map(Stage::to_string)
                .collect::<Vec<_>>()
                .join(" → ")
        );
        ProcessingResult {
            run_id,
            dataset_id: batch.dataset_id.clone(),
            status,
            tables: state.tables,
            files: state.files,
            errors: state.errors,
            forest: state.forest,
            ddl: state.ddl,
            view_name: state.view_name,
        }
    }

    fn init(&self, state: &mut RunState<'_>) -> Stage {
        let batch = state.batch;
        let dataset = &batch.dataset_id;
        match self.collaborators.metadata.get_manifest(dataset) {
            Ok(prior) => {
                if let Some(manifest) = &prior {
                    debug!(
                        "Loaded manifest for '{dataset}' with {} table(s)",
                        manifest.tables.len()
                    );
                }
                state.prior = prior;
                Stage::Validate
            }
            Err(err) => {
                let err = IngestError::infrastructure(format!("Loading manifest of '{dataset}'"), err);
                state.abort("", None, &err)
            }
        }
    }

    fn validate(&self, state: &mut RunState<'_>) -> Stage {
        let layout = DatasetLayout::new(&state.batch.dataset_id);
        match reconcile::validate(
            &state.batch.operations,
            state.prior_tables(),
            self.collaborators.storage,
            &layout,
        ) {
            Ok(conflicts) if conflicts.is_empty() => Stage::Apply,
            Ok(conflicts) => {
                for conflict in &conflicts {
                    warn!("Validation: {conflict}");
                }
                state.errors.extend(conflicts);
                state.failed = true;
                Stage::Result
            }
            Err(err) => state.abort("", None, &err),
        }
    }

    fn apply(&self, state: &mut RunState<'_>) -> Stage {
        let batch = state.batch;
        for operation in &batch.operations {
            if let Err(err) = self.apply_one(state, operation) {
                if err.aborts_batch() {
                    return state.abort(&operation.file_name, Some(&operation.table_name), &err);
                }
                warn!(
                    "Skipping '{}' for table '{}': {err}",
                    operation.file_name, operation.table_name
                );
                state.errors.push(ProcessingError::from_error(
                    &operation.file_name,
                    Some(&operation.table_name),
                    &err,
                ));
            }
        }
        Stage::Reconcile
    }

    fn apply_one(&self, state: &mut RunState<'_>, operation: &FileOperation) -> Result<(), IngestError> {
        let batch = state.batch;
        let dataset = batch.dataset_id.as_str();
        let table = operation.table_name.as_str();
        if operation.kind.affects_view() && !state.view_dropped {
            let view = ddl::view_name(dataset);
            self.collaborators
                .engine
                .drop_view(&view)
                .map_err(|err| IngestError::infrastructure(format!("Dropping view '{view}'"), err))?;
            state.view_dropped = true;
        }

        match operation.kind {
            OperationKind::Delete => {
                self.retire_table(dataset, table)?;
                state
                    .applied
                    .push(AppliedOperation::new(OperationKind::Delete, table, None));
                Ok(())
            }
            OperationKind::Replace => {
                self.retire_table(dataset, table)?;
                self.load_file(state, operation, None, 1)
            }
            OperationKind::Add => self.load_file(state, operation, None, 1),
            OperationKind::Append => {
                let key = normalize_table_name(table);
                let existing = reconcile::squash(&state.applied, state.prior_tables())
                    .into_iter()
                    .find(|t| normalize_table_name(&t.table_name) == key);
                let start = existing.as_ref().map_or(1, |t| t.max_row_id + 1);
                self.load_file(state, operation, existing.as_ref(), start)
            }
        }
    }

    /// Archives a table's objects and drops its definition.
    fn retire_table(&self, dataset: &str, table: &str) -> Result<(), IngestError> {
        TableArchiver::new(self.collaborators.storage, dataset).archive(table, Utc::now())?;
        let physical = physical_table_name(dataset, table);
        self.collaborators
            .engine
            .drop_table(&physical)
            .map_err(|err| IngestError::infrastructure(format!("Dropping table '{physical}'"), err))
    }

    fn load_file(
        &self,
        state: &mut RunState<'_>,
        operation: &FileOperation,
        existing: Option<&TableSnapshot>,
        row_id_start: u64,
    ) -> Result<(), IngestError> {
        let batch = state.batch;
        let pipeline = FilePipeline::new(self.config, self.collaborators.storage, &batch.dataset_id);
        match pipeline.run(operation, existing, &mut state.normalizer, row_id_start) {
            Ok(outcome) => {
                if !outcome.errors.is_empty() {
                    warn!(
                        "'{}' had {} value(s) that did not match their column type",
                        operation.file_name,
                        outcome.errors.len()
                    );
                }
                state.errors.extend(outcome.errors);
                state.applied.push(AppliedOperation::new(
                    operation.kind,
                    &operation.table_name,
                    Some(outcome.snapshot),
                ));
                Ok(())
            }
            Err(err) => {
                state.applied.push(AppliedOperation::new(
                    operation.kind,
                    &operation.table_name,
                    None,
                ));
                Err(err)
            }
        }
    }

    fn reconcile(&self, state: &mut RunState<'_>) -> Stage {
        let reconciliation = reconcile::reconcile(&state.applied, state.prior_tables());
        debug!(
            "Squashed {} applied operation(s) into {} table(s)",
            state.applied.len(),
            reconciliation.tables.len()
        );
        state.files = reconciliation.files;
        state.tables = reconciliation.tables;
        Stage::Rebuild
    }

    fn rebuild(&self, state: &mut RunState<'_>) -> Stage {
        if state.tables.is_empty() {
            debug!("No tables left; skipping DDL");
            return Stage::Persist;
        }
        let dataset = state.batch.dataset_id.clone();
        sort_tables(&mut state.tables);
        let forest = match JoinForest::build(&state.tables) {
            Ok(forest) => forest,
            Err(err) => return state.abort("", None, &err),
        };

        let settings = self.config.ddl_settings(&state.batch.bucket_name);
        let timeout = self.config.ddl_timeout();
        let mut statements: Vec<(String, String)> = state
            .tables
            .iter()
            .filter(|t| t.operation != OperationKind::Append)
            .map(|t| (t.table_name.clone(), ddl::plan_table(&settings, &dataset, t)))
            .collect();
        let had_view = state.prior.as_ref().is_some_and(|m| m.view_name.is_some());
        if (state.view_dropped || !had_view)
            && let Some(view) = ddl::plan_view(&settings, &dataset, &forest)
        {
            statements.push((ddl::view_name(&dataset), view));
        }

        for (name, statement) in statements {
            if let Err(err) = self.collaborators.engine.execute(&statement, timeout) {
                let err = IngestError::infrastructure(format!("Creating '{name}'"), err);
                return state.abort("", Some(&name), &err);
            }
            state.ddl.push(statement);
        }
        state.view_name = Some(ddl::view_name(&dataset));
        state.forest = Some(forest);
        Stage::Persist
    }

    fn persist(&self, state: &mut RunState<'_>) -> Stage {
        let batch = state.batch;
        let dataset = &batch.dataset_id;
        if let Err(err) = self.collaborators.metadata.save_manifest(
            dataset,
            &state.tables,
            state.view_name.as_deref(),
        ) {
            let err = IngestError::infrastructure(format!("Saving manifest of '{dataset}'"), err);
            return state.abort("", None, &err);
        }
        Stage::Result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::ScriptQueryEngine,
        error::ErrorKind,
        metadata::MemoryManifestStore,
        model::FileSource,
        storage::MemoryObjectStorage,
    };

    fn batch(operations: Vec<FileOperation>) -> BatchRequest {
        BatchRequest {
            dataset_id: "sales".into(),
            bucket_name: "landing".into(),
            operations,
        }
    }

    fn add(table: &str, file: &str) -> FileOperation {
        FileOperation::new(
            table,
            file,
            OperationKind::Add,
            Some(FileSource::Stored(format!("in/{file}"))),
        )
    }

    #[test]
    fn stage_names_render_upper_case() {
        assert_eq!(Stage::Reconcile.to_string(), "RECONCILE");
    }

    #[test]
    fn add_creates_table_view_and_manifest() {
        let storage = MemoryObjectStorage::new();
        storage.put("in/orders.csv", "id,amount\n1,2.5\n2,3\n");
        let engine = ScriptQueryEngine::new("default", None);
        let metadata = MemoryManifestStore::new();
        let config = IngestConfig::default();
        let orchestrator = Orchestrator::new(
            &config,
            Collaborators {
                storage: &storage,
                engine: &engine,
                metadata: &metadata,
            },
        );

        let result = orchestrator.run(&batch(vec![add("orders", "orders.csv")]));
        assert_eq!(result.status, Status::Ok, "{:?}", result.errors);
        assert_eq!(result.tables.len(), 1);
        assert_eq!(result.ddl.len(), 2);
        assert_eq!(result.view_name.as_deref(), Some("sales_view"));
        assert!(engine.table_exists("sales_orders").unwrap());
        let manifest = metadata.get_manifest("sales").unwrap().unwrap();
        assert_eq!(manifest.tables[0].row_count, 2);
    }

    #[test]
    fn validation_failure_changes_nothing() {
        let storage = MemoryObjectStorage::new();
        let engine = ScriptQueryEngine::new("default", None);
        let metadata = MemoryManifestStore::new();
        let config = IngestConfig::default();
        let orchestrator = Orchestrator::new(
            &config,
            Collaborators {
                storage: &storage,
                engine: &engine,
                metadata: &metadata,
            },
        );
        let delete = FileOperation::new("orders", "orders.csv", OperationKind::Delete, None);
        let result = orchestrator.run(&batch(vec![delete]));
        assert_eq!(result.status, Status::Error);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::TableDoesNotExist);
        assert!(engine.statements().is_empty());
        assert!(metadata.get_manifest("sales").unwrap().is_none());
    }
}
