pub mod archive;
pub mod cli;
pub mod columnar;
pub mod columns;
pub mod config;
pub mod data;
pub mod ddl;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod inference;
pub mod io_utils;
pub mod join;
pub mod metadata;
pub mod model;
pub mod numeric;
pub mod orchestrator;
pub mod parser;
pub mod pipeline;
pub mod reconcile;
pub mod sorter;
pub mod storage;
pub mod table;
pub mod transform;

use std::{
    env,
    ffi::OsStr,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::Path,
    sync::OnceLock,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    cli::{Cli, Commands},
    config::IngestConfig,
    engine::ScriptQueryEngine,
    metadata::{JsonManifestStore, MetadataStore},
    model::{BatchRequest, FileSource, Status},
    orchestrator::{Collaborators, Orchestrator},
    storage::LocalObjectStorage,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("tabular_ingest", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Ingest(args) => handle_ingest(&args),
        Commands::Probe(args) => handle_probe(&args),
    }
}

fn handle_ingest(args: &cli::IngestArgs) -> Result<()> {
    let config = IngestConfig::load_or_default(args.config.as_deref())?;
    let batch = load_batch(&args.batch)?;
    info!(
        "Ingesting {} operation(s) into dataset '{}' under {:?}",
        batch.operations.len(),
        batch.dataset_id,
        args.root
    );

    fs::create_dir_all(&args.root)
        .with_context(|| format!("Creating storage root {:?}", args.root))?;
    let storage = LocalObjectStorage::new(args.root.join("objects"));
    let metadata = JsonManifestStore::new(args.root.join("manifests"));
    let prior = metadata
        .get_manifest(&batch.dataset_id)
        .with_context(|| format!("Loading manifest for dataset '{}'", batch.dataset_id))?;
    let script = args
        .script
        .clone()
        .unwrap_or_else(|| args.root.join("ddl.sql"));
    let (existing_tables, existing_view) = match &prior {
        Some(manifest) => (
            manifest
                .tables
                .iter()
                .map(|t| ddl::physical_table_name(&batch.dataset_id, &t.table_name))
                .collect::<Vec<_>>(),
            manifest.view_name.clone(),
        ),
        None => (Vec::new(), None),
    };
    let engine = ScriptQueryEngine::new(config.database.clone(), Some(script))
        .with_existing(&existing_tables, existing_view.as_deref());

    let collaborators = Collaborators {
        storage: &storage,
        engine: &engine,
        metadata: &metadata,
    };
    let result = Orchestrator::new(&config, collaborators).run(&batch);
    debug!("Run {} executed {} statement(s)", result.run_id, engine.statements().len());

    match &args.output {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("Creating result file {path:?}"))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &result)
                .with_context(|| format!("Writing result to {path:?}"))?;
            writer.flush()?;
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            serde_json::to_writer_pretty(&mut handle, &result).context("Writing result JSON")?;
            writeln!(handle)?;
        }
    }

    if result.status == Status::Error {
        let reason = result
            .errors
            .iter()
            .find(|e| e.kind.aborts_batch())
            .or_else(|| result.errors.first())
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".to_string());
        bail!("Batch for dataset '{}' failed: {reason}", result.dataset_id);
    }
    info!(
        "Batch finished with status {:?}: {} table(s), {} error(s)",
        result.status,
        result.tables.len(),
        result.errors.len()
    );
    Ok(())
}

/// Reads a batch request; relative local sources resolve against the batch file's directory.
fn load_batch(path: &Path) -> Result<BatchRequest> {
    let file = File::open(path).with_context(|| format!("Opening batch file {path:?}"))?;
    let reader = BufReader::new(file);
    let is_json = path
        .extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let mut batch: BatchRequest = if is_json {
        serde_json::from_reader(reader).context("Parsing batch JSON")?
    } else {
        serde_yaml::from_reader(reader).context("Parsing batch YAML")?
    };
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for operation in &mut batch.operations {
        if let Some(FileSource::Local(source)) = &mut operation.source
            && source.is_relative()
        {
            *source = base.join(&*source);
        }
    }
    Ok(batch)
}

fn handle_probe(args: &cli::ProbeArgs) -> Result<()> {
    let mut config = IngestConfig::load_or_default(args.config.as_deref())?;
    if let Some(label) = &args.input_encoding {
        config.encoding = Some(label.clone());
    }
    if let Some(delimiter) = args.delimiter {
        config.parser.delimiter = Some(delimiter);
    }
    if let Some(rows) = args.sample_rows {
        config.inference.sample_size = rows;
    }
    let file_name = args
        .input
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or("stdin")
        .to_string();
    let encoding = config.text_encoding()?;
    let delimiter = io_utils::resolve_input_delimiter(&file_name, config.parser.delimiter);
    info!(
        "Probing '{}' as {} with delimiter '{}'",
        args.input.display(),
        encoding.name(),
        io_utils::printable_delimiter(delimiter)
    );

    let reader = io_utils::open_input(&args.input)?;
    let summary = pipeline::infer_schema(reader, &file_name, &config)
        .with_context(|| format!("Inferring schema from {:?}", args.input))?;
    print!("{}", table::render_schema(&summary.columns));
    info!(
        "Inferred {} column(s) from {} row(s) with {} conversion error(s)",
        summary.column_count,
        summary.row_count,
        summary.errors.len()
    );
    Ok(())
}
