use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about = "Ingest delimited files into Parquet tables", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a batch of file operations against a local storage root
    Ingest(IngestArgs),
    /// Infer and print the schema of a delimited file without uploading it
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Batch request file (YAML, or JSON when the extension is .json)
    #[arg(short, long)]
    pub batch: PathBuf,
    /// Directory holding stored objects and dataset manifests
    #[arg(short, long)]
    pub root: PathBuf,
    /// Optional YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// SQL script receiving every executed statement (defaults to <root>/ddl.sql)
    #[arg(long)]
    pub script: Option<PathBuf>,
    /// Write the processing result JSON here instead of stdout
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Input file to inspect (`-` reads stdin)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Delimiter character (supports ',', 'tab', ';', '|'); defaults by extension
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<char>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Rows buffered before column types are locked
    #[arg(long)]
    pub sample_rows: Option<usize>,
    /// Optional YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

pub fn parse_delimiter(value: &str) -> Result<char, String> {
    match value.to_ascii_lowercase().as_str() {
        "tab" | "\\t" => Ok('\t'),
        "comma" => Ok(','),
        "semicolon" => Ok(';'),
        "pipe" => Ok('|'),
        _ => {
            let mut chars = value.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if matches!(first, '"' | '\r' | '\n') {
                return Err(format!("'{}' cannot be used as a delimiter", first.escape_default()));
            }
            Ok(first)
        }
    }
}
