//! Run configuration loaded from YAML.
//!
//! Every field has a default, so an empty document (or no file at all) is a
//! valid configuration.

use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::{
    columnar::ParquetCompression,
    ddl::{DdlSettings, MAX_VARCHAR_LENGTH},
    decoder::{TextEncoding, Utf8Fallback},
    inference::InferenceSettings,
    io_utils,
    parser::ParserOptions,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Encoding label for every file in the batch; UTF-8 when unset.
    pub encoding: Option<String>,
    pub utf8_fallback: Utf8Fallback,
    pub parser: ParserOptions,
    pub inference: InferenceSettings,
    /// Bytes read from a source per decode step.
    pub chunk_size: usize,
    /// Rows per Parquet record batch.
    pub batch_rows: usize,
    pub compression: ParquetCompression,
    pub database: String,
    /// Scheme for table locations; the bucket name completes the base.
    pub location_scheme: String,
    pub ddl_timeout_secs: u64,
    pub varchar_cap: usize,
    /// Bytes a spooled temporary file holds in memory before moving to disk.
    pub spool_threshold: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            encoding: None,
            utf8_fallback: Utf8Fallback::Reject,
            parser: ParserOptions::default(),
            inference: InferenceSettings::default(),
            chunk_size: 64 * 1024,
            batch_rows: 8192,
            compression: ParquetCompression::Snappy,
            database: "default".to_string(),
            location_scheme: "s3".to_string(),
            ddl_timeout_secs: 60,
            varchar_cap: MAX_VARCHAR_LENGTH,
            spool_threshold: 8 * 1024 * 1024,
        }
    }
}

impl IngestConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening config file {path:?}"))?;
        let reader = BufReader::new(file);
        let config: IngestConfig =
            serde_yaml::from_reader(reader).context("Parsing config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(anyhow!("chunk_size must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.inference.threshold) {
            return Err(anyhow!(
                "inference.threshold must be between 0 and 1, got {}",
                self.inference.threshold
            ));
        }
        self.text_encoding().map(|_| ())
    }

    pub fn text_encoding(&self) -> Result<TextEncoding> {
        io_utils::resolve_encoding(self.encoding.as_deref(), self.utf8_fallback)
    }

    pub fn ddl_timeout(&self) -> Duration {
        Duration::from_secs(self.ddl_timeout_secs)
    }

    pub fn ddl_settings(&self, bucket_name: &str) -> DdlSettings {
        let mut settings = DdlSettings::new(
            &self.database,
            &format!("{}://{}", self.location_scheme, bucket_name.trim_matches('/')),
        );
        settings.varchar_cap = self.varchar_cap;
        settings.compression = self.compression;
        settings
    }

    /// Parser options for one file, with the delimiter defaulted from its name.
    pub fn parser_options(&self, file_name: &str) -> ParserOptions {
        let mut options = self.parser.clone();
        options.delimiter = Some(io_utils::resolve_input_delimiter(
            file_name,
            self.parser.delimiter,
        ));
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: IngestConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, IngestConfig::default());
        assert_eq!(config.ddl_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn partial_document_overrides_selected_fields() {
        let yaml = "encoding: latin1\ncompression: zstd\nparser:\n  delimiter: ';'\ninference:\n  sample_size: 10\n";
        let config: IngestConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.text_encoding().unwrap(), TextEncoding::Latin1);
        assert_eq!(config.compression, ParquetCompression::Zstd);
        assert_eq!(config.inference.sample_size, 10);
        assert_eq!(config.inference.threshold, 0.65);
        assert_eq!(config.parser_options("a.tsv").delimiter, Some(';'));
    }

    #[test]
    fn delimiter_falls_back_to_extension() {
        let config = IngestConfig::default();
        assert_eq!(config.parser_options("a.tsv").delimiter, Some('\t'));
        assert_eq!(config.parser_options("a.csv").delimiter, Some(','));
    }

    #[test]
    fn ddl_settings_use_bucket_as_location_base() {
        let settings = IngestConfig::default().ddl_settings("landing");
        assert_eq!(settings.location_base, "s3://landing");
        assert_eq!(settings.database, "default");
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        let mut config = IngestConfig::default();
        config.inference.threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
