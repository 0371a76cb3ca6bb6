//! Input resolution helpers: encodings, delimiters and input streams.
//!
//! - **Encoding**: labels are resolved through `encoding_rs` so the usual
//!   aliases (`utf8`, `l1`, `unicodefffe`, ...) work, then mapped onto the
//!   decoders this crate streams with.
//! - **Delimiter**: extension-based defaults (`.tsv` → tab, otherwise comma)
//!   unless a delimiter is configured.
//! - **stdin**: the `-` path convention reads from standard input.

use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE, WINDOWS_1252};

use crate::decoder::{ByteOrder, TextEncoding, Utf8Fallback};

pub const DEFAULT_CSV_DELIMITER: char = ',';
pub const DEFAULT_TSV_DELIMITER: char = '\t';

pub fn is_dash(path: &Path) -> bool {
    path == Path::new("-")
}

/// Maps an encoding label onto a streaming decoder; no label means UTF-8.
pub fn resolve_encoding(label: Option<&str>, fallback: Utf8Fallback) -> Result<TextEncoding> {
    let Some(value) = label.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(TextEncoding::Utf8(fallback));
    };
    let lowered = value.to_ascii_lowercase();
    // The WHATWG tables fold ASCII into windows-1252 and pin bare UTF-16 to LE.
    match lowered.as_str() {
        "ascii" | "us-ascii" | "ansi_x3.4-1968" => return Ok(TextEncoding::Ascii),
        "utf-16" | "utf16" => return Ok(TextEncoding::Utf16(None)),
        _ => {}
    }
    let encoding = Encoding::for_label(lowered.as_bytes())
        .ok_or_else(|| anyhow!("Unknown encoding '{value}'"))?;
    if encoding == UTF_8 {
        Ok(TextEncoding::Utf8(fallback))
    } else if encoding == UTF_16LE {
        Ok(TextEncoding::Utf16(Some(ByteOrder::Little)))
    } else if encoding == UTF_16BE {
        Ok(TextEncoding::Utf16(Some(ByteOrder::Big)))
    } else if encoding == WINDOWS_1252 {
        Ok(TextEncoding::Latin1)
    } else {
        Err(anyhow!(
            "Encoding '{value}' ({}) is not supported for ingestion",
            encoding.name()
        ))
    }
}

pub fn resolve_input_delimiter(file_name: &str, provided: Option<char>) -> char {
    provided.unwrap_or_else(|| match Path::new(file_name).extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => DEFAULT_TSV_DELIMITER,
        _ => DEFAULT_CSV_DELIMITER,
    })
}

pub fn printable_delimiter(delimiter: char) -> String {
    match delimiter {
        '\t' => "\\t".to_string(),
        '\n' => "\\n".to_string(),
        other => other.to_string(),
    }
}

pub fn open_input(path: &Path) -> Result<Box<dyn Read + Send>> {
    if is_dash(path) {
        Ok(Box::new(io::stdin()))
    } else {
        let file = File::open(path).with_context(|| format!("Opening input file {path:?}"))?;
        Ok(Box::new(BufReader::new(file)))
    }
}
