//! Streaming CSV tokenizer over decoded text chunks.
//!
//! Text is pushed in arbitrarily sized chunks; the tokenizer keeps the partial
//! field, partial row, open quote and pending `\r` between calls, so splitting
//! the input differently never changes the rows produced. The first row becomes
//! the header.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LineTerminator {
    /// Accept `\n`, `\r` and `\r\n`, even mixed within one stream.
    #[default]
    Auto,
    Lf,
    Cr,
    CrLf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserOptions {
    pub delimiter: Option<char>,
    pub quoting: bool,
    pub quote: char,
    pub escape_backslash: bool,
    pub line_terminator: LineTerminator,
    pub trim: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            quoting: true,
            quote: '"',
            escape_backslash: false,
            line_terminator: LineTerminator::Auto,
            trim: true,
        }
    }
}

/// A data row along with the 1-based data row index and the line it ended on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub index: u64,
    pub line: u64,
    pub fields: Vec<String>,
}

pub struct CsvParser {
    delimiter: char,
    options: ParserOptions,
    headers: Option<Vec<String>>,
    field: String,
    row: Vec<String>,
    in_quotes: bool,
    field_quoted: bool,
    quote_pending: bool,
    escape_next: bool,
    pending_cr: bool,
    skip_lf: bool,
    line: u64,
    rows_emitted: u64,
}

impl CsvParser {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            delimiter: options.delimiter.unwrap_or(','),
            options,
            headers: None,
            field: String::new(),
            row: Vec::new(),
            in_quotes: false,
            field_quoted: false,
            quote_pending: false,
            escape_next: false,
            pending_cr: false,
            skip_lf: false,
            line: 1,
            rows_emitted: 0,
        }
    }

    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted
    }

    /// Tokenizes `chunk`, appending every completed data row to `out`.
    pub fn push(&mut self, chunk: &str, out: &mut Vec<Record>) -> Result<()> {
        for ch in chunk.chars() {
            self.consume(ch, out)?;
        }
        Ok(())
    }

    /// Flushes the final row. Call once the input is exhausted.
    pub fn finish(&mut self, out: &mut Vec<Record>) -> Result<()> {
        if self.pending_cr {
            self.pending_cr = false;
            self.field.push('\r');
        }
        if self.escape_next {
            self.escape_next = false;
            self.field.push('\\');
        }
        if self.in_quotes && !self.quote_pending {
            return Err(IngestError::Parse {
                line: self.line,
                message: "quoted field is not terminated before end of input".to_string(),
            });
        }
        self.quote_pending = false;
        self.in_quotes = false;
        self.end_row(out)
    }

    fn consume(&mut self, ch: char, out: &mut Vec<Record>) -> Result<()> {
        if self.skip_lf {
            self.skip_lf = false;
            if ch == '\n' {
                return Ok(());
            }
        }
        if self.pending_cr {
            self.pending_cr = false;
            if ch == '\n' {
                return self.terminate(out);
            }
            self.field.push('\r');
        }
        if self.escape_next {
            self.escape_next = false;
            self.field.push(ch);
            return Ok(());
        }
        if ch == '\u{feff}' && self.at_stream_start() {
            return Ok(());
        }
        if self.in_quotes {
            if self.quote_pending {
                self.quote_pending = false;
                if ch == self.options.quote {
                    self.field.push(ch);
                    return Ok(());
                }
                self.in_quotes = false;
            } else {
                if self.options.escape_backslash && ch == '\\' {
                    self.escape_next = true;
                } else if ch == self.options.quote {
                    self.quote_pending = true;
                } else {
                    if ch == '\n' {
                        self.line += 1;
                    }
                    self.field.push(ch);
                }
                return Ok(());
            }
        }

        if ch == self.delimiter {
            self.end_field();
            return Ok(());
        }
        match (ch, self.options.line_terminator) {
            ('\n', LineTerminator::Auto | LineTerminator::Lf) => return self.terminate(out),
            ('\r', LineTerminator::Auto) => {
                self.skip_lf = true;
                return self.terminate(out);
            }
            ('\r', LineTerminator::Cr) => return self.terminate(out),
            ('\r', LineTerminator::CrLf) => {
                self.pending_cr = true;
                return Ok(());
            }
            _ => {}
        }
        if self.options.escape_backslash && ch == '\\' {
            self.escape_next = true;
        } else if self.options.quoting
            && ch == self.options.quote
            && !self.field_quoted
            && self.field.trim().is_empty()
        {
            self.field.clear();
            self.in_quotes = true;
            self.field_quoted = true;
        } else if self.field_quoted && self.options.trim && ch.is_whitespace() {
            // padding after a closing quote
        } else {
            self.field.push(ch);
        }
        Ok(())
    }

    fn at_stream_start(&self) -> bool {
        self.headers.is_none() && self.row.is_empty() && self.field.is_empty() && !self.in_quotes
    }

    fn end_field(&mut self) {
        let mut value = std::mem::take(&mut self.field);
        if self.options.trim && !self.field_quoted {
            let trimmed = value.trim();
            if trimmed.len() != value.len() {
                value = trimmed.to_string();
            }
        }
        self.row.push(value);
        self.field_quoted = false;
    }

    fn terminate(&mut self, out: &mut Vec<Record>) -> Result<()> {
        let result = self.end_row(out);
        self.line += 1;
        result
    }

    fn end_row(&mut self, out: &mut Vec<Record>) -> Result<()> {
        let blank = self.row.is_empty()
            && !self.field_quoted
            && (self.field.is_empty() || (self.options.trim && self.field.trim().is_empty()));
        if blank {
            self.field.clear();
            return Ok(());
        }
        self.end_field();
        let fields = std::mem::take(&mut self.row);

        let Some(headers) = &self.headers else {
            self.headers = Some(dedupe_headers(fields));
            return Ok(());
        };
        if fields.len() != headers.len() {
            return Err(IngestError::Parse {
                line: self.line,
                message: format!(
                    "expected {} column(s) but found {}",
                    headers.len(),
                    fields.len()
                ),
            });
        }
        self.rows_emitted += 1;
        out.push(Record {
            index: self.rows_emitted,
            line: self.line,
            fields,
        });
        Ok(())
    }
}

/// Suffixes repeated header names with `_1`, `_2`, ….
pub fn dedupe_headers(headers: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::with_capacity(headers.len());
    let mut result = Vec::with_capacity(headers.len());
    for header in headers {
        let mut candidate = header.clone();
        let mut counter = 1usize;
        while seen.contains(&candidate) {
            candidate = format!("{header}_{counter}");
            counter += 1;
        }
        seen.insert(candidate.clone());
        result.push(candidate);
    }
    result
}
