//! Column name normalization for query-engine identifiers.
//!
//! Header text is converted to lower snake case restricted to ASCII letters,
//! digits and `_`. Headers with nothing usable left are named
//! `invalid_column_<n>`, numbered from 1 within each header row so the same
//! header always normalizes to the same names.

use std::collections::HashSet;

use heck::ToSnakeCase;
use log::debug;

#[derive(Debug, Default)]
pub struct ColumnNameNormalizer {
    invalid_columns: usize,
}

impl ColumnNameNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalid_columns(&self) -> usize {
        self.invalid_columns
    }

    pub fn normalize(&mut self, name: &str) -> String {
        let snake = name.to_snake_case();
        let mut cleaned = String::with_capacity(snake.len());
        for ch in snake.chars() {
            if ch.is_ascii_alphanumeric() {
                cleaned.push(ch.to_ascii_lowercase());
            } else if !cleaned.ends_with('_') {
                cleaned.push('_');
            }
        }
        let cleaned = cleaned.trim_matches('_');
        if cleaned.is_empty() {
            self.invalid_columns += 1;
            let generated = format!("invalid_column_{}", self.invalid_columns);
            debug!("Header '{name}' has no usable characters; naming it '{generated}'");
            return generated;
        }
        if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
            format!("c_{cleaned}")
        } else {
            cleaned.to_string()
        }
    }

    /// Normalizes a full header row, suffixing collisions with `_1`, `_2`, ….
    pub fn normalize_headers(&mut self, headers: &[String]) -> Vec<String> {
        self.invalid_columns = 0;
        let mut seen = HashSet::with_capacity(headers.len());
        headers
            .iter()
            .map(|header| {
                let base = self.normalize(header);
                let mut candidate = base.clone();
                let mut counter = 1usize;
                while seen.contains(&candidate) {
                    candidate = format!("{base}_{counter}");
                    counter += 1;
                }
                seen.insert(candidate.clone());
                candidate
            })
            .collect()
    }
}
