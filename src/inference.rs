//! Online per-column type classification.
//!
//! Each [`FieldTypeInferencer`] counts the numeric, date and other values it
//! analyzes and periodically reclassifies its column. Once [`finish`] is
//! called the type is locked and never changes again; values that contradict
//! a locked type surface later as format errors during conversion.
//!
//! [`finish`]: FieldTypeInferencer::finish

use serde::{Deserialize, Serialize};

use crate::{data::parse_naive_date, model::ColumnType, numeric};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Rows buffered by the row transformer before types are locked.
    pub sample_size: usize,
    /// Reclassify after this many analyzed values.
    pub reclassify_every: u64,
    /// Fraction of analyzed values that must match for NUMBER or DATE.
    pub threshold: f64,
    /// Analyzed values after which sampling throttles to `throttle_rate`.
    pub min_samples: u64,
    pub throttle_rate: f64,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            sample_size: 100,
            reclassify_every: 100,
            threshold: 0.65,
            min_samples: 1000,
            throttle_rate: 0.1,
        }
    }
}

impl InferenceSettings {
    fn throttle_stride(&self) -> u64 {
        if self.throttle_rate <= 0.0 || self.throttle_rate >= 1.0 {
            1
        } else {
            (1.0 / self.throttle_rate).round().max(1.0) as u64
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldTypeInferencer {
    settings: InferenceSettings,
    stride: u64,
    number_of_numbers: u64,
    number_of_strings: u64,
    number_of_dates: u64,
    seen: u64,
    analyzed: u64,
    column_type: ColumnType,
    locked: bool,
}

impl FieldTypeInferencer {
    pub fn new(settings: &InferenceSettings) -> Self {
        Self {
            stride: settings.throttle_stride(),
            settings: settings.clone(),
            number_of_numbers: 0,
            number_of_strings: 0,
            number_of_dates: 0,
            seen: 0,
            analyzed: 0,
            column_type: ColumnType::Unknown,
            locked: false,
        }
    }

    /// An inferencer whose type is fixed from the start.
    pub fn locked(settings: &InferenceSettings, column_type: ColumnType) -> Self {
        let mut inferencer = Self::new(settings);
        inferencer.column_type = column_type;
        inferencer.locked = true;
        inferencer
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn analyzed(&self) -> u64 {
        self.analyzed
    }

    pub fn counts(&self) -> (u64, u64, u64) {
        (self.number_of_numbers, self.number_of_strings, self.number_of_dates)
    }

    pub fn observe(&mut self, value: &str) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return;
        }
        self.seen += 1;
        if self.locked || !self.should_analyze() {
            return;
        }
        self.analyzed += 1;
        if numeric::is_numeric(trimmed) {
            self.number_of_numbers += 1;
        } else if parse_naive_date(trimmed).is_some() {
            self.number_of_dates += 1;
        } else {
            self.number_of_strings += 1;
        }
        if self.analyzed % self.settings.reclassify_every.max(1) == 0 {
            self.column_type = self.classify();
        }
    }

    fn should_analyze(&self) -> bool {
        self.analyzed < self.settings.min_samples || self.seen % self.stride == 0
    }

    fn classify(&self) -> ColumnType {
        let total = self.number_of_numbers + self.number_of_strings + self.number_of_dates;
        if total == 0 {
            return ColumnType::Unknown;
        }
        let fraction = |count: u64| count as f64 / total as f64;
        if fraction(self.number_of_numbers) > self.settings.threshold {
            ColumnType::Number
        } else if fraction(self.number_of_dates) > self.settings.threshold {
            ColumnType::Date
        } else {
            ColumnType::String
        }
    }

    /// Locks the classification. Columns that never saw a value lock as STRING.
    pub fn finish(&mut self) -> ColumnType {
        if !self.locked {
            self.column_type = match self.classify() {
                ColumnType::Unknown => ColumnType::String,
                other => other,
            };
            self.locked = true;
        }
        self.column_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(values: &[&str]) -> FieldTypeInferencer {
        let mut inferencer = FieldTypeInferencer::new(&InferenceSettings::default());
        for value in values {
            inferencer.observe(value);
        }
        inferencer
    }

    #[test]
    fn mostly_numeric_columns_become_number() {
        let mut values = vec!["1"; 7];
        values.extend(["x", "y", "z"]);
        assert_eq!(feed(&values).finish(), ColumnType::Number);
    }

    #[test]
    fn threshold_ties_favour_string() {
        let settings = InferenceSettings {
            threshold: 0.5,
            ..InferenceSettings::default()
        };
        let mut inferencer = FieldTypeInferencer::new(&settings);
        for value in ["1", "2", "a", "b"] {
            inferencer.observe(value);
        }
        assert_eq!(inferencer.finish(), ColumnType::String);
    }

    #[test]
    fn dates_are_classified_when_not_numeric() {
        let values = ["2024-01-01", "2024-02-01", "2024/03/01", "n/a"];
        assert_eq!(feed(&values).finish(), ColumnType::Date);
    }

    #[test]
    fn empty_values_are_ignored_and_empty_columns_lock_string() {
        let mut inferencer = feed(&["", "  ", ""]);
        assert_eq!(inferencer.column_type(), ColumnType::Unknown);
        assert_eq!(inferencer.finish(), ColumnType::String);
    }

    #[test]
    fn classification_is_recomputed_every_interval() {
        let settings = InferenceSettings {
            reclassify_every: 3,
            ..InferenceSettings::default()
        };
        let mut inferencer = FieldTypeInferencer::new(&settings);
        inferencer.observe("1");
        inferencer.observe("2");
        assert_eq!(inferencer.column_type(), ColumnType::Unknown);
        inferencer.observe("3");
        assert_eq!(inferencer.column_type(), ColumnType::Number);
    }

    #[test]
    fn locked_type_is_sticky() {
        let mut inferencer = feed(&["1", "2", "3"]);
        assert_eq!(inferencer.finish(), ColumnType::Number);
        for _ in 0..50 {
            inferencer.observe("text");
        }
        assert_eq!(inferencer.finish(), ColumnType::Number);
        assert_eq!(inferencer.seen(), 53);
        assert_eq!(inferencer.analyzed(), 3);
    }

    #[test]
    fn sampling_throttles_after_minimum() {
        let settings = InferenceSettings {
            min_samples: 10,
            throttle_rate: 0.25,
            ..InferenceSettings::default()
        };
        let mut inferencer = FieldTypeInferencer::new(&settings);
        for idx in 0..50 {
            inferencer.observe(&idx.to_string());
        }
        assert_eq!(inferencer.seen(), 50);
        assert!(inferencer.analyzed() < 50);
        assert!(inferencer.analyzed() >= 10);
    }
}
