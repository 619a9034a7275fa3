//! CSV → [`Record`] cleaning.
//!
//! Text cleanup steps:
//! 1. Strip HTML tags
//! 2. Collapse whitespace runs to a single space
//! 3. Trim
//!
//! Rows with empty text, unparsable rows and repeated ids are dropped and
//! counted. A missing required column aborts the whole run.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::InputConfig;
use crate::records::Record;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum CleanError {
    #[error("required column '{column}' not found in CSV header (available: {available:?})")]
    Schema {
        column: String,
        available: Vec<String>,
    },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Row accounting for a cleaning run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub rows_read: usize,
    pub kept: usize,
    pub dropped_empty: usize,
    pub dropped_malformed: usize,
    pub dropped_duplicate: usize,
}

impl CleanReport {
    pub fn dropped(&self) -> usize {
        self.dropped_empty + self.dropped_malformed + self.dropped_duplicate
    }
}

/// Remove HTML tags and normalize whitespace.
pub fn clean_text(raw: &str) -> String {
    let without_tags = HTML_TAG.replace_all(raw, "");
    WHITESPACE.replace_all(&without_tags, " ").trim().to_string()
}

pub struct Cleaner {
    id_column: Option<String>,
    text_column: String,
}

impl Cleaner {
    /// `id_column: None` uses the 0-based data row number as the id.
    pub fn new(id_column: Option<String>, text_column: impl Into<String>) -> Self {
        Self {
            id_column,
            text_column: text_column.into(),
        }
    }

    pub fn from_config(config: &InputConfig) -> Self {
        Self::new(config.id_column.clone(), config.text_column.clone())
    }

    pub fn clean_file(&self, path: &Path) -> Result<(Vec<Record>, CleanReport), CleanError> {
        let file = std::fs::File::open(path)?;
        self.clean_reader(file)
    }

    pub fn clean_reader<R: Read>(&self, reader: R) -> Result<(Vec<Record>, CleanReport), CleanError> {
        let now = Instant::now();
        let mut csv_reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);

        let headers: Vec<String> = csv_reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();

        let text_idx = Self::column_index(&headers, &self.text_column)?;
        let id_idx = match &self.id_column {
            Some(column) => Some(Self::column_index(&headers, column)?),
            None => None,
        };

        let mut report = CleanReport::default();
        let mut seen = HashSet::new();
        let mut records = vec![];

        for (row, result) in csv_reader.records().enumerate() {
            report.rows_read += 1;

            let row_record = match result {
                Ok(record) => record,
                Err(err) if err.is_io_error() => return Err(err.into()),
                Err(err) => {
                    log::debug!("skipping malformed row {row}: {err}");
                    report.dropped_malformed += 1;
                    continue;
                }
            };

            let id = match id_idx {
                Some(idx) => match row_record.get(idx).map(str::trim) {
                    Some(id) if !id.is_empty() => id.to_string(),
                    _ => {
                        report.dropped_malformed += 1;
                        continue;
                    }
                },
                None => row.to_string(),
            };

            let text = match row_record.get(text_idx) {
                Some(raw) => clean_text(raw),
                None => {
                    report.dropped_malformed += 1;
                    continue;
                }
            };

            if text.is_empty() {
                report.dropped_empty += 1;
                continue;
            }

            if !seen.insert(id.clone()) {
                report.dropped_duplicate += 1;
                continue;
            }

            records.push(Record { id, text });
        }

        report.kept = records.len();

        if report.dropped() > 0 {
            log::warn!(
                "dropped {} rows (empty: {}, malformed: {}, duplicate id: {})",
                report.dropped(),
                report.dropped_empty,
                report.dropped_malformed,
                report.dropped_duplicate
            );
        }

        log::debug!(
            "took {}ms to clean {} rows",
            now.elapsed().as_micros() as f64 / 1000.0,
            report.rows_read
        );

        Ok((records, report))
    }

    fn column_index(headers: &[String], column: &str) -> Result<usize, CleanError> {
        headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| CleanError::Schema {
                column: column.to_string(),
                available: headers.to_vec(),
            })
    }
}
