//! Batched, rate-limited embedding of cleaned records.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use super::embeddings::{Embedder, EmbeddingError, InputType};
use crate::records::{EmbeddedRecord, Record};
use crate::storage;

/// Failure kind recorded for batches never sent after a fatal error
pub const SKIPPED_KIND: &str = "skipped";

/// Spaces the starts of consecutive calls at least `min_interval` apart.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_start: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_start: None,
        }
    }

    /// Block until the next call may start, then mark it started.
    /// Returns how long it slept.
    pub fn wait(&mut self) -> Duration {
        let mut slept = Duration::ZERO;

        if let Some(last) = self.last_start {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                slept = self.min_interval - elapsed;
                log::debug!("rate limit: sleeping {:.1}s", slept.as_secs_f64());
                std::thread::sleep(slept);
            }
        }

        self.last_start = Some(Instant::now());
        slept
    }
}

/// One batch that produced no embeddings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedBatch {
    /// 1-based batch number within the run
    pub batch: usize,
    pub ids: Vec<String>,
    pub kind: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct EmbedReport {
    pub batches: usize,
    pub calls: usize,
    pub embedded: usize,
    pub failed: Vec<FailedBatch>,
    pub total_tokens: u64,
    /// Fatal error that stopped the run early
    pub aborted: Option<String>,
}

impl EmbedReport {
    pub fn failed_ids(&self) -> Vec<String> {
        self.failed
            .iter()
            .flat_map(|batch| batch.ids.iter().cloned())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Embeds records in fixed-size batches, in input order.
///
/// A failed batch is recorded and the run moves on; a fatal error stops
/// further calls and every remaining batch is reported as skipped.
pub struct BatchEmbedder<'a> {
    embedder: &'a dyn Embedder,
    batch_size: usize,
    limiter: RateLimiter,
    show_progress: bool,
}

impl<'a> BatchEmbedder<'a> {
    pub fn new(embedder: &'a dyn Embedder, batch_size: usize, min_interval: Duration) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
            limiter: RateLimiter::new(min_interval),
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Embed `records`, handing each successful batch to `sink` before the
    /// next call. An error from `sink` aborts the run.
    pub fn run<F, E>(&mut self, records: &[Record], mut sink: F) -> Result<EmbedReport, E>
    where
        F: FnMut(&[EmbeddedRecord]) -> Result<(), E>,
    {
        let batches: Vec<&[Record]> = records.chunks(self.batch_size).collect();
        let mut report = EmbedReport {
            batches: batches.len(),
            ..Default::default()
        };

        let progress = self.progress_bar(batches.len() as u64);

        for (idx, batch) in batches.iter().enumerate() {
            let number = idx + 1;

            if let Some(reason) = &report.aborted {
                report.failed.push(FailedBatch {
                    batch: number,
                    ids: batch_ids(batch),
                    kind: SKIPPED_KIND.to_string(),
                    error: format!("not attempted: {reason}"),
                });
                progress.inc(1);
                continue;
            }

            self.limiter.wait();
            report.calls += 1;

            match self.embed_batch(batch) {
                Ok((embedded, tokens)) => {
                    sink(&embedded)?;
                    report.embedded += embedded.len();
                    match tokens {
                        Some(tokens) => {
                            report.total_tokens += tokens;
                            log::info!(
                                "batch {number}/{}: embedded {} records ({tokens} tokens)",
                                batches.len(),
                                embedded.len()
                            );
                        }
                        None => log::info!(
                            "batch {number}/{}: embedded {} records",
                            batches.len(),
                            embedded.len()
                        ),
                    }
                }
                Err(err) => {
                    log::warn!(
                        "batch {number}/{} failed ({}): {err}",
                        batches.len(),
                        err.kind()
                    );
                    if err.is_fatal() {
                        report.aborted = Some(err.to_string());
                    }
                    report.failed.push(FailedBatch {
                        batch: number,
                        ids: batch_ids(batch),
                        kind: err.kind().to_string(),
                        error: err.to_string(),
                    });
                }
            }

            progress.inc(1);
        }

        progress.finish_and_clear();

        if let Some(reason) = &report.aborted {
            log::error!("embedding stopped early: {reason}");
        }

        Ok(report)
    }

    fn embed_batch(
        &self,
        batch: &[Record],
    ) -> Result<(Vec<EmbeddedRecord>, Option<u64>), EmbeddingError> {
        let texts: Vec<String> = batch.iter().map(|r| r.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts, InputType::Document)?;

        if embeddings.vectors.len() != batch.len() {
            return Err(EmbeddingError::Malformed(format!(
                "got {} vectors for {} inputs",
                embeddings.vectors.len(),
                batch.len()
            )));
        }

        let embedded = batch
            .iter()
            .zip(embeddings.vectors)
            .map(|(record, vector)| EmbeddedRecord {
                id: record.id.clone(),
                text_hash: record.text_hash(),
                vector,
            })
            .collect();

        Ok((embedded, embeddings.total_tokens))
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let bar = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar
    }
}

fn batch_ids(batch: &[Record]) -> Vec<String> {
    batch.iter().map(|r| r.id.clone()).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed failure report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Contents of `failed_ids.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub generated_at: DateTime<Utc>,
    pub model: String,
    pub failed_ids: Vec<String>,
    pub batches: Vec<FailedBatch>,
}

impl FailureReport {
    pub fn from_run(model: &str, report: &EmbedReport) -> Self {
        Self {
            generated_at: Utc::now(),
            model: model.to_string(),
            failed_ids: report.failed_ids(),
            batches: report.failed.clone(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        let json = serde_json::to_vec_pretty(self)?;
        storage::write_atomic(path, &json)?;
        Ok(())
    }

    /// Load a previous report; `None` when there is none.
    pub fn load(path: &Path) -> Result<Option<Self>, ReportError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Remove the report after a run with no failures.
    pub fn clear(path: &Path) -> Result<(), ReportError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
