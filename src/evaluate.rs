//! Runs a fixed set of test queries and writes a plain-text report for
//! manual relevance review.

use std::fmt::Write as _;
use std::path::Path;

use crate::semantic::{QueryResult, QueryService, RateLimiter};
use crate::storage;

#[derive(Debug)]
pub struct QueryOutcome {
    pub query: String,
    pub result: Result<Vec<QueryResult>, String>,
}

/// Run every query through `service`, spacing the embedding calls with
/// `limiter`. A failing query is recorded and the run moves on.
pub fn run_queries(
    service: &QueryService,
    queries: &[String],
    k: usize,
    limiter: &mut RateLimiter,
) -> Vec<QueryOutcome> {
    queries
        .iter()
        .enumerate()
        .map(|(idx, query)| {
            log::info!("evaluating query {}/{}: {query:?}", idx + 1, queries.len());
            limiter.wait();

            let result = service.search(query, k).map_err(|err| {
                log::warn!("query {query:?} failed: {err}");
                err.to_string()
            });

            QueryOutcome {
                query: query.clone(),
                result,
            }
        })
        .collect()
}

pub fn render_report(outcomes: &[QueryOutcome], k: usize) -> String {
    let mut out = String::new();
    out.push_str("NIH CDE Semantic Search Test Results\n");
    out.push_str("====================================\n");
    let _ = writeln!(out, "(Retrieving Top {k} results per query)\n");

    for (idx, outcome) in outcomes.iter().enumerate() {
        let _ = writeln!(out, "--- Query {}: {} ---", idx + 1, outcome.query);

        match &outcome.result {
            Ok(results) if results.is_empty() => {
                out.push_str("  *Search returned no results.*\n\n");
            }
            Ok(results) => {
                let _ = writeln!(out, "Found {} results:", results.len());
                for result in results {
                    let _ = writeln!(
                        out,
                        "  {}. ID: {} (Score: {:.4})",
                        result.rank, result.id, result.score
                    );
                    let _ = writeln!(out, "     Text: {}", result.text);
                }
                out.push('\n');
            }
            Err(err) => {
                let _ = writeln!(out, "  *Query failed: {err}*\n");
            }
        }
    }

    out
}

pub fn write_report(path: &Path, outcomes: &[QueryOutcome], k: usize) -> std::io::Result<()> {
    storage::write_atomic(path, render_report(outcomes, k).as_bytes())
}

/// Read one query per line; blank lines and `#` comments are skipped.
pub fn load_queries(path: &Path) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
