//! Pipeline stages behind the CLI subcommands.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::cleaner::{CleanReport, Cleaner};
use crate::config::Config;
use crate::evaluate;
use crate::paths::DataPaths;
use crate::records::{self, EmbeddedRecord, EmbeddingsMeta, JsonLines};
use crate::semantic::{
    create_embedder, BatchEmbedder, EmbedReport, Embedder, FailureReport, IndexBuilder,
    IndexManifest, IndexStorage, QueryResult, QueryService, RateLimiter,
};
use crate::web;

/// Longest text shown in a CLI results row
const MAX_TABLE_TEXT: usize = 80;

#[derive(Debug, Clone, Copy, Default)]
pub struct EmbedOptions {
    pub only_failed: bool,
    pub fresh: bool,
    pub show_progress: bool,
}

/// CSV → `cleaned.jsonl`.
pub fn prepare(config: &Config, paths: &DataPaths, input: Option<PathBuf>) -> Result<CleanReport> {
    let csv_path = input
        .or_else(|| config.input.csv_path.clone())
        .context("no input CSV: pass --input or set input.csv_path in config.yaml")?;

    log::info!("cleaning {}", csv_path.display());

    let (records, report) = Cleaner::from_config(&config.input)
        .clean_file(&csv_path)
        .with_context(|| format!("failed to clean {}", csv_path.display()))?;

    if records.is_empty() {
        bail!("no usable records in {}", csv_path.display());
    }

    records::write_jsonl(&paths.cleaned_path, &records)
        .with_context(|| format!("failed to write {}", paths.cleaned_path.display()))?;

    log::info!(
        "wrote {} records to {} ({} dropped)",
        report.kept,
        paths.cleaned_path.display(),
        report.dropped()
    );

    Ok(report)
}

/// `cleaned.jsonl` → `embeddings.jsonl`, skipping records whose current text
/// was embedded by an earlier run. Embeddings of removed records or changed
/// texts are dropped. Failed ids are written to `failed_ids.json`.
pub fn embed(
    config: &Config,
    paths: &DataPaths,
    embedder: &dyn Embedder,
    opts: EmbedOptions,
) -> Result<EmbedReport> {
    let records = records::read_records(&paths.cleaned_path).with_context(|| {
        format!(
            "failed to read {}, run `cde prepare` first",
            paths.cleaned_path.display()
        )
    })?;

    if opts.fresh {
        log::info!("discarding previous embeddings");
        if paths.embeddings_path.exists() {
            std::fs::remove_file(&paths.embeddings_path)?;
        }
        EmbeddingsMeta::clear(&paths.embeddings_meta_path)?;
        FailureReport::clear(&paths.failed_path)?;
    }

    repair_embeddings(paths)?;
    claim_embeddings(paths, embedder.model_name())?;

    let current: HashMap<String, String> = records
        .iter()
        .map(|r| (r.id.clone(), r.text_hash()))
        .collect();

    let mut done = records::embedded_hashes(&paths.embeddings_path)?;
    let before = done.len();
    done.retain(|id, hash| current.get(id) == Some(&*hash));

    if done.len() < before {
        let mut seen = HashSet::new();
        let dropped = records::retain_embedded(&paths.embeddings_path, |r| {
            current.get(&r.id) == Some(&r.text_hash) && seen.insert(r.id.clone())
        })?;
        log::info!("dropped {dropped} embeddings of removed or changed records");
    }

    let wanted: Option<HashSet<String>> = if opts.only_failed {
        match FailureReport::load(&paths.failed_path)? {
            Some(report) => Some(report.failed_ids.into_iter().collect()),
            None => {
                log::info!("no failed ids recorded, nothing to retry");
                return Ok(EmbedReport::default());
            }
        }
    } else {
        None
    };

    let pending: Vec<_> = records
        .into_iter()
        .filter(|r| !done.contains_key(&r.id))
        .filter(|r| wanted.as_ref().map_or(true, |ids| ids.contains(&r.id)))
        .collect();

    if pending.is_empty() {
        log::info!("all records already embedded");
        FailureReport::clear(&paths.failed_path)?;
        return Ok(EmbedReport::default());
    }

    log::info!(
        "embedding {} records with {} ({} already done, batch size {}, {:.0}s between calls)",
        pending.len(),
        embedder.model_name(),
        done.len(),
        config.embedding.batch_size,
        config.embedding.min_interval().as_secs_f64()
    );

    let report = BatchEmbedder::new(
        embedder,
        config.embedding.batch_size,
        config.embedding.min_interval(),
    )
    .with_progress(opts.show_progress)
    .run(&pending, |batch| {
        records::append_embedded(&paths.embeddings_path, batch)
    })
    .with_context(|| format!("failed to write {}", paths.embeddings_path.display()))?;

    if report.is_complete() {
        FailureReport::clear(&paths.failed_path)?;
    } else {
        FailureReport::from_run(embedder.model_name(), &report).save(&paths.failed_path)?;
        log::warn!(
            "{} ids failed to embed, see {}",
            report.failed_ids().len(),
            paths.failed_path.display()
        );
    }

    log::info!(
        "embedded {} records in {} of {} batches ({} tokens)",
        report.embedded,
        report.calls,
        report.batches,
        report.total_tokens
    );

    Ok(report)
}

/// Cut a partial line left by an interrupted append.
fn repair_embeddings(paths: &DataPaths) -> Result<()> {
    let removed = records::discard_torn_tail(&paths.embeddings_path)
        .with_context(|| format!("failed to repair {}", paths.embeddings_path.display()))?;
    if removed > 0 {
        log::warn!(
            "discarded {removed} bytes of an interrupted write at the end of {}",
            paths.embeddings_path.display()
        );
    }
    Ok(())
}

/// Record `model` as the producer of `embeddings.jsonl`, refusing when the
/// file already holds vectors from another model.
fn claim_embeddings(paths: &DataPaths, model: &str) -> Result<()> {
    let has_embeddings = paths.embeddings_path.exists();

    match EmbeddingsMeta::load(&paths.embeddings_meta_path)? {
        Some(meta) if meta.model == model => return Ok(()),
        Some(meta) if has_embeddings => bail!(
            "existing embeddings were made with {}, configured model is {model}; re-run with --fresh",
            meta.model
        ),
        None if has_embeddings => bail!(
            "{} has no recorded model; re-run with --fresh",
            paths.embeddings_path.display()
        ),
        _ => {}
    }

    EmbeddingsMeta::new(model).save(&paths.embeddings_meta_path)?;
    Ok(())
}

/// `embeddings.jsonl` → `index/`. Only embeddings of the current cleaned
/// records with unchanged text are indexed.
pub fn index(config: &Config, paths: &DataPaths) -> Result<IndexManifest> {
    repair_embeddings(paths)?;

    let embeddings = JsonLines::<EmbeddedRecord>::open(&paths.embeddings_path).with_context(|| {
        format!(
            "failed to open {}, run `cde embed` first",
            paths.embeddings_path.display()
        )
    })?;

    let meta = EmbeddingsMeta::load(&paths.embeddings_meta_path)?.with_context(|| {
        format!(
            "no model recorded for {}, run `cde embed --fresh`",
            paths.embeddings_path.display()
        )
    })?;
    if meta.model != config.embedding.model {
        bail!(
            "embeddings were made with {}, configured model is {}; run `cde embed --fresh` to re-embed",
            meta.model,
            config.embedding.model
        );
    }

    let current: HashMap<String, String> = records::read_records(&paths.cleaned_path)
        .with_context(|| {
            format!(
                "failed to read {}, run `cde prepare` first",
                paths.cleaned_path.display()
            )
        })?
        .into_iter()
        .map(|r| {
            let hash = r.text_hash();
            (r.id, hash)
        })
        .collect();

    let mut builder = IndexBuilder::new();
    let mut removed = 0;
    let mut stale = 0;
    for record in embeddings {
        let record = record?;
        match current.get(&record.id) {
            None => removed += 1,
            Some(hash) if *hash != record.text_hash => stale += 1,
            Some(_) => builder.push(record)?,
        }
    }

    if removed > 0 || stale > 0 {
        log::warn!(
            "skipped {removed} embeddings of removed records and {stale} of changed texts, run `cde embed` to refresh"
        );
    }
    if builder.duplicates() > 0 {
        log::warn!(
            "{} duplicate ids in {} ignored",
            builder.duplicates(),
            paths.embeddings_path.display()
        );
    }

    let index = builder.finish()?;

    let missing = current.len().saturating_sub(index.len());
    if missing > 0 {
        log::warn!("{missing} cleaned records have no embedding and are not indexed");
    }

    let manifest = IndexStorage::new(paths.index_dir.clone()).save(&index, &meta.model)?;

    log::info!(
        "indexed {} vectors ({} dimensions) in {}",
        manifest.count,
        manifest.dimensions,
        paths.index_dir.display()
    );

    Ok(manifest)
}

/// Run all three build stages. Stops before indexing when any id failed to
/// embed.
pub fn build(
    config: &Config,
    paths: &DataPaths,
    embedder: &dyn Embedder,
    input: Option<PathBuf>,
    show_progress: bool,
) -> Result<IndexManifest> {
    prepare(config, paths, input)?;

    let report = embed(
        config,
        paths,
        embedder,
        EmbedOptions {
            show_progress,
            ..Default::default()
        },
    )?;
    ensure_complete(&report, paths)?;

    index(config, paths)
}

fn ensure_complete(report: &EmbedReport, paths: &DataPaths) -> Result<()> {
    if let Some(reason) = &report.aborted {
        bail!(
            "embedding stopped: {reason}; {} ids written to {}",
            report.failed_ids().len(),
            paths.failed_path.display()
        );
    }
    if !report.is_complete() {
        bail!(
            "{} ids failed to embed; re-run `cde embed --only-failed`",
            report.failed_ids().len()
        );
    }
    Ok(())
}

fn open_embedder(config: &Config, paths: &DataPaths) -> Result<Box<dyn Embedder>> {
    create_embedder(&config.embedding, &paths.base_path).context("failed to set up embedding model")
}

fn open_service(config: &Config, paths: &DataPaths) -> Result<QueryService> {
    let embedder = open_embedder(config, paths)?;
    QueryService::open(paths, embedder, config.search.max_k).context("failed to load search index")
}

fn print_results(results: &[QueryResult]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }

    println!("{:>4}  {:>7}  {:<16}  TEXT", "RANK", "SCORE", "ID");
    for result in results {
        println!(
            "{:>4}  {:>7.4}  {:<16}  {}",
            result.rank,
            result.score,
            result.id,
            truncate(&result.text, MAX_TABLE_TEXT)
        );
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Dispatch a parsed command.
pub fn run(command: crate::cli::Command, config: Config, paths: DataPaths) -> Result<()> {
    use crate::cli::Command;

    match command {
        Command::Prepare { input } => {
            let report = prepare(&config, &paths, input)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Command::Embed { only_failed, fresh } => {
            let embedder = open_embedder(&config, &paths)?;
            let report = embed(
                &config,
                &paths,
                embedder.as_ref(),
                EmbedOptions {
                    only_failed,
                    fresh,
                    show_progress: true,
                },
            )?;
            ensure_complete(&report, &paths)
        }

        Command::Index {} => {
            index(&config, &paths)?;
            Ok(())
        }

        Command::Build { input } => {
            let embedder = open_embedder(&config, &paths)?;
            build(&config, &paths, embedder.as_ref(), input, true)?;
            Ok(())
        }

        Command::Search { query, k, json } => {
            let service = open_service(&config, &paths)?;
            let results = service.search(&query, k.unwrap_or(config.search.default_k))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
            Ok(())
        }

        Command::Serve { listen } => {
            let service = open_service(&config, &paths)?;
            let listen = listen.unwrap_or_else(|| config.web.listen.clone());
            web::start_daemon(service, &config.search, &listen)
        }

        Command::Evaluate { queries, k, output } => {
            let queries = match queries {
                Some(path) => evaluate::load_queries(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => config.evaluation.queries.clone(),
            };
            if queries.is_empty() {
                bail!("no evaluation queries");
            }

            let k = k.unwrap_or(config.evaluation.k);
            let output = output.unwrap_or_else(|| config.evaluation.output.clone());

            let service = open_service(&config, &paths)?;
            let mut limiter = RateLimiter::new(config.embedding.min_interval());
            let outcomes = evaluate::run_queries(&service, &queries, k, &mut limiter);

            evaluate::write_report(&output, &outcomes, k)
                .with_context(|| format!("failed to write {}", output.display()))?;

            let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
            log::info!(
                "{} queries evaluated ({failed} failed), report saved to {}",
                outcomes.len(),
                output.display()
            );
            Ok(())
        }

        Command::Config {} => {
            print!("{}", serde_yml::to_string(&config)?);
            Ok(())
        }
    }
}
