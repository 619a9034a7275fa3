use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Semantic search over NIH Common Data Elements", long_about = None)]
pub struct Args {
    /// Data directory (defaults to $CDE_BASE_PATH or ~/.local/share/cde-search)
    #[clap(long, global = true)]
    pub base_path: Option<PathBuf>,

    /// Debug logging
    #[clap(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Clean the raw CSV export into cleaned.jsonl
    Prepare {
        /// CSV file (overrides input.csv_path)
        #[clap(short, long)]
        input: Option<PathBuf>,
    },

    /// Embed cleaned records into embeddings.jsonl
    Embed {
        /// Only retry ids listed in failed_ids.json
        #[clap(long, default_value = "false")]
        only_failed: bool,

        /// Discard existing embeddings and start over
        #[clap(long, default_value = "false", conflicts_with = "only_failed")]
        fresh: bool,
    },

    /// Build the search index from embeddings.jsonl
    Index {},

    /// Run prepare, embed and index in sequence
    Build {
        /// CSV file (overrides input.csv_path)
        #[clap(short, long)]
        input: Option<PathBuf>,
    },

    /// Search the index from the command line
    Search {
        /// Natural-language description of the data element
        query: String,

        /// Number of results
        #[clap(short)]
        k: Option<usize>,

        /// Print results as JSON
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Start the web UI and JSON API
    Serve {
        /// Listen address (overrides web.listen)
        #[clap(short, long)]
        listen: Option<String>,
    },

    /// Run test queries and write a plain-text report
    Evaluate {
        /// File with one query per line
        #[clap(short, long)]
        queries: Option<PathBuf>,

        /// Results per query
        #[clap(short)]
        k: Option<usize>,

        /// Report path
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {},
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search() {
        let args = Args::parse_from(["cde", "search", "heart rate", "-k", "3", "--json"]);
        match args.command {
            Command::Search { query, k, json } => {
                assert_eq!(query, "heart rate");
                assert_eq!(k, Some(3));
                assert!(json);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_global_base_path() {
        let args = Args::parse_from(["cde", "index", "--base-path", "/tmp/cde"]);
        assert_eq!(args.base_path, Some(PathBuf::from("/tmp/cde")));
        assert!(matches!(args.command, Command::Index {}));
    }

    #[test]
    fn test_embed_flags_conflict() {
        assert!(Args::try_parse_from(["cde", "embed", "--fresh", "--only-failed"]).is_err());
    }
}
