//! Command-line interface definitions for the newsroom crawler.
//!
//! All arguments can be provided via command-line flags or environment
//! variables.

use clap::Parser;

/// Command-line arguments for the crawler.
///
/// # Examples
///
/// ```sh
/// # Continuous crawl of every cron-enabled dataset
/// newsroom_crawler --catalog ./catalog.yaml -c ./pipeline.yaml -j ./json
///
/// # One cycle against a single dataset, ignoring its cron flag
/// newsroom_crawler --catalog ./catalog.yaml --dataset gazette --once
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Dataset catalog (YAML) the work store is seeded from
    #[arg(long, env = "CRAWLER_CATALOG")]
    pub catalog: String,

    /// Optional path to the pipeline configuration file
    #[arg(short, long, env = "CRAWLER_CONFIG")]
    pub config: Option<String>,

    /// Only process this dataset, even if it is not cron-enabled
    #[arg(short, long)]
    pub dataset: Option<String>,

    /// Output directory for exported articles
    #[arg(short, long, env = "CRAWLER_JSON_OUTPUT_DIR")]
    pub json_output_dir: Option<String>,

    /// Write per-request telemetry as JSON lines to this file instead of the log
    #[arg(long, env = "CRAWLER_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    /// Run a single cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Classify and link entities with the LLM instead of the built-in heuristics
    #[arg(long)]
    pub llm: bool,

    /// Optional path to the LLM client config.yaml (defaults to the client's config dir)
    #[arg(long, env = "CRAWLER_LLM_CONFIG")]
    pub llm_config: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from([
            "newsroom_crawler",
            "--catalog",
            "./catalog.yaml",
            "--json-output-dir",
            "./json",
            "--once",
        ]);

        assert_eq!(cli.catalog, "./catalog.yaml");
        assert_eq!(cli.json_output_dir.as_deref(), Some("./json"));
        assert!(cli.once);
        assert!(!cli.llm);
        assert_eq!(cli.dataset, None);
    }

    #[test]
    fn test_cli_short_flags() {
        let cli = Cli::parse_from([
            "newsroom_crawler",
            "--catalog",
            "c.yaml",
            "-c",
            "/tmp/pipeline.yaml",
            "-d",
            "gazette",
            "-j",
            "/tmp/json",
        ]);

        assert_eq!(cli.config.as_deref(), Some("/tmp/pipeline.yaml"));
        assert_eq!(cli.dataset.as_deref(), Some("gazette"));
        assert_eq!(cli.json_output_dir.as_deref(), Some("/tmp/json"));
    }

    #[test]
    fn test_catalog_is_required() {
        let result = Cli::try_parse_from(["newsroom_crawler", "--once"]);
        assert!(result.is_err());
    }
}
