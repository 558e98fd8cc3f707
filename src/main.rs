use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scrapeflow_adapters::{HtmlParser, RoutingFetcher, TokenBucket};
use scrapeflow_core::config::AppConfig;
use scrapeflow_graph::graph::state::StateContainer;
use scrapeflow_graph::{pipelines, BatchCoordinator, Collaborators, Executor};

#[derive(Parser)]
#[command(name = "scrapeflow", version, about = "Graph-driven LLM scraping pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "scrapeflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration
    Config,
    /// Build and validate a prebuilt pipeline, then print it
    Graph {
        /// Describe images before answering
        #[arg(long)]
        images: bool,
        /// Merge answers across sources
        #[arg(long)]
        multi: bool,
    },
    /// Fetch and parse sources, print the batch result as JSON
    Parse {
        /// URLs or local file paths
        #[arg(required = true)]
        sources: Vec<String>,
    },
}

fn load_config(path: &PathBuf) -> anyhow::Result<AppConfig> {
    if path.exists() {
        Ok(AppConfig::load(path)?)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(AppConfig::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("scrapeflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Graph { images, multi } => {
            let graph = match (images, multi) {
                (true, _) => pipelines::omni_scraper(&config)?,
                (false, true) => pipelines::multi_scraper(&config)?,
                (false, false) => pipelines::smart_scraper(&config)?,
            };
            info!(nodes = graph.nodes().len(), edges = graph.edges().len(), "Graph is valid");
            println!("{}", toml::to_string_pretty(&graph.to_definition())?);
        }
        Commands::Parse { sources } => {
            let mut collaborators = Collaborators::new()
                .with_fetcher(Arc::new(RoutingFetcher::new()?))
                .with_parser(Arc::new(HtmlParser));
            if let Some(ref limiter) = config.rate_limiter {
                collaborators = collaborators.with_limiter(Arc::new(TokenBucket::from_config(limiter)));
            }

            let graph = pipelines::fetch_parse(&config)?;
            let executor = Executor::new(Arc::new(config), Arc::new(collaborators));
            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling executions");
                    ctrl_c.cancel();
                }
            });

            let result = BatchCoordinator::new(executor)
                .run(&graph, &sources, &StateContainer::new(), &cancel)
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.failed() > 0 {
                warn!(failed = result.failed(), "Some sources failed");
            }
        }
    }

    Ok(())
}
