//! Command line front end for CodeChat.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use codechat_config::Config;
use codechat_core::{QueryEngine, QueryRequest, QueryResponse};
use codechat_index::{
    analyze, GraphSnapshot, GraphStore, InMemoryGraphStore, QueryAnalysis, RetrievalOutcome,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "codechat")]
#[command(author, version, about = "Ask grounded questions about a code knowledge graph", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(clap::Args, Debug)]
struct GraphArgs {
    /// Knowledge-graph snapshot (JSON)
    #[arg(long)]
    graph: PathBuf,

    /// Restrict results to one repository
    #[arg(long)]
    repo: Option<String>,

    /// Number of results (defaults to engine.default_top_k)
    #[arg(short = 'k', long)]
    top_k: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer a question about the indexed code
    Ask {
        query: String,
        #[command(flatten)]
        graph: GraphArgs,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show ranked sources without calling the language model
    Retrieve {
        query: String,
        #[command(flatten)]
        graph: GraphArgs,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show how a question is classified
    Analyze {
        query: String,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List repositories in a snapshot
    Repos {
        /// Knowledge-graph snapshot (JSON)
        #[arg(long)]
        graph: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    debug!(config = ?cli.config, "Configuration loaded");

    match cli.command {
        Commands::Ask {
            query,
            graph,
            format,
        } => cmd_ask(&config, &query, &graph, format).await,
        Commands::Retrieve {
            query,
            graph,
            format,
        } => cmd_retrieve(&config, &query, &graph, format).await,
        Commands::Analyze { query, format } => cmd_analyze(&query, format),
        Commands::Repos { graph } => cmd_repos(&graph).await,
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

/// Logs go to stderr so `--format json` output stays machine readable.
fn init_tracing(verbose: bool) {
    let default = if verbose { "codechat=debug" } else { "codechat=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn load_store(path: &Path, dimensions: usize) -> Result<Arc<dyn GraphStore>> {
    let snapshot = GraphSnapshot::load(path)
        .with_context(|| format!("Failed to load graph snapshot {}", path.display()))?;
    info!(
        repositories = snapshot.repositories().len(),
        path = %path.display(),
        "Graph snapshot loaded"
    );
    Ok(Arc::new(
        InMemoryGraphStore::new(snapshot).with_dimensions(dimensions),
    ))
}

fn request(config: &Config, query: &str, args: &GraphArgs) -> QueryRequest {
    let mut request =
        QueryRequest::new(query).with_top_k(args.top_k.unwrap_or(config.engine.default_top_k));
    if let Some(repo) = &args.repo {
        request = request.with_repository(repo.clone());
    }
    request
}

async fn cmd_ask(config: &Config, query: &str, args: &GraphArgs, format: OutputFormat) -> Result<()> {
    let store = load_store(&args.graph, config.embeddings.dimensions)?;
    let engine = QueryEngine::from_config(config, store)?;
    let request = request(config, query, args);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling query");
            on_interrupt.cancel();
        }
    });

    let response = engine
        .answer_with_cancel(&request, &cancel)
        .await
        .with_context(|| "Query failed")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Text => print!("{}", render_answer(&response)),
    }
    Ok(())
}

#[derive(Serialize)]
struct RankedSource<'a> {
    rank: usize,
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    repository: &'a str,
    lineno: u32,
    score: f32,
    source: codechat_index::StrategyKind,
}

#[derive(Serialize)]
struct RetrieveOutput<'a> {
    analysis: &'a QueryAnalysis,
    degraded: &'a [codechat_index::StrategyKind],
    results: Vec<RankedSource<'a>>,
}

async fn cmd_retrieve(
    config: &Config,
    query: &str,
    args: &GraphArgs,
    format: OutputFormat,
) -> Result<()> {
    let store = load_store(&args.graph, config.embeddings.dimensions)?;
    let engine = QueryEngine::retrieval_from_config(config, store)?;
    let (analysis, outcome) = engine
        .retrieve(&request(config, query, args))
        .await
        .context("Retrieval failed")?;

    match format {
        OutputFormat::Json => {
            let output = RetrieveOutput {
                analysis: &analysis,
                degraded: &outcome.degraded,
                results: ranked_sources(&outcome),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => print!("{}", render_ranked(&outcome)),
    }
    Ok(())
}

fn cmd_analyze(query: &str, format: OutputFormat) -> Result<()> {
    let analysis = analyze(query);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&analysis)?),
        OutputFormat::Text => print!("{}", render_analysis(&analysis)),
    }
    Ok(())
}

async fn cmd_repos(graph: &Path) -> Result<()> {
    let snapshot = GraphSnapshot::load(graph)
        .with_context(|| format!("Failed to load graph snapshot {}", graph.display()))?;
    let store = InMemoryGraphStore::new(snapshot);
    let repos = store.repositories().await?;
    if repos.is_empty() {
        println!("No repositories in snapshot.");
    }
    for repo in repos {
        println!(
            "{}: {} files, {} classes, {} functions",
            repo.name, repo.files, repo.classes, repo.functions
        );
    }
    Ok(())
}

fn ranked_sources(outcome: &RetrievalOutcome) -> Vec<RankedSource<'_>> {
    outcome
        .results
        .iter()
        .enumerate()
        .map(|(i, r)| RankedSource {
            rank: i + 1,
            name: &r.node.name,
            kind: r.node.kind.label(),
            repository: &r.node.repository,
            lineno: r.node.lineno,
            score: r.score,
            source: r.source,
        })
        .collect()
}

fn render_answer(response: &QueryResponse) -> String {
    let mut out = format!("{}\n", response.answer);
    if !response.sources.is_empty() {
        out.push_str("\nSources:\n");
        for (i, source) in response.sources.iter().enumerate() {
            out.push_str(&format!(
                "  {}. [{}] {} ({}:{}) score {:.3}\n",
                i + 1,
                source.kind,
                source.name,
                source.repository,
                source.lineno,
                source.score
            ));
        }
    }
    let meta = &response.metadata;
    if !meta.degraded_strategies.is_empty() {
        out.push_str(&format!(
            "\nNote: degraded retrieval ({:?})\n",
            meta.degraded_strategies
        ));
    }
    out
}

fn render_ranked(outcome: &RetrievalOutcome) -> String {
    if outcome.results.is_empty() {
        return "No relevant code found.\n".to_string();
    }
    let mut out = String::new();
    for source in ranked_sources(outcome) {
        out.push_str(&format!(
            "{:>2}. {:.3}  [{}] {} ({}:{}) via {:?}\n",
            source.rank,
            source.score,
            source.kind,
            source.name,
            source.repository,
            source.lineno,
            source.source
        ));
    }
    if !outcome.degraded.is_empty() {
        out.push_str(&format!("degraded: {:?}\n", outcome.degraded));
    }
    out
}

fn render_analysis(analysis: &QueryAnalysis) -> String {
    let keywords: Vec<&str> = analysis.keywords.iter().map(String::as_str).collect();
    format!(
        "type: {}\nkeywords: {}\nmulti-part: {}\n",
        analysis.query_type,
        keywords.join(", "),
        analysis.is_multi_part
    )
}
