use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;

use ragforge::config::{ensure_layout, Config};
use ragforge::search::{EmbeddingType, SearchOptions};
use ragforge::{Brain, Error, QuickIngestOptions};

/// ragforge — local knowledge graph and retrieval engine
#[derive(Parser)]
#[command(name = "ragforge", about, version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Brain home directory (defaults to ~/.ragforge)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the brain home layout (config.yaml, .env, docker-compose.yml)
    Init,

    /// Register a project, run an initial sync, and start watching
    Ingest(IngestArgs),

    /// Hybrid semantic + lexical search across indexed projects
    Search(SearchArgs),

    /// Show registered projects and node counts
    Status,

    /// Ingest a path and keep watching until interrupted
    Watch(WatchArgs),

    /// Delete all nodes of the project registered at a path
    Forget(ForgetArgs),

    /// Remove orphan nodes and expired quick-ingest projects
    Gc,

    /// Show the resolved configuration
    Config,
}

#[derive(Parser)]
struct IngestArgs {
    /// Project root directory
    path: PathBuf,

    /// Display name for the project
    #[arg(long)]
    name: Option<String>,

    /// Include globs (relative to the root, comma-separated ok)
    #[arg(long)]
    include: Vec<String>,

    /// Exclude globs
    #[arg(long)]
    exclude: Vec<String>,

    /// Skip starting a watcher after the initial sync
    #[arg(long)]
    no_watch: bool,

    /// Journal every node change to logs/changes.jsonl
    #[arg(long)]
    track_changes: bool,
}

#[derive(Parser)]
struct SearchArgs {
    /// Search query string
    query: String,

    /// Maximum number of results
    #[arg(short, long)]
    limit: Option<usize>,

    /// Skip results below this score
    #[arg(long)]
    min_score: Option<f64>,

    /// Facet to search: name, content, description, or all
    #[arg(long, value_name = "FACET")]
    facet: Option<String>,

    /// Lexical (BM25) search only
    #[arg(long)]
    lexical: bool,

    /// Semantic search only (no BM25 fusion)
    #[arg(long, conflicts_with = "lexical")]
    semantic_only: bool,

    /// Fuzzy edit distance for lexical terms (0-2)
    #[arg(long)]
    fuzzy: Option<u8>,

    /// Restrict results to paths matching this glob
    #[arg(long)]
    glob: Option<String>,

    /// Restrict to these project ids
    #[arg(long)]
    project: Vec<String>,

    /// Raw filter clause, e.g. "language = 'typescript' AND startLine > 10"
    #[arg(long)]
    filter: Option<String>,

    /// Flush pending edits before searching
    #[arg(long)]
    fresh: bool,
}

#[derive(Parser)]
struct WatchArgs {
    /// Project root directory
    path: PathBuf,
}

#[derive(Parser)]
struct ForgetArgs {
    /// Project root directory
    path: PathBuf,
}

fn search_options(args: &SearchArgs, config: &Config) -> Result<SearchOptions, Error> {
    let mut options = SearchOptions {
        limit: args.limit.unwrap_or(config.search_default_limit),
        min_score: args.min_score.unwrap_or(config.search_min_score),
        ..SearchOptions::default()
    };
    if let Some(facet) = &args.facet {
        options.embedding_type = facet.parse::<EmbeddingType>()?;
    }
    if args.lexical {
        options.semantic = false;
        options.hybrid = false;
    }
    if args.semantic_only {
        options.hybrid = false;
    }
    if let Some(fuzzy) = args.fuzzy {
        options.fuzzy_distance = fuzzy.min(2);
    }
    options.glob = args.glob.clone();
    options.raw_filter_clause = args.filter.clone();
    if !args.project.is_empty() {
        options.projects = Some(args.project.clone());
    }
    Ok(options)
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ragforge::logging::init(cli.verbose)?;

    match cli.command {
        Commands::Init => {
            let home = Config::resolve_home(cli.home.as_deref())?;
            ensure_layout(&home)?;
            println!("{} {}", "initialized".green().bold(), home.display());
        }
        Commands::Ingest(args) => {
            let brain = Brain::open(cli.home.as_deref()).await?;
            let spinner = indicatif::ProgressBar::new_spinner();
            spinner.set_style(
                indicatif::ProgressStyle::with_template("{spinner} {msg}")
                    .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner()),
            );
            spinner.set_message(format!("ingesting {}", args.path.display()));
            spinner.enable_steady_tick(std::time::Duration::from_millis(100));

            let report = brain
                .quick_ingest(
                    &args.path,
                    QuickIngestOptions {
                        project_name: args.name,
                        include: args.include,
                        exclude: args.exclude,
                        watch: !args.no_watch,
                        track_changes: args.track_changes,
                    },
                )
                .await?;
            spinner.finish_and_clear();

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} project {} — {} created, {} updated, {} unchanged, {} deleted",
                    "ingested".green().bold(),
                    report.project_id.cyan(),
                    report.stats.created,
                    report.stats.updated,
                    report.stats.unchanged,
                    report.stats.deleted,
                );
                println!(
                    "embedded {} facets across {} nodes ({} api calls)",
                    report.embedding.facets_embedded,
                    report.embedding.nodes_processed,
                    report.embedding.api_calls,
                );
                for error in &report.stats.errors {
                    eprintln!("{} {}: {}", "error".red(), error.path, error.message);
                }
            }
            if !args.no_watch {
                println!("watching for changes — press Ctrl+C to stop");
                tokio::signal::ctrl_c().await?;
            }
            brain.shutdown().await?;
        }
        Commands::Search(args) => {
            let brain = Brain::open(cli.home.as_deref()).await?;
            let options = search_options(&args, brain.config())?;
            let response = brain.search(&args.query, &options, args.fresh).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else if response.results.is_empty() {
                println!("{}", "no results".yellow());
            } else {
                for (idx, hit) in response.results.iter().enumerate() {
                    let name = hit
                        .properties
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("(unnamed)");
                    let location = hit.path.as_deref().unwrap_or("");
                    println!(
                        "{:>2}. {} {} {}  {}",
                        idx + 1,
                        format!("{:.3}", hit.score).bold(),
                        hit.label.blue(),
                        name.cyan(),
                        location.dimmed(),
                    );
                    if let Some(range) = &hit.matched_range {
                        println!(
                            "      lines {}-{} (chunk {}, score {:.3})",
                            range.start_line, range.end_line, range.chunk_index, range.chunk_score,
                        );
                    }
                }
                println!(
                    "{} of {} results",
                    response.results.len(),
                    response.total_count
                );
            }
            brain.shutdown().await?;
        }
        Commands::Status => {
            let brain = Brain::open(cli.home.as_deref()).await?;
            let status = brain.status().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else if status.projects.is_empty() {
                println!("{}", "no projects registered".yellow());
            } else {
                for project in &status.projects {
                    let mut flags = Vec::new();
                    if project.watching {
                        flags.push("watching");
                    }
                    if project.excluded {
                        flags.push("excluded");
                    }
                    println!(
                        "{} {} — {} nodes [{}] {}",
                        project.project_id.cyan(),
                        project.root.display(),
                        project.node_count,
                        project.project_type,
                        flags.join(", ").dimmed(),
                    );
                }
                println!("{} nodes total", status.total_nodes);
            }
            brain.shutdown().await?;
        }
        Commands::Watch(args) => {
            let brain = Brain::open(cli.home.as_deref()).await?;
            brain
                .quick_ingest(&args.path, QuickIngestOptions::default())
                .await?;
            println!(
                "{} {} — press Ctrl+C to stop",
                "watching".green().bold(),
                args.path.display()
            );
            tokio::signal::ctrl_c().await?;
            brain.shutdown().await?;
        }
        Commands::Forget(args) => {
            let brain = Brain::open(cli.home.as_deref()).await?;
            let deleted = brain.forget(&args.path).await?;
            println!(
                "{} {} ({} nodes removed)",
                "forgot".green().bold(),
                args.path.display(),
                deleted
            );
            brain.shutdown().await?;
        }
        Commands::Gc => {
            let brain = Brain::open(cli.home.as_deref()).await?;
            let report = brain.gc().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} {} orphan nodes, {} expired projects",
                    "gc".green().bold(),
                    report.orphan_nodes_deleted,
                    report.projects_removed
                );
            }
            brain.shutdown().await?;
        }
        Commands::Config => {
            let config = Config::load(cli.home.as_deref())?;
            println!("home: {}", config.home.display());
            println!(
                "embedding: {:?} model={} dims={} batch={}",
                config.embedding_provider,
                config.embedding_model,
                config.embedding_dimensions,
                config.embedding_batch_size
            );
            println!(
                "timing: watch_batch={}ms edit_debounce={}ms lock_timeout={}ms",
                config.watch_batch_ms, config.edit_debounce_ms, config.lock_timeout_ms
            );
            println!(
                "search: limit={} min_score={}",
                config.search_default_limit, config.search_min_score
            );
            println!("retention: {} days", config.retention_days);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Initialization failures (missing store, unreachable container,
        // missing credential) abort with guidance.
        if let Some(Error::Init(msg)) = e.downcast_ref::<Error>() {
            eprintln!("{} {}", "initialization failed:".red().bold(), msg);
            eprintln!("run `ragforge init` and check ~/.ragforge/.env");
        } else {
            eprintln!("{} {e}", "error:".red().bold());
        }
        process::exit(1);
    }
}
