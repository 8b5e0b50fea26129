//! PCE Mirror CLI - Command line interface for the local PCE mirror.
//!
//! This tool synchronizes reference entities from a PCE into a local
//! database and runs asynchronous traffic queries against it.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pcemirror_app::{data_dir, ExportFormat, Mirror, MirrorConfig, SyncMode, SyncReport};
use pcemirror_common::{
    AsyncOperation, EntityKind, OperationId, OperationStatus, TrafficFilter, TrafficQuery,
    DEFAULT_MAX_RESULTS,
};

#[derive(Parser)]
#[command(name = "pcemirror")]
#[command(about = "PCE Mirror - Local mirror of PCE policy objects and traffic")]
#[command(version)]
struct Cli {
    /// Configuration file (default: pcemirror/config.json in the data directory).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Synchronize entities from the PCE.
    Sync {
        /// Upsert only, never prune.
        #[arg(long)]
        selective: bool,

        /// Entity types to synchronize (default: all).
        types: Vec<String>,
    },

    /// Check connectivity and credentials.
    Check,

    /// Show record counts.
    Stats,

    /// Traffic queries.
    Query {
        #[command(subcommand)]
        command: QueryCommands,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum QueryCommands {
    /// Submit a traffic query.
    Submit {
        /// Query name.
        #[arg(short, long, default_value = "pcemirror")]
        name: String,

        /// First day of the window (YYYY-MM-DD).
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last day of the window (YYYY-MM-DD, default: today).
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Window length in days when --start is not given.
        #[arg(long, default_value_t = 7)]
        days: i64,

        /// Maximum number of result rows.
        #[arg(short, long, default_value_t = DEFAULT_MAX_RESULTS)]
        max_results: u32,

        /// Wait for completion and fetch the results.
        #[arg(short, long)]
        wait: bool,

        /// Run a deep rule analysis before fetching the results.
        #[arg(long, requires = "wait")]
        rules: bool,
    },

    /// Show one operation.
    Status {
        /// Operation id.
        id: String,
    },

    /// List operations.
    List {
        /// Only operations in this status.
        #[arg(short, long)]
        status: Option<OperationStatus>,
    },

    /// Wait for an operation to finish.
    Wait {
        /// Operation id.
        id: String,

        /// Run a deep rule analysis before fetching the results.
        #[arg(long)]
        rules: bool,
    },

    /// Cancel a pending or running operation.
    Cancel {
        /// Operation id.
        id: String,
    },

    /// Print result rows of a completed operation.
    Results {
        /// Operation id.
        id: String,

        /// Number of rows to print.
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Export result rows to a file.
    Export {
        /// Operation id.
        id: String,

        /// Output format: "csv" or "json".
        #[arg(short, long, default_value = "csv")]
        format: ExportFormat,

        /// Destination file (default: export directory).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete finished operations older than the given age.
    Purge {
        /// Age in days.
        #[arg(short, long, default_value_t = 30)]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir().join("config.json"));

    match cli.command {
        Commands::Init { force } => cmd_init(&config_path, force),

        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "pcemirror", &mut std::io::stdout());
            Ok(())
        }

        Commands::Sync { selective, types } => {
            let mirror = open_mirror(&config_path)?;
            cmd_sync(&mirror, selective, &types).await
        }

        Commands::Check => {
            let mirror = open_mirror(&config_path)?;
            mirror
                .check_connection()
                .await
                .context("Connection check failed")?;
            println!("Connection OK");
            Ok(())
        }

        Commands::Stats => cmd_stats(&open_mirror(&config_path)?),

        Commands::Query { command } => {
            let rules = matches!(
                command,
                QueryCommands::Submit { rules: true, .. } | QueryCommands::Wait { rules: true, .. }
            );
            let mirror = open_mirror_with(&config_path, |config| {
                if rules {
                    config.poll.deep_rule_analysis = true;
                }
            })?;
            cmd_query(&mirror, command).await
        }
    }
}

fn open_mirror(config_path: &Path) -> Result<Mirror> {
    open_mirror_with(config_path, |_| {})
}

/// Open the mirror after applying command-line overrides to the loaded
/// configuration.
fn open_mirror_with(config_path: &Path, adjust: impl FnOnce(&mut MirrorConfig)) -> Result<Mirror> {
    let mut config = MirrorConfig::load(config_path).with_context(|| {
        format!(
            "Failed to load configuration from {} (run `pcemirror init` to create one)",
            config_path.display()
        )
    })?;
    adjust(&mut config);
    Mirror::open(&config).context("Failed to open mirror")
}

fn parse_id(id: &str) -> Result<OperationId> {
    OperationId::new(id).context("Invalid operation id")
}

/// Write a default configuration file.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    let config = MirrorConfig::default();
    config
        .save(path)
        .context("Failed to write configuration")?;

    println!("Configuration written to {}", path.display());
    println!("  Database: {}", config.database_path.display());
    println!("Edit the pce section before running `pcemirror check`.");
    Ok(())
}

/// Synchronize entity types.
async fn cmd_sync(mirror: &Mirror, selective: bool, types: &[String]) -> Result<()> {
    let kinds = types
        .iter()
        .map(|t| t.parse::<EntityKind>())
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid entity type")?;
    let mode = if selective {
        SyncMode::Selective
    } else {
        SyncMode::Full
    };

    if kinds.is_empty() {
        info!("Synchronizing all entity types ({})", mode);
    } else {
        info!("Synchronizing {} entity types ({})", kinds.len(), mode);
    }

    let report = mirror
        .synchronize(&kinds, mode)
        .await
        .context("Synchronization failed")?;
    print_report(&report);

    let failed = report.failures().count();
    if failed > 0 {
        anyhow::bail!("{} entity types failed to synchronize", failed);
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!("Sync ({}) finished in {:.1?}:", report.mode, report.duration);
    for entry in &report.types {
        match &entry.error {
            Some(error) => println!(
                "  {:<13} FAILED after {} pages: {}{}",
                entry.kind,
                entry.pages,
                error,
                if error.transient { " (retry later)" } else { "" }
            ),
            None => println!(
                "  {:<13} {} fetched, {} new, {} updated, {} unchanged, {}",
                entry.kind,
                entry.fetched,
                entry.inserted,
                entry.updated,
                entry.unchanged,
                entry
                    .pruned
                    .map(|n| format!("{n} pruned"))
                    .unwrap_or_else(|| "no pruning".to_string())
            ),
        }
    }
}

/// Show record counts.
fn cmd_stats(mirror: &Mirror) -> Result<()> {
    let stats = mirror.stats().context("Failed to read store")?;

    println!("Entities:");
    for (kind, count) in &stats.entities {
        println!("  {:<13} {}", kind, count);
    }
    println!("Operations: {} ({} active)", stats.operations, stats.active_operations);
    println!("Flows: {}", stats.flows);
    Ok(())
}

async fn cmd_query(mirror: &Mirror, command: QueryCommands) -> Result<()> {
    match command {
        QueryCommands::Submit {
            name,
            start,
            end,
            days,
            max_results,
            wait,
            rules: _,
        } => {
            let query = build_query(name, start, end, days, max_results);
            let id = mirror
                .submit_query(&query)
                .await
                .context("Failed to submit query")?;
            println!("Submitted operation {}", id);

            if wait {
                let operation = mirror.poll(&id).await.context("Failed while waiting")?;
                print_operation(&operation);
            }
            Ok(())
        }

        QueryCommands::Status { id } => {
            let operation = mirror
                .get_operation_status(&parse_id(&id)?)
                .context("Failed to read operation")?;
            print_operation(&operation);
            Ok(())
        }

        QueryCommands::List { status } => {
            let operations = mirror
                .list_operations(status)
                .context("Failed to list operations")?;
            if operations.is_empty() {
                println!("No operations.");
            }
            for operation in operations {
                println!(
                    "{}  {:<10} {}  polls={}",
                    operation.id,
                    operation.status,
                    operation.submitted_at.format("%Y-%m-%d %H:%M:%S"),
                    operation.poll_attempts
                );
            }
            Ok(())
        }

        QueryCommands::Wait { id, rules: _ } => {
            let operation = mirror
                .poll(&parse_id(&id)?)
                .await
                .context("Failed while waiting")?;
            print_operation(&operation);
            Ok(())
        }

        QueryCommands::Cancel { id } => {
            let id = parse_id(&id)?;
            if mirror
                .cancel_operation(&id)
                .await
                .context("Failed to cancel operation")?
            {
                println!("Operation {} cancelled", id);
            } else {
                println!("Operation {} had already finished", id);
            }
            Ok(())
        }

        QueryCommands::Results { id, limit } => {
            let flows = mirror
                .fetch_results(&parse_id(&id)?)
                .await
                .context("Failed to fetch results")?;
            println!("{} rows", flows.len());
            for flow in flows.iter().take(limit) {
                println!("{}", serde_json::to_string(flow)?);
            }
            Ok(())
        }

        QueryCommands::Export { id, format, output } => {
            let (path, rows) = mirror
                .export_results(&parse_id(&id)?, format, output.as_deref())
                .context("Failed to export results")?;
            println!("Exported {} rows to {}", rows, path.display());
            Ok(())
        }

        QueryCommands::Purge { days } => {
            let purged = mirror
                .purge_operations(days)
                .context("Failed to purge operations")?;
            println!("Purged {} operations", purged);
            Ok(())
        }
    }
}

fn build_query(
    name: String,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    days: i64,
    max_results: u32,
) -> TrafficQuery {
    let end = end.unwrap_or_else(|| chrono::Utc::now().date_naive());
    let start = start.unwrap_or(end - chrono::Duration::days(days));
    TrafficQuery::new(name, start, end, max_results).with_filter(TrafficFilter::default())
}

fn print_operation(operation: &AsyncOperation) {
    println!("Operation {}:", operation.id);
    println!("  Status: {}", operation.status);
    println!("  Job: {}", operation.job_handle);
    println!("  Submitted: {}", operation.submitted_at);
    println!("  Polls: {}", operation.poll_attempts);
    if let Some(finished) = operation.finished_at {
        println!("  Finished: {}", finished);
    }
    if let Some(detail) = &operation.error_detail {
        println!("  Detail: {}", detail);
    }
    if operation.results_fetched_at.is_some() {
        println!("  Results: stored");
    }
}
