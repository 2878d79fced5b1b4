// ============================================================================
// memdb: CLI inspection tool for an agent memory directory
// ============================================================================
// Usage:
//   memdb stats                                   Show tier and index statistics
//   memdb save SENDER OWNER QUERY ANSWER          Record one dialogue turn
//   memdb recall SENDER OWNER QUERY [--max-chars] Long-term recall text
//   memdb recent OWNER                            Short-term window
//   memdb list OWNER [--page N] [--page-size N]   Page through stored memories
//   memdb clear OWNER --yes                       Forget an owner entirely
//   memdb export [--owner OWNER]                  Export records as JSON
// ============================================================================

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use memory_core::{MemoryConfig, MemoryDriver};
use std::path::PathBuf;
use tracing::info;

/// Agent memory inspection tool
#[derive(Parser)]
#[command(name = "memdb", version, about = "Inspect and manage an agent memory directory")]
struct Cli {
    /// Memory directory (default: MEMORY_DATA_DIR or ~/.memory-engine)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON config file (bare or under a "memoryStorageConfig" key)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show short-term, long-term and index statistics
    Stats,

    /// Record one dialogue turn through the driver
    Save {
        sender: String,
        owner: String,
        query: String,
        answer: String,
    },

    /// Print the long-term recall for a query
    Recall {
        sender: String,
        owner: String,
        query: String,

        /// Character budget (default: max_recall_chars from config)
        #[arg(long)]
        max_chars: Option<usize>,
    },

    /// Print the short-term window of an owner
    Recent { owner: String },

    /// Page through an owner's long-term memories (oldest first per page)
    List {
        owner: String,

        #[arg(long, default_value = "1")]
        page: usize,

        #[arg(long, default_value = "20")]
        page_size: usize,
    },

    /// Remove every memory of an owner
    Clear {
        owner: String,

        /// Required; clearing cannot be undone
        #[arg(long)]
        yes: bool,
    },

    /// Export long-term records as JSON
    Export {
        /// Only this owner's records
        #[arg(long)]
        owner: Option<String>,
    },
}

fn format_timestamp(ts: f64) -> String {
    Utc.timestamp_opt(ts as i64, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn load_config(cli: &Cli) -> Result<MemoryConfig> {
    let mut config = match &cli.config {
        Some(path) => MemoryConfig::from_json_file(path)?,
        None => MemoryConfig::default(),
    }
    .apply_env();

    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("memory_core=info".parse()?)
                .add_directive("memdb=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!("Using memory directory {}", config.data_dir.display());

    let driver = MemoryDriver::with_defaults(config)?;

    let result = match cli.command {
        Commands::Stats => cmd_stats(&driver).await,
        Commands::Save {
            sender,
            owner,
            query,
            answer,
        } => cmd_save(&driver, &sender, &owner, &query, &answer).await,
        Commands::Recall {
            sender,
            owner,
            query,
            max_chars,
        } => cmd_recall(&driver, &sender, &owner, &query, max_chars).await,
        Commands::Recent { owner } => cmd_recent(&driver, &owner),
        Commands::List {
            owner,
            page,
            page_size,
        } => cmd_list(&driver, &owner, page, page_size),
        Commands::Clear { owner, yes } => cmd_clear(&driver, &owner, yes).await,
        Commands::Export { owner } => cmd_export(&driver, owner.as_deref()),
    };

    driver.shutdown().await;
    result
}

async fn cmd_stats(driver: &MemoryDriver) -> Result<()> {
    let stats = driver.stats().await;

    println!("=== Memory Stats ===");
    println!("Directory: {}", driver.config().data_dir.display());
    println!();
    println!(
        "Short-term: {} turns across {} owners (window {})",
        stats.short_term_turns,
        stats.short_term_owners,
        driver.config().local_memory_num
    );

    match (&stats.long_term, &stats.long_term_disabled) {
        (Some(lt), _) => {
            println!("Long-term:  {} records, {} vectors", lt.records, lt.vectors);
            println!("  Index:    {}", lt.index_variant);
            println!("  Owners:   {}", lt.owners.len());
            for owner in &lt.owners {
                println!("    {}", owner);
            }
            println!(
                "  Cache:    {} records, {} queries",
                lt.cached_records, lt.cached_queries
            );
        }
        (None, Some(reason)) => println!("Long-term:  disabled ({})", reason),
        (None, None) => println!("Long-term:  unavailable"),
    }

    Ok(())
}

async fn cmd_save(driver: &MemoryDriver, sender: &str, owner: &str, query: &str, answer: &str) -> Result<()> {
    driver.save(sender, query, owner, answer).await;
    println!("Saved turn for {} / {}", owner, sender);
    Ok(())
}

async fn cmd_recall(
    driver: &MemoryDriver,
    sender: &str,
    owner: &str,
    query: &str,
    max_chars: Option<usize>,
) -> Result<()> {
    let budget = max_chars.unwrap_or(driver.config().max_recall_chars);
    let recall = driver.search_long(query, sender, owner, budget).await;

    if recall.is_empty() {
        println!("No memories recalled.");
    } else {
        print!("{}", recall);
    }
    Ok(())
}

fn cmd_recent(driver: &MemoryDriver, owner: &str) -> Result<()> {
    let turns = driver.search_short("", "", owner);

    if turns.is_empty() {
        println!("No recent turns for {}.", owner);
        return Ok(());
    }

    for (i, turn) in turns.iter().enumerate() {
        println!("[{}] {}", i + 1, turn.human);
        println!("    {}", turn.ai);
    }
    Ok(())
}

fn cmd_list(driver: &MemoryDriver, owner: &str, page: usize, page_size: usize) -> Result<()> {
    let Some(long_term) = driver.long_term() else {
        anyhow::bail!(
            "Long-term memory is disabled: {}",
            driver.long_term_disabled_reason().unwrap_or("unknown")
        );
    };

    let texts = long_term.page_by_owner(owner, page, page_size)?;
    if texts.is_empty() {
        println!("No memories on page {} for {}.", page, owner);
        return Ok(());
    }

    for text in &texts {
        println!("- {}", text);
    }
    println!("\nPage {}: {} memories", page, texts.len());
    Ok(())
}

async fn cmd_clear(driver: &MemoryDriver, owner: &str, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to clear '{}' without --yes", owner);
    }

    driver.clear(owner).await;
    println!("Cleared all memories of {}", owner);
    Ok(())
}

fn cmd_export(driver: &MemoryDriver, owner: Option<&str>) -> Result<()> {
    let Some(long_term) = driver.long_term() else {
        anyhow::bail!(
            "Long-term memory is disabled: {}",
            driver.long_term_disabled_reason().unwrap_or("unknown")
        );
    };

    let owners: Vec<String> = match owner {
        Some(owner) => vec![owner.to_string()],
        None => long_term.stats()?.owners.into_iter().collect(),
    };

    let mut records = Vec::new();
    for owner in &owners {
        for record in long_term.records_by_owner(owner)? {
            records.push(serde_json::json!({
                "id": record.id,
                "owner": record.owner,
                "sender": record.sender,
                "text": record.text,
                "importance": record.importance,
                "keywords": record.keywords,
                "created_at": format_timestamp(record.timestamp),
            }));
        }
    }

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "owners": owners,
        "records": records,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}
