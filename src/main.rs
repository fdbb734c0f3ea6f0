use std::path::PathBuf;

use chrono::{Local, TimeZone};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

use watchtrail::error::Result;
use watchtrail::models::{ItemRecord, Settings};
use watchtrail::transfer::{self, ImportMode};
use watchtrail::{AppError, Config, Engine};

enum Command {
    Export(PathBuf),
    Import { path: PathBuf, mode: ImportMode },
    Stats,
    List,
    Search(String),
    Cleanup,
    Sync,
}

struct Args {
    command: Command,
    debug: bool,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let debug = args.iter().any(|a| a == "--debug");
    let replace = args.iter().any(|a| a == "--replace");
    let rest: Vec<&String> = args
        .iter()
        .skip(1)
        .filter(|a| *a != "--debug" && *a != "--replace")
        .collect();

    let value = |flag: &str| -> Result<String> {
        rest.get(1)
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::Config(format!("{flag} needs an argument")))
    };

    let command = match rest.first().map(|s| s.as_str()) {
        Some("--export") => Command::Export(PathBuf::from(value("--export")?)),
        Some("--import") => Command::Import {
            path: PathBuf::from(value("--import")?),
            mode: if replace {
                ImportMode::Replace
            } else {
                ImportMode::Merge
            },
        },
        Some("--stats") => Command::Stats,
        Some("--search") => Command::Search(value("--search")?),
        Some("--cleanup") => Command::Cleanup,
        Some("--sync") => Command::Sync,
        Some("--list") | None => Command::List,
        Some(other) => return Err(AppError::Config(format!("unknown argument {other}"))),
    };

    Ok(Args { command, debug })
}

fn log_filter(debug: bool) -> EnvFilter {
    // Only show warnings and errors unless debugging
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    EnvFilter::from_default_env().add_directive(level.into())
}

/// The `--debug` flag or the stored `debug` setting turns on debug logs.
fn wants_debug(args: &Args, settings: &Settings) -> bool {
    args.debug || settings.debug
}

fn print_items(items: &[ItemRecord]) {
    for item in items {
        let when = Local
            .timestamp_millis_opt(item.last_touched_at)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let progress = item
            .watched_fraction()
            .map(|f| format!("{:>3.0}%", f * 100.0))
            .unwrap_or_else(|| "   ?".to_string());
        println!("{when}  {progress}  {}  {}", item.id, item.title);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;

    // Settings live in storage, so the filter may be raised after opening
    let (filter, filter_handle) = reload::Layer::new(log_filter(args.debug));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load()?;
    let engine = Engine::open(&config).await?;

    let settings = engine.storage.get_settings().await?;
    if wants_debug(&args, &settings) && !args.debug {
        if let Err(e) = filter_handle.reload(log_filter(true)) {
            tracing::warn!("Could not raise log level: {}", e);
        }
    }

    match args.command {
        Command::Export(path) => {
            let file = transfer::export_to_path(&engine.storage, &engine.stats, &path).await?;
            println!(
                "Exported {} items and {} collections to {:?}",
                file.metadata.item_count, file.metadata.collection_count, path
            );
        }
        Command::Import { path, mode } => {
            let report = transfer::import_from_path(&engine.storage, &path, mode).await?;
            println!(
                "Imported {} items and {} collections ({} skipped as deleted)",
                report.items, report.collections, report.suppressed
            );
        }
        Command::Stats => {
            let stats = engine.stats.get_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::List => {
            let items = engine.storage.get_all_items().await?;
            let page = engine.storage.get_settings().await?.page_size as usize;
            print_items(&items[..items.len().min(page.max(1))]);
            if items.len() > page {
                println!("... {} more", items.len() - page);
            }
        }
        Command::Search(query) => {
            print_items(&engine.storage.search_items(&query).await?);
        }
        Command::Cleanup => {
            let report = engine.run_maintenance().await?;
            println!(
                "Purged {} expired tombstones, archived {} records",
                report.tombstones.total(),
                report.archived
            );
        }
        Command::Sync => match &engine.sync {
            Some(sync) => match sync.full_sync().await? {
                Some(report) => println!(
                    "Synced: {} pulled, {} pushed, {} removed, {} too large{}",
                    report.pulled,
                    report.pushed,
                    report.removed,
                    report.oversize,
                    if report.replaced { " (local history replaced)" } else { "" }
                ),
                None => println!("A sync is already running"),
            },
            None => {
                eprintln!("Sync is not configured; set [sync] remote_dir in {:?}", Config::config_path());
            }
        },
    }

    engine.shutdown().await;
    Ok(())
}
