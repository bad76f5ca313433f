//! # Confsync Admin
//!
//! Operator CLI over a [`SyncContext`] built from configuration.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin confsync_admin -- latest --if-none-match "\"<tag>\""
//! cargo run --bin confsync_admin -- publish snapshot.json --delta delta.json
//! cargo run --bin confsync_admin -- since 2016-05-18T10:00:00Z
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use confsync::{
    metrics,
    notification_pipeline::LogDispatcher,
    settings::{LogFormat, LogSettings, MetricsSettings, Settings},
    snapshot_store::SnapshotRead,
    types::{DataPayload, ItemKind},
    SyncContext,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "confsync_admin")]
#[command(about = "Inspect and maintain confsync snapshots, change log and caches", version)]
struct Cli {
    /// Configuration file (defaults to ./Config.toml when present)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the latest snapshot
    Latest {
        /// Version tag(s) the client already has
        #[arg(long, value_name = "TAG")]
        if_none_match: Vec<String>,
    },

    /// Show the consolidated changes after a timestamp (RFC 3339 or epoch millis)
    Since { timestamp: String },

    /// List recent snapshot versions
    History {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Publish a full snapshot and, optionally, the diff that produced it
    Publish {
        snapshot: PathBuf,

        #[arg(long, value_name = "PATH")]
        delta: Option<PathBuf>,
    },

    /// Run the notification pipeline once
    Notify {
        #[arg(long)]
        since: String,
    },

    /// Fetch an issuer's signing keys through the cert cache
    Certs { url: String },

    /// Delete every snapshot and change entry
    ClearAll {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

fn init_logging(log: &LogSettings) {
    #[cfg(feature = "observability")]
    {
        if log.format == LogFormat::Json {
            let level = log.level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
            tracing_subscriber::fmt().json().with_max_level(level).init();
            return;
        }
    }

    if log.format == LogFormat::Json {
        eprintln!("JSON logs need the 'observability' feature; using plain logs");
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log.level.as_str())).init();
}

#[cfg(feature = "observability")]
fn init_metrics(settings: &MetricsSettings) -> Result<()> {
    if !settings.enabled {
        return Ok(());
    }
    let addr: std::net::SocketAddr = settings
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address {}", settings.listen_addr))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    metrics::describe_metrics();
    log::info!("📊 Metrics exporter listening on {}", addr);
    Ok(())
}

#[cfg(not(feature = "observability"))]
fn init_metrics(settings: &MetricsSettings) -> Result<()> {
    if settings.enabled {
        log::warn!("Metrics enabled in configuration but the 'observability' feature is off");
    }
    metrics::describe_metrics();
    Ok(())
}

/// Accepts RFC 3339 or milliseconds since the epoch.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(millis) = raw.trim().parse::<i64>() {
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .with_context(|| format!("Timestamp out of range: {}", raw));
    }
    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .with_context(|| format!("Expected RFC 3339 or epoch millis, got {}", raw))?;
    Ok(parsed.with_timezone(&Utc))
}

fn read_payload(path: &Path) -> Result<DataPayload> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    DataPayload::from_bytes(&bytes).with_context(|| format!("{} is not a dataset payload", path.display()))
}

fn print_counts(payload: &DataPayload) {
    for kind in ItemKind::ALL {
        println!("  {:<9} {}", kind.as_str(), payload.items(kind).len());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::new()?,
    };
    init_logging(&settings.log);
    init_metrics(&settings.metrics)?;

    let mut ctx = SyncContext::from_settings(&settings).await?;

    match cli.command {
        Commands::Latest { if_none_match } => {
            let tags: Vec<&str> = if_none_match.iter().map(String::as_str).collect();
            match ctx.snapshots.read_latest(&tags).await? {
                SnapshotRead::NotModified(header) => {
                    println!("{} {} ({})", "Not modified".yellow().bold(), header.tag, header.timestamp);
                }
                SnapshotRead::Fresh(snapshot) if snapshot.is_empty() => {
                    println!("{}", "No snapshot has been published yet".yellow());
                }
                SnapshotRead::Fresh(snapshot) => {
                    println!("{} {}", "ETag".green().bold(), snapshot.etag());
                    println!("{} {}", "Timestamp".green().bold(), snapshot.timestamp);
                    print_counts(&snapshot.payload);
                }
            }
        }

        Commands::Since { timestamp } => {
            let since = parse_timestamp(&timestamp)?;
            let delta = ctx.change_log.since(since).await?;
            println!(
                "{} {} entries folded, {} skipped, next cursor {}",
                "Changes".green().bold(),
                delta.entries,
                delta.skipped,
                delta.timestamp
            );
            if delta.truncated {
                println!("{}", "Entry cap reached; run again from the cursor for more".yellow());
            }
            println!("{}", serde_json::to_string_pretty(&delta.changes)?);
        }

        Commands::History { limit } => {
            let headers = ctx.snapshots.history(limit).await?;
            if headers.is_empty() {
                println!("{}", "No snapshots".yellow());
            }
            for header in headers {
                println!("{}  {}", header.timestamp.to_rfc3339().dimmed(), header.tag);
            }
        }

        Commands::Publish { snapshot, delta } => {
            let snapshot = read_payload(&snapshot)?;
            let delta = match delta {
                Some(path) => read_payload(&path)?,
                None => DataPayload::default(),
            };
            let published = ctx.publish(&snapshot, &delta).await?;
            println!(
                "{} {} at {}",
                "✅ Published".green().bold(),
                published.snapshot.tag,
                published.snapshot.timestamp
            );
            print_counts(&snapshot);
            match published.change {
                Some(ts) => println!("  change entry at {}", ts),
                None => println!("  {}", "no change entry (empty delta)".dimmed()),
            }
        }

        Commands::Notify { since } => {
            let since = parse_timestamp(&since)?;
            if ctx.pipeline.is_none() {
                println!("{}", "Notifications disabled in configuration; using the log dispatcher".yellow());
                ctx = ctx.with_dispatcher(Arc::new(LogDispatcher::new(100)));
            }
            let Some(pipeline) = ctx.pipeline.as_ref() else {
                bail!("Notification pipeline unavailable");
            };
            let report = pipeline.run_since(since).await?;
            println!(
                "{} {} of {} candidates dispatched, next cursor {}",
                "🔔".bold(),
                report.dispatched,
                report.candidates,
                report.cursor
            );
        }

        Commands::Certs { url } => {
            let keys = ctx.certs.get_keys(&url).await?;
            println!("{} {} keys", "✅".green(), keys.len());
            for key_id in keys.key_ids() {
                println!("  {}", key_id);
            }
        }

        Commands::ClearAll { yes } => {
            if !yes {
                bail!("Refusing to delete every snapshot and change entry without --yes");
            }
            let cleared = ctx.clear_all().await?;
            println!(
                "{} {} snapshots, {} change entries",
                "🗑️  Cleared".red().bold(),
                cleared.snapshots,
                cleared.changes
            );
        }
    }

    Ok(())
}
