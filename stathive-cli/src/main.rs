/*!
Stathive CLI - inspect and age out stored call-statistics snapshots.

Works against any configured backend; the store is given as
`<kind>:<init_param>`, e.g. `file:/var/lib/stathive` or
`sql-normalized:postgres://stats@db/stats`. `stathive cleanup` is meant to be
run from cron or a systemd timer.
*/

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use stathive_core::{Backend, Snapshot, SnapshotStore, StatNode, StoreConfig};
use tabled::{Table, Tabled};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "stathive")]
#[command(about = "CLI for stored call-statistics snapshots")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Store as <kind>:<init_param>, kind one of file, sql-blob, sql-normalized
    #[arg(short, long, env = "STATHIVE_STORE")]
    store: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone, Debug)]
struct Range {
    /// Range start, RFC 3339 (default: 24 hours before --to)
    #[arg(long, value_parser = parse_time)]
    from: Option<DateTime<Utc>>,

    /// Range end, RFC 3339 (default: now)
    #[arg(long, value_parser = parse_time)]
    to: Option<DateTime<Utc>>,
}

impl Range {
    fn resolve(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let to = self.to.unwrap_or_else(Utc::now);
        let from = self.from.unwrap_or(to - Duration::hours(24));
        (from, to)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List snapshots overlapping a time range
    List {
        #[command(flatten)]
        range: Range,
        /// Only snapshots of this instance
        #[arg(short, long)]
        instance: Option<String>,
        /// Only snapshots containing a node with this exact name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Print one snapshot
    Show {
        /// Snapshot identifier
        snapshot_id: String,
        /// Print the stored JSON instead of a tree
        #[arg(long)]
        json: bool,
    },
    /// List instance tags with snapshots in a time range
    Instances {
        #[command(flatten)]
        range: Range,
    },
    /// Merge all snapshots of a time range into one tree
    Aggregate {
        #[command(flatten)]
        range: Range,
        /// Only snapshots of this instance
        #[arg(short, long)]
        instance: Option<String>,
        /// Keep only the top-level operations
        #[arg(long)]
        top_level: bool,
        /// Print JSON instead of a tree
        #[arg(long)]
        json: bool,
    },
    /// Merge every node with one operation name across a time range
    Details {
        /// Operation name, matched exactly
        name: String,
        #[command(flatten)]
        range: Range,
        /// Only snapshots of this instance
        #[arg(short, long)]
        instance: Option<String>,
        /// Print JSON instead of a tree
        #[arg(long)]
        json: bool,
    },
    /// Delete snapshots whose window ended more than DAYS days ago
    Cleanup {
        /// Retention in days
        #[arg(short, long)]
        days: u32,
        /// Only snapshots of this instance
        #[arg(short, long)]
        instance: Option<String>,
    },
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Instance")]
    instance: String,
    #[tabled(rename = "Window")]
    window: String,
    #[tabled(rename = "Nodes")]
    nodes: usize,
    #[tabled(rename = "Entry calls")]
    calls: u64,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let config = StoreConfig::from_uri(&cli.store).context("invalid --store")?;
    let store = Backend::from_config(&config)
        .with_context(|| format!("failed to open {} store", config.backend))?;

    match cli.command {
        Commands::List { range, instance, name } => {
            list_snapshots(&store, &range, instance.as_deref(), name.as_deref())?
        }
        Commands::Show { snapshot_id, json } => show_snapshot(&store, &snapshot_id, json)?,
        Commands::Instances { range } => list_instances(&store, &range)?,
        Commands::Aggregate {
            range,
            instance,
            top_level,
            json,
        } => aggregate(&store, &range, instance.as_deref(), top_level, json)?,
        Commands::Details {
            name,
            range,
            instance,
            json,
        } => details(&store, &name, &range, instance.as_deref(), json)?,
        Commands::Cleanup { days, instance } => cleanup(&store, days, instance.as_deref())?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp like 2024-05-01T12:00:00Z: {e}"))
}

fn list_snapshots(
    store: &Backend,
    range: &Range,
    instance: Option<&str>,
    name: Option<&str>,
) -> Result<(), anyhow::Error> {
    let (from, to) = range.resolve();
    info!(from = %from, to = %to, "listing snapshots");

    let mut rows = Vec::new();
    for id in store.find(from, to, name, instance)? {
        match store.load(&id) {
            Ok(snapshot) => rows.push(SnapshotRow {
                window: format_window(&snapshot),
                instance: snapshot.instance_tag().to_string(),
                nodes: snapshot.root().node_count(),
                calls: snapshot.root().children().map(|c| c.count).sum(),
                id,
            }),
            Err(e) => warn!(id = %id, error = %e, "failed to load snapshot"),
        }
    }

    if rows.is_empty() {
        println!("No snapshots found");
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

fn show_snapshot(store: &Backend, snapshot_id: &str, json: bool) -> Result<(), anyhow::Error> {
    let snapshot = store
        .load(snapshot_id)
        .with_context(|| format!("failed to load snapshot {snapshot_id}"))?;
    print_snapshot(&snapshot, json)
}

fn list_instances(store: &Backend, range: &Range) -> Result<(), anyhow::Error> {
    let (from, to) = range.resolve();
    let instances = store.instances(from, to)?;
    if instances.is_empty() {
        println!("No instances found");
    }
    for instance in instances {
        println!("{instance}");
    }
    Ok(())
}

fn aggregate(
    store: &Backend,
    range: &Range,
    instance: Option<&str>,
    top_level: bool,
    json: bool,
) -> Result<(), anyhow::Error> {
    let (from, to) = range.resolve();
    match store.load_aggregated(from, to, instance, top_level)? {
        Some(snapshot) => print_snapshot(&snapshot, json),
        None => {
            println!("No snapshots found");
            Ok(())
        }
    }
}

fn details(
    store: &Backend,
    name: &str,
    range: &Range,
    instance: Option<&str>,
    json: bool,
) -> Result<(), anyhow::Error> {
    let (from, to) = range.resolve();
    match store.load_details(name, from, to, instance)? {
        Some(node) if json => println!("{}", serde_json::to_string_pretty(&node)?),
        Some(node) => print_node(&node, 0),
        None => println!("No calls of '{name}' found"),
    }
    Ok(())
}

fn cleanup(store: &Backend, days: u32, instance: Option<&str>) -> Result<(), anyhow::Error> {
    let removed = store.cleanup(days, instance)?;
    println!("✓ Removed {removed} snapshot(s) older than {days} day(s)");
    Ok(())
}

fn print_snapshot(snapshot: &Snapshot, json: bool) -> Result<(), anyhow::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    println!("Instance: {}", display_tag(snapshot.instance_tag()));
    println!("Window:   {}", format_window(snapshot));
    println!();
    print_node(snapshot.root(), 0);
    Ok(())
}

fn print_node(node: &StatNode, depth: usize) {
    println!(
        "{:indent$}{}  count={} err={} avg={}ms max={}ms",
        "",
        node.name(),
        node.count,
        node.error_count,
        node.avg_duration_ms(),
        node.max_duration_ms,
        indent = depth * 2
    );
    for child in node.children() {
        print_node(child, depth + 1);
    }
}

fn display_tag(tag: &str) -> &str {
    if tag.is_empty() {
        "(mixed)"
    } else {
        tag
    }
}

fn format_window(snapshot: &Snapshot) -> String {
    format!(
        "{} .. {}",
        snapshot.window_start().format("%Y-%m-%d %H:%M:%S"),
        snapshot.window_end().format("%Y-%m-%d %H:%M:%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_time() {
        let ts = parse_time("2024-05-01T12:00:00+02:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn test_default_range_is_last_day() {
        let range = Range { from: None, to: None };
        let (from, to) = range.resolve();
        assert_eq!(to - from, Duration::hours(24));
    }

    #[test]
    fn test_cleanup_args() {
        let cli = Cli::try_parse_from(["stathive", "--store", "file:/tmp/s", "cleanup", "--days", "30"]).unwrap();
        assert_eq!(cli.store, "file:/tmp/s");
        assert!(matches!(cli.command, Commands::Cleanup { days: 30, instance: None }));
    }

    #[test]
    fn test_details_args() {
        let cli = Cli::try_parse_from([
            "stathive",
            "--store",
            "file:/x",
            "details",
            "GET /orders",
            "--from",
            "2024-05-01T00:00:00Z",
            "-i",
            "web-1",
        ])
        .unwrap();
        match cli.command {
            Commands::Details { name, range, instance, json } => {
                assert_eq!(name, "GET /orders");
                assert_eq!(range.from, Some(parse_time("2024-05-01T00:00:00Z").unwrap()));
                assert_eq!(instance.as_deref(), Some("web-1"));
                assert!(!json);
            }
            _ => panic!("expected details"),
        }
    }

    #[test]
    fn test_store_precedes_subcommand() {
        let cli = Cli::try_parse_from(["stathive", "--store", "file:/x", "instances"]).unwrap();
        assert_eq!(cli.store, "file:/x");
        assert!(matches!(cli.command, Commands::Instances { .. }));

        let cli = Cli::try_parse_from(["stathive", "-s", "sql-blob:sqlite:/tmp/s.db", "-v", "show", "abc", "--json"])
            .unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Show { ref snapshot_id, json: true } if snapshot_id == "abc"));
    }
}
