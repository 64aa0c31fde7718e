use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kdash_cache::MemoryCache;
use kdash_core::{CacheKey, ConnectionStatus, ResourceKind, WireMessage};
use kdash_reconcile::{rule_for, CacheReconciler, Reconciler, ReconcilerConfig, Rule};
use kdash_stream::{EventStreamClient, StreamConfig};
use serde_json::Value;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kdashctl", version, about = "kdash real-time sync CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to an update stream and print cache changes as they happen
    Watch {
        /// WebSocket endpoint, e.g. "ws://localhost:8000/ws/updates"
        #[arg(long = "endpoint", env = "KDASH_ENDPOINT")]
        endpoint: String,
        /// Only reconcile these kinds (repeatable; default: all)
        #[arg(long = "kind")]
        kinds: Vec<ResourceKind>,
        /// Delay between reconnect attempts (overrides KDASH_RECONNECT_MS)
        #[arg(long = "reconnect-ms")]
        reconnect_ms: Option<u64>,
        /// Retries before giving up (overrides KDASH_MAX_RECONNECTS)
        #[arg(long = "max-reconnects")]
        max_reconnects: Option<u32>,
        /// Heartbeat interval (overrides KDASH_HEARTBEAT_SECS)
        #[arg(long = "heartbeat-secs")]
        heartbeat_secs: Option<u64>,
    },
    /// Apply a JSON-lines file of wire messages to an empty cache and print it
    Replay {
        file: PathBuf,
    },
    /// List known resource kinds with scope and reconciliation rule
    Kinds,
}

fn init_tracing() {
    let env = std::env::var("KDASH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KDASH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KDASH_METRICS_ADDR; expected host:port");
        }
    }
}

fn rule_name(rule: Rule) -> &'static str {
    match rule {
        Rule::Merge => "merge",
        Rule::Invalidate => "invalidate",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { endpoint, kinds, reconnect_ms, max_reconnects, heartbeat_secs } => {
            let mut cfg = StreamConfig::from_env(endpoint);
            if let Some(ms) = reconnect_ms {
                cfg = cfg.with_reconnect_interval(Duration::from_millis(ms));
            }
            if let Some(n) = max_reconnects {
                cfg = cfg.with_max_reconnect_attempts(n);
            }
            if let Some(secs) = heartbeat_secs {
                cfg = cfg.with_heartbeat_interval(Duration::from_secs(secs.max(1)));
            }
            info!(endpoint = %cfg.endpoint, kinds = ?kinds, "watch invoked");
            watch(cfg, kinds, cli.output).await?;
        }
        Commands::Replay { file } => {
            info!(file = %file.display(), "replay invoked");
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let cache = MemoryCache::new();
            let engine = Reconciler::new(Arc::new(cache.clone()), ReconcilerConfig::all("replay"));
            let (mut applied, mut skipped) = (0usize, 0usize);
            for (lineno, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WireMessage>(line) {
                    Ok(msg) => match engine.handle(&msg) {
                        Some(_) => applied += 1,
                        None => skipped += 1,
                    },
                    Err(e) => {
                        warn!(line = lineno + 1, error = %e, "replay: malformed line skipped");
                        skipped += 1;
                    }
                }
            }
            info!(applied, skipped, "replay finished");
            print_cache(&cache.snapshot(), cli.output)?;
        }
        Commands::Kinds => match cli.output {
            Output::Human => {
                for kind in ResourceKind::ALL {
                    let scope = if kind.is_namespaced() { "namespaced" } else { "cluster" };
                    println!("{} • {} • {}", kind, scope, rule_name(rule_for(kind)));
                }
            }
            Output::Json => {
                #[derive(serde::Serialize)]
                struct Row { kind: ResourceKind, namespaced: bool, rule: &'static str }
                let rows: Vec<Row> = ResourceKind::ALL
                    .into_iter()
                    .map(|kind| Row { kind, namespaced: kind.is_namespaced(), rule: rule_name(rule_for(kind)) })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
        },
    }

    Ok(())
}

async fn watch(cfg: StreamConfig, kinds: Vec<ResourceKind>, output: Output) -> Result<()> {
    let cache = MemoryCache::new();
    let client = EventStreamClient::connect_ws(cfg);
    let config = if kinds.is_empty() {
        ReconcilerConfig::all("kdashctl")
    } else {
        ReconcilerConfig::for_kinds("kdashctl", kinds)
    };
    let mut reconciler = CacheReconciler::attach(&client, Arc::new(cache.clone()), config);

    let mut status_rx = client.watch_status();
    let mut epoch_rx = cache.subscribe_epoch();
    let mut last: HashMap<CacheKey, Value> = HashMap::new();
    let mut result = Ok(());

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *status_rx.borrow_and_update();
                let cause = match status {
                    ConnectionStatus::Error | ConnectionStatus::Disconnected => client.last_error().map(|e| e.to_string()),
                    _ => None,
                };
                match (output, &cause) {
                    (Output::Human, Some(cause)) => println!("# {} ({})", status, cause),
                    (Output::Human, None) => println!("# {}", status),
                    (Output::Json, _) => println!("{}", serde_json::json!({ "status": status.to_string(), "error": cause })),
                }
                if status == ConnectionStatus::Disposed {
                    result = Err(anyhow::anyhow!(
                        "gave up on {} after {} reconnect attempts",
                        client.endpoint(),
                        client.reconnect_attempts()
                    ));
                    break;
                }
            }
            changed = epoch_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                epoch_rx.borrow_and_update();
                print_changes(&mut last, cache.snapshot(), output);
            }
        }
    }

    reconciler.dispose();
    client.shutdown().await;
    warn!("watch loop ended");
    result
}

/// Print keys whose value differs from `last`, then remember the new snapshot.
fn print_changes(last: &mut HashMap<CacheKey, Value>, snapshot: Vec<(CacheKey, Value)>, output: Output) {
    let mut next: HashMap<CacheKey, Value> = HashMap::with_capacity(snapshot.len());
    for (key, value) in snapshot {
        let op = match last.remove(&key) {
            None => Some("+"),
            Some(prev) if prev != value => Some("~"),
            Some(_) => None,
        };
        if let Some(op) = op {
            match output {
                Output::Human => println!("{} {} {}", op, key, summary(&value)),
                Output::Json => println!("{}", serde_json::json!({ "op": op, "key": key.to_string(), "value": value })),
            }
        }
        next.insert(key, value);
    }
    let mut gone: Vec<&CacheKey> = last.keys().collect();
    gone.sort();
    for key in gone {
        match output {
            Output::Human => println!("- {}", key),
            Output::Json => println!("{}", serde_json::json!({ "op": "-", "key": key.to_string() })),
        }
    }
    *last = next;
}

fn print_cache(snapshot: &[(CacheKey, Value)], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for (key, value) in snapshot {
                println!("{}", key);
                match value.as_array() {
                    Some(items) => {
                        for item in items {
                            println!("  {}", entry_label(item));
                        }
                    }
                    None => println!("  {}", value),
                }
            }
        }
        Output::Json => {
            let map: serde_json::Map<String, Value> =
                snapshot.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
            println!("{}", serde_json::to_string_pretty(&map)?);
        }
    }
    Ok(())
}

fn summary(value: &Value) -> String {
    match value {
        Value::Array(items) => format!("({} entries)", items.len()),
        Value::Object(obj) => format!("({} fields)", obj.len()),
        other => other.to_string(),
    }
}

fn entry_label(entry: &Value) -> String {
    let name = entry.get("name").and_then(Value::as_str).unwrap_or("?");
    match entry.get("namespace").and_then(Value::as_str) {
        Some(ns) => format!("{}/{} {}", ns, name, entry),
        None => format!("{} {}", name, entry),
    }
}
