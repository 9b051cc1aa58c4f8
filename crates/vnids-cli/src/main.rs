#![deny(unsafe_code)]

//! vnids CLI: run the supervisor daemon or control a running one.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vnids_config::AppConfig;
use vnids_core::ipc::{EventsData, GetEventsParams, GetHistoryParams, IpcClient, StatsData, StatusData};

/// vnids: network intrusion detection supervisor.
#[derive(Parser)]
#[command(name = "vnids", version = vnids_core::build_info::VERSION, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "vnids.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Control socket to use instead of the configured one.
    #[arg(long, global = true)]
    socket: Option<String>,

    /// Print raw JSON instead of a summary.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground.
    Start,

    /// Ask a running daemon to shut down.
    Stop,

    /// Show daemon and engine status.
    Status,

    /// Show ingest and engine counters.
    Stats,

    /// List queued events.
    Events {
        /// Maximum number of events.
        #[arg(long)]
        limit: Option<i64>,

        /// Only events at or after this time (RFC 3339 or Unix seconds).
        #[arg(long)]
        since: Option<String>,

        /// Only events with severity at most this (1 = critical).
        #[arg(long)]
        severity_max: Option<i64>,
    },

    /// Show stored events from the history database, newest first.
    History {
        /// Maximum number of events.
        #[arg(long)]
        limit: Option<i64>,

        /// Only events at or after this time (RFC 3339 or Unix seconds).
        #[arg(long)]
        since: Option<String>,

        /// Only events with severity at most this (1 = critical).
        #[arg(long)]
        severity_max: Option<i64>,

        /// Only events of this type (alert, flow, anomaly, ...).
        #[arg(long = "type")]
        event_type: Option<String>,
    },

    /// Ask the engine to reload its rules.
    ReloadRules {
        /// New rules directory; defaults to the current one.
        path: Option<String>,
    },

    /// Restart the engine, clearing a failed state.
    RestartEngine,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mut config, loaded) = load_config(&cli.config).await?;
    config.apply_env_overrides();
    if let Some(socket) = &cli.socket {
        config.ipc.socket_path = socket.clone();
    }
    config.validate().context("invalid configuration")?;

    let level = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
    if !loaded {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Start => cmd_start(config).await,
        Commands::Config { show } => cmd_config(&cli.config, &config, show),
        command => {
            let mut client = IpcClient::from_config(&config.ipc);
            let output = run_client_command(&mut client, command, cli.json).await?;
            print!("{output}");
            Ok(())
        }
    }
}

async fn cmd_start(config: AppConfig) -> Result<()> {
    info!("Starting vnids daemon");
    let daemon = vnids_core::Daemon::new(config);
    daemon.run().await?;
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("failed to render config")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load the config file, or defaults when it does not exist. The flag
/// reports whether a file was read.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

async fn run_client_command(client: &mut IpcClient, command: Commands, json: bool) -> Result<String> {
    let output = match command {
        Commands::Status => {
            let status = client.status().await?;
            if json { to_json(&status)? } else { render_status(&status) }
        }
        Commands::Stats => {
            let stats = client.stats().await?;
            if json { to_json(&stats)? } else { render_stats(&stats) }
        }
        Commands::Events {
            limit,
            since,
            severity_max,
        } => {
            let events = client
                .events(GetEventsParams {
                    limit,
                    since: since.map(since_value),
                    severity_max,
                })
                .await?;
            if json { to_json(&events)? } else { render_events(&events) }
        }
        Commands::History {
            limit,
            since,
            severity_max,
            event_type,
        } => {
            let events = client
                .history(GetHistoryParams {
                    limit,
                    since: since.map(since_value),
                    severity_max,
                    event_type,
                })
                .await?;
            if json { to_json(&events)? } else { render_events(&events) }
        }
        Commands::ReloadRules { path } => {
            let reload = client.reload_rules(path.as_deref()).await?;
            if json {
                to_json(&reload)?
            } else if reload.restarted {
                format!("Engine restarting with rules from {}\n", reload.rules_path)
            } else if reload.applied {
                format!("Engine reloading rules from {}\n", reload.rules_path)
            } else {
                format!("Engine not running; {} applies at next start\n", reload.rules_path)
            }
        }
        Commands::RestartEngine => {
            let restart = client.restart_engine().await?;
            if json { to_json(&restart)? } else { format!("Engine {}\n", restart.state) }
        }
        Commands::Stop => {
            let ack = client.shutdown().await?;
            if json { to_json(&ack)? } else { "Shutdown initiated\n".to_string() }
        }
        Commands::Start | Commands::Config { .. } => anyhow::bail!("not a client command"),
    };
    Ok(output)
}

/// Unix seconds go over the wire as a number, anything else as a string.
fn since_value(since: String) -> serde_json::Value {
    match since.parse::<i64>() {
        Ok(secs) => serde_json::Value::from(secs),
        Err(_) => serde_json::Value::from(since),
    }
}

fn render_events(events: &EventsData) -> String {
    let mut out = String::new();
    for event in &events.events {
        let severity = event.severity().map_or("-".to_string(), |s| s.to_string());
        let sid = event.alert.as_ref().map_or(0, |a| a.signature_id);
        let _ = writeln!(
            out,
            "{}  {:<7} sev={} flow={} sid={}",
            event.timestamp.to_rfc3339(),
            event.event_type,
            severity,
            event.flow_id.unwrap_or(0),
            sid
        );
    }
    let _ = writeln!(out, "{} event(s)", events.count);
    out
}

fn to_json(value: &impl Serialize) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)? + "\n")
}

fn render_status(status: &StatusData) -> String {
    let engine = &status.engine;
    let mut out = String::new();
    let _ = writeln!(out, "vnids {} (pid {}, up {}s)", status.version, status.pid, status.uptime_seconds);
    let _ = writeln!(
        out,
        "engine: {} pid={} up={}s restarts={} (total {})",
        engine.state,
        engine.pid.map_or("-".to_string(), |p| p.to_string()),
        engine.uptime_seconds,
        engine.restart_count,
        engine.total_restarts
    );
    if let Some(exit) = engine.last_exit {
        let _ = writeln!(out, "last exit: {exit}");
    }
    let _ = writeln!(out, "rules: {}", engine.rules_dir);
    let _ = writeln!(out, "queue: {} queued, {} dropped", status.queue_len, status.dropped_events);
    out
}

fn render_stats(stats: &StatsData) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "lines={} events={} parse_errors={} alerts={} flows={} anomalies={}",
        stats.lines_read,
        stats.events_processed,
        stats.parse_errors,
        stats.alerts_total,
        stats.flows_total,
        stats.anomalies_total
    );
    let _ = writeln!(
        out,
        "queue={}/{} dropped={} engine={} restarts={}",
        stats.queue_len, stats.queue_capacity, stats.events_dropped, stats.state, stats.restart_count
    );
    if let Some(engine) = &stats.engine {
        let _ = writeln!(
            out,
            "capture: packets={} drops={} alerts={} flows_active={}",
            engine.kernel_packets, engine.kernel_drops, engine.detect_alerts, engine.flows_active
        );
    }
    if let Some(history) = &stats.history {
        let _ = writeln!(
            out,
            "history: stored={} inserted={} pruned={} write_errors={}",
            history.stored, history.inserted, history.pruned, history.write_errors
        );
    }
    out
}
