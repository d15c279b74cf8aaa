//! RIP Route Monitor Daemon
//!
//! Main entry point for the ripmond daemon.
//! Listens for RIP responses on the multicast group and keeps the routing
//! trie current; display queries are summarized whenever the trie changes.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CM-6: Configuration Settings - File plus command line overrides
//! - SI-4: System Monitoring - Continuous route monitoring

use clap::Parser;
use sonic_ripmond::{
    DEFAULT_CONFIG_PATH, DisplayQuery, MetricsCollector, Result, RipReceiver, RipmonConfig,
    RipmonError, RouteView, RoutingTrie, run_purge_loop, start_metrics_server, watch_displays,
};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// SONiC RIP route monitor
#[derive(Parser, Debug)]
#[command(name = "ripmond")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// UDP port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Local interface address for the multicast membership
    #[arg(long)]
    interface: Option<Ipv4Addr>,

    /// Serve Prometheus metrics on this loopback port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Regions to watch, as ADDRESS MASK LABEL triples
    #[arg(value_name = "ADDRESS MASK LABEL")]
    display: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // NIST: AU-3, AU-12 - Audit logging setup
    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("ripmond: {}", e);
        return ExitCode::FAILURE;
    }

    info!("ripmond: Starting RIP route monitor");

    match run_daemon(args).await {
        Ok(()) => {
            info!("ripmond: Daemon exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "ripmond: Daemon exiting with error");
            ExitCode::FAILURE
        }
    }
}

/// Initialize structured logging
///
/// `RUST_LOG` takes precedence over `--log-level`.
fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| RipmonError::Config(format!("Failed to set logger: {}", e)))?;

    Ok(())
}

/// Load the configuration file and apply command line overrides
fn build_config(args: &Args) -> Result<RipmonConfig> {
    let mut config = RipmonConfig::load_or_default(&args.config)?;

    if let Some(port) = args.port {
        config.receiver.port = port;
    }
    if let Some(interface) = args.interface {
        config.receiver.interface = interface;
    }
    if let Some(port) = args.metrics_port {
        config.metrics.enabled = true;
        config.metrics.port = port;
    }

    let queries = parse_display_args(&args.display)?;
    if !queries.is_empty() {
        config.display = queries;
    }

    config.validate()?;
    Ok(config)
}

fn parse_display_args(values: &[String]) -> Result<Vec<DisplayQuery>> {
    if values.len() % 3 != 0 {
        return Err(RipmonError::Config(format!(
            "display regions are ADDRESS MASK LABEL triples, got {} values",
            values.len()
        )));
    }
    values
        .chunks_exact(3)
        .map(|triple| {
            DisplayQuery::from_triple(&triple[0], &triple[1], &triple[2])
                .map_err(RipmonError::from)
        })
        .collect()
}

/// Main daemon body
///
/// Runs until Ctrl-C/SIGTERM or until the receiver fails.
///
/// # NIST Controls
/// - SI-4: System Monitoring - Receive, purge and watch tasks
async fn run_daemon(args: Args) -> Result<()> {
    let config = build_config(&args)?;
    info!(
        group = %config.receiver.group,
        port = config.receiver.port,
        interface = %config.receiver.interface,
        route_timeout_secs = config.timers.route_timeout_secs,
        staleness_window_secs = config.timers.staleness_window_secs,
        displays = config.display.len(),
        "ripmond: Configuration loaded"
    );

    let trie = Arc::new(RoutingTrie::new());
    let metrics = MetricsCollector::new()?;
    let cancel = CancellationToken::new();

    setup_signal_handlers(Arc::clone(&trie), cancel.clone())?;

    let metrics_handle = config.metrics.enabled.then(|| {
        let collector = metrics.clone();
        let port = config.metrics.port;
        let token = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(collector, port, token).await {
                error!(error = %e, "ripmond: Metrics server failed");
            }
        })
    });

    let purge_handle = tokio::spawn(run_purge_loop(
        Arc::clone(&trie),
        config.purge_interval(),
        config.route_timeout(),
        metrics.clone(),
        cancel.clone(),
    ));

    let watch_handle = tokio::spawn(watch_displays(
        RouteView::new(Arc::clone(&trie)),
        config.display.clone(),
        config.poll_interval(),
        config.staleness_window(),
        cancel.clone(),
    ));

    let receiver = RipReceiver::new(Arc::clone(&trie), config.receiver.clone(), metrics);
    let receiver_token = cancel.clone();
    let receiver_handle = tokio::spawn(async move { receiver.run(receiver_token).await });

    let result = receiver_handle
        .await
        .map_err(|e| RipmonError::Io(std::io::Error::other(e)))
        .and_then(|result| result);

    // the receiver only returns early on failure; take the rest down with it
    cancel.cancel();

    if let Err(e) = purge_handle.await {
        warn!(error = %e, "ripmond: Purge task ended abnormally");
    }
    if let Err(e) = watch_handle.await {
        warn!(error = %e, "ripmond: Display watcher ended abnormally");
    }
    if let Some(handle) = metrics_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "ripmond: Metrics task ended abnormally");
        }
    }

    info!(
        routes = trie.routes().len(),
        population = trie.population(),
        "ripmond: Graceful shutdown complete"
    );
    result
}

/// Setup signal handlers
///
/// SIGINT and SIGTERM shut the daemon down; SIGHUP clears the trie so it
/// is rebuilt from the next round of advertisements. SIGUSR1 logs the trie
/// as a Graphviz graph.
///
/// # NIST Controls
/// - AU-12: Audit Record Generation - Log operator signals
fn setup_signal_handlers(trie: Arc<RoutingTrie>, cancel: CancellationToken) -> Result<()> {
    let mut hangup = unix_signal(SignalKind::hangup())?;
    let mut terminate = unix_signal(SignalKind::terminate())?;
    let mut dump = unix_signal(SignalKind::user_defined1())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                interrupted = signal::ctrl_c() => {
                    if interrupted.is_ok() {
                        info!("ripmond: Received SIGINT");
                    }
                    cancel.cancel();
                    break;
                }

                _ = terminate.recv() => {
                    info!("ripmond: Received SIGTERM");
                    cancel.cancel();
                    break;
                }

                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("ripmond: Received SIGHUP, clearing routing trie");
                    trie.clear();
                }

                received = dump.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("ripmond: Received SIGUSR1");
                    dump_trie(&trie);
                }
            }
        }
    });

    Ok(())
}

/// Log the trie as a DOT graph. Returns the graph.
fn dump_trie(trie: &RoutingTrie) -> String {
    let dot = trie.to_dot();
    info!(
        routes = trie.routes().len(),
        nodes = trie.node_count(),
        generation = trie.generation(),
        "ripmond: Routing trie dump\n{}",
        dot
    );
    dot
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["ripmond", "--config", "/nonexistent/ripmond.toml"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["ripmond"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(args.log_level, "info");
        assert!(args.display.is_empty());
    }

    #[test]
    fn test_command_line_overrides() {
        let config = build_config(&args(&[
            "--port",
            "5520",
            "--interface",
            "192.0.2.1",
            "--metrics-port",
            "9200",
            "10.0.0.0",
            "255.255.0.0",
            "core",
        ]))
        .unwrap();

        assert_eq!(config.receiver.port, 5520);
        assert_eq!(config.receiver.interface, Ipv4Addr::new(192, 0, 2, 1));
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9200);
        assert_eq!(config.display.len(), 1);
        assert_eq!(config.display[0].title(), "10.0.0.0/16 (core)");
    }

    #[test]
    fn test_display_args_must_be_triples() {
        assert!(build_config(&args(&["10.0.0.0", "255.255.0.0"])).is_err());
        assert!(parse_display_args(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_dump_trie() {
        let trie = RoutingTrie::new();
        trie.set(0x0A00_0000, 0xFF00_0000, 5);
        let dot = dump_trie(&trie);
        assert!(dot.starts_with("digraph {"));
        assert!(dot.contains("[label=\"5\"]"));
        assert_eq!(dot.matches("->").count(), 8);
    }

    #[test]
    fn test_invalid_display_mask() {
        let err = build_config(&args(&["10.0.0.0", "255.0.255.0", "odd"])).unwrap_err();
        assert!(matches!(err, RipmonError::Address(_)));
    }
}
