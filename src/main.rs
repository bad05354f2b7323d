use clap::Parser;
use kaf_monitor::brokers::{BrokerSource, StaticBrokers};
use kaf_monitor::config::MonitorConfig;
use kaf_monitor::remote::{Node, NodeAccount};
use kaf_monitor::{MonitorError, OffsetMonitor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Run a kaf consumer on a node and report the newest offset it read per
/// partition.
#[derive(Parser, Debug)]
#[command(name = "kaf-monitor", version, about)]
pub struct Cli {
    /// Topic to consume
    #[arg(short, long)]
    topic: String,

    /// Config file path
    #[arg(short, long, default_value = "kaf-monitor.toml")]
    config: PathBuf,

    /// Broker addresses, comma separated (overrides config)
    #[arg(short, long, value_delimiter = ',')]
    brokers: Vec<String>,

    /// Max records for the consumer to read (overrides config)
    #[arg(short, long)]
    limit: Option<u64>,

    /// Stop once every partition in --partitions reached this offset
    #[arg(long, requires = "partitions")]
    until_offset: Option<u64>,

    /// Partitions checked by --until-offset, comma separated
    #[arg(long, value_delimiter = ',')]
    partitions: Vec<u32>,

    /// Seconds to wait before stopping the consumer (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Print the consumer command line and exit
    #[arg(long)]
    dry_run: bool,

    /// Log every consumer output line
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "kaf_monitor=debug"
    } else {
        "kaf_monitor=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match MonitorConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };
    if !cli.brokers.is_empty() {
        config.brokers.addresses = cli.brokers.clone();
    }
    if cli.limit.is_some() {
        config.consumer.record_limit = cli.limit;
    }
    if let Some(timeout) = cli.timeout {
        config.poll.timeout_secs = timeout;
    }

    let account = Arc::new(NodeAccount::new(Node::from_config(&config.node)));
    let brokers: Arc<dyn BrokerSource> = Arc::new(StaticBrokers::from_config(&config.brokers));
    let mut monitor =
        OffsetMonitor::new(account, brokers, &cli.topic).with_consumer(config.consumer.clone());

    if cli.dry_run {
        println!("{}", monitor.command_line());
        return;
    }

    if let Err(e) = monitor.start() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    let timeout = Duration::from_secs(config.poll.timeout_secs);
    let interval = Duration::from_millis(config.poll.interval_ms);

    let outcome = tokio::select! {
        r = wait_for_target(&monitor, &cli, timeout, interval) => r,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping consumer");
            Ok(())
        }
    };

    if let Err(e) = monitor.stop().await {
        tracing::warn!(error = %e, "failed to stop consumer");
    }
    let worker = monitor.wait().await;

    match serde_json::to_string_pretty(&monitor.snapshot()) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize snapshot"),
    }

    let mut failed = false;
    if let Err(e) = worker {
        eprintln!("Error: monitor failed: {e}");
        failed = true;
    }
    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        failed = true;
    }
    if failed {
        std::process::exit(1);
    }
}

/// With `--until-offset`, wait for every listed partition to reach it;
/// otherwise wait for the consumer to exit on its own.
async fn wait_for_target(
    monitor: &OffsetMonitor,
    cli: &Cli,
    timeout: Duration,
    interval: Duration,
) -> Result<(), MonitorError> {
    match cli.until_offset {
        Some(target) => {
            tracing::info!(until_offset = target, partitions = ?cli.partitions, "waiting for offsets");
            monitor
                .wait_until(|m| m.reached(&cli.partitions, target), timeout, interval)
                .await
        }
        None => match monitor.wait_until(|m| m.is_done(), timeout, interval).await {
            Err(MonitorError::Timeout { .. }) => {
                tracing::info!("timeout reached, stopping consumer");
                Ok(())
            }
            other => other,
        },
    }
}
