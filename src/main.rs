use clap::{Parser, Subcommand};
use headless_sentinel::config::{parse_time_range, Config};
use headless_sentinel::credentials::ChainCredentialProvider;
use headless_sentinel::notify::{Remediator, WebhookNotifier};
use headless_sentinel::pool::{run_cycle, ContinuousConfig};
use headless_sentinel::rules::Watcher;
use headless_sentinel::store::Store;
use headless_sentinel::transport::WinrmExecutor;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Headless log aggregation and alerting engine for Windows event logs.
#[derive(Parser)]
#[command(name = "sentinel", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one collection cycle, or loop continuously.
    Collect {
        #[arg(long, default_value = "sentinel.yaml")]
        config: String,
        #[arg(long)]
        continuous: bool,
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run arbitrary SQL against the store and print the result.
    Query {
        #[arg(long, default_value = "sentinel.yaml")]
        config: String,
        #[arg(long)]
        query: Option<String>,
        #[arg(long = "event-id")]
        event_id: Option<u32>,
        #[arg(long)]
        severity: Option<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        last: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
        #[arg(long)]
        export: Option<String>,
    },
    /// Run the rule engine in the foreground.
    Watch {
        #[arg(long, default_value = "sentinel.yaml")]
        config: String,
    },
    /// Render a period report.
    Report {
        #[arg(long)]
        output: Option<String>,
        #[arg(long, default_value = "24h")]
        period: String,
        #[arg(long, default_value = "markdown")]
        format: String,
    },
    /// Print recent rows, optionally following.
    Tail {
        #[arg(long)]
        follow: bool,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long, default_value_t = 50)]
        lines: u32,
    },
    /// Print store statistics.
    Status {
        #[arg(long, default_value = "sentinel.yaml")]
        config: String,
    },
    /// Create the store schema (with confirmation).
    Init {
        #[arg(long, default_value = "sentinel.yaml")]
        config: String,
    },
    /// Write a sample config file.
    GenerateConfig { path: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "sentinel exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> headless_sentinel::Result<()> {
    match cli.command {
        Command::Collect {
            config,
            continuous,
            interval,
        } => run_collect(&config, continuous, interval).await,
        Command::Query { config, query, .. } => run_query(&config, query.as_deref()).await,
        Command::Watch { config } => run_watch(&config).await,
        Command::Report { period, .. } => {
            let hours = parse_time_range(&period)?;
            info!(hours, "report rendering is out of scope; printing the window only");
            Ok(())
        }
        Command::Tail { lines, .. } => {
            info!(lines, "tail formatting is out of scope in this build");
            Ok(())
        }
        Command::Status { config } => run_status(&config).await,
        Command::Init { config } => run_init(&config).await,
        Command::GenerateConfig { path } => Config::generate_sample(&path),
    }
}

async fn run_collect(config_path: &str, continuous: bool, interval_override: Option<u64>) -> headless_sentinel::Result<()> {
    let config = Config::load(config_path)?;
    let store = Arc::new(Store::open(&config.database.path)?);
    let executor: Arc<dyn headless_sentinel::transport::RemoteExecutor> = Arc::new(WinrmExecutor::new());
    let credentials = Arc::new(ChainCredentialProvider::new(&config.targets));

    if !continuous {
        let report = run_cycle(
            executor,
            credentials,
            &config.targets,
            &config.collection.log_types,
            config.collection.hours_back,
            config.collection.max_events,
            config.collection.concurrent_hosts,
        )
        .await;
        let ids = store.insert_batch(&report.entries)?;
        info!(inserted = ids.len(), hosts_failed = report.hosts_failed.len(), "collection cycle complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    let continuous_config = ContinuousConfig {
        interval: std::time::Duration::from_secs(interval_override.unwrap_or(config.alerts.check_interval)),
        ..Default::default()
    };

    headless_sentinel::pool::run_continuous(
        executor,
        credentials,
        config.targets,
        config.collection.log_types,
        config.collection.hours_back,
        config.collection.max_events,
        config.collection.concurrent_hosts,
        continuous_config,
        move |report| {
            let store = Arc::clone(&store);
            async move {
                store.insert_batch(&report.entries)?;
                Ok(())
            }
        },
        shutdown_rx,
    )
    .await;

    Ok(())
}

async fn run_query(config_path: &str, query: Option<&str>) -> headless_sentinel::Result<()> {
    let config = Config::load(config_path)?;
    let store = Store::open(&config.database.path)?;
    let sql = query.unwrap_or("SELECT * FROM logs ORDER BY id DESC LIMIT 100");
    let rows = store.query(sql)?;
    for row in rows {
        println!("{}", row.values.join(", "));
    }
    Ok(())
}

async fn run_watch(config_path: &str) -> headless_sentinel::Result<()> {
    let config = Config::load(config_path)?;
    let store = Arc::new(Store::open(&config.database.path)?);
    let notifier = Arc::new(WebhookNotifier::new());
    let executor: Arc<dyn headless_sentinel::transport::RemoteExecutor> = Arc::new(WinrmExecutor::new());
    let remediator = Arc::new(Remediator::new(executor));
    let credentials = Arc::new(ChainCredentialProvider::new(&config.targets));

    let mut watcher = Watcher::new(store, config.alerts.rules, notifier, remediator, credentials);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(config.alerts.check_interval)) => {
                watcher.tick().await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, stopping watcher");
                return Ok(());
            }
        }
    }
}

async fn run_status(config_path: &str) -> headless_sentinel::Result<()> {
    let config = Config::load(config_path)?;
    let store = Store::open(&config.database.path)?;
    let stats = store.stats()?;
    println!("rows: {}", stats.row_count);
    if let Some(earliest) = stats.earliest_timestamp {
        println!("earliest: {earliest}");
    }
    if let Some(latest) = stats.latest_timestamp {
        println!("latest: {latest}");
    }
    Ok(())
}

async fn run_init(config_path: &str) -> headless_sentinel::Result<()> {
    let config = Config::load(config_path)?;
    let _store = Store::open(&config.database.path)?;
    info!(path = %config.database.path, "schema ready");
    Ok(())
}
