//! Drives one collection cycle across every configured host with bounded
//! parallelism, modeled on the Python original's `ForwarderPool`
//! (semaphore-gated `asyncio.as_completed` fan-out) and `run_continuous`.
//!
//! The WinRM client is synchronous, so each host's executor call runs on a
//! blocking-pool thread (`tokio::task::spawn_blocking`); the scheduler
//! itself only awaits their completion (spec §5, DESIGN NOTES "Cooperative
//! suspension vs blocking I/O").

use crate::collector::{collect_host, HostBatch};
use crate::credentials::CredentialProvider;
use crate::model::{HostTarget, LogEntry};
use crate::transport::RemoteExecutor;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Summary of one pass over all configured hosts.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub entries: Vec<LogEntry>,
    pub hosts_attempted: usize,
    pub hosts_failed: Vec<String>,
    pub elapsed: Duration,
}

/// Runs every `targets` entry's collection concurrently, capped at `W`
/// in-flight host collectors at once (spec §4.4). A host whose executor
/// fails entirely (no channel succeeded) is recorded in `hosts_failed` but
/// never aborts the cycle — the aggregated batch still contains every
/// other host's successes.
pub async fn run_cycle(
    executor: Arc<dyn RemoteExecutor>,
    credentials: Arc<dyn CredentialProvider>,
    targets: &[HostTarget],
    log_types: &[String],
    hours_back: i64,
    max_events: u32,
    concurrency: usize,
) -> CycleReport {
    let started = Instant::now();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = FuturesUnordered::new();

    for target in targets.iter().cloned() {
        let executor = Arc::clone(&executor);
        let credentials = Arc::clone(&credentials);
        let semaphore = Arc::clone(&semaphore);
        let log_types = log_types.to_vec();

        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            let host_ip = target.ip.clone();

            let creds = match credentials.resolve(&host_ip) {
                Ok(c) => c,
                Err(e) => {
                    warn!(host = %host_ip, error = %e, "no credentials available, skipping host");
                    return (host_ip, None);
                }
            };

            let batch = tokio::task::spawn_blocking(move || {
                collect_host(executor.as_ref(), &target, &creds, &log_types, hours_back, max_events)
            })
            .await
            .unwrap_or_else(|join_err| {
                error!(host = %host_ip, error = %join_err, "host collection task panicked");
                HostBatch::default()
            });

            (host_ip, Some(batch))
        }));
    }

    let mut report = CycleReport {
        hosts_attempted: targets.len(),
        ..Default::default()
    };

    while let Some(joined) = tasks.next().await {
        let (host_ip, batch) = match joined {
            Ok(pair) => pair,
            Err(join_err) => {
                error!(error = %join_err, "collector task join failed");
                continue;
            }
        };

        match batch {
            Some(batch) if batch.any_channel_succeeded() => {
                report.entries.extend(batch.entries);
            }
            Some(_) => {
                report.hosts_failed.push(host_ip);
            }
            None => {
                report.hosts_failed.push(host_ip);
            }
        }
    }

    report.elapsed = started.elapsed();
    report
}

/// Configuration for the continuous collection loop.
pub struct ContinuousConfig {
    pub interval: Duration,
    pub error_backoff: Duration,
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(60),
        }
    }
}

/// Runs `run_cycle` repeatedly, sleeping `interval` between cycles and
/// backing off 60s after an unexpected error, until `shutdown` resolves
/// (spec §4.4, §5 "Cancellation"). `on_cycle` receives each cycle's report
/// and is expected to flush it to the store.
pub async fn run_continuous<F, Fut>(
    executor: Arc<dyn RemoteExecutor>,
    credentials: Arc<dyn CredentialProvider>,
    targets: Vec<HostTarget>,
    log_types: Vec<String>,
    hours_back: i64,
    max_events: u32,
    concurrency: usize,
    config: ContinuousConfig,
    mut on_cycle: F,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) where
    F: FnMut(CycleReport) -> Fut,
    Fut: std::future::Future<Output = crate::error::Result<()>>,
{
    loop {
        if *shutdown.borrow() {
            info!("shutdown signal received, exiting continuous collection loop");
            return;
        }

        let report = run_cycle(
            Arc::clone(&executor),
            Arc::clone(&credentials),
            &targets,
            &log_types,
            hours_back,
            max_events,
            concurrency,
        )
        .await;

        info!(
            entries = report.entries.len(),
            hosts_failed = report.hosts_failed.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "collection cycle complete"
        );

        let sleep_for = match on_cycle(report).await {
            Ok(()) => config.interval,
            Err(e) => {
                error!(error = %e, "cycle flush failed, backing off");
                config.error_backoff
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("shutdown signal received during sleep, exiting");
                    return;
                }
            }
        }
    }
}
