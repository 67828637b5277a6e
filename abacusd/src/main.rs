// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::time::Duration;

use abacusd::adapters::cli::{self, Command};
use abacusd::adapters::db::{JobStateStore, SqliteStoreAdapter};
use abacusd::adapters::fs::{FileApplicationCatalog, LocalObjectStore};
use abacusd::adapters::ssh::{RusshConnector, SshParams, check_login};
use abacusd::adapters::stream::{EventBus, RequestSpool};
use abacusd::app::ports::JobStateStorePort;
use abacusd::app::services::aggregator::JobStateAggregator;
use abacusd::app::services::completion::JobCompletionService;
use abacusd::app::services::poller::StatusPoller;
use abacusd::app::services::submission::{JobSubmissionOrchestrator, SubmissionSettings};
use abacusd::app::services::templates::TeraScriptGenerator;
use abacusd::app::services::tracking::JobTracker;
use abacusd::config::{self, Config, ConfigReport, SshConfig};
use abacusd::remote::{ConnectionPool, files};
use abacusd::remote::lines::read_lines;
use abacusd::logging;

const SPOOL_SCAN_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn log_config_report(report: &ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => tracing::info!(
            "config path: {} (source={}, present={})",
            path.display(),
            source.as_str(),
            report.config_file_present
        ),
        (Some(path), None) => tracing::info!(
            "config path: {} (present={})",
            path.display(),
            report.config_file_present
        ),
        (None, _) => tracing::info!("config path: (none)"),
    }
    tracing::info!(
        "config database_path: {} (source={})",
        report.database_path.value.display(),
        report.database_path.source.as_str()
    );
    tracing::info!(
        "config poll_interval_secs: {} (source={})",
        report.poll_interval_secs.value,
        report.poll_interval_secs.source.as_str()
    );
    tracing::info!(
        "config pool_size: {} (source={})",
        report.pool_size.value,
        report.pool_size.source.as_str()
    );
    tracing::info!(
        "config verbose: {} (source={})",
        report.verbose.value,
        report.verbose.source.as_str()
    );
}

fn ssh_params(ssh: &SshConfig) -> SshParams {
    SshParams {
        host: ssh.host.clone(),
        port: ssh.port,
        username: ssh.username.clone(),
        identity_path: ssh.identity_path.clone(),
        known_hosts_path: ssh.known_hosts_path.clone(),
        connect_timeout: ssh.connect_timeout,
        keepalive_secs: ssh.keepalive_secs,
    }
}

fn build_pool(config: &Config) -> anyhow::Result<Arc<ConnectionPool>> {
    let ssh = config.require_ssh()?;
    tracing::info!(host = %ssh.host, port = ssh.port, user = %ssh.username, "using cluster login node");
    let connector = Arc::new(RusshConnector::new(ssh_params(ssh)));
    let pool = ConnectionPool::new(connector, config.pool_size);
    tracing::debug!(capacity = pool.capacity(), "created ssh session pool");
    Ok(Arc::new(pool))
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn JobStateStorePort>> {
    config::ensure_database_dir(&config.database_path)?;
    let store = JobStateStore::open(&config.database_path)
        .await
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    Ok(Arc::new(SqliteStoreAdapter::new(store)))
}

async fn restore_aggregator(store: Arc<dyn JobStateStorePort>) -> anyhow::Result<JobStateAggregator> {
    JobStateAggregator::restore(store)
        .await
        .context("failed to restore job state")
}

async fn print_history(config: &Config, owner: &str) -> anyhow::Result<()> {
    let aggregator = restore_aggregator(open_store(config).await?).await?;
    match aggregator.serialized_history(owner)? {
        Some(json) => {
            println!("{json}");
            Ok(())
        }
        None => anyhow::bail!("no job history recorded for '{owner}'"),
    }
}

async fn print_lines(config: &Config, remote_path: &str, start: u64, count: u64) -> anyhow::Result<()> {
    let pool = build_pool(config)?;
    let result = async {
        let lease = pool.lease().await?;
        read_lines(lease.session(), remote_path, start, count).await
    }
    .await;
    pool.close();
    let window = result?;
    for line in &window.lines {
        println!("{line}");
    }
    if window.exit_code != 0 {
        anyhow::bail!(
            "reading {remote_path} exited with status {}",
            window.exit_code
        );
    }
    Ok(())
}

async fn print_listing(config: &Config, remote_path: &str) -> anyhow::Result<()> {
    let pool = build_pool(config)?;
    let result = async {
        let lease = pool.lease().await?;
        files::ls(lease.session(), remote_path).await
    }
    .await;
    pool.close();
    for entry in &result? {
        println!("{}", cli::format_listing_entry(entry));
    }
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let aggregator = Arc::new(restore_aggregator(store.clone()).await?);
    let tracker = Arc::new(
        JobTracker::restore(store)
            .await
            .context("failed to restore tracked jobs")?,
    );
    let pool = build_pool(&config)?;
    check_login(&pool).await?;

    let bus = Arc::new(EventBus::default());
    let aggregator_events = bus.subscribe();
    let orchestrator_events = bus.subscribe();
    let completion_events = bus.subscribe();

    let catalog = Arc::new(FileApplicationCatalog::new(config.applications_dir.clone()));
    let storage = Arc::new(LocalObjectStore::new(config.storage_root.clone()));
    let orchestrator = Arc::new(JobSubmissionOrchestrator::new(
        pool.clone(),
        catalog.clone(),
        storage.clone(),
        Arc::new(TeraScriptGenerator::new()),
        bus.clone(),
        SubmissionSettings {
            home_directory: config.cluster.home_directory.clone(),
            default_reservation: config.cluster.reservation.clone(),
        },
    ));
    let completion = Arc::new(JobCompletionService::new(
        pool.clone(),
        catalog,
        storage,
        tracker.clone(),
        bus.clone(),
    ));
    let poller = StatusPoller::new(
        pool.clone(),
        tracker,
        bus.clone(),
        Duration::from_secs(config.poll_interval_secs),
    );
    let spool = RequestSpool::new(config.requests_dir.clone(), bus.clone(), SPOOL_SCAN_INTERVAL);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let aggregator_task = tokio::spawn(aggregator.run(aggregator_events));
    let orchestrator_task = tokio::spawn(orchestrator.run(orchestrator_events));
    let completion_task = tokio::spawn(completion.run(completion_events));
    let poller_task = tokio::spawn(poller.run(shutdown_rx.clone()));
    let spool_task = tokio::spawn(spool.run(shutdown_rx));

    tracing::info!(
        requests_dir = %config.requests_dir.display(),
        poll_interval_secs = config.poll_interval_secs,
        "abacusd running"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    let _ = shutdown_tx.send(true);
    for (name, task) in [("poller", poller_task), ("spool", spool_task)] {
        if let Err(err) = task.await {
            tracing::warn!("{name} task ended abnormally: {err}");
        }
    }
    // Bus consumers also publish into the bus, so none of them sees its channel
    // close; give in-flight work a grace period, then abort.
    for (name, mut task) in [
        ("orchestrator", orchestrator_task),
        ("completion", completion_task),
        ("aggregator", aggregator_task),
    ] {
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("{name} task ended abnormally: {err}"),
            Err(_) => {
                task.abort();
                tracing::debug!("{name} task aborted");
            }
        }
    }
    tracing::debug!(outstanding = pool.outstanding(), "closing ssh session pool");
    pool.close();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = cli::parse_opts();
    let opts = parsed.opts;
    let command = opts.selected_command();
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            database_path: opts.database_path,
            poll_interval_secs: opts.poll_interval_secs,
            pool_size: opts.pool_size,
            verbose: parsed.verbose_override,
        },
    )?;
    logging::init(config.verbose);
    log_config_report(&report);

    match command {
        Command::Serve => serve(config).await,
        Command::History { owner } => print_history(&config, &owner).await,
        Command::Lines {
            remote_path,
            start,
            count,
        } => print_lines(&config, &remote_path, start, count).await,
        Command::Ls { remote_path } => print_listing(&config, &remote_path).await,
    }
}
