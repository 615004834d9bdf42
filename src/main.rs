use anyhow::Context;
use clap::Parser;
use polywatch::adapters::{GammaClient, PriceStream, WsConnector};
use polywatch::cli::{self, Cli, Commands, MarketRow, OutputMode, RecordRow};
use polywatch::clock::{Clock, SystemClock};
use polywatch::config::AppConfig;
use polywatch::services::{DiscoveryService, Metrics, StatusServer, StatusState};
use polywatch::strategy::{LifecycleConfig, MarketContext, MarketSupervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod main_runtime;

use main_runtime::{build_sink, init_logging, init_logging_simple, shutdown_signal};

/// Interval of the periodic status line
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    if let Err(errors) = config.validate() {
        anyhow::bail!("invalid configuration: {}", errors.join("; "));
    }

    match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Run => {
            let _guard = init_logging(&config.logging);
            run_monitor(config).await
        }
        Commands::Feed { secs } => {
            init_logging_simple();
            run_feed(config, secs).await
        }
        Commands::Discover { json } => {
            init_logging_simple();
            let discovery = DiscoveryService::from_config(config.discovery, Arc::new(SystemClock))?;
            let markets = discovery.discover().await;
            let rows: Vec<MarketRow> = markets.iter().map(MarketRow::from).collect();
            cli::print_items(&rows, OutputMode::from_json_flag(json))
        }
        Commands::Records { hours, json } => {
            init_logging_simple();
            let sink = build_sink(&config.database).await?;
            let records = sink
                .recent_records(Duration::from_secs(hours * 3600))
                .await
                .context("loading records")?;
            let rows: Vec<RecordRow> = records.iter().map(RecordRow::from).collect();
            cli::print_items(&rows, OutputMode::from_json_flag(json))
        }
    }
}

async fn run_monitor(config: AppConfig) -> anyhow::Result<()> {
    info!("Polywatch read-only monitor starting");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::new());

    let sink = build_sink(&config.database).await?;

    let stream = Arc::new(PriceStream::new(
        config.feed.clone(),
        clock.clone(),
        metrics.clone(),
    ));
    let connector = WsConnector::from_config(&config.feed)?;
    let feed_task = tokio::spawn({
        let stream = stream.clone();
        async move { stream.run(&connector).await }
    });

    info!("Waiting for Chainlink BTC/USD price feed...");
    if stream
        .wait_for_price(Duration::from_secs(config.feed.startup_wait_secs))
        .await
    {
        if let Some(price) = stream.price() {
            info!("Price feed connected. BTC/USD: ${:.2}", price);
        }
    } else {
        warn!("Price feed not available yet. Will retry during market monitoring.");
    }

    let gamma = GammaClient::new(
        &config.discovery.gamma_url,
        Duration::from_secs(config.discovery.request_timeout_secs),
    )?;

    let ctx = MarketContext {
        prices: stream.clone(),
        outcomes: Arc::new(gamma.clone()),
        sink: sink.clone(),
        clock: clock.clone(),
    };
    let supervisor = Arc::new(MarketSupervisor::new(
        ctx,
        LifecycleConfig {
            strategy: config.strategy.clone(),
            settlement: config.settlement.clone(),
        },
        metrics.clone(),
    ));

    let status = Arc::new(StatusState::new(
        stream.clone(),
        supervisor.clone(),
        sink.clone(),
        metrics.clone(),
        clock.clone(),
    ));
    let status_port = config.status_port;
    tokio::spawn(async move {
        if let Err(e) = StatusServer::new(status, status_port).run().await {
            error!("Status server stopped: {}", e);
        }
    });

    let discovery = DiscoveryService::new(gamma, config.discovery.clone(), clock.clone());
    if let Err(e) = discovery
        .seed_seen(sink.as_ref(), config.database.dedupe_window())
        .await
    {
        warn!("Could not load already-processed markets: {}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let discovery_task = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { discovery.run_forever(&supervisor, shutdown_rx).await }
    });

    info!("Starting market discovery loop...");
    let mut status_ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = status_ticker.tick() => {
                metrics.log_status();
                info!("Active markets: {}", supervisor.len());
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = discovery_task.await {
        warn!("Discovery task ended abnormally: {}", e);
    }
    supervisor.shutdown();
    feed_task.abort();

    info!("Shutdown complete");
    Ok(())
}

async fn run_feed(config: AppConfig, secs: u64) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stream = Arc::new(PriceStream::new(
        config.feed.clone(),
        clock,
        Arc::new(Metrics::new()),
    ));
    let connector = WsConnector::from_config(&config.feed)?;
    let feed_task = tokio::spawn({
        let stream = stream.clone();
        async move { stream.run(&connector).await }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    for _ in 0..secs {
        ticker.tick().await;
        let snap = stream.snapshot();
        match snap.price {
            Some(price) => println!(
                "BTC/USD ${:.2} | age {:.1}s | ticks {}",
                price,
                snap.last_update_age_secs.unwrap_or(0.0),
                snap.tick_count
            ),
            None => println!(
                "no fresh price (connected: {}, last: {})",
                snap.ws_connected,
                snap.last_price
                    .map(|p| format!("${:.2}", p))
                    .unwrap_or_else(|| "-".to_string())
            ),
        }
    }

    feed_task.abort();
    Ok(())
}
