use anyhow::Context;
use polywatch::adapters::{MemoryStore, PostgresStore};
use polywatch::config::{DatabaseConfig, LoggingConfig};
use polywatch::strategy::RecordSink;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn default_filter(level: &str) -> String {
    if level == "info" {
        "info,polywatch=debug,sqlx=warn".to_string()
    } else {
        format!("{level},polywatch={level},sqlx=warn")
    }
}

/// Console plus daily-rotating file logging. The returned guard flushes the
/// file writer on drop and must be held for the life of the process.
pub fn init_logging(cfg: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&cfg.level)));

    // `rolling::daily` panics if it cannot create the first file, so check
    // the directory is writable before handing it over.
    let log_dir = cfg.dir.as_str();
    let writable = std::fs::create_dir_all(log_dir).is_ok() && {
        let probe = std::path::Path::new(log_dir).join(".polywatch_write_test");
        let ok = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&probe)
            .is_ok();
        let _ = std::fs::remove_file(&probe);
        ok
    };

    let (file_layer, guard) = if writable {
        let file_appender = tracing_appender::rolling::daily(log_dir, "polywatch.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), Some(guard))
    } else {
        eprintln!(
            "Warning: Could not write to log directory {}, file logging disabled",
            log_dir
        );
        (None, None)
    };

    let console_layer = if cfg.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(filter)
        .with(file_layer)
        .init();

    if guard.is_some() {
        eprintln!("Logging to: {}/polywatch.log", log_dir);
    }
    guard
}

pub fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

/// Postgres when a URL is configured, otherwise an in-process store
pub async fn build_sink(cfg: &DatabaseConfig) -> anyhow::Result<Arc<dyn RecordSink>> {
    match cfg.url.as_deref() {
        Some(url) => {
            let store = PostgresStore::new(url, cfg.max_connections)
                .await
                .context("connecting to PostgreSQL")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database configured, records are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter("info"), "info,polywatch=debug,sqlx=warn");
        assert_eq!(default_filter("warn"), "warn,polywatch=warn,sqlx=warn");
        assert!(EnvFilter::try_new(default_filter("debug")).is_ok());
    }
}
