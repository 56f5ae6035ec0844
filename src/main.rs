use darwin_cancellations::cache::CancellationCache;
use darwin_cancellations::config::Config;
use darwin_cancellations::darwin_subscriber::{DarwinSubscriber, SubscriberState};
use darwin_cancellations::enricher::{Enricher, EnrichmentStats};
use darwin_cancellations::pipeline::Pipeline;
use darwin_cancellations::store::ScheduleStore;
use darwin_cancellations::webui;

use config_file::FromConfigFile;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// exit codes: 0 normal shutdown, 2 configuration error, 3 store
// initialization failure, 4 unrecoverable startup failure
const EXIT_CONFIG: i32 = 2;
const EXIT_STORE: i32 = 3;
const EXIT_STARTUP: i32 = 4;

const READINESS_DEADLINE: Duration = Duration::from_secs(10);

fn init_logging(
    config: &Config,
) -> Result<tracing_appender::non_blocking::WorkerGuard, String> {
    std::fs::create_dir_all(&config.log.dir)
        .map_err(|e| format!("cannot create log directory {:?}: {}", config.log.dir, e))?;
    let appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .max_log_files(10)
        .filename_prefix("darwin-cancellations")
        .filename_suffix("log")
        .build(&config.log.dir)
        .map_err(|e| format!("cannot open log directory {:?}: {}", config.log.dir, e))?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    Ok(guard)
}

async fn import_startup_files(store: &ScheduleStore, dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(target: "main", dir = %dir.display(), error = %e, "cannot read import directory");
            return;
        }
    };
    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|kind| kind.is_file()).unwrap_or(false) {
            files.push(entry.path());
        }
    }
    files.sort();
    for file in files {
        match store.import_file(&file).await {
            Ok((disposition, record)) => {
                tracing::info!(
                    target: "main",
                    file = %file.display(),
                    disposition = ?disposition,
                    imported = record.records_imported,
                    success = record.success,
                    "startup import"
                );
            }
            Err(e) => {
                tracing::warn!(target: "main", file = %file.display(), error = %e, "startup import failed");
            }
        }
    }
}

async fn run() -> i32 {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./config.toml".to_string());
    let config = match Config::from_config_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error in {}: {}", config_path, e);
            return EXIT_CONFIG;
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        return EXIT_CONFIG;
    }
    let listen = match config.listen_addr() {
        Ok(listen) => listen,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_CONFIG;
        }
    };
    let _log_guard = match init_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_STARTUP;
        }
    };

    let store = match ScheduleStore::open(&config.store.path, config.store.retention_days).await
    {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(target: "main", error = %e, "schedule store failed to open");
            return EXIT_STORE;
        }
    };
    if let Some(dir) = &config.import.dir {
        import_startup_files(&store, dir).await;
    }

    let cache = Arc::new(CancellationCache::new(
        config.cache.max_entries,
        chrono::Duration::hours(config.cache.max_age_hours as i64),
    ));
    let stats = Arc::new(EnrichmentStats::default());
    let subscriber = DarwinSubscriber::new(config.broker.clone());
    let subscriber_state = subscriber.state_cell();
    let enricher = Enricher::new(store.clone(), stats.clone());
    let pipeline = Pipeline::spawn(&config, subscriber, enricher, cache.clone(), stats.clone());

    // the process keeps running either way; readiness just reports late
    let watchdog_state = subscriber_state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(READINESS_DEADLINE).await;
        let state = watchdog_state.get();
        if !matches!(state, SubscriberState::Subscribed | SubscriberState::Receiving) {
            tracing::warn!(
                target: "main",
                state = %state,
                "not ready within startup deadline"
            );
        }
    });

    let rocket = webui::build_rocket(
        &config,
        listen,
        store.clone(),
        cache,
        stats,
        subscriber_state,
    );
    tracing::info!(target: "main", listen = %listen, "query API starting");
    let served = webui::serve(rocket).await;

    tracing::info!(target: "main", "shutting down ingestion pipeline");
    pipeline.shutdown().await;
    if let Err(e) = store.persist().await {
        tracing::warn!(target: "main", error = %e, "final snapshot write failed");
    }

    match served {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(target: "main", error = %e, "server failed");
            EXIT_STARTUP
        }
    }
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}
