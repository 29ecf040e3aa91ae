//! unmark-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables and the command line.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Verify ffmpeg, object storage and the detection model.
//! 4. Connect the status store and the job dispatcher.
//! 5. Start the housekeeping loop.
//! 6. Build the Axum router and start the HTTP server with graceful shutdown
//!    (`serve`), or only consume queued jobs until a signal arrives (`worker`).

mod config;
mod error;
mod middleware;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use unmark_core::{
    Collaborators, DispatchConfig, ObjectStorage, PipelineRunner, RunnerOptions, ServiceOptions,
    StatusConfig, StatusStore, TaskDispatcher, TaskService, WebhookNotifier,
};
use unmark_engine::{
    DetectorConfig, DiffusionInpainter, FfmpegTool, S3Config, S3Storage, YoloDetector,
};

use crate::config::Config;
use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "unmark-server", version, about = "Video watermark removal service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API (default).
    Serve {
        /// Overrides `UNMARK_BIND`.
        #[arg(long)]
        bind: Option<String>,
        /// Only enqueue jobs; leave execution to separate `worker` processes.
        #[arg(long)]
        no_worker: bool,
    },
    /// Consume jobs from the Redis queue without serving HTTP.
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let mut cfg = Config::from_env()?;
    let command = cli.command.unwrap_or(Command::Serve {
        bind: None,
        no_worker: false,
    });
    if let Command::Serve {
        bind: Some(bind), ..
    } = &command
    {
        cfg.bind_address = bind.clone();
    }

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let _log_guard = init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "unmark-server starting");

    tokio::fs::create_dir_all(&cfg.work_dir)
        .await
        .with_context(|| format!("cannot create work dir {}", cfg.work_dir.display()))?;

    // ── 3. Capabilities ────────────────────────────────────────────────────────
    let media = FfmpegTool::discover(cfg.ffmpeg_auto_download)
        .await
        .context("ffmpeg is not usable")?;

    let storage = Arc::new(S3Storage::new(S3Config {
        endpoint: cfg.s3_endpoint.clone(),
        region: cfg.s3_region.clone(),
        bucket: cfg.s3_bucket.clone(),
        access_key: cfg.s3_access_key.clone(),
        secret_key: cfg.s3_secret_key.clone(),
        public_base: cfg.s3_public_base.clone(),
        prefix: cfg.s3_prefix.clone(),
        public_read: cfg.s3_public_read,
    }));
    storage
        .check()
        .await
        .with_context(|| format!("bucket '{}' is not reachable", storage.bucket()))?;
    info!(bucket = storage.bucket(), "object storage ready");

    let detector_cfg = DetectorConfig {
        model_path: cfg.model_path.clone(),
        input_size: cfg.model_input_size,
    };
    let detector = tokio::task::spawn_blocking(move || YoloDetector::load(&detector_cfg))
        .await?
        .context("detection model failed to load")?;
    info!(detector = ?detector, "detection model ready");

    // ── 4. Status store + dispatcher ───────────────────────────────────────────
    let store = StatusStore::connect(&StatusConfig {
        redis_url: cfg.redis_url.clone(),
        key_prefix: cfg.status_prefix.clone(),
        ttl: cfg.task_ttl,
        snapshot_path: cfg.status_file.clone(),
        ..StatusConfig::default()
    })
    .await?;

    let notifier = WebhookNotifier::new()?;
    let runner = Arc::new(PipelineRunner::new(
        store.clone(),
        Collaborators {
            storage: storage.clone(),
            media: Arc::new(media),
            detector: Arc::new(detector),
            inpainter: Arc::new(DiffusionInpainter::default()),
        },
        notifier.clone(),
        RunnerOptions {
            work_root: cfg.work_dir.join("runs"),
            ..RunnerOptions::default()
        },
    ));

    let consume = !matches!(command, Command::Serve { no_worker: true, .. });
    let dispatcher = Arc::new(
        TaskDispatcher::connect(
            &DispatchConfig {
                broker_url: cfg.redis_url.clone(),
                queue_key: cfg.queue_key.clone(),
                concurrency: cfg.concurrency,
                consume,
                ..DispatchConfig::default()
            },
            runner,
        )
        .await,
    );

    // ── 5. Housekeeping ────────────────────────────────────────────────────────
    tokio::spawn(housekeeping(
        store.clone(),
        storage.clone(),
        cfg.housekeeping_interval,
    ));

    // ── 6a. Worker only ────────────────────────────────────────────────────────
    if matches!(command, Command::Worker) {
        anyhow::ensure!(
            dispatcher.backend_name() == "redis",
            "worker mode needs a reachable Redis queue (UNMARK_REDIS_URL)"
        );
        info!(concurrency = cfg.concurrency, "worker consuming jobs");
        shutdown_signal().await;
        dispatcher.shutdown().await;
        info!("unmark-server worker stopped");
        return Ok(());
    }

    // ── 6b. HTTP server with graceful shutdown ─────────────────────────────────
    let service = TaskService::new(
        store,
        storage,
        Arc::clone(&dispatcher),
        notifier,
        ServiceOptions {
            defaults: cfg.defaults,
            expire_after_days: cfg.expire_after_days,
        },
    );
    let state = Arc::new(AppState::new(cfg.clone(), service));

    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.service.shutdown().await;
    dispatcher.shutdown().await;
    info!("unmark-server stopped");
    Ok(())
}

/// Install the global subscriber. The returned guard flushes the rolling
/// file writer and must live until exit.
fn init_tracing(cfg: &Config) -> Option<WorkerGuard> {
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = || match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: UNMARK_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                EnvFilter::new("info")
            }
        },
    };

    let stdout = if cfg.log_json {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    };

    let (file, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "unmark-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout.with_filter(env_filter()))
        .with(file)
        .init();
    guard
}

/// Periodically drop stale status records and purge storage objects whose
/// expiry has passed. The first pass runs immediately.
async fn housekeeping(
    store: StatusStore,
    storage: Arc<S3Storage>,
    every: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match store.cleanup_old().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "stale task records removed"),
            Err(e) => warn!(error = %e, "status cleanup failed"),
        }
        match storage.purge_expired().await {
            Ok(keys) if keys.is_empty() => {}
            Ok(keys) => info!(count = keys.len(), "expired objects purged"),
            Err(e) => warn!(error = %e, "storage purge failed"),
        }
    }
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
