// memodesk - self-hosted voice memo pipeline
//
// A tech lead records voice memos; memodesk transcribes them with a
// local whisper.cpp CLI, asks a local llama.cpp server to extract
// structured artefacts (actions, deadlines, blockers, knowledge notes),
// and files everything under long-lived epics.
//
// Architecture:
// - Store (rusqlite): events, epics, projections, jobs, FTS5 search
// - Job queue: durable, exponential backoff, dead-letter table
// - Worker runner: polling loop with bounded concurrency
// - STT / LLM supervisors: child processes for the two heavy stages
// - TTL sweeper: transcript and audio expiry on a daily cadence
// - HTTP surface (axum): uploads, reads, admin

mod cli;
mod config;
mod extract;
mod llm;
mod matcher;
mod push;
mod queue;
mod runner;
mod server;
mod store;
mod stt;
mod sweeper;

use anyhow::{Context, Result};
use config::Config;
use llm::{LlmModelManager, LlmStartOptions, LlmSupervisor};
use queue::{JobQueue, JobType};
use runner::{RunnerConfig, WorkerRunner};
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use stt::{SttConfig, SttSupervisor, SttWorker};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI commands first (config --show, model download, ...).
    // If a command was handled, exit early.
    if cli::handle_cli().await {
        return Ok(());
    }

    let config = Config::from_env();

    // Precedence: RUST_LOG env var > config > default "info"
    let default_filter = format!("memodesk={}", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    // Optional daily-rotated file log next to the stdout layer. The
    // guard must outlive the subscriber or buffered lines are lost.
    let (file_layer, _log_guard) = match &config.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "memodesk.log".to_string());
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    tracing::info!(version = config::VERSION, "memodesk starting");
    tracing::debug!(?config, "Effective configuration");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    // Composition root: construct each component once and thread the
    // handles explicitly; no process-wide mutable state.
    let config = Arc::new(config);
    let store = Arc::new(Store::open(&config.db_path)?);
    let queue = Arc::new(JobQueue::new(store.clone()));

    let stt = Arc::new(
        SttSupervisor::initialize(&SttConfig {
            cli_path: config.whisper.cli_path.clone(),
            models_dir: config.whisper.models_dir.clone(),
            model: config.whisper.model.clone(),
            threads: config.whisper.threads,
        })
        .await?,
    );

    let llm = Arc::new(LlmSupervisor::new(
        config.llm.server_bin.clone(),
        config.llm.port,
    ));
    let llm_models = Arc::new(LlmModelManager::new(&config.llm.models_dir)?);
    if config.llm.autostart {
        let options = LlmStartOptions {
            model_path: config.llm.model_path(),
            context_size: config.llm.context_size,
            threads: config.llm.threads,
            batch_size: config.llm.batch_size,
            gpu_layers: config.llm.gpu_layers,
        };
        if let Err(e) = llm.start(options).await {
            // The queue's backoff covers the gap until the operator
            // starts it via the admin API.
            tracing::warn!("LLM server did not start: {} (extraction will retry)", e);
        }
    }

    let push_transport: Arc<dyn push::PushTransport> = match &config.vapid {
        Some(vapid) => Arc::new(push::WebPushTransport::new(push::VapidIdentity {
            public_key: vapid.public_key.clone(),
            private_key: vapid.private_key.clone(),
            subject: vapid.subject.clone(),
        })),
        None => {
            tracing::info!("No VAPID identity configured; push deliveries are no-ops");
            Arc::new(push::NoopTransport)
        }
    };

    // Register one worker per job type.
    let mut runner = WorkerRunner::new(
        store.clone(),
        queue.clone(),
        RunnerConfig {
            poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
            max_concurrent: config.worker.max_concurrent,
            shutdown_deadline: Duration::from_secs(config.worker.shutdown_deadline_secs),
        },
    );
    runner.register(
        JobType::Stt,
        Arc::new(SttWorker::new(
            store.clone(),
            queue.clone(),
            stt.clone(),
            config.ttl.transcript_ttl_days,
        )),
    );
    runner.register(
        JobType::Extract,
        Arc::new(extract::ExtractWorker::new(
            store.clone(),
            queue.clone(),
            llm.clone(),
        )),
    );
    runner.register(
        JobType::Reprocess,
        Arc::new(extract::ReprocessWorker::new(
            store.clone(),
            queue.clone(),
            llm.clone(),
        )),
    );
    runner.register(
        JobType::Push,
        Arc::new(push::PushWorker::new(store.clone(), push_transport)),
    );
    runner.register(
        JobType::TtlCleanup,
        Arc::new(sweeper::TtlWorker::new(store.clone())),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner_handle = tokio::spawn(runner.run(shutdown_rx.clone()));
    tokio::spawn(llm::run_health_monitor(
        llm.clone(),
        Duration::from_secs(30),
        shutdown_rx.clone(),
    ));
    let sweeper_handle = tokio::spawn(sweeper::run_scheduler(
        queue.clone(),
        Duration::from_secs(config.ttl.cleanup_interval_hours * 3600),
        shutdown_rx.clone(),
    ));

    let state = server::AppState {
        store,
        queue,
        stt,
        llm: llm.clone(),
        llm_models,
        config: config.clone(),
    };
    let server_handle = tokio::spawn(server::start_server(state, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down...");

    // Stop accepting work, drain the runner, then take down the LLM
    // child last so in-flight extractions can finish.
    let _ = shutdown_tx.send(true);
    let _ = server_handle.await;
    let _ = sweeper_handle.await;
    let _ = runner_handle.await;
    if let Err(e) = llm.stop().await {
        tracing::warn!("LLM shutdown error: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
