use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chat_worker::config::{StoreBackend, WorkerConfig};
use chat_worker::error::Error;
use chat_worker::llm::{InferenceClient, TogetherClient};
use chat_worker::pipeline::TaskPipeline;
use chat_worker::queue::{LineQueue, QueueGateway};
use chat_worker::store::{ContextStore, LibSqlContextStore, MemoryContextStore};
use chat_worker::worker::{WorkerController, shutdown_signal};

/// How long the runtime waits for leftover blocking tasks after the worker
/// stopped. The stdin reader sits in a blocking read that cannot be
/// cancelled, so without a bound an idle producer would keep the process
/// alive.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    // Logs go to stderr; stdout carries results.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    let code = match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker exited with an error");
            ExitCode::FAILURE
        }
    };
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    code
}

async fn run() -> Result<(), Error> {
    let config = WorkerConfig::from_env()?;

    eprintln!("💬 Chat Worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.inference.model);
    eprintln!("   Endpoint: {}", config.inference.endpoint);

    // ── Context store ───────────────────────────────────────────────────
    let store: Arc<dyn ContextStore> = match &config.store {
        StoreBackend::LibSql { path } => {
            eprintln!("   Context: {}", path.display());
            Arc::new(LibSqlContextStore::new_local(path, config.bounds).await?)
        }
        StoreBackend::Memory => {
            eprintln!("   Context: in-memory (not persisted)");
            Arc::new(MemoryContextStore::new(config.bounds))
        }
    };

    // ── Inference ───────────────────────────────────────────────────────
    let llm: Arc<dyn InferenceClient> = Arc::new(TogetherClient::new(config.inference.clone())?);

    // ── Queue + pipeline ────────────────────────────────────────────────
    let queue: Arc<dyn QueueGateway> = Arc::new(LineQueue::stdio());
    let pipeline = Arc::new(TaskPipeline::new(
        store,
        llm,
        queue.clone(),
        config.limits.job_timeout,
    ));

    eprintln!(
        "   Jobs: up to {} in flight, {}s timeout\n",
        config.limits.max_concurrent_jobs,
        config.limits.job_timeout.as_secs()
    );

    let reason = WorkerController::new(pipeline, queue, config.limits)
        .run(shutdown_signal())
        .await?;
    tracing::info!(reason = %reason, "Shutdown complete");
    Ok(())
}
