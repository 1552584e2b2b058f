//! gridcrop-worker: extraction worker speaking the framed protocol on
//! stdin/stdout. Logs go to stderr.

use anyhow::Context;

use gridcrop::{GRIDCROP_VERSION, WorkerConfig, init_tracing, run_worker};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = WorkerConfig::default();
    tracing::info!(
        version = GRIDCROP_VERSION,
        output_format = ?config.output_format,
        fetch_timeout_secs = config.fetch_timeout.as_secs(),
        "Starting gridcrop worker"
    );

    run_worker(tokio::io::stdin(), tokio::io::stdout(), config)
        .await
        .context("worker loop failed")?;

    tracing::info!("Worker stopped");
    Ok(())
}
