//! Worker hosting for the client-worker channel.
//!
//! Two ways to get a worker on the other end of a byte stream:
//! - **Thread**: a dedicated OS thread with its own current-thread runtime,
//!   connected through an in-memory duplex pipe
//! - **Process**: the `gridcrop-worker` binary, talking over its stdin/stdout

use std::io;
use std::process::Stdio;
use std::thread::JoinHandle;

use tokio::io::DuplexStream;
use tokio::process::{Child, Command};

use crate::worker::{WorkerConfig, run_worker};

/// Capacity of the in-memory pipe between client and worker thread.
const DUPLEX_CAPACITY: usize = 1024 * 1024;

/// Handle to a worker running on its own thread.
pub struct WorkerThread {
    join: JoinHandle<io::Result<()>>,
}

impl WorkerThread {
    /// Block until the worker loop exits. Close the client end first.
    pub fn join(self) -> io::Result<()> {
        self.join
            .join()
            .map_err(|_| io::Error::other("worker thread panicked"))?
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Start a worker thread and return the client's end of the pipe.
pub fn spawn_worker_thread(config: WorkerConfig) -> io::Result<(DuplexStream, WorkerThread)> {
    let (client_end, worker_end) = tokio::io::duplex(DUPLEX_CAPACITY);

    let join = std::thread::Builder::new()
        .name("gridcrop-worker".to_string())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let (reader, writer) = tokio::io::split(worker_end);
                let result = run_worker(reader, writer, config).await;
                if let Err(ref e) = result {
                    tracing::error!(error = %e, "Worker thread failed");
                }
                result
            })
        })?;

    tracing::debug!("Spawned worker thread");
    Ok((client_end, WorkerThread { join }))
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for launching worker subprocesses.
///
/// The returned child must have piped stdin and stdout.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Launches the `gridcrop-worker` binary.
#[derive(Debug, Clone)]
pub struct BinarySpawner {
    program: String,
    envs: Vec<(String, String)>,
}

impl BinarySpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            envs: Vec::new(),
        }
    }

    /// Uses `GRIDCROP_WORKER_BIN` when set, else `gridcrop-worker` from PATH.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("GRIDCROP_WORKER_BIN").unwrap_or_else(|_| "gridcrop-worker".to_string()),
        )
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for BinarySpawner {
    fn default() -> Self {
        Self::from_env()
    }
}

impl WorkerSpawner for BinarySpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        if self.program.is_empty() {
            return Err(SpawnError::Other("empty worker program".to_string()));
        }
        tracing::debug!(program = %self.program, "Spawning worker process");
        let child = Command::new(&self.program)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}
