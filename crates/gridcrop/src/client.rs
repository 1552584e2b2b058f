//! Client side of the extraction channel.
//!
//! `ExtractClient` owns the handle and request counters, the pending-request
//! table and the registration caches. Requests go out through one framed
//! writer; a single reader task resolves pending entries as responses arrive,
//! in whatever order the worker produces them.
//!
//! Deduplication is by explicit key: an [`ImageKey`] is registered at most once
//! per session (unless the registration failed), and a [`ConfigKey`] is posted
//! at most once per handle while it stays the handle's current config.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Action, Blob, ImageHandle, ImageSource, Request, RequestId, Response};
use crate::bridge::transport::{SpawnError, WorkerSpawner, WorkerThread, spawn_worker_thread};
use crate::geometry::{ExtractConfig, GeometryError, Rectangle, Template};
use crate::worker::WorkerConfig;

/// Caller-chosen identity of an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey(String);

impl ImageKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ImageKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ImageKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl std::fmt::Display for ImageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of an extraction config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigKey(u64);

impl ConfigKey {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Content hash over every field of the config, floats by bit pattern.
    /// Equal configs get equal keys.
    pub fn of(config: &ExtractConfig) -> Self {
        let mut hasher = DefaultHasher::new();
        match &config.model {
            Template::Grid { rows, cols } => {
                0u8.hash(&mut hasher);
                hash_floats(rows, &mut hasher);
                hash_floats(cols, &mut hasher);
            }
            Template::Boxes {
                box_size,
                rows,
                cols,
            } => {
                1u8.hash(&mut hasher);
                hash_floats(&[box_size.x(), box_size.y()], &mut hasher);
                hash_floats(rows, &mut hasher);
                hash_floats(cols, &mut hasher);
            }
        }
        let Rectangle { top_left, size } = config.coords;
        hash_floats(
            &[top_left.x(), top_left.y(), size.x(), size.y()],
            &mut hasher,
        );
        match config.pads {
            Some(pads) => {
                1u8.hash(&mut hasher);
                hash_floats(&[pads.l, pads.r, pads.t, pads.b], &mut hasher);
            }
            None => 0u8.hash(&mut hasher),
        }
        Self(hasher.finish())
    }
}

fn hash_floats<H: Hasher>(values: &[f64], state: &mut H) {
    values.len().hash(state);
    for value in values {
        value.to_bits().hash(state);
    }
}

/// An image plus the key it is deduplicated under.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub key: ImageKey,
    pub source: ImageSource,
}

impl ImageRef {
    /// Image fetched by the worker; the locator doubles as the key.
    pub fn locator(locator: impl Into<String>) -> Self {
        let locator = locator.into();
        Self {
            key: ImageKey::new(locator.clone()),
            source: ImageSource::Locator(locator),
        }
    }

    pub fn bytes(key: impl Into<ImageKey>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            source: ImageSource::bytes(bytes),
        }
    }
}

/// A config plus the key it is deduplicated under.
#[derive(Debug, Clone)]
pub struct ConfigRef {
    pub key: ConfigKey,
    pub config: ExtractConfig,
}

impl ConfigRef {
    pub fn new(key: ConfigKey, config: ExtractConfig) -> Self {
        Self { key, config }
    }

    /// Keyed by [`ConfigKey::of`].
    pub fn hashed(config: ExtractConfig) -> Self {
        Self {
            key: ConfigKey::of(&config),
            config,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] GeometryError),
    #[error("failed to start worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("worker fatal: {0}")]
    WorkerFatal(String),
    #[error("worker is gone")]
    WorkerGone,
    #[error("protocol error: {0}")]
    Protocol(String),
}

type RequestSink = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonCodec<Request>>;
type PendingTx = oneshot::Sender<Result<Response, ClientError>>;
type PendingRx = oneshot::Receiver<Result<Response, ClientError>>;

/// `None` once registration failed; the entry is then dropped from the table.
type Registration = Arc<OnceCell<Option<ImageHandle>>>;

/// State shared with the reader task.
#[derive(Default)]
struct Shared {
    pending: DashMap<(Action, RequestId), PendingTx>,
    fatal: OnceLock<String>,
    closed: AtomicBool,
}

impl Shared {
    fn closed_error(&self) -> ClientError {
        match self.fatal.get() {
            Some(reason) => ClientError::WorkerFatal(reason.clone()),
            None => ClientError::WorkerGone,
        }
    }

    fn resolve(&self, response: Response) {
        let (Some(action), Some(req_id)) = (response.action(), response.req_id()) else {
            return;
        };
        match self.pending.remove(&(action, req_id)) {
            Some((_, tx)) => {
                if tx.send(Ok(response)).is_err() {
                    tracing::debug!(%action, %req_id, "Caller went away, discarding response");
                }
            }
            None => {
                tracing::warn!(%action, %req_id, "Response for unknown request");
            }
        }
    }

    fn fail_all(&self) {
        let keys: Vec<_> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !keys.is_empty() {
            tracing::warn!(count = keys.len(), "Failing in-flight requests");
        }
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(self.closed_error()));
            }
        }
    }
}

/// Recover from a poisoned table lock; the tables hold no invariants that a
/// panicking holder could break halfway.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Client table mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

enum WorkerHost {
    Thread(WorkerThread),
    Process(Child),
    External,
}

pub struct ExtractClient {
    writer: AsyncMutex<Option<RequestSink>>,
    shared: Arc<Shared>,
    next_handle: AtomicU64,
    next_request: AtomicU64,
    images: StdMutex<HashMap<ImageKey, Registration>>,
    configs: StdMutex<HashMap<ImageHandle, Arc<AsyncMutex<Option<ConfigKey>>>>>,
    reader_task: JoinHandle<()>,
    host: WorkerHost,
}

impl ExtractClient {
    /// Talk to a worker that is already running on the other end of
    /// `reader`/`writer`. Must be called from within a tokio runtime.
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_host(reader, writer, WorkerHost::External)
    }

    /// Start an in-process worker on a dedicated thread.
    pub fn spawn_thread(config: WorkerConfig) -> Result<Self, ClientError> {
        let (stream, thread) = spawn_worker_thread(config)?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self::with_host(reader, writer, WorkerHost::Thread(thread)))
    }

    /// Start a worker subprocess and talk to it over its stdin/stdout.
    pub fn spawn_process(spawner: &dyn WorkerSpawner) -> Result<Self, ClientError> {
        let mut child = spawner.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        tracing::info!(pid = ?child.id(), "Worker process started");
        Ok(Self::with_host(stdout, stdin, WorkerHost::Process(child)))
    }

    fn with_host<R, W>(reader: R, writer: W, host: WorkerHost) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::default());
        let reader = FramedRead::new(reader, JsonCodec::<Response>::new());
        let reader_task = tokio::spawn(read_responses(reader, Arc::clone(&shared)));
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);

        Self {
            writer: AsyncMutex::new(Some(FramedWrite::new(writer, JsonCodec::new()))),
            shared,
            next_handle: AtomicU64::new(0),
            next_request: AtomicU64::new(0),
            images: StdMutex::new(HashMap::new()),
            configs: StdMutex::new(HashMap::new()),
            reader_task,
            host,
        }
    }

    /// Register an image with the worker, once per key.
    ///
    /// Returns whether the worker could load it. A failed registration is
    /// forgotten, so the next call for the same key tries again.
    pub async fn post_img(&self, image: &ImageRef) -> Result<bool, ClientError> {
        Ok(self.handle_for(image).await?.is_some())
    }

    /// Make `config` the current config for `image`, registering the image
    /// first if needed. Nothing is sent when the worker already has this
    /// config for the image, or when the image failed to register.
    pub async fn post_config(&self, image: &ImageRef, config: &ConfigRef) -> Result<(), ClientError> {
        config.config.validate()?;
        let Some(handle) = self.handle_for(image).await? else {
            tracing::debug!(key = %image.key, "Image not registered, skipping config");
            return Ok(());
        };
        drop(self.ensure_config(handle, config).await?);
        Ok(())
    }

    /// Extract box `idx` of `config` from `image`.
    ///
    /// `None` when the image failed to register, or when the box lies outside
    /// the image. An index past the template's last box kills the worker and
    /// fails with [`ClientError::WorkerFatal`].
    pub async fn extract(
        &self,
        image: &ImageRef,
        idx: usize,
        config: &ConfigRef,
    ) -> Result<Option<Blob>, ClientError> {
        config.config.validate()?;
        let Some(handle) = self.handle_for(image).await? else {
            tracing::debug!(key = %image.key, idx, "Image not registered, no extraction");
            return Ok(None);
        };

        // Hold the config slot until extract-box is on the wire so no other
        // config can be posted for this handle in between.
        let config_guard = self.ensure_config(handle, config).await?;
        let req_id = self.next_request_id();
        let rx = self
            .send(Request::ExtractBox {
                img_id: handle,
                req_id,
                idx,
            })
            .await?;
        drop(config_guard);

        match self.await_response(rx).await? {
            Response::ExtractBox { value, .. } => Ok(value),
            other => Err(unexpected(Action::ExtractBox, other)),
        }
    }

    /// Whether the worker channel is closed, after a fatal error or a worker exit.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Reason the worker gave for its fatal error, if any.
    pub fn fatal_reason(&self) -> Option<&str> {
        self.shared.fatal.get().map(String::as_str)
    }

    /// Number of requests still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    /// Close the channel and wait for the worker to exit.
    pub async fn close(mut self) -> Result<(), ClientError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }

        match std::mem::replace(&mut self.host, WorkerHost::External) {
            WorkerHost::Thread(thread) => {
                tokio::task::spawn_blocking(move || thread.join())
                    .await
                    .map_err(|e| ClientError::Transport(io::Error::other(e)))??;
            }
            WorkerHost::Process(mut child) => {
                let status = child.wait().await?;
                if !status.success() {
                    tracing::warn!(%status, "Worker process exited with failure");
                }
            }
            WorkerHost::External => {}
        }
        tracing::debug!("Client closed");
        Ok(())
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::new(self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    /// Resolve the handle for `image`, registering it on first use.
    /// Concurrent callers for the same key share one registration.
    async fn handle_for(&self, image: &ImageRef) -> Result<Option<ImageHandle>, ClientError> {
        let cell = Arc::clone(lock(&self.images).entry(image.key.clone()).or_default());
        let handle = *cell.get_or_try_init(|| self.register(image)).await?;

        if handle.is_none() {
            let mut images = lock(&self.images);
            if images
                .get(&image.key)
                .is_some_and(|current| Arc::ptr_eq(current, &cell))
            {
                images.remove(&image.key);
            }
        }
        Ok(handle)
    }

    async fn register(&self, image: &ImageRef) -> Result<Option<ImageHandle>, ClientError> {
        let handle = ImageHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let req_id = self.next_request_id();
        tracing::debug!(%handle, key = %image.key, "Registering image");

        let response = self
            .round_trip(Request::PostImg {
                img_id: handle,
                req_id,
                img: image.source.clone(),
            })
            .await?;
        match response {
            Response::PostImg { value: true, .. } => Ok(Some(handle)),
            Response::PostImg { value: false, .. } => {
                tracing::warn!(%handle, key = %image.key, "Worker failed to load image");
                Ok(None)
            }
            other => Err(unexpected(Action::PostImg, other)),
        }
    }

    /// Post `config` for `handle` unless it is already current. Returns the
    /// handle's config slot, still locked.
    async fn ensure_config(
        &self,
        handle: ImageHandle,
        config: &ConfigRef,
    ) -> Result<OwnedMutexGuard<Option<ConfigKey>>, ClientError> {
        let slot = Arc::clone(lock(&self.configs).entry(handle).or_default());
        let mut current = slot.lock_owned().await;
        if *current == Some(config.key) {
            tracing::trace!(%handle, "Config already cached");
            return Ok(current);
        }

        // Unknown until the worker acknowledges: a cancelled or failed post
        // may still have reached the worker.
        *current = None;
        let req_id = self.next_request_id();
        tracing::debug!(%handle, %req_id, "Posting config");
        let response = self
            .round_trip(Request::PostConfig {
                img_id: handle,
                req_id,
                config: config.config.clone(),
            })
            .await?;
        match response {
            Response::PostConfig { .. } => {
                *current = Some(config.key);
                Ok(current)
            }
            other => Err(unexpected(Action::PostConfig, other)),
        }
    }

    async fn round_trip(&self, request: Request) -> Result<Response, ClientError> {
        let rx = self.send(request).await?;
        self.await_response(rx).await
    }

    /// Register a pending entry and write the request.
    async fn send(&self, request: Request) -> Result<PendingRx, ClientError> {
        let key = (request.action(), request.req_id());
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(key, tx);

        // The reader sets `closed` before draining, so an entry inserted
        // after the drain is caught here.
        if self.is_closed() {
            self.shared.pending.remove(&key);
            return Err(self.shared.closed_error());
        }

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            self.shared.pending.remove(&key);
            return Err(ClientError::WorkerGone);
        };
        tracing::trace!(action = %key.0, req_id = %key.1, "Sending request");
        if let Err(e) = sink.send(request).await {
            self.shared.pending.remove(&key);
            if self.is_closed() {
                return Err(self.shared.closed_error());
            }
            return Err(ClientError::Transport(e));
        }
        Ok(rx)
    }

    async fn await_response(&self, rx: PendingRx) -> Result<Response, ClientError> {
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.closed_error()),
        }
    }
}

impl Drop for ExtractClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn unexpected(expected: Action, got: Response) -> ClientError {
    ClientError::Protocol(format!("expected {expected} response, got {got:?}"))
}

async fn read_responses<R: AsyncRead + Unpin>(
    mut reader: FramedRead<R, JsonCodec<Response>>,
    shared: Arc<Shared>,
) {
    loop {
        match reader.next().await {
            Some(Ok(Response::Fatal { req_id, reason })) => {
                tracing::error!(req_id = ?req_id.map(|id| id.get()), %reason, "Worker fatal");
                let _ = shared.fatal.set(reason);
                break;
            }
            Some(Ok(response)) => shared.resolve(response),
            Some(Err(e)) => {
                tracing::error!(error = %e, "Response channel error");
                break;
            }
            None => {
                tracing::info!("Worker closed the response channel");
                break;
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    shared.fail_all();
}
