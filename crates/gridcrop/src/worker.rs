//! Worker event loop - the compute side of the channel.
//!
//! The client side (handle assignment, request routing) is in client.rs.
//!
//! Requests are handled one at a time in arrival order. Nothing here runs
//! concurrently, so the store needs no locking. The loop ends when the client
//! closes its end of the channel, or after a fatal response.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, JsonCodec};
use crate::bridge::protocol::{Blob, Request, Response};
use crate::extract::OutputFormat;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub output_format: OutputFormat,
    pub fetch_timeout: Duration,
    pub max_frame_length: usize,
}

impl Default for WorkerConfig {
    /// Reads `GRIDCROP_OUTPUT_FORMAT`, `GRIDCROP_JPEG_QUALITY` and
    /// `GRIDCROP_FETCH_TIMEOUT_SECS`, falling back to PNG and 30s.
    fn default() -> Self {
        let jpeg_quality = std::env::var("GRIDCROP_JPEG_QUALITY")
            .ok()
            .and_then(|s| s.parse::<u8>().ok())
            .unwrap_or(90);
        let output_format = match std::env::var("GRIDCROP_OUTPUT_FORMAT") {
            Ok(name) => OutputFormat::parse(&name, jpeg_quality).unwrap_or_else(|| {
                tracing::warn!(%name, "Unknown GRIDCROP_OUTPUT_FORMAT, using png");
                OutputFormat::Png
            }),
            Err(_) => OutputFormat::Png,
        };
        Self {
            output_format,
            fetch_timeout: Duration::from_secs(
                std::env::var("GRIDCROP_FETCH_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(30),
            ),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl WorkerConfig {
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

/// Run the worker over `reader`/`writer` with a store built from `config`.
pub async fn run_worker<R, W>(reader: R, writer: W, config: WorkerConfig) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let store = Store::from_config(&config);
    serve(reader, writer, store, config.max_frame_length).await
}

/// Run the event loop against an existing store.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    mut store: Store,
    max_frame_length: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(
        reader,
        JsonCodec::<Request>::with_max_frame_length(max_frame_length),
    );
    let mut writer = FramedWrite::new(
        writer,
        JsonCodec::<Response>::with_max_frame_length(max_frame_length),
    );

    tracing::info!("Worker ready");

    loop {
        match reader.next().await {
            Some(Ok(request)) => {
                let action = request.action();
                let req_id = request.req_id();
                tracing::trace!(%action, %req_id, img_id = %request.img_id(), "Request received");

                match handle_request(&mut store, request).await {
                    Ok(response) => writer.send(response).await?,
                    Err(e) => {
                        tracing::error!(%action, %req_id, error = %e, "Fatal request");
                        let _ = writer
                            .send(Response::Fatal {
                                req_id: Some(req_id),
                                reason: e.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Request channel error");
                let _ = writer
                    .send(Response::Fatal {
                        req_id: None,
                        reason: format!("request channel error: {}", e),
                    })
                    .await;
                break;
            }
            None => {
                tracing::info!("Request channel closed, worker exiting");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(store: &mut Store, request: Request) -> Result<Response, StoreError> {
    let response = match request {
        Request::PostImg {
            img_id,
            req_id,
            img,
        } => Response::PostImg {
            req_id,
            value: store.register_image(img_id, img).await,
        },
        Request::PostConfig {
            img_id,
            req_id,
            config,
        } => {
            store.register_config(img_id, config);
            Response::PostConfig { req_id, value: () }
        }
        Request::ExtractBox {
            img_id,
            req_id,
            idx,
        } => Response::ExtractBox {
            req_id,
            value: store.extract_box(img_id, idx)?.map(Blob::new),
        },
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ImageHandle, ImageSource, RequestId};
    use crate::geometry::{ExtractConfig, Rectangle, Template};
    use crate::store::tests::sheet_png;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct Harness {
        tx: FramedWrite<WriteHalf<DuplexStream>, JsonCodec<Request>>,
        rx: FramedRead<ReadHalf<DuplexStream>, JsonCodec<Response>>,
        worker: tokio::task::JoinHandle<io::Result<()>>,
    }

    fn start() -> Harness {
        let (client, worker) = tokio::io::duplex(64 * 1024);
        let (worker_rx, worker_tx) = tokio::io::split(worker);
        let worker = tokio::spawn(run_worker(
            worker_rx,
            worker_tx,
            WorkerConfig::default().with_output_format(OutputFormat::Png),
        ));
        let (rx, tx) = tokio::io::split(client);
        Harness {
            tx: FramedWrite::new(tx, JsonCodec::new()),
            rx: FramedRead::new(rx, JsonCodec::new()),
            worker,
        }
    }

    impl Harness {
        async fn call(&mut self, request: Request) -> Response {
            self.tx.send(request).await.unwrap();
            self.rx.next().await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn answers_each_action() {
        let mut h = start();
        let img_id = ImageHandle::new(0);

        let resp = h
            .call(Request::PostImg {
                img_id,
                req_id: RequestId::new(0),
                img: ImageSource::bytes(sheet_png(40, 40)),
            })
            .await;
        assert_eq!(
            resp,
            Response::PostImg {
                req_id: RequestId::new(0),
                value: true
            }
        );

        let resp = h
            .call(Request::PostConfig {
                img_id,
                req_id: RequestId::new(1),
                config: ExtractConfig::new(Template::uniform(2, 2), Rectangle::full()),
            })
            .await;
        assert_eq!(
            resp,
            Response::PostConfig {
                req_id: RequestId::new(1),
                value: ()
            }
        );

        let resp = h
            .call(Request::ExtractBox {
                img_id,
                req_id: RequestId::new(2),
                idx: 3,
            })
            .await;
        match resp {
            Response::ExtractBox { req_id, value } => {
                assert_eq!(req_id, RequestId::new(2));
                assert!(!value.unwrap().is_empty());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_image_is_false() {
        let mut h = start();
        let resp = h
            .call(Request::PostImg {
                img_id: ImageHandle::new(0),
                req_id: RequestId::new(5),
                img: ImageSource::bytes(b"nope".to_vec()),
            })
            .await;
        assert_eq!(
            resp,
            Response::PostImg {
                req_id: RequestId::new(5),
                value: false
            }
        );
    }

    #[tokio::test]
    async fn extract_without_state_is_null() {
        let mut h = start();
        let resp = h
            .call(Request::ExtractBox {
                img_id: ImageHandle::new(9),
                req_id: RequestId::new(1),
                idx: 0,
            })
            .await;
        assert_eq!(
            resp,
            Response::ExtractBox {
                req_id: RequestId::new(1),
                value: None
            }
        );
    }

    #[tokio::test]
    async fn out_of_range_index_is_fatal_and_stops_the_worker() {
        let mut h = start();
        let img_id = ImageHandle::new(0);
        h.call(Request::PostImg {
            img_id,
            req_id: RequestId::new(0),
            img: ImageSource::bytes(sheet_png(40, 40)),
        })
        .await;
        h.call(Request::PostConfig {
            img_id,
            req_id: RequestId::new(1),
            config: ExtractConfig::new(Template::uniform(2, 2), Rectangle::full()),
        })
        .await;

        let resp = h
            .call(Request::ExtractBox {
                img_id,
                req_id: RequestId::new(2),
                idx: 4,
            })
            .await;
        match resp {
            Response::Fatal { req_id, reason } => {
                assert_eq!(req_id, Some(RequestId::new(2)));
                assert!(reason.contains("out of range"), "{reason}");
            }
            other => panic!("unexpected response: {other:?}"),
        }

        h.worker.await.unwrap().unwrap();
        assert!(h.rx.next().await.is_none());
    }

    #[tokio::test]
    async fn exits_when_client_closes() {
        let mut h = start();
        h.tx.close().await.unwrap();
        h.worker.await.unwrap().unwrap();
        assert!(h.rx.next().await.is_none());
    }

    #[test]
    fn worker_config_builders() {
        let config = WorkerConfig::default()
            .with_output_format(OutputFormat::Jpeg { quality: 70 })
            .with_fetch_timeout(Duration::from_secs(2))
            .with_max_frame_length(1024);
        assert_eq!(config.output_format, OutputFormat::Jpeg { quality: 70 });
        assert_eq!(config.fetch_timeout, Duration::from_secs(2));
        assert_eq!(config.max_frame_length, 1024);
    }
}
