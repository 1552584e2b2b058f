//! gridcrop: offloaded grid-box extraction from images.
//!
//! A client registers images and grid configs with a background worker and
//! then asks for individual boxes by index. The worker decodes each image
//! once, reifies the normalized grid against the image size, and returns each
//! box cropped (with padding) and encoded.
//!
//! The worker runs on its own thread ([`ExtractClient::spawn_thread`]) or as
//! the `gridcrop-worker` subprocess ([`ExtractClient::spawn_process`]).

pub mod bridge;
pub mod client;
pub mod extract;
pub mod fetch;
pub mod geometry;
pub mod logging;
pub mod store;
pub mod worker;

pub use bridge::protocol::{Blob, ImageHandle, ImageSource, RequestId};
pub use bridge::transport::{BinarySpawner, SpawnError, WorkerSpawner};
pub use client::{ClientError, ConfigKey, ConfigRef, ExtractClient, ImageKey, ImageRef};
pub use extract::{ImageCodec, ImageCrateCodec, OutputFormat};
pub use geometry::{ExtractConfig, GeometryError, Paddings, Rectangle, Template, Vec2};
pub use logging::init_tracing;
pub use worker::{WorkerConfig, run_worker};

/// Crate version from Cargo.toml.
pub const GRIDCROP_VERSION: &str = env!("CARGO_PKG_VERSION");
