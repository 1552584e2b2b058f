//! IPC bridge between the extraction client and its worker.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Response) and wire identifiers
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: Worker hosting on a thread or in a subprocess

pub mod codec;
pub mod protocol;
pub mod transport;
