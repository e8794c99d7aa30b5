// src/lib.rs
//! Etude: a static-file HTTP/1.1 server on raw sockets.
//!
//! One reactor thread owns every socket and drives an edge-triggered,
//! one-shot epoll set. Connections that have finished reading are moved to a
//! fixed worker pool, which parses the request, resolves it under the document
//! root and stages the response. The reactor then sends the staged header
//! block and the memory-mapped file in a single vectored write.

#[cfg(not(target_os = "linux"))]
compile_error!("etude-core requires Linux (epoll, accept4, MSG_NOSIGNAL)");

pub mod config;
pub mod conn;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod response;
pub mod server;
pub mod slab;
pub mod syscalls;

// Re-exports for users
pub use config::Config;
pub use error::{EtudeError, EtudeResult};
pub use logging::{init_logging, init_logging_json, init_logging_with_level};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::Server;
