//! # MOMENTUM Core
//!
//! Shared-memory streaming transport for moving large buffers between
//! processes on one host with minimal copying.
//!
//! - **Memory**: segments under the data path and the buffer pool inside them
//! - **Communication**: streams, subscriptions and the route table
//! - **Context**: per-process owner of streams and the dispatch loop
//! - **Registry**: administrative create/remove/list of streams and routes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use momentum_core::Context;
//! use std::time::Duration;
//!
//! # fn main() -> momentum_core::MomentumResult<()> {
//! let ctx = Context::new()?;
//! let stream = ctx.stream("mx://frames", 4096, 8, true)?;
//!
//! ctx.subscribe("mx://frames", |payload: &[u8]| {
//!     println!("got {} bytes", payload.len());
//! })?;
//!
//! if let Some(mut buffer) = stream.next(Duration::from_millis(100))? {
//!     buffer.write(b"hello")?;
//!     stream.send(buffer)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod communication;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod registry;

// Re-export commonly used types for easy access
pub use communication::{
    BufferState, Handler, HandlerPanic, Route, RouteTable, Stream, StreamOptions,
};
pub use config::MomentumConfig;
pub use context::{Context, ContextBuilder};
pub use error::{MomentumError, MomentumResult, ResourceKind};
pub use memory::{Backpressure, MAX_BUFFER_COUNT, MAX_CONSUMERS, STREAM_HEADER_SIZE};
pub use registry::{Registry, StreamInfo, StreamSpec};
