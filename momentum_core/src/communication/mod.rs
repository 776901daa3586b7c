//! # Communication layer for MOMENTUM
//!
//! - **Stream**: producer side of a named shared-memory stream
//! - **subscriber**: handlers and the per-context dispatch loop
//! - **RouteTable**: logical names for groups of streams

pub mod route;
pub mod stream;
pub mod subscriber;

pub use route::{Route, RouteTable};
pub use stream::{BufferState, Stream, StreamOptions};
pub use subscriber::{Handler, HandlerPanic};
