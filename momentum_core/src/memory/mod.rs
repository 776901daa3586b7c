//! # Shared memory layer for MOMENTUM
//!
//! - **ShmRegion**: one memory-mapped file per stream, with attach tracking
//! - **BufferPool**: the slot state machine living inside a stream segment
//! - **futex**: process-shared wait/wake on words inside a segment
//!
//! Everything above this module talks to shared memory through `BufferPool`.

pub mod buffer_pool;
pub mod futex;
pub mod platform;
pub mod shm_region;

pub use buffer_pool::{
    Backpressure, BufferPool, PoolConfig, PoolInfo, PoolShape, SlotState, MAX_BUFFER_COUNT,
    MAX_CONSUMERS, STREAM_HEADER_SIZE,
};
pub use platform::*;
pub use shm_region::ShmRegion;
