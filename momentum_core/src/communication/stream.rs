use crate::error::{MomentumError, MomentumResult};
use crate::memory::{stream_object_name, Backpressure, BufferPool, PoolConfig, PoolShape};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shape and policy of a stream, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub buffer_size: usize,
    pub buffer_count: usize,
    /// Deliver every publication (true) or only the newest one (false)
    pub broadcast: bool,
    pub backpressure: Backpressure,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            buffer_size: 65536,
            buffer_count: 16,
            broadcast: true,
            backpressure: Backpressure::Block,
        }
    }
}

impl StreamOptions {
    pub fn new(buffer_size: usize, buffer_count: usize) -> Self {
        Self {
            buffer_size,
            buffer_count,
            ..Self::default()
        }
    }

    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn latest_only(self) -> Self {
        self.broadcast(false)
    }

    pub fn backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub(crate) fn pool_config(&self) -> MomentumResult<PoolConfig> {
        Ok(PoolConfig {
            shape: PoolShape::new(self.buffer_size, self.buffer_count)?,
            broadcast: self.broadcast,
            backpressure: self.backpressure,
        })
    }

    fn from_pool(config: PoolConfig) -> Self {
        Self {
            buffer_size: config.shape.buffer_size,
            buffer_count: config.shape.buffer_count,
            broadcast: config.broadcast,
            backpressure: config.backpressure,
        }
    }
}

struct StreamInner {
    pool: BufferPool,
    name: String,
    /// Serializes producers sharing this handle
    producer: Mutex<()>,
    cancel: Arc<AtomicBool>,
}

/// Handle to a named shared-memory stream.
///
/// Cloning is cheap and shares the mapping; the segment is unmapped once the
/// last clone and the last outstanding [`BufferState`] are gone.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.inner.name)
            .field("options", &self.options())
            .finish_non_exhaustive()
    }
}

impl Stream {
    /// Create the stream or attach to it, validating the recorded shape
    pub(crate) fn open_or_create(
        data_path: &Path,
        name: &str,
        options: StreamOptions,
        cancel: Arc<AtomicBool>,
    ) -> MomentumResult<Self> {
        let name = stream_object_name(name)?;
        let pool = BufferPool::create_or_attach(data_path, &name, options.pool_config()?)?;
        Ok(Self::from_pool(pool, name, cancel))
    }

    /// Attach to an existing stream with whatever shape it was created with
    pub(crate) fn attach(
        data_path: &Path,
        name: &str,
        cancel: Arc<AtomicBool>,
    ) -> MomentumResult<Self> {
        let name = stream_object_name(name)?;
        let pool = BufferPool::attach(data_path, &name)?;
        Ok(Self::from_pool(pool, name, cancel))
    }

    fn from_pool(pool: BufferPool, name: String, cancel: Arc<AtomicBool>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                pool,
                name,
                producer: Mutex::new(()),
                cancel,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> StreamOptions {
        StreamOptions::from_pool(self.inner.pool.config())
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.pool.shape().buffer_size
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.pool.shape().buffer_count
    }

    pub fn is_broadcast(&self) -> bool {
        self.inner.pool.config().broadcast
    }

    /// Whether this handle created the segment
    pub fn is_creator(&self) -> bool {
        self.inner.pool.is_owner()
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    /// Acquire a free buffer to write into.
    ///
    /// Waits up to `timeout` for a slot; `Ok(None)` means none became free in
    /// time. Returns `Err(Cancelled)` once the owning context is torn down.
    pub fn next(&self, timeout: Duration) -> MomentumResult<Option<BufferState>> {
        let deadline = Instant::now() + timeout;
        let Some(_guard) = self.inner.producer.try_lock_until(deadline) else {
            return Ok(None);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let slot = self.inner.pool.acquire_free_slot(remaining, &self.inner.cancel)?;
        Ok(slot.map(|index| BufferState {
            stream: self.inner.clone(),
            index,
            len: 0,
            sent: false,
        }))
    }

    /// `next` without waiting
    pub fn try_next(&self) -> MomentumResult<Option<BufferState>> {
        self.next(Duration::ZERO)
    }

    /// Publish a buffer obtained from this stream's `next`.
    ///
    /// Returns the sequence number assigned to the publication.
    pub fn send(&self, mut buffer: BufferState) -> MomentumResult<u64> {
        if !Arc::ptr_eq(&self.inner, &buffer.stream) {
            return Err(MomentumError::invalid_input(format!(
                "buffer belongs to stream '{}', not '{}'",
                buffer.stream.name, self.inner.name
            )));
        }
        let seq = self.inner.pool.mark_ready(buffer.index, buffer.len)?;
        buffer.sent = true;
        Ok(seq)
    }

    /// Acknowledge slot `index` on behalf of `consumer_id`
    pub fn release(&self, index: usize, consumer_id: usize) {
        self.inner.pool.mark_consumed(index, consumer_id);
    }
}

/// Exclusive handle to one slot being written.
///
/// Dropping it without passing it to [`Stream::send`] returns the slot to the
/// pool unpublished.
pub struct BufferState {
    stream: Arc<StreamInner>,
    index: usize,
    len: usize,
    sent: bool,
}

impl std::fmt::Debug for BufferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferState")
            .field("stream", &self.stream.name)
            .field("slot", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

impl BufferState {
    pub fn slot_index(&self) -> usize {
        self.index
    }

    /// Writable size of the buffer
    pub fn capacity(&self) -> usize {
        self.stream.pool.shape().buffer_size
    }

    /// Payload length that `send` will publish
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole slot, `capacity()` bytes
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: the slot is Writing and exclusively owned by this handle
        unsafe {
            std::slice::from_raw_parts_mut(
                self.stream.pool.slot_data_ptr(self.index),
                self.capacity(),
            )
        }
    }

    /// The payload written so far (`len()` bytes)
    pub fn data(&self) -> &[u8] {
        // SAFETY: as in data_mut; len <= capacity
        unsafe { std::slice::from_raw_parts(self.stream.pool.slot_data_ptr(self.index), self.len) }
    }

    /// Set how many bytes of the buffer form the payload
    pub fn set_data_size(&mut self, len: usize) -> MomentumResult<()> {
        if len > self.capacity() {
            return Err(MomentumError::invalid_input(format!(
                "data size {} exceeds buffer_size {} of stream '{}'",
                len,
                self.capacity(),
                self.stream.name
            )));
        }
        self.len = len;
        Ok(())
    }

    /// Copy `bytes` into the buffer and make them the payload
    pub fn write(&mut self, bytes: &[u8]) -> MomentumResult<()> {
        self.set_data_size(bytes.len())?;
        self.data_mut()[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl Drop for BufferState {
    fn drop(&mut self) {
        if !self.sent {
            self.stream.pool.abandon(self.index);
        }
    }
}
