//! Buffer pool laid out inside one stream segment.
//!
//! # Memory Layout
//!
//! ```text
//! +----------------------------------------------------------------+
//! | POOL HEADER (384 bytes)                                        |
//! |   magic "MOMENTUM", version, flags, buffer_size, buffer_count  |
//! |   init word, write sequence, round-robin cursor                |
//! |   free/ready futex words + waiter counts                       |
//! |   consumer bitmap, consumer pid table (64 entries)             |
//! +----------------------------------------------------------------+
//! | SLOT TABLE (MAX_BUFFER_COUNT entries, 64 bytes each)           |
//! |   state word, owner pid, length, sequence, pending bitmap      |
//! +----------------------------------------------------------------+
//! | DATA (buffer_count * buffer_size bytes)                        |
//! +----------------------------------------------------------------+
//! ```
//!
//! The header and slot table always have the same size, so a stream occupies
//! exactly `STREAM_HEADER_SIZE + buffer_size * buffer_count` bytes.
//!
//! # Slot state machine
//!
//! Each slot has one atomic state word: the low 8 bits hold the phase
//! (Free, Writing, Ready) and the upper 24 bits count active readers. A Ready
//! slot with readers is reported as [`SlotState::Reading`].
//!
//! ```text
//! Free --acquire (CAS)--> Writing --mark_ready--> Ready <--begin/end_read--> Reading
//!   ^                        |                      |
//!   +------ abandon ---------+                      |
//!   +--- last pending consumer acked, no readers ---+
//! ```
//!
//! Every consumer registered on the stream owns one bit. `mark_ready`
//! snapshots the registered consumers into the slot's pending bitmap; a slot
//! only returns to Free once that bitmap is empty and no reader is active.
//! There is no pool-wide lock: producers and consumers on different slots never
//! contend.

use super::futex::{futex_wait, futex_wake_all};
use super::shm_region::ShmRegion;
use crate::error::{MomentumError, MomentumResult};
use memmap2::MmapOptions;
use std::fs::File;
use std::mem;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Magic bytes identifying a MOMENTUM stream segment
pub const POOL_MAGIC: [u8; 8] = *b"MOMENTUM";

/// Layout version recorded in every header
pub const POOL_VERSION: u32 = 1;

/// Upper bound on `buffer_count`; the slot table is sized for it
pub const MAX_BUFFER_COUNT: usize = 256;

/// Upper bound on consumers attached to one stream (one bit each)
pub const MAX_CONSUMERS: usize = 64;

/// Bytes preceding the data region of every stream
pub const STREAM_HEADER_SIZE: usize =
    mem::size_of::<PoolHeader>() + MAX_BUFFER_COUNT * mem::size_of::<SlotMeta>();

const FLAG_BROADCAST: u32 = 1 << 0;
const FLAG_DROP_OLDEST: u32 = 1 << 1;

const INIT_DONE: u32 = 1;

/// How long an attacher waits for the creator to finish initializing the header
const INIT_WAIT: Duration = Duration::from_secs(1);

/// Longest single futex sleep; bounds how late cancellation and reaping are noticed
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

const PHASE_FREE: u32 = 0;
const PHASE_WRITING: u32 = 1;
const PHASE_READY: u32 = 2;
const PHASE_MASK: u32 = 0xff;
const READER_SHIFT: u32 = 8;
const MAX_READERS: u32 = u32::MAX >> READER_SHIFT;

/// Consumer pid table entry while a reaper tears the consumer down
const PID_RECLAIMING: u32 = u32::MAX;

#[inline]
const fn pack(phase: u32, readers: u32) -> u32 {
    (readers << READER_SHIFT) | phase
}

#[inline]
const fn phase_of(word: u32) -> u32 {
    word & PHASE_MASK
}

#[inline]
const fn readers_of(word: u32) -> u32 {
    word >> READER_SHIFT
}

/// Observable state of one buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Writing,
    Ready,
    Reading,
}

impl SlotState {
    fn from_word(word: u32) -> Self {
        match phase_of(word) {
            PHASE_FREE => SlotState::Free,
            PHASE_READY if readers_of(word) > 0 => SlotState::Reading,
            PHASE_READY => SlotState::Ready,
            // Writing, or a phase this build does not know: never hand it out
            _ => SlotState::Writing,
        }
    }
}

/// What a producer does when every slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// Wait (up to the caller's timeout) for a consumer to release a slot
    #[default]
    Block,
    /// Reclaim the oldest Ready slot nobody is currently reading
    DropOldest,
}

/// Immutable geometry of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShape {
    pub buffer_size: usize,
    pub buffer_count: usize,
}

impl PoolShape {
    pub fn new(buffer_size: usize, buffer_count: usize) -> MomentumResult<Self> {
        if buffer_size == 0 {
            return Err(MomentumError::invalid_input("buffer_size must be at least 1"));
        }
        if !(1..=MAX_BUFFER_COUNT).contains(&buffer_count) {
            return Err(MomentumError::invalid_input(format!(
                "buffer_count {} out of range (1-{})",
                buffer_count, MAX_BUFFER_COUNT
            )));
        }
        let shape = Self {
            buffer_size,
            buffer_count,
        };
        shape.total_size()?;
        Ok(shape)
    }

    /// Bytes used by the data slots
    pub fn data_size(&self) -> MomentumResult<usize> {
        self.buffer_size
            .checked_mul(self.buffer_count)
            .ok_or_else(|| MomentumError::invalid_input("Integer overflow calculating data size"))
    }

    /// Bytes of the whole segment, header included
    pub fn total_size(&self) -> MomentumResult<usize> {
        self.data_size()?
            .checked_add(STREAM_HEADER_SIZE)
            .ok_or_else(|| MomentumError::invalid_input("Integer overflow calculating total size"))
    }
}

/// Creation-time parameters of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub shape: PoolShape,
    pub broadcast: bool,
    pub backpressure: Backpressure,
}

impl PoolConfig {
    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.broadcast {
            flags |= FLAG_BROADCAST;
        }
        if self.backpressure == Backpressure::DropOldest {
            flags |= FLAG_DROP_OLDEST;
        }
        flags
    }

    fn from_header(header: &PoolHeader) -> Self {
        Self {
            shape: PoolShape {
                buffer_size: header.buffer_size as usize,
                buffer_count: header.buffer_count as usize,
            },
            broadcast: header.flags & FLAG_BROADCAST != 0,
            backpressure: if header.flags & FLAG_DROP_OLDEST != 0 {
                Backpressure::DropOldest
            } else {
                Backpressure::Block
            },
        }
    }
}

/// Pool header at the start of the segment
#[repr(C, align(64))]
struct PoolHeader {
    magic: [u8; 8],
    version: u32,
    flags: u32,
    buffer_size: u64,
    buffer_count: u32,
    /// Set to INIT_DONE (release) once the creator has written the fields above
    initialized: AtomicU32,
    /// Last sequence number handed out by `mark_ready`
    write_seq: AtomicU64,
    /// Index of the slot most recently handed to a producer
    next_slot: AtomicU32,
    /// Bumped on every slot release; producers wait on it
    free_signal: AtomicU32,
    free_waiters: AtomicU32,
    /// Bumped on every publish; dispatchers wait on it
    ready_signal: AtomicU32,
    ready_waiters: AtomicU32,
    _pad0: u32,
    /// Bit per consumer that receives new sends
    consumer_mask: AtomicU64,
    _pad1: [u8; 56],
    /// Owning pid per consumer id, 0 when the id is unused
    consumer_pids: [AtomicU32; MAX_CONSUMERS],
}

const _: () = assert!(mem::size_of::<PoolHeader>() == 384);

/// Per-slot metadata (one cache line)
#[repr(C, align(64))]
struct SlotMeta {
    state: AtomicU32,
    /// Producer pid while Writing, 0 otherwise
    owner_pid: AtomicU32,
    len: AtomicU64,
    sequence: AtomicU64,
    /// Consumers that still have to acknowledge this publication
    pending: AtomicU64,
    _pad: [u8; 32],
}

const _: () = assert!(mem::size_of::<SlotMeta>() == 64);
const _: () = assert!(STREAM_HEADER_SIZE % 64 == 0);

/// Shape and flags read from a segment without attaching to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInfo {
    pub config: PoolConfig,
    pub total_memory: usize,
}

/// A view of the buffer pool inside a mapped stream segment
pub struct BufferPool {
    region: ShmRegion,
    header: NonNull<PoolHeader>,
    slots: NonNull<SlotMeta>,
    data: NonNull<u8>,
    config: PoolConfig,
    pid: u32,
}

// SAFETY: all shared state behind the pointers is accessed through atomics or
// through slots exclusively owned by the caller (Writing) or pinned by a
// reader count (Reading).
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.region.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BufferPool {
    /// Create the pool `name` under `dir`, or attach to it if it already exists.
    ///
    /// Attaching validates the recorded shape and broadcast flag against
    /// `config` and fails with `ConfigMismatch` on any difference.
    pub fn create_or_attach(dir: &Path, name: &str, config: PoolConfig) -> MomentumResult<Self> {
        let total_size = config.shape.total_size()?;
        let region = ShmRegion::open_or_create(dir, name, total_size)?;

        if region.is_owner() {
            let pool = Self::from_region(region, config)?;
            pool.initialize();
            log::info!(
                "POOL: Created stream '{}' ({} x {} bytes, broadcast: {}, backpressure: {:?})",
                name,
                config.shape.buffer_count,
                config.shape.buffer_size,
                config.broadcast,
                config.backpressure
            );
            return Ok(pool);
        }

        let recorded = Self::wait_initialized(&region)?;
        if recorded.shape != config.shape {
            return Err(MomentumError::mismatch(
                name,
                format!(
                    "recorded {} x {} bytes, requested {} x {} bytes",
                    recorded.shape.buffer_count,
                    recorded.shape.buffer_size,
                    config.shape.buffer_count,
                    config.shape.buffer_size
                ),
            ));
        }
        if recorded.broadcast != config.broadcast {
            return Err(MomentumError::mismatch(
                name,
                format!(
                    "recorded broadcast={}, requested broadcast={}",
                    recorded.broadcast, config.broadcast
                ),
            ));
        }
        // Backpressure is a producer-side policy; the recorded one wins
        Self::from_region(region, recorded)
    }

    /// Attach to an existing pool, adopting whatever shape it was created with
    pub fn attach(dir: &Path, name: &str) -> MomentumResult<Self> {
        let region = ShmRegion::open(dir, name)?;
        let recorded = Self::wait_initialized(&region)?;
        Self::from_region(region, recorded)
    }

    /// Read a segment's shape without attaching (no lock is taken)
    pub fn inspect(path: &Path) -> MomentumResult<PoolInfo> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = File::open(path)?;
        if (file.metadata()?.len() as usize) < STREAM_HEADER_SIZE {
            return Err(MomentumError::invalid_segment(name, "file smaller than header"));
        }

        // SAFETY: read-only mapping of the header; only read through atomics
        // or after observing the init word
        let mmap = unsafe { MmapOptions::new().len(mem::size_of::<PoolHeader>()).map(&file)? };
        let header = unsafe { &*(mmap.as_ptr() as *const PoolHeader) };
        let config = read_header(header, &name)?;
        Ok(PoolInfo {
            config,
            total_memory: config.shape.total_size()?,
        })
    }

    fn wait_initialized(region: &ShmRegion) -> MomentumResult<PoolConfig> {
        if region.size() < STREAM_HEADER_SIZE {
            return Err(MomentumError::invalid_segment(
                region.name(),
                format!("segment is {} bytes, header needs {}", region.size(), STREAM_HEADER_SIZE),
            ));
        }
        // SAFETY: size checked above; mmap base is page aligned
        let header = unsafe { &*(region.as_ptr() as *const PoolHeader) };

        let deadline = Instant::now() + INIT_WAIT;
        while header.initialized.load(Ordering::Acquire) != INIT_DONE {
            if Instant::now() >= deadline {
                return Err(MomentumError::invalid_segment(
                    region.name(),
                    "header was never initialized",
                ));
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let config = read_header(header, region.name())?;
        let expected = config.shape.total_size()?;
        if region.size() < expected {
            return Err(MomentumError::invalid_segment(
                region.name(),
                format!("segment is {} bytes, shape needs {}", region.size(), expected),
            ));
        }
        Ok(config)
    }

    fn from_region(region: ShmRegion, config: PoolConfig) -> MomentumResult<Self> {
        let total = config.shape.total_size()?;
        if region.size() < total {
            return Err(MomentumError::invalid_segment(
                region.name(),
                "segment too small for its shape",
            ));
        }

        let base = region.base_ptr();
        // SAFETY: base is non-null (mmap) and every offset is within `total`
        let (header, slots, data) = unsafe {
            (
                NonNull::new_unchecked(base as *mut PoolHeader),
                NonNull::new_unchecked(base.add(mem::size_of::<PoolHeader>()) as *mut SlotMeta),
                NonNull::new_unchecked(base.add(STREAM_HEADER_SIZE)),
            )
        };

        Ok(Self {
            region,
            header,
            slots,
            data,
            config,
            pid: std::process::id(),
        })
    }

    /// Write the header of a freshly created (all-zero) segment
    fn initialize(&self) {
        let h = self.header.as_ptr();
        // SAFETY: we created the segment and nobody reads the plain fields
        // before `initialized` is published below.
        unsafe {
            std::ptr::addr_of_mut!((*h).magic).write(POOL_MAGIC);
            std::ptr::addr_of_mut!((*h).version).write(POOL_VERSION);
            std::ptr::addr_of_mut!((*h).flags).write(self.config.flags());
            std::ptr::addr_of_mut!((*h).buffer_size).write(self.config.shape.buffer_size as u64);
            std::ptr::addr_of_mut!((*h).buffer_count).write(self.config.shape.buffer_count as u32);
        }
        let header = self.header();
        // First acquire starts at slot 0
        header
            .next_slot
            .store((self.config.shape.buffer_count - 1) as u32, Ordering::Relaxed);
        header.initialized.store(INIT_DONE, Ordering::Release);
    }

    #[inline]
    fn header(&self) -> &PoolHeader {
        // SAFETY: validated in from_region; lives as long as the region
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn slot(&self, index: usize) -> &SlotMeta {
        debug_assert!(index < self.config.shape.buffer_count);
        // SAFETY: index < buffer_count <= MAX_BUFFER_COUNT
        unsafe { &*self.slots.as_ptr().add(index) }
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    pub fn shape(&self) -> PoolShape {
        self.config.shape
    }

    pub fn is_owner(&self) -> bool {
        self.region.is_owner()
    }

    /// Pointer to the first byte of slot `index`.
    ///
    /// # Safety
    ///
    /// `index` must be below `buffer_count`, and the caller must own the slot
    /// (Writing) or hold a read on it (Reading) while using the pointer.
    pub unsafe fn slot_data_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.config.shape.buffer_count);
        self.data.as_ptr().add(index * self.config.shape.buffer_size)
    }

    pub fn slot_state(&self, index: usize) -> SlotState {
        SlotState::from_word(self.slot(index).state.load(Ordering::Acquire))
    }

    pub fn slot_len(&self, index: usize) -> usize {
        self.slot(index).len.load(Ordering::Acquire) as usize
    }

    pub fn slot_sequence(&self, index: usize) -> u64 {
        self.slot(index).sequence.load(Ordering::Acquire)
    }

    /// Bitmap of consumers that have not acknowledged slot `index` yet
    pub fn pending_consumers(&self, index: usize) -> u64 {
        self.slot(index).pending.load(Ordering::Acquire)
    }

    /// Number of consumers that will be snapshotted by the next send
    pub fn consumer_count(&self) -> u32 {
        self.header().consumer_mask.load(Ordering::Acquire).count_ones()
    }

    /// Last sequence number assigned on this stream
    pub fn last_sequence(&self) -> u64 {
        self.header().write_seq.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // Producer side
    // ---------------------------------------------------------------------

    /// Try once to move a Free slot to Writing.
    ///
    /// Scans round-robin starting after the last handed-out index so slots are
    /// reused in roughly FIFO order.
    pub fn try_acquire(&self) -> Option<usize> {
        let count = self.config.shape.buffer_count;
        let header = self.header();
        let start = (header.next_slot.load(Ordering::Relaxed) as usize + 1) % count;

        for step in 0..count {
            let index = (start + step) % count;
            let slot = self.slot(index);
            if slot
                .state
                .compare_exchange(
                    pack(PHASE_FREE, 0),
                    pack(PHASE_WRITING, 0),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.claim(index);
                return Some(index);
            }
        }

        if self.config.backpressure == Backpressure::DropOldest {
            return self.steal_oldest_ready();
        }
        None
    }

    fn claim(&self, index: usize) {
        let slot = self.slot(index);
        slot.owner_pid.store(self.pid, Ordering::Relaxed);
        slot.len.store(0, Ordering::Relaxed);
        self.header()
            .next_slot
            .store(index as u32, Ordering::Relaxed);
    }

    /// Reclaim the Ready slot with the lowest sequence that nobody is reading
    fn steal_oldest_ready(&self) -> Option<usize> {
        for _ in 0..self.config.shape.buffer_count {
            let mut oldest: Option<(u64, usize)> = None;
            for index in 0..self.config.shape.buffer_count {
                let slot = self.slot(index);
                if slot.state.load(Ordering::Acquire) == pack(PHASE_READY, 0) {
                    let seq = slot.sequence.load(Ordering::Acquire);
                    if oldest.map_or(true, |(s, _)| seq < s) {
                        oldest = Some((seq, index));
                    }
                }
            }

            let (seq, index) = oldest?;
            if self
                .slot(index)
                .state
                .compare_exchange(
                    pack(PHASE_READY, 0),
                    pack(PHASE_WRITING, 0),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                log::debug!(
                    "POOL: '{}' dropped unconsumed sequence {} from slot {}",
                    self.name(),
                    seq,
                    index
                );
                self.claim(index);
                return Some(index);
            }
        }
        None
    }

    /// Acquire a Free slot, waiting up to `timeout` for one to be released.
    ///
    /// Returns `Ok(None)` on timeout and `Err(Cancelled)` as soon as `cancel`
    /// is set.
    pub fn acquire_free_slot(
        &self,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> MomentumResult<Option<usize>> {
        let header = self.header();
        let deadline = Instant::now() + timeout;
        let mut reaped = false;

        loop {
            if cancel.load(Ordering::Acquire) {
                return Err(MomentumError::Cancelled);
            }

            let seen = header.free_signal.load(Ordering::SeqCst);
            if let Some(index) = self.try_acquire() {
                return Ok(Some(index));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // Slots pinned by crashed processes are the one thing waiting won't fix
            if !reaped {
                reaped = true;
                if self.reap_dead_peers() > 0 {
                    continue;
                }
            }

            header.free_waiters.fetch_add(1, Ordering::SeqCst);
            futex_wait(
                &header.free_signal,
                seen,
                Some((deadline - now).min(MAX_WAIT_SLICE)),
            );
            header.free_waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Publish slot `index` with `len` payload bytes (Writing -> Ready).
    ///
    /// The pending bitmap is a snapshot of the consumers registered right now;
    /// consumers that register later never see this publication. With nobody
    /// registered the slot goes straight back to Free. Returns the sequence
    /// number assigned to the publication.
    pub fn mark_ready(&self, index: usize, len: usize) -> MomentumResult<u64> {
        if len > self.config.shape.buffer_size {
            return Err(MomentumError::invalid_input(format!(
                "payload length {} exceeds buffer_size {}",
                len, self.config.shape.buffer_size
            )));
        }

        let header = self.header();
        let slot = self.slot(index);
        if slot.state.load(Ordering::Acquire) != pack(PHASE_WRITING, 0) {
            return Err(MomentumError::Internal(format!(
                "slot {} of '{}' is not being written",
                index,
                self.name()
            )));
        }

        slot.len.store(len as u64, Ordering::Relaxed);
        let seq = header.write_seq.fetch_add(1, Ordering::AcqRel) + 1;
        slot.sequence.store(seq, Ordering::Relaxed);
        let consumers = header.consumer_mask.load(Ordering::Acquire);
        slot.pending.store(consumers, Ordering::Relaxed);
        slot.owner_pid.store(0, Ordering::Relaxed);

        let next_phase = if consumers == 0 { PHASE_FREE } else { PHASE_READY };
        slot.state
            .compare_exchange(
                pack(PHASE_WRITING, 0),
                pack(next_phase, 0),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .map_err(|_| {
                MomentumError::Internal(format!(
                    "slot {} of '{}' was reclaimed while being written",
                    index,
                    self.name()
                ))
            })?;

        if consumers == 0 {
            self.signal_free();
        } else {
            self.signal_ready();
        }
        Ok(seq)
    }

    /// Give back a slot acquired for writing without publishing it
    pub fn abandon(&self, index: usize) {
        let slot = self.slot(index);
        slot.owner_pid.store(0, Ordering::Relaxed);
        if slot
            .state
            .compare_exchange(
                pack(PHASE_WRITING, 0),
                pack(PHASE_FREE, 0),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            self.signal_free();
        }
    }

    // ---------------------------------------------------------------------
    // Consumer side
    // ---------------------------------------------------------------------

    /// Claim a consumer id for `pid`; sends after this call include it
    pub fn register_consumer(&self, pid: u32) -> MomentumResult<usize> {
        let header = self.header();
        for id in 0..MAX_CONSUMERS {
            if header.consumer_pids[id]
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Bits left behind by a previous owner of this id
                self.clear_pending(id);
                header
                    .consumer_mask
                    .fetch_or(1u64 << id, Ordering::AcqRel);
                log::debug!("POOL: '{}' registered consumer {} (pid {})", self.name(), id, pid);
                return Ok(id);
            }
        }
        Err(MomentumError::busy(format!(
            "stream '{}' already has {} consumers",
            self.name(),
            MAX_CONSUMERS
        )))
    }

    /// Release a consumer id and every acknowledgement it still owes
    pub fn unregister_consumer(&self, consumer_id: usize) {
        let header = self.header();
        header
            .consumer_mask
            .fetch_and(!(1u64 << consumer_id), Ordering::AcqRel);
        self.clear_pending(consumer_id);
        header.consumer_pids[consumer_id].store(0, Ordering::Release);
        log::debug!("POOL: '{}' unregistered consumer {}", self.name(), consumer_id);
    }

    fn clear_pending(&self, consumer_id: usize) {
        for index in 0..self.config.shape.buffer_count {
            self.mark_consumed(index, consumer_id);
        }
    }

    /// True if slot `index` holds a publication `consumer_id` has not acknowledged
    pub fn is_consumable(&self, index: usize, consumer_id: usize) -> bool {
        let slot = self.slot(index);
        phase_of(slot.state.load(Ordering::Acquire)) == PHASE_READY
            && slot.pending.load(Ordering::Acquire) & (1u64 << consumer_id) != 0
    }

    /// Consumable slots for `consumer_id` as `(sequence, index)`, oldest first
    pub fn consumable_slots(&self, consumer_id: usize) -> Vec<(u64, usize)> {
        let mut ready: Vec<(u64, usize)> = (0..self.config.shape.buffer_count)
            .filter(|&index| self.is_consumable(index, consumer_id))
            .map(|index| (self.slot_sequence(index), index))
            .collect();
        ready.sort_unstable();
        ready
    }

    /// Pin slot `index` for reading (Ready -> Reading).
    ///
    /// Fails if the slot is no longer Ready, was republished with a different
    /// sequence, or no longer expects `consumer_id`.
    pub fn begin_read(&self, index: usize, consumer_id: usize, expected_seq: u64) -> bool {
        if !self.pin(index) {
            return false;
        }
        let slot = self.slot(index);
        if slot.sequence.load(Ordering::Acquire) != expected_seq
            || slot.pending.load(Ordering::Acquire) & (1u64 << consumer_id) == 0
        {
            self.end_read(index);
            return false;
        }
        true
    }

    /// Add a reader to a Ready slot so it can be neither freed nor stolen
    fn pin(&self, index: usize) -> bool {
        let slot = self.slot(index);
        let mut word = slot.state.load(Ordering::Acquire);
        loop {
            if phase_of(word) != PHASE_READY || readers_of(word) == MAX_READERS {
                return false;
            }
            match slot.state.compare_exchange_weak(
                word,
                pack(PHASE_READY, readers_of(word) + 1),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }

    /// Acknowledge publication `expected_seq` in slot `index` without reading it.
    ///
    /// Does nothing and returns false if the slot has since been republished,
    /// so a stale index never clears a bit on a newer publication.
    pub fn acknowledge(&self, index: usize, consumer_id: usize, expected_seq: u64) -> bool {
        if !self.begin_read(index, consumer_id, expected_seq) {
            return false;
        }
        self.mark_consumed(index, consumer_id);
        self.end_read(index);
        true
    }

    /// Drop a read pin taken with `begin_read`
    pub fn end_read(&self, index: usize) {
        let slot = self.slot(index);
        let mut word = slot.state.load(Ordering::Acquire);
        loop {
            debug_assert!(phase_of(word) == PHASE_READY && readers_of(word) > 0);
            let remaining = readers_of(word).saturating_sub(1);
            match slot.state.compare_exchange_weak(
                word,
                pack(PHASE_READY, remaining),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if remaining == 0 && slot.pending.load(Ordering::Acquire) == 0 {
                        self.try_free(index);
                    }
                    return;
                }
                Err(current) => word = current,
            }
        }
    }

    /// Record that `consumer_id` is done with slot `index`.
    ///
    /// The slot returns to Free once the last pending consumer acknowledged
    /// and no read pin remains.
    pub fn mark_consumed(&self, index: usize, consumer_id: usize) {
        let bit = 1u64 << consumer_id;
        let slot = self.slot(index);
        let previous = slot.pending.fetch_and(!bit, Ordering::AcqRel);
        if previous & bit != 0 && previous & !bit == 0 {
            self.try_free(index);
        }
    }

    fn try_free(&self, index: usize) {
        if self
            .slot(index)
            .state
            .compare_exchange(
                pack(PHASE_READY, 0),
                pack(PHASE_FREE, 0),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            self.signal_free();
        }
    }

    // ---------------------------------------------------------------------
    // Signalling
    // ---------------------------------------------------------------------

    fn signal_free(&self) {
        let header = self.header();
        header.free_signal.fetch_add(1, Ordering::SeqCst);
        if header.free_waiters.load(Ordering::SeqCst) > 0 {
            futex_wake_all(&header.free_signal);
        }
    }

    fn signal_ready(&self) {
        let header = self.header();
        header.ready_signal.fetch_add(1, Ordering::SeqCst);
        if header.ready_waiters.load(Ordering::SeqCst) > 0 {
            futex_wake_all(&header.ready_signal);
        }
    }

    /// Current value of the publish counter, for use with `wait_ready`
    pub fn ready_token(&self) -> u32 {
        self.header().ready_signal.load(Ordering::SeqCst)
    }

    /// Block until something is published after `token` was read, or `timeout`
    pub fn wait_ready(&self, token: u32, timeout: Duration) {
        let header = self.header();
        header.ready_waiters.fetch_add(1, Ordering::SeqCst);
        futex_wait(&header.ready_signal, token, Some(timeout.min(MAX_WAIT_SLICE)));
        header.ready_waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Kick every waiter on this stream, in every process, so it re-checks its state
    pub fn wake_all(&self) {
        let header = self.header();
        header.free_signal.fetch_add(1, Ordering::SeqCst);
        header.ready_signal.fetch_add(1, Ordering::SeqCst);
        futex_wake_all(&header.free_signal);
        futex_wake_all(&header.ready_signal);
    }

    // ---------------------------------------------------------------------
    // Crash recovery
    // ---------------------------------------------------------------------

    /// Release consumers and writing slots owned by processes that no longer exist.
    ///
    /// Returns how many consumers and slots were reclaimed.
    pub fn reap_dead_peers(&self) -> usize {
        let header = self.header();
        let mut reclaimed = 0;

        for id in 0..MAX_CONSUMERS {
            let pid = header.consumer_pids[id].load(Ordering::Acquire);
            if pid == 0 || pid == PID_RECLAIMING || pid == self.pid || process_alive(pid) {
                continue;
            }
            if header.consumer_pids[id]
                .compare_exchange(pid, PID_RECLAIMING, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                log::warn!(
                    "POOL: '{}' reaping consumer {} of dead process {}",
                    self.name(),
                    id,
                    pid
                );
                self.unregister_consumer(id);
                reclaimed += 1;
            }
        }

        reclaimed += self.clear_orphaned_pending();

        for index in 0..self.config.shape.buffer_count {
            let slot = self.slot(index);
            let pid = slot.owner_pid.load(Ordering::Acquire);
            if pid == 0 || pid == self.pid || process_alive(pid) {
                continue;
            }
            if slot
                .state
                .compare_exchange(
                    pack(PHASE_WRITING, 0),
                    pack(PHASE_FREE, 0),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                log::warn!(
                    "POOL: '{}' reclaimed slot {} held by dead process {}",
                    self.name(),
                    index,
                    pid
                );
                slot.owner_pid.store(0, Ordering::Release);
                self.signal_free();
                reclaimed += 1;
            }
        }

        reclaimed
    }

    /// Drop pending bits of consumers that are no longer registered.
    ///
    /// A consumer that unregisters while `mark_ready` is between reading the
    /// mask and storing it leaves its bit on the new publication. Registration
    /// clears pending bits before it sets its mask bit, so any pending bit
    /// outside the mask is owed by nobody.
    fn clear_orphaned_pending(&self) -> usize {
        let header = self.header();
        let mut cleared = 0;
        for index in 0..self.config.shape.buffer_count {
            // Pinned, the slot cannot be freed and republished under us
            if !self.pin(index) {
                continue;
            }
            let slot = self.slot(index);
            let pending = slot.pending.load(Ordering::Acquire);
            let orphaned = pending & !header.consumer_mask.load(Ordering::Acquire);
            if orphaned != 0 {
                slot.pending.fetch_and(!orphaned, Ordering::AcqRel);
                log::warn!(
                    "POOL: '{}' cleared acknowledgements owed by departed consumers {:#x} on slot {}",
                    self.name(),
                    orphaned,
                    index
                );
                cleared += 1;
            }
            self.end_read(index);
        }
        cleared
    }
}

fn read_header(header: &PoolHeader, name: &str) -> MomentumResult<PoolConfig> {
    if header.initialized.load(Ordering::Acquire) != INIT_DONE {
        return Err(MomentumError::invalid_segment(name, "header not initialized"));
    }
    if header.magic != POOL_MAGIC {
        return Err(MomentumError::invalid_segment(name, "bad magic"));
    }
    if header.version != POOL_VERSION {
        return Err(MomentumError::mismatch(
            name,
            format!("layout version {}, expected {}", header.version, POOL_VERSION),
        ));
    }
    let config = PoolConfig::from_header(header);
    PoolShape::new(config.shape.buffer_size, config.shape.buffer_count)
        .map_err(|e| MomentumError::invalid_segment(name, e.to_string()))?;
    Ok(config)
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the permission/existence check only
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(dir: &Path, count: usize, backpressure: Backpressure) -> BufferPool {
        let config = PoolConfig {
            shape: PoolShape::new(64, count).unwrap(),
            broadcast: true,
            backpressure,
        };
        BufferPool::create_or_attach(dir, "pool", config).unwrap()
    }

    #[test]
    fn test_state_word_packing() {
        assert_eq!(SlotState::from_word(pack(PHASE_FREE, 0)), SlotState::Free);
        assert_eq!(SlotState::from_word(pack(PHASE_WRITING, 0)), SlotState::Writing);
        assert_eq!(SlotState::from_word(pack(PHASE_READY, 0)), SlotState::Ready);
        assert_eq!(SlotState::from_word(pack(PHASE_READY, 3)), SlotState::Reading);
        assert_eq!(readers_of(pack(PHASE_READY, 3)), 3);
        assert_eq!(SlotState::from_word(0x7f), SlotState::Writing);
    }

    #[test]
    fn test_shape_limits() {
        assert!(PoolShape::new(0, 4).is_err());
        assert!(PoolShape::new(16, 0).is_err());
        assert!(PoolShape::new(16, MAX_BUFFER_COUNT + 1).is_err());
        assert!(PoolShape::new(usize::MAX, 2).is_err());
        let shape = PoolShape::new(1024, 4).unwrap();
        assert_eq!(shape.total_size().unwrap(), 4096 + STREAM_HEADER_SIZE);
    }

    #[test]
    fn test_round_robin_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 3, Backpressure::Block);

        assert_eq!(pool.try_acquire(), Some(0));
        pool.abandon(0);
        // Next scan starts after the last handed-out slot
        assert_eq!(pool.try_acquire(), Some(1));
        assert_eq!(pool.try_acquire(), Some(2));
        assert_eq!(pool.try_acquire(), Some(0));
        assert_eq!(pool.try_acquire(), None);
    }

    #[test]
    fn test_slot_freed_after_last_ack() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 2, Backpressure::Block);
        let a = pool.register_consumer(std::process::id()).unwrap();
        let b = pool.register_consumer(std::process::id()).unwrap();

        let index = pool.try_acquire().unwrap();
        let seq = pool.mark_ready(index, 10).unwrap();
        assert_eq!(pool.slot_state(index), SlotState::Ready);
        assert!(pool.is_consumable(index, a));
        assert!(pool.is_consumable(index, b));

        assert!(pool.begin_read(index, a, seq));
        assert_eq!(pool.slot_state(index), SlotState::Reading);
        pool.mark_consumed(index, a);
        pool.end_read(index);
        assert!(!pool.is_consumable(index, a));
        assert_eq!(pool.slot_state(index), SlotState::Ready);

        pool.mark_consumed(index, b);
        assert_eq!(pool.slot_state(index), SlotState::Free);
    }

    #[test]
    fn test_publish_without_consumers_frees_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 1, Backpressure::Block);
        let index = pool.try_acquire().unwrap();
        assert_eq!(pool.mark_ready(index, 1).unwrap(), 1);
        assert_eq!(pool.slot_state(index), SlotState::Free);
    }

    #[test]
    fn test_payload_longer_than_buffer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 1, Backpressure::Block);
        let index = pool.try_acquire().unwrap();
        assert!(pool.mark_ready(index, 65).is_err());
        assert_eq!(pool.slot_state(index), SlotState::Writing);
    }

    #[test]
    fn test_drop_oldest_steals_unread_slot() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 2, Backpressure::DropOldest);
        pool.register_consumer(std::process::id()).unwrap();

        let first = pool.try_acquire().unwrap();
        pool.mark_ready(first, 1).unwrap();
        let second = pool.try_acquire().unwrap();
        pool.mark_ready(second, 1).unwrap();

        // Both Ready and unread: the lower sequence goes first
        assert_eq!(pool.try_acquire(), Some(first));
    }

    #[test]
    fn test_reading_slot_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 1, Backpressure::DropOldest);
        let consumer = pool.register_consumer(std::process::id()).unwrap();

        let index = pool.try_acquire().unwrap();
        let seq = pool.mark_ready(index, 1).unwrap();
        assert!(pool.begin_read(index, consumer, seq));
        assert_eq!(pool.try_acquire(), None);
        pool.end_read(index);
        assert_eq!(pool.try_acquire(), Some(index));
    }

    #[test]
    fn test_unregister_releases_pending_slots() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 1, Backpressure::Block);
        let consumer = pool.register_consumer(std::process::id()).unwrap();

        let index = pool.try_acquire().unwrap();
        pool.mark_ready(index, 1).unwrap();
        assert_eq!(pool.slot_state(index), SlotState::Ready);

        pool.unregister_consumer(consumer);
        assert_eq!(pool.slot_state(index), SlotState::Free);
        assert_eq!(pool.consumer_count(), 0);
    }

    #[test]
    fn test_orphaned_pending_bit_does_not_pin_slot() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 1, Backpressure::Block);
        let consumer = pool.register_consumer(std::process::id()).unwrap();

        let index = pool.try_acquire().unwrap();
        pool.mark_ready(index, 1).unwrap();

        // Unregistered after its pending bits were cleared but before the
        // publication above stored the mask it had already read
        let header = pool.header();
        header
            .consumer_mask
            .fetch_and(!(1u64 << consumer), Ordering::AcqRel);
        header.consumer_pids[consumer].store(0, Ordering::Release);
        assert_eq!(pool.slot_state(index), SlotState::Ready);

        let cancel = AtomicBool::new(false);
        let acquired = pool
            .acquire_free_slot(Duration::from_millis(200), &cancel)
            .unwrap();
        assert_eq!(acquired, Some(index));
    }

    #[test]
    fn test_registered_pending_bits_survive_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 1, Backpressure::Block);
        let consumer = pool.register_consumer(std::process::id()).unwrap();

        let index = pool.try_acquire().unwrap();
        pool.mark_ready(index, 1).unwrap();
        assert_eq!(pool.reap_dead_peers(), 0);
        assert!(pool.is_consumable(index, consumer));
    }

    #[test]
    fn test_acknowledge_skips_republished_slot() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            shape: PoolShape::new(64, 2).unwrap(),
            broadcast: false,
            backpressure: Backpressure::DropOldest,
        };
        let pool = BufferPool::create_or_attach(dir.path(), "latest", config).unwrap();
        let consumer = pool.register_consumer(std::process::id()).unwrap();

        for _ in 0..2 {
            let index = pool.try_acquire().unwrap();
            pool.mark_ready(index, 1).unwrap();
        }
        let snapshot = pool.consumable_slots(consumer);
        assert_eq!(snapshot, vec![(1, 0), (2, 1)]);

        // The producer steals the oldest slot before the consumer acks it
        let stolen = pool.try_acquire().unwrap();
        assert_eq!(stolen, 0);
        assert_eq!(pool.mark_ready(stolen, 1).unwrap(), 3);

        let (seq, index) = snapshot[0];
        assert!(!pool.acknowledge(index, consumer, seq));
        assert_eq!(pool.consumable_slots(consumer), vec![(2, 1), (3, 0)]);

        assert!(pool.acknowledge(1, consumer, 2));
        assert_eq!(pool.slot_state(1), SlotState::Free);
        assert_eq!(pool.consumable_slots(consumer), vec![(3, 0)]);
    }

    #[test]
    fn test_attach_reads_recorded_shape() {
        let dir = tempfile::tempdir().unwrap();
        let _creator = pool(dir.path(), 3, Backpressure::DropOldest);
        let attached = BufferPool::attach(dir.path(), "pool").unwrap();
        assert_eq!(attached.shape(), PoolShape::new(64, 3).unwrap());
        assert_eq!(attached.config().backpressure, Backpressure::DropOldest);
        assert!(!attached.is_owner());

        let info = BufferPool::inspect(&dir.path().join("pool")).unwrap();
        assert_eq!(info.total_memory, 64 * 3 + STREAM_HEADER_SIZE);
    }
}
