//! Packet buffers and packet references.
//!
//! Each worker owns one `BufferPool`: a fixed number of equally sized buffers
//! carved out of a single arena allocation, plus a free list. Packets travel
//! through the graph as `PacketRef`s (buffer index + cursor), which are
//! `Copy` and cheap to batch.

use tracing::warn;

use crate::arena::VecArena;
use crate::graph::DropReason;

/// Headroom reserved in front of received data (room for encapsulation).
pub const HEADROOM: usize = 128;

/// Size of a single buffer.
pub const BUFFER_SIZE: usize = 2048;

/// Maximum packet that fits behind the headroom.
pub const MAX_PACKET: usize = BUFFER_SIZE - HEADROOM;

/// Default number of buffers in a worker's pool.
pub const POOL_SIZE: usize = 4096;

/// Identity of a buffer within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferIndex(pub u32);

impl BufferIndex {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to one packet: buffer identity plus the current parse cursor.
///
/// `offset` is where the next header starts; `len` is the number of valid
/// bytes from there on. `offset + len` never exceeds `BUFFER_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRef {
    buffer: BufferIndex,
    offset: u32,
    len: u32,
}

impl PacketRef {
    #[inline]
    pub fn buffer(&self) -> BufferIndex {
        self.buffer
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Move the cursor forward past a consumed header.
    ///
    /// Returns `false` (and leaves the ref untouched) if fewer than `n`
    /// bytes remain.
    #[inline]
    pub fn advance(&mut self, n: usize) -> bool {
        if n > self.len() {
            return false;
        }
        self.offset += n as u32;
        self.len -= n as u32;
        true
    }

    /// Move the cursor back to make room for a header in front.
    ///
    /// Returns `false` if the buffer has less than `n` bytes of headroom.
    #[inline]
    pub fn retreat(&mut self, n: usize) -> bool {
        if n > self.offset() {
            return false;
        }
        self.offset -= n as u32;
        self.len += n as u32;
        true
    }

    /// Shorten the packet, e.g. to drop link-layer padding.
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.len = len as u32;
        }
    }
}

/// Per-buffer metadata kept alongside the data.
#[derive(Debug, Clone, Copy, Default)]
struct BufferMeta {
    allocated: bool,
    drop_reason: Option<DropReason>,
}

/// Fixed-size pool of packet buffers owned by a single worker.
pub struct BufferPool {
    data: VecArena<u8>,
    meta: VecArena<BufferMeta>,
    /// Stack of free buffer indices; only the first `free_len` slots are live.
    free: VecArena<u32>,
    free_len: usize,
}

impl BufferPool {
    /// Create a pool of `count` buffers.
    pub fn new(count: usize) -> Self {
        let mut data = VecArena::with_capacity(count * BUFFER_SIZE);
        data.resize(count * BUFFER_SIZE);

        let mut meta = VecArena::with_capacity(count);
        meta.resize(count);

        // Pop from the back hands out low indices first.
        let free: VecArena<u32> = (0..count as u32).rev().collect();
        let free_len = free.len();

        BufferPool {
            data,
            meta,
            free,
            free_len,
        }
    }

    /// Total number of buffers.
    pub fn size(&self) -> usize {
        self.meta.len()
    }

    /// Number of buffers currently free.
    #[inline]
    pub fn available(&self) -> usize {
        self.free_len
    }

    /// Allocate an empty buffer with the cursor placed after the headroom.
    ///
    /// Returns `None` if the pool is exhausted.
    pub fn alloc(&mut self) -> Option<PacketRef> {
        if self.free_len == 0 {
            return None;
        }
        self.free_len -= 1;
        let index = self.free[self.free_len];

        self.meta[index as usize] = BufferMeta {
            allocated: true,
            drop_reason: None,
        };
        Some(PacketRef {
            buffer: BufferIndex(index),
            offset: HEADROOM as u32,
            len: 0,
        })
    }

    /// Allocate a buffer and copy `frame` into it.
    ///
    /// Returns `None` if the pool is exhausted or the frame does not fit.
    pub fn alloc_with(&mut self, frame: &[u8]) -> Option<PacketRef> {
        if frame.len() > MAX_PACKET {
            return None;
        }
        let mut r = self.alloc()?;
        self.tail_room_mut(&r)[..frame.len()].copy_from_slice(frame);
        r.len = frame.len() as u32;
        Some(r)
    }

    /// Return a buffer to the pool.
    pub fn free(&mut self, r: PacketRef) {
        let meta = &mut self.meta[r.buffer.index()];
        if !meta.allocated {
            warn!(buffer = r.buffer.0, "Double free of packet buffer");
            return;
        }
        *meta = BufferMeta::default();
        *self.free.validate(self.free_len) = r.buffer.0;
        self.free_len += 1;
    }

    fn range(r: &PacketRef) -> std::ops::Range<usize> {
        let start = r.buffer.index() * BUFFER_SIZE + r.offset();
        start..start + r.len()
    }

    /// Packet bytes from the cursor on.
    #[inline]
    pub fn data(&self, r: &PacketRef) -> &[u8] {
        &self.data[Self::range(r)]
    }

    /// Mutable packet bytes from the cursor on.
    #[inline]
    pub fn data_mut(&mut self, r: &PacketRef) -> &mut [u8] {
        &mut self.data[Self::range(r)]
    }

    /// Space from the cursor to the end of the buffer, for receiving into.
    pub fn tail_room_mut(&mut self, r: &PacketRef) -> &mut [u8] {
        let base = r.buffer.index() * BUFFER_SIZE;
        &mut self.data[base + r.offset()..base + BUFFER_SIZE]
    }

    /// Set the packet length after receiving into `tail_room_mut`.
    pub fn set_len(&self, r: &mut PacketRef, len: usize) {
        r.len = len.min(BUFFER_SIZE - r.offset()) as u32;
    }

    /// Record why a packet is being dropped.
    pub fn set_drop_reason(&mut self, r: &PacketRef, reason: DropReason) {
        self.meta[r.buffer.index()].drop_reason = Some(reason);
    }

    /// Drop reason recorded for this packet, if any.
    pub fn drop_reason(&self, r: &PacketRef) -> Option<DropReason> {
        self.meta[r.buffer.index()].drop_reason
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(POOL_SIZE)
    }
}
