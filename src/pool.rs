//! Reusable frame-sized memory.
//!
//! [`BufferRing`] holds the scratch canvases conversion writes into; slots are
//! handed out round-robin so the canvas being filled is never the one most
//! recently finished. [`PayloadRecycler`] supplies the storage for the
//! independent copies handed to consumers and takes it back when those copies
//! are dropped, so steady state performs no frame-sized allocation.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayVec;
use crossbeam_channel::{Receiver, Sender, bounded};
use serde::{Serialize, Serializer};

use crate::geometry::Rect;

/// Maximum number of slots a [`BufferRing`] can hold.
pub const MAX_RING_SLOTS: usize = 8;
/// Minimum number of slots; one filling, one just finished.
pub const MIN_RING_SLOTS: usize = 2;

#[derive(Default)]
struct ScratchBuffer {
    data: Vec<u8>,
    /// Destination rect drawn by the previous frame in this slot.
    drawn: Option<Rect>,
}

/// Fixed set of scratch canvases used in rotation.
pub struct BufferRing {
    slots: ArrayVec<ScratchBuffer, MAX_RING_SLOTS>,
    next: usize,
    allocations: u64,
}

impl BufferRing {
    /// `slots` is clamped to `MIN_RING_SLOTS..=MAX_RING_SLOTS`. Nothing is
    /// allocated until the first [`acquire`](Self::acquire).
    pub fn new(slots: usize) -> Self {
        let count = slots.clamp(MIN_RING_SLOTS, MAX_RING_SLOTS);
        BufferRing {
            slots: (0..count).map(|_| ScratchBuffer::default()).collect(),
            next: 0,
            allocations: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index of the slot the next [`acquire`](Self::acquire) returns.
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Number of slot (re)allocations performed so far.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Borrow the current slot sized to exactly `len` bytes, reallocating it
    /// if the size changed since it was last used. The ring only moves on to
    /// the next slot when the returned slot is [released](ScratchSlot::release).
    pub fn acquire(&mut self, len: usize) -> ScratchSlot<'_> {
        let index = self.next;
        let count = self.slots.len();
        let buffer = &mut self.slots[index];
        if buffer.data.len() != len {
            buffer.data = vec![0; len];
            buffer.drawn = None;
            self.allocations += 1;
        }
        ScratchSlot {
            index,
            count,
            buffer,
            next: &mut self.next,
        }
    }
}

impl fmt::Debug for BufferRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRing")
            .field("slots", &self.slots.len())
            .field("next", &self.next)
            .field("allocations", &self.allocations)
            .finish()
    }
}

/// Exclusive access to one ring slot.
pub struct ScratchSlot<'a> {
    index: usize,
    count: usize,
    buffer: &'a mut ScratchBuffer,
    next: &'a mut usize,
}

impl ScratchSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Get the slot ready for a frame drawn into `dst`. When `dst` differs
    /// from what this slot held last time the whole canvas is cleared to
    /// black, so padding never shows a stale frame.
    pub fn prepare(&mut self, dst: Rect) {
        if self.buffer.drawn != Some(dst) {
            self.buffer.data.fill(0);
            self.buffer.drawn = Some(dst);
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.data
    }

    /// Mark the slot as filled and advance the ring.
    pub fn release(self) {
        *self.next = (self.index + 1) % self.count;
    }
}

struct RecyclerShared {
    returned: Sender<Vec<u8>>,
    allocations: AtomicU64,
}

/// Bounded pool of payload storage.
#[derive(Clone)]
pub struct PayloadRecycler {
    shared: Arc<RecyclerShared>,
    free: Receiver<Vec<u8>>,
}

impl PayloadRecycler {
    /// Keep at most `capacity` returned buffers around.
    pub fn new(capacity: usize) -> Self {
        let (returned, free) = bounded(capacity.max(1));
        PayloadRecycler {
            shared: Arc::new(RecyclerShared {
                returned,
                allocations: AtomicU64::new(0),
            }),
            free,
        }
    }

    /// Number of payload buffers allocated because none could be reused.
    pub fn allocations(&self) -> u64 {
        self.shared.allocations.load(Ordering::Relaxed)
    }

    /// Buffers currently waiting for reuse.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// An independent copy of `bytes`, backed by recycled storage when a
    /// buffer of the same length is available.
    pub fn copy_of(&self, bytes: &[u8]) -> PayloadBytes {
        let mut data = self.take(bytes.len());
        data.copy_from_slice(bytes);
        PayloadBytes {
            data,
            home: Some(self.shared.returned.clone()),
        }
    }

    fn take(&self, len: usize) -> Vec<u8> {
        // Buffers of another length belong to an older target size.
        while let Ok(buffer) = self.free.try_recv() {
            if buffer.len() == len {
                return buffer;
            }
        }
        self.shared.allocations.fetch_add(1, Ordering::Relaxed);
        vec![0; len]
    }
}

impl fmt::Debug for PayloadRecycler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadRecycler")
            .field("available", &self.available())
            .field("allocations", &self.allocations())
            .finish()
    }
}

/// Frame bytes owned by a payload. Returned to the recycler it came from
/// when dropped.
pub struct PayloadBytes {
    data: Vec<u8>,
    home: Option<Sender<Vec<u8>>>,
}

impl PayloadBytes {
    /// Take the bytes out; the storage is not recycled.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.home = None;
        std::mem::take(&mut self.data)
    }
}

impl From<Vec<u8>> for PayloadBytes {
    fn from(data: Vec<u8>) -> Self {
        PayloadBytes { data, home: None }
    }
}

impl Deref for PayloadBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for PayloadBytes {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PayloadBytes {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            // A full pool just lets the buffer go.
            let _ = home.try_send(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for PayloadBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadBytes({} bytes)", self.data.len())
    }
}

impl Serialize for PayloadBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.data)
    }
}
