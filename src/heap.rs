//! Global-memory heap adapter.
//!
//! The tree never holds raw addresses; it stores [`Gptr`] handles and
//! translates them at the moment of access through [`GlobalHeap::to_local`].
//! Any allocator over a shared mapping can sit behind the trait. The
//! in-process [`ArenaHeap`] provided here allocates in large chunks and
//! recycles freed blocks through size-class free lists; it backs tests,
//! benches and single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::gptr::Gptr;

/// Allocator over a shared, byte-addressable memory region.
///
/// Implementations must hand out 8-byte-aligned blocks and must keep the
/// `to_local` mapping stable for the lifetime of the attachment. `alloc` may
/// report transient failure under contention even when space exists; callers
/// are expected to retry.
pub trait GlobalHeap {
    /// Allocate `size` bytes. `None` on failure (possibly transient).
    fn alloc(&self, size: usize) -> Option<Gptr>;

    /// Return a block to the heap. The block becomes reusable no later than
    /// the next [`offline_free`](GlobalHeap::offline_free).
    fn free(&self, gptr: Gptr);

    /// Batched reclamation hook, invoked by maintenance.
    fn offline_free(&self) {}

    /// Translate a global pointer into a local address.
    ///
    /// The result must not be cached across heap reattachments. Passing a
    /// pointer this heap never allocated is a logic error; implementations
    /// may panic.
    fn to_local(&self, gptr: Gptr) -> *mut u8;
}

impl<H: GlobalHeap + ?Sized> GlobalHeap for &H {
    fn alloc(&self, size: usize) -> Option<Gptr> {
        (**self).alloc(size)
    }
    fn free(&self, gptr: Gptr) {
        (**self).free(gptr)
    }
    fn offline_free(&self) {
        (**self).offline_free()
    }
    fn to_local(&self, gptr: Gptr) -> *mut u8 {
        (**self).to_local(gptr)
    }
}

impl<H: GlobalHeap + ?Sized> GlobalHeap for Arc<H> {
    fn alloc(&self, size: usize) -> Option<Gptr> {
        (**self).alloc(size)
    }
    fn free(&self, gptr: Gptr) {
        (**self).free(gptr)
    }
    fn offline_free(&self) {
        (**self).offline_free()
    }
    fn to_local(&self, gptr: Gptr) -> *mut u8 {
        (**self).to_local(gptr)
    }
}

/// Default chunk size (1 MiB).
const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Every block is preceded by an 8-byte header holding its rounded size, so
/// `free` does not need a size argument and blocks stay 8-aligned.
const HEADER: usize = 8;

const ALIGN: usize = 8;

/// Pointer encoding: chunk ordinal (1-based) in the high 24 bits, byte
/// offset within the chunk in the low 40. Ordinal 0 never occurs, so a raw
/// value of 0 stays the null pointer.
const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

struct ArenaState {
    /// Boxed so chunk base addresses never move while the vec grows.
    chunks: Vec<Box<[u8]>>,
    /// Bump position within the last chunk.
    bump: usize,
    /// Reusable blocks keyed by rounded block size.
    free_lists: HashMap<usize, Vec<Gptr>>,
    /// Blocks handed to `free` but not yet reclaimed.
    pending: Vec<Gptr>,
    /// Total payload bytes currently allocated.
    live: usize,
}

/// Chunked in-process heap with size-class free lists.
///
/// Freed blocks are parked on a pending list and only become reusable when
/// [`offline_free`](GlobalHeap::offline_free) runs, mirroring allocators
/// that defer reclamation to a maintenance pass.
pub struct ArenaHeap {
    state: Mutex<ArenaState>,
    chunk_size: usize,
    /// Allocation refuses to grow past this many payload bytes.
    max_bytes: usize,
}

impl ArenaHeap {
    /// Heap with the default chunk size and no capacity limit.
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Heap with a specific chunk size.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert!(chunk_size >= HEADER + ALIGN, "chunk size too small");
        ArenaHeap {
            state: Mutex::new(ArenaState {
                chunks: Vec::new(),
                bump: 0,
                free_lists: HashMap::new(),
                pending: Vec::new(),
                live: 0,
            }),
            chunk_size,
            max_bytes: usize::MAX,
        }
    }

    /// Heap that fails allocation once `max_bytes` of payload are live.
    pub fn with_capacity(max_bytes: usize) -> Self {
        let mut heap = Self::new();
        heap.max_bytes = max_bytes;
        heap
    }

    /// Payload bytes currently allocated.
    pub fn live_bytes(&self) -> usize {
        self.state.lock().live
    }

    /// Number of chunks acquired so far.
    pub fn num_chunks(&self) -> usize {
        self.state.lock().chunks.len()
    }

    fn encode(chunk: usize, offset: usize) -> Gptr {
        debug_assert!((offset as u64) <= OFFSET_MASK);
        Gptr::from_raw(((chunk as u64 + 1) << OFFSET_BITS) | offset as u64)
    }

    fn decode(gptr: Gptr) -> (usize, usize) {
        let raw = gptr.raw();
        let chunk = (raw >> OFFSET_BITS) as usize - 1;
        let offset = (raw & OFFSET_MASK) as usize;
        (chunk, offset)
    }

    fn read_header(&self, state: &ArenaState, gptr: Gptr) -> usize {
        let (chunk, offset) = Self::decode(gptr);
        let bytes = &state.chunks[chunk][offset - HEADER..offset];
        u64::from_ne_bytes(bytes.try_into().unwrap()) as usize
    }
}

impl Default for ArenaHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalHeap for ArenaHeap {
    fn alloc(&self, size: usize) -> Option<Gptr> {
        let rounded = size.max(1).next_multiple_of(ALIGN);
        let mut state = self.state.lock();

        if state.live + rounded > self.max_bytes {
            return None;
        }

        if let Some(list) = state.free_lists.get_mut(&rounded) {
            if let Some(gptr) = list.pop() {
                state.live += rounded;
                return Some(gptr);
            }
        }

        let block = HEADER + rounded;
        assert!(
            block <= self.chunk_size,
            "allocation of {size} bytes exceeds chunk size {}",
            self.chunk_size
        );
        let needs_chunk = match state.chunks.last() {
            Some(last) => state.bump + block > last.len(),
            None => true,
        };
        if needs_chunk {
            tracing::debug!(chunk = state.chunks.len(), size = self.chunk_size, "arena chunk");
            state.chunks.push(vec![0u8; self.chunk_size].into_boxed_slice());
            state.bump = 0;
        }

        let chunk = state.chunks.len() - 1;
        let header_at = state.bump;
        let payload_at = header_at + HEADER;
        state.bump += block;
        state.live += rounded;
        state.chunks[chunk][header_at..payload_at]
            .copy_from_slice(&(rounded as u64).to_ne_bytes());
        Some(Self::encode(chunk, payload_at))
    }

    fn free(&self, gptr: Gptr) {
        if gptr.is_null() {
            return;
        }
        let mut state = self.state.lock();
        let rounded = self.read_header(&state, gptr);
        state.live -= rounded;
        state.pending.push(gptr);
    }

    fn offline_free(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        for gptr in pending {
            let rounded = self.read_header(&state, gptr);
            state.free_lists.entry(rounded).or_default().push(gptr);
        }
    }

    fn to_local(&self, gptr: Gptr) -> *mut u8 {
        assert!(gptr.is_valid(), "to_local on null pointer");
        let (chunk, offset) = Self::decode(gptr);
        let state = self.state.lock();
        let slab = &state.chunks[chunk];
        assert!(offset < slab.len(), "pointer past end of chunk");
        // Chunk contents are heap-allocated and never move; the returned
        // address stays valid after the lock is released.
        unsafe { (slab.as_ptr() as *mut u8).add(offset) }
    }
}
