//! Shared message arena
//!
//! A fixed region split into 64-byte blocks. Block 0 holds the
//! [`ArenaHeader`]; every other block belongs to at most one message run.
//! A run starts with a [`BlockHeader`] followed by payload that may spill
//! into the following blocks of the same run.
//!
//! Runs are never split, merged or unlinked. Each run is pushed onto the
//! chain of its size class (single block or multi block) when it is first
//! carved from the bump pointer and stays there, toggling between free and
//! in use. Chains always point from newer runs to strictly older, lower
//! indexed runs, which is checked on every walk.
//!
//! Only the peer holding the turn touches the arena, so plain relaxed
//! atomics suffice here; the rendezvous handoff provides the fences.

use crate::error::{ShmError, ShmResult};
use memmap2::MmapMut;
use static_assertions::const_assert_eq;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use transact::consts::{
    BLOCK_HEADER_SIZE, BLOCK_SIZE, FIRST_DATA_BLOCK, MIN_ARENA_BLOCKS, NO_BLOCK,
};

/// Arena header, stored in block 0
#[repr(C, align(64))]
pub struct ArenaHeader {
    /// Run most recently published for the peer, or `NO_BLOCK`
    current_message_offset: AtomicU64,
    /// Next never-used block
    bump_offset: AtomicU64,
    /// Newest single-block run, or `NO_BLOCK`
    small_free_list_head: AtomicU64,
    /// Newest multi-block run, or `NO_BLOCK`
    large_free_list_head: AtomicU64,
    _reserved: [u8; 32],
}

/// Header at the start of every run
#[repr(C)]
pub struct BlockHeader {
    /// Next older run of the same size class, or `NO_BLOCK`
    prev_in_free_chain: AtomicU64,
    length_in_blocks: AtomicU64,
    free: AtomicU64,
    message_id: AtomicU64,
}

const_assert_eq!(core::mem::size_of::<ArenaHeader>(), BLOCK_SIZE);
const_assert_eq!(core::mem::size_of::<BlockHeader>(), BLOCK_HEADER_SIZE);

/// Size class of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Exactly one block
    Small,
    /// More than one block
    Large,
}

impl SizeClass {
    pub const fn of(length_in_blocks: u64) -> Self {
        if length_in_blocks == 1 {
            Self::Small
        } else {
            Self::Large
        }
    }
}

/// A validated run of blocks inside an arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    index: u64,
    length_in_blocks: u64,
}

impl BlockRef {
    /// Block index of the first block of the run
    pub const fn index(&self) -> u64 {
        self.index
    }

    pub const fn length_in_blocks(&self) -> u64 {
        self.length_in_blocks
    }

    pub const fn size_class(&self) -> SizeClass {
        SizeClass::of(self.length_in_blocks)
    }

    /// Payload bytes between the block header and the end of the run
    pub const fn payload_capacity(&self) -> usize {
        self.length_in_blocks as usize * BLOCK_SIZE - BLOCK_HEADER_SIZE
    }
}

/// Snapshot of arena occupancy, computed by walking both chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    pub total_blocks: u64,
    /// Blocks carved so far, header block included
    pub bump_offset: u64,
    pub small_runs: u64,
    pub small_free: u64,
    pub large_runs: u64,
    pub large_free: u64,
    /// Blocks held by free runs of either class
    pub free_blocks: u64,
}

impl ArenaStats {
    /// Blocks never handed out yet
    pub fn untouched_blocks(&self) -> u64 {
        self.total_blocks.saturating_sub(self.bump_offset)
    }
}

/// Number of blocks needed for a payload of `requested_bytes`
pub fn blocks_for(requested_bytes: usize) -> Option<u64> {
    let total = requested_bytes.checked_add(BLOCK_HEADER_SIZE)?;
    Some(total.div_ceil(BLOCK_SIZE) as u64)
}

/// One peer's view of a shared arena
pub struct Arena {
    region: MmapMut,
    base: NonNull<u8>,
    total_blocks: u64,
}

// SAFETY: the arena owns its mapping; `base` points into it. It is not
// `Sync`: callers serialize access through the rendezvous turn.
unsafe impl Send for Arena {}

impl Arena {
    /// Wrap a mapped region of at least `total_blocks` blocks.
    ///
    /// The owner initializes the header; other peers adopt the existing one
    /// after checking that its bump pointer is in range.
    pub fn attach(mut region: MmapMut, total_blocks: u64, is_owner: bool) -> ShmResult<Self> {
        let needed = (total_blocks as usize).checked_mul(BLOCK_SIZE);
        if total_blocks < MIN_ARENA_BLOCKS as u64 || needed.is_none_or(|n| n > region.len()) {
            return Err(ShmError::InvalidSize {
                size: region.len(),
            });
        }
        let base = NonNull::new(region.as_mut_ptr()).ok_or(ShmError::InvalidSize { size: 0 })?;
        if base.as_ptr() as usize % BLOCK_SIZE != 0 {
            return Err(ShmError::InvalidState("arena mapping is not block aligned"));
        }

        let arena = Self {
            region,
            base,
            total_blocks,
        };

        let header = arena.header();
        if is_owner {
            header
                .current_message_offset
                .store(NO_BLOCK, Ordering::Relaxed);
            header.bump_offset.store(FIRST_DATA_BLOCK, Ordering::Relaxed);
            header.small_free_list_head.store(NO_BLOCK, Ordering::Relaxed);
            header.large_free_list_head.store(NO_BLOCK, Ordering::Relaxed);
            tracing::debug!(total_blocks, "initialized arena header");
        } else {
            arena.checked_bump()?;
            tracing::debug!(total_blocks, "attached to arena");
        }
        Ok(arena)
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Size of the usable region in bytes
    pub fn size_bytes(&self) -> usize {
        self.total_blocks as usize * BLOCK_SIZE
    }

    /// Allocate a run with room for `requested_bytes` of payload.
    ///
    /// Reuses the first free run of the same class with exactly the needed
    /// length, otherwise carves a new run from the bump pointer.
    ///
    /// # Errors
    ///
    /// - `ArenaCorrupted` if a chain link or the bump pointer is invalid
    /// - `ArenaExhausted` if no run fits; the arena is left untouched
    pub fn allocate(&self, message_id: u32, requested_bytes: usize) -> ShmResult<BlockRef> {
        let length = blocks_for(requested_bytes).ok_or(ShmError::ArenaExhausted {
            required_bytes: usize::MAX,
        })?;
        let class = SizeClass::of(length);
        let head = self.head(class);

        let reusable = self.walk(head.load(Ordering::Relaxed), |_, block| {
            block.free.load(Ordering::Relaxed) != 0
                && block.length_in_blocks.load(Ordering::Relaxed) == length
        })?;
        if let Some(index) = reusable {
            let block = self.block_header(index);
            block.free.store(0, Ordering::Relaxed);
            block.message_id.store(message_id as u64, Ordering::Relaxed);
            tracing::trace!(index, length, message_id, "reused run");
            return Ok(BlockRef {
                index,
                length_in_blocks: length,
            });
        }

        let bump = self.checked_bump()?;
        if length > self.total_blocks - bump {
            let required_bytes = bump
                .saturating_add(length)
                .saturating_mul(BLOCK_SIZE as u64);
            tracing::debug!(length, bump, "arena exhausted");
            return Err(ShmError::ArenaExhausted {
                required_bytes: usize::try_from(required_bytes).unwrap_or(usize::MAX),
            });
        }

        let block = self.block_header(bump);
        block
            .prev_in_free_chain
            .store(head.load(Ordering::Relaxed), Ordering::Relaxed);
        block.length_in_blocks.store(length, Ordering::Relaxed);
        block.free.store(0, Ordering::Relaxed);
        block.message_id.store(message_id as u64, Ordering::Relaxed);
        head.store(bump, Ordering::Relaxed);
        self.header()
            .bump_offset
            .store(bump + length, Ordering::Relaxed);
        tracing::trace!(index = bump, length, message_id, "carved run");

        Ok(BlockRef {
            index: bump,
            length_in_blocks: length,
        })
    }

    /// Return a run to its size class for reuse
    pub fn mark_free(&self, block: &BlockRef) {
        self.block_header(block.index)
            .free
            .store(1, Ordering::Relaxed);
    }

    /// Validate `offset` and view the run stored there
    pub fn resolve(&self, offset: u64) -> ShmResult<BlockRef> {
        if !(FIRST_DATA_BLOCK..self.total_blocks).contains(&offset) {
            return Err(ShmError::corrupted(format!(
                "offset {offset} outside [1, {})",
                self.total_blocks
            )));
        }
        let length = self.run_length(offset)?;
        Ok(BlockRef {
            index: offset,
            length_in_blocks: length,
        })
    }

    /// Post `block` as the message for the peer to read after the handoff
    pub fn publish(&self, block: &BlockRef) {
        self.header()
            .current_message_offset
            .store(block.index, Ordering::Relaxed);
    }

    /// Most recently published offset, `NO_BLOCK` if nothing was published
    pub fn current(&self) -> u64 {
        self.header().current_message_offset.load(Ordering::Relaxed)
    }

    pub fn message_id(&self, block: &BlockRef) -> u32 {
        self.block_header(block.index)
            .message_id
            .load(Ordering::Relaxed) as u32
    }

    pub fn is_free(&self, block: &BlockRef) -> bool {
        self.block_header(block.index).free.load(Ordering::Relaxed) != 0
    }

    /// Walk both chains and summarize occupancy
    pub fn stats(&self) -> ShmResult<ArenaStats> {
        let mut stats = ArenaStats {
            total_blocks: self.total_blocks,
            bump_offset: self.checked_bump()?,
            ..ArenaStats::default()
        };

        for class in [SizeClass::Small, SizeClass::Large] {
            let mut runs = 0;
            let mut free = 0;
            self.walk(self.head(class).load(Ordering::Relaxed), |_, block| {
                runs += 1;
                if block.free.load(Ordering::Relaxed) != 0 {
                    free += 1;
                    stats.free_blocks += block.length_in_blocks.load(Ordering::Relaxed);
                }
                false
            })?;
            match class {
                SizeClass::Small => (stats.small_runs, stats.small_free) = (runs, free),
                SizeClass::Large => (stats.large_runs, stats.large_free) = (runs, free),
            }
        }
        Ok(stats)
    }

    /// Copy `bytes` into the payload of `block` at `offset`.
    ///
    /// The caller guarantees `offset + bytes.len() <= block.payload_capacity()`.
    pub(crate) fn write_payload(&self, block: &BlockRef, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= block.payload_capacity());
        // SAFETY: `block` was validated against `total_blocks`, so its run
        // lies inside the mapping, and the caller bounds the range to it.
        unsafe {
            let dst = self.payload_ptr(block).add(offset);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }

    /// Copy payload bytes of `block` at `offset` into `out`
    pub(crate) fn read_payload(&self, block: &BlockRef, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= block.payload_capacity());
        // SAFETY: see `write_payload`.
        unsafe {
            let src = self.payload_ptr(block).add(offset);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
        }
    }

    /// Borrow `len` payload bytes of `block` at `offset` in place
    pub(crate) fn payload(&self, block: &BlockRef, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= block.payload_capacity());
        // SAFETY: see `write_payload`. The peer does not write the run while
        // this side holds the turn.
        unsafe { std::slice::from_raw_parts(self.payload_ptr(block).add(offset), len) }
    }

    fn payload_ptr(&self, block: &BlockRef) -> *mut u8 {
        // SAFETY: index < total_blocks, checked when the BlockRef was made.
        unsafe {
            self.base
                .as_ptr()
                .add(block.index as usize * BLOCK_SIZE + BLOCK_HEADER_SIZE)
        }
    }

    fn header(&self) -> &ArenaHeader {
        // SAFETY: block 0 is inside the mapping and block aligned.
        unsafe { &*self.base.as_ptr().cast::<ArenaHeader>() }
    }

    fn block_header(&self, index: u64) -> &BlockHeader {
        debug_assert!(index >= FIRST_DATA_BLOCK && index < self.total_blocks);
        // SAFETY: callers only pass indices validated against `total_blocks`.
        unsafe {
            &*self
                .base
                .as_ptr()
                .add(index as usize * BLOCK_SIZE)
                .cast::<BlockHeader>()
        }
    }

    fn head(&self, class: SizeClass) -> &AtomicU64 {
        match class {
            SizeClass::Small => &self.header().small_free_list_head,
            SizeClass::Large => &self.header().large_free_list_head,
        }
    }

    fn checked_bump(&self) -> ShmResult<u64> {
        let bump = self.header().bump_offset.load(Ordering::Relaxed);
        if bump < FIRST_DATA_BLOCK || bump > self.total_blocks {
            tracing::warn!(bump, total_blocks = self.total_blocks, "bump pointer out of range");
            return Err(ShmError::corrupted(format!(
                "bump offset {bump} outside [1, {}]",
                self.total_blocks
            )));
        }
        Ok(bump)
    }

    /// Stored length of the run at a validated `index`
    fn run_length(&self, index: u64) -> ShmResult<u64> {
        let length = self
            .block_header(index)
            .length_in_blocks
            .load(Ordering::Relaxed);
        if length == 0 || length > self.total_blocks - index {
            return Err(ShmError::corrupted(format!(
                "run at {index} has length {length}"
            )));
        }
        Ok(length)
    }

    /// Follow a chain from `head` until `visit` returns true.
    ///
    /// Every link must be a data block strictly below the previously visited
    /// one, so the walk always terminates.
    fn walk(
        &self,
        head: u64,
        mut visit: impl FnMut(u64, &BlockHeader) -> bool,
    ) -> ShmResult<Option<u64>> {
        let mut previous = self.total_blocks;
        let mut index = head;
        while index != NO_BLOCK {
            if index < FIRST_DATA_BLOCK || index >= previous {
                tracing::warn!(index, previous, "invalid free chain link");
                return Err(ShmError::corrupted(format!(
                    "free chain link {index} does not point below {previous}"
                )));
            }
            self.run_length(index)?;
            let block = self.block_header(index);
            if visit(index, block) {
                return Ok(Some(index));
            }
            previous = index;
            index = block.prev_in_free_chain.load(Ordering::Relaxed);
        }
        Ok(None)
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("total_blocks", &self.total_blocks)
            .field("mapped_len", &self.region.len())
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(total_blocks: u64) -> Arena {
        let region = MmapMut::map_anon(total_blocks as usize * BLOCK_SIZE).unwrap();
        Arena::attach(region, total_blocks, true).unwrap()
    }

    fn set_link(arena: &Arena, index: u64, link: u64) {
        arena
            .block_header(index)
            .prev_in_free_chain
            .store(link, Ordering::Relaxed);
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(core::mem::size_of::<ArenaHeader>(), 64);
        assert_eq!(core::mem::size_of::<BlockHeader>(), 32);
    }

    #[test]
    fn test_blocks_for() {
        assert_eq!(blocks_for(0), Some(1));
        assert_eq!(blocks_for(32), Some(1));
        assert_eq!(blocks_for(33), Some(2));
        assert_eq!(blocks_for(96), Some(2));
        assert_eq!(blocks_for(97), Some(3));
        assert_eq!(blocks_for(usize::MAX), None);
    }

    #[test]
    fn test_owner_initializes_header() {
        let arena = arena(8);
        assert_eq!(arena.current(), NO_BLOCK);
        let stats = arena.stats().unwrap();
        assert_eq!(stats.bump_offset, 1);
        assert_eq!(stats.small_runs + stats.large_runs, 0);
        assert_eq!(stats.untouched_blocks(), 7);
    }

    #[test]
    fn test_attach_rejects_small_region() {
        let region = MmapMut::map_anon(BLOCK_SIZE * 2).unwrap();
        assert!(matches!(
            Arena::attach(region, 4, true),
            Err(ShmError::InvalidSize { .. })
        ));
        let region = MmapMut::map_anon(BLOCK_SIZE).unwrap();
        assert!(Arena::attach(region, 1, true).is_err());
    }

    #[test]
    fn test_non_owner_rejects_garbage_header() {
        // A zeroed header has bump_offset 0, which no owner ever writes.
        let region = MmapMut::map_anon(BLOCK_SIZE * 4).unwrap();
        assert!(matches!(
            Arena::attach(region, 4, false),
            Err(ShmError::ArenaCorrupted { .. })
        ));
    }

    #[test]
    fn test_bump_allocation_and_classes() {
        let arena = arena(16);
        let small = arena.allocate(1, 4).unwrap();
        let large = arena.allocate(2, 100).unwrap();
        let small2 = arena.allocate(3, 0).unwrap();

        assert_eq!((small.index(), small.length_in_blocks()), (1, 1));
        assert_eq!((large.index(), large.length_in_blocks()), (2, 3));
        assert_eq!(small2.index(), 5);
        assert_eq!(small.size_class(), SizeClass::Small);
        assert_eq!(large.size_class(), SizeClass::Large);
        assert_eq!(large.payload_capacity(), 3 * 64 - 32);
        assert_eq!(arena.message_id(&large), 2);

        let stats = arena.stats().unwrap();
        assert_eq!(stats.small_runs, 2);
        assert_eq!(stats.large_runs, 1);
        assert_eq!(stats.bump_offset, 6);
    }

    #[test]
    fn test_reuse_exact_length_only() {
        let arena = arena(16);
        let two = arena.allocate(1, 64).unwrap();
        arena.mark_free(&two);

        // Three blocks do not fit a free two-block run.
        let three = arena.allocate(2, 150).unwrap();
        assert_ne!(three.index(), two.index());

        let again = arena.allocate(3, 60).unwrap();
        assert_eq!(again, two);
        assert!(!arena.is_free(&again));
        assert_eq!(arena.message_id(&again), 3);
    }

    #[test]
    fn test_first_fit_prefers_newest() {
        let arena = arena(16);
        let a = arena.allocate(1, 8).unwrap();
        let b = arena.allocate(2, 8).unwrap();
        arena.mark_free(&a);
        arena.mark_free(&b);
        assert_eq!(arena.allocate(3, 8).unwrap(), b);
        assert_eq!(arena.allocate(4, 8).unwrap(), a);
    }

    #[test]
    fn test_exhaustion_reports_required_size() {
        let arena = arena(4);
        arena.allocate(1, 8).unwrap();
        let before = arena.stats().unwrap();

        let err = arena.allocate(2, 200).unwrap_err();
        assert!(matches!(err, ShmError::ArenaExhausted { required_bytes } if required_bytes == 6 * 64));
        assert_eq!(arena.stats().unwrap(), before);
    }

    #[test]
    fn test_resolve_validates_offset() {
        let arena = arena(8);
        let run = arena.allocate(1, 70).unwrap();
        arena.publish(&run);
        assert_eq!(arena.resolve(arena.current()).unwrap(), run);

        assert!(matches!(arena.resolve(0), Err(ShmError::ArenaCorrupted { .. })));
        assert!(matches!(arena.resolve(8), Err(ShmError::ArenaCorrupted { .. })));
        assert!(matches!(arena.resolve(NO_BLOCK), Err(ShmError::ArenaCorrupted { .. })));
    }

    #[test]
    fn test_resolve_rejects_overlong_run() {
        let arena = arena(8);
        let run = arena.allocate(1, 8).unwrap();
        arena
            .block_header(run.index())
            .length_in_blocks
            .store(50, Ordering::Relaxed);
        assert!(arena.resolve(run.index()).is_err());
    }

    #[test]
    fn test_forward_link_is_corruption() {
        let arena = arena(16);
        let a = arena.allocate(1, 8).unwrap();
        let b = arena.allocate(2, 8).unwrap();
        set_link(&arena, a.index(), b.index());

        let err = arena.allocate(3, 8).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_self_link_is_corruption() {
        let arena = arena(16);
        let a = arena.allocate(1, 8).unwrap();
        set_link(&arena, a.index(), a.index());
        assert!(arena.stats().is_err());
    }

    #[test]
    fn test_out_of_range_head_is_corruption() {
        let arena = arena(16);
        arena.allocate(1, 8).unwrap();
        arena
            .header()
            .small_free_list_head
            .store(99, Ordering::Relaxed);
        assert!(matches!(
            arena.allocate(2, 8),
            Err(ShmError::ArenaCorrupted { .. })
        ));
    }

    #[test]
    fn test_corrupt_bump_offset() {
        let arena = arena(8);
        arena.header().bump_offset.store(0, Ordering::Relaxed);
        assert!(matches!(
            arena.allocate(1, 8),
            Err(ShmError::ArenaCorrupted { .. })
        ));
    }

    #[test]
    fn test_payload_copy() {
        let arena = arena(8);
        let run = arena.allocate(1, 90).unwrap();
        let data: Vec<u8> = (0..run.payload_capacity() as u8).collect();
        arena.write_payload(&run, 0, &data);

        let mut out = vec![0u8; data.len()];
        arena.read_payload(&run, 0, &mut out);
        assert_eq!(out, data);
    }
}
