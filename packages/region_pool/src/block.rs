use std::alloc::{Layout, alloc, dealloc};
use std::num::NonZero;
use std::ptr::NonNull;

use new_zealand::nz;
use static_assertions::const_assert;

/// Alignment of every address handed out by a pool, and of every raw block
/// obtained from the OS allocator.
pub const ALLOC_ALIGNMENT: usize = 8;

/// Standard block size used when a context is built without an explicit one.
pub const DEFAULT_BLOCK_SIZE: NonZero<usize> = nz!(8192);

/// Smallest standard block size a context will accept; requests below this
/// are clamped up.
pub const MIN_BLOCK_SIZE: NonZero<usize> = nz!(256);

/// Header at the start of every memory region obtained from the OS, whether
/// standard-sized or oversized. The data area begins immediately after it.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Total size of the region in bytes, this header included.
    pub(crate) size: usize,

    /// Intrusive link. Chains free standard blocks in the context, the
    /// blocks backing a pool, a pool's oversized blocks, and same-size
    /// fragments inside the memtree.
    pub(crate) next: Option<NonNull<BlockHeader>>,
}

pub(crate) const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

// The minimum standard block must fit the header plus at least one memtree
// node, otherwise freed tails could never be recycled.
const_assert!(MIN_BLOCK_SIZE.get() >= BLOCK_HEADER_SIZE + size_of::<crate::memtree::MemtreeNode>());
const_assert!(BLOCK_HEADER_SIZE % ALLOC_ALIGNMENT == 0);

/// Rounds `n` up to [`ALLOC_ALIGNMENT`]. The caller must have excluded
/// overflow (see [`checked_align_up`] for untrusted sizes).
pub(crate) const fn align_up(n: usize) -> usize {
    (n + (ALLOC_ALIGNMENT - 1)) & !(ALLOC_ALIGNMENT - 1)
}

/// Overflow-checked variant of [`align_up`] for caller-supplied sizes.
pub(crate) const fn checked_align_up(n: usize) -> Option<usize> {
    match n.checked_add(ALLOC_ALIGNMENT - 1) {
        Some(padded) => Some(padded & !(ALLOC_ALIGNMENT - 1)),
        None => None,
    }
}

/// Obtains `size` bytes from the OS allocator, aligned to
/// [`ALLOC_ALIGNMENT`]. Returns `None` when the allocator reports
/// exhaustion or the size is not representable as a layout.
pub(crate) fn raw_alloc(size: usize) -> Option<NonNull<u8>> {
    let layout = Layout::from_size_align(size, ALLOC_ALIGNMENT).ok()?;

    // SAFETY: `size` is at least BLOCK_HEADER_SIZE at every call site, so
    // the layout is never zero-sized.
    NonNull::new(unsafe { alloc(layout) })
}

/// Returns a region previously obtained through [`raw_alloc`] to the OS.
///
/// # Safety
///
/// `ptr` must have been returned by [`raw_alloc`] with exactly this `size`,
/// and must not be used afterwards.
pub(crate) unsafe fn raw_free(ptr: NonNull<u8>, size: usize) {
    let layout = Layout::from_size_align(size, ALLOC_ALIGNMENT)
        .expect("layout was valid at allocation time, so it is valid now");

    // SAFETY: The caller guarantees `ptr` came from `raw_alloc(size)`,
    // which used this exact layout.
    unsafe { dealloc(ptr.as_ptr(), layout) };
}

/// Initializes a fresh region as a block of `size` total bytes and returns
/// its header.
///
/// # Safety
///
/// `mem` must point to at least `size` writable bytes aligned to
/// [`ALLOC_ALIGNMENT`], with `size >= BLOCK_HEADER_SIZE`.
pub(crate) unsafe fn init_block(mem: NonNull<u8>, size: usize) -> NonNull<BlockHeader> {
    let block = mem.cast::<BlockHeader>();

    // SAFETY: The caller guarantees the region is writable, large enough
    // for the header and properly aligned.
    unsafe { block.as_ptr().write(BlockHeader { size, next: None }) };

    block
}

/// First usable byte of a block's data area.
///
/// # Safety
///
/// `block` must point to a live block header.
pub(crate) unsafe fn block_data(block: NonNull<BlockHeader>) -> NonNull<u8> {
    // SAFETY: Every block is at least BLOCK_HEADER_SIZE bytes, so the data
    // area start is within (or one past) the allocation.
    unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(BLOCK_HEADER_SIZE)) }
}

/// One-past-the-end address of a block.
///
/// # Safety
///
/// `block` must point to a live block header.
pub(crate) unsafe fn block_end(block: NonNull<BlockHeader>) -> *mut u8 {
    // SAFETY: The caller guarantees a live header; `size` spans the
    // allocation, so the offset stays one past its end.
    unsafe { block.as_ptr().cast::<u8>().add((*block.as_ptr()).size) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_alignment() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), ALLOC_ALIGNMENT);
        assert_eq!(align_up(ALLOC_ALIGNMENT), ALLOC_ALIGNMENT);
        assert_eq!(align_up(100), 104);
    }

    #[test]
    fn checked_align_up_rejects_overflow() {
        assert_eq!(checked_align_up(usize::MAX), None);
        assert_eq!(checked_align_up(usize::MAX - ALLOC_ALIGNMENT), None);
        assert_eq!(checked_align_up(24), Some(24));
    }

    #[test]
    fn block_round_trip() {
        let mem = raw_alloc(256).expect("test allocation");
        // SAFETY: 256 writable aligned bytes were just allocated.
        let block = unsafe { init_block(mem, 256) };

        // SAFETY: `block` was initialized above.
        unsafe {
            assert_eq!((*block.as_ptr()).size, 256);
            assert!((*block.as_ptr()).next.is_none());
            assert_eq!(
                block_end(block),
                mem.as_ptr().add(256),
                "end must be base plus total size"
            );
        }
        // SAFETY: `block` was initialized above.
        let data = unsafe { block_data(block) };
        assert_eq!(data.as_ptr(), mem.as_ptr().wrapping_add(BLOCK_HEADER_SIZE));

        // SAFETY: Allocated above with this exact size; not used again.
        unsafe { raw_free(mem, 256) };
    }
}
