//! Pools: bump-pointer arenas over chains of cached blocks.
//!
//! A pool's own header lives inside its first standard block, exactly where
//! the allocator placed it, so creating a pool costs one block acquisition
//! and destroying it returns that block along with everything else. Pools
//! form a tree; destroying a parent destroys its children first.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use crate::block::{
    ALLOC_ALIGNMENT, BLOCK_HEADER_SIZE, BlockHeader, align_up, block_data, block_end,
    checked_align_up, init_block,
};
use crate::context::{self, Context, ContextCore};
use crate::memtree::{MIN_FRAGMENT, MemTree};
use crate::track::{self, CleanupFn, Registration, TrackLink, UsedReg};

/// Pool state, written into the data area of the pool's first block.
#[repr(C)]
pub(crate) struct PoolCore {
    /// Bump pointer inside `current_block`. Null-poisoned on destroy in
    /// debug builds to trap use-after-destroy.
    pub(crate) current: *mut u8,

    /// Whether allocations carry a recorded length for `freemem_auto`.
    pub(crate) coalesce: bool,

    /// Last block of the chain; the only one with bump space left.
    pub(crate) current_block: NonNull<BlockHeader>,

    /// Head of the block chain; also holds this very structure.
    pub(crate) first_block: NonNull<BlockHeader>,

    /// Reusable fragments inside this pool's blocks.
    pub(crate) remnants: MemTree,

    /// Oversized blocks charged to this pool, returned to the context's
    /// best-fit cache on clear.
    pub(crate) nonstd_blocks: Option<NonNull<BlockHeader>>,

    pub(crate) ctx: NonNull<ContextCore>,

    pub(crate) parent: Option<NonNull<PoolCore>>,
    pub(crate) sibling: Option<NonNull<PoolCore>>,
    pub(crate) child: Option<NonNull<PoolCore>>,

    /// Embedded tracking record; its owner list is this pool's cleanup
    /// list.
    pub(crate) track: Registration,
}

/// Bytes reserved at the start of the first block's data area for the pool
/// header itself.
const POOL_RESERVED: usize = align_up(size_of::<PoolCore>());

unsafe fn create_core(ctx: NonNull<ContextCore>, coalesce: bool) -> Option<NonNull<PoolCore>> {
    // SAFETY: Caller guarantees a live context. The acquired block is
    // standard-sized, which is statically known to fit the pool header.
    unsafe {
        let blk = context::acquire_std_block(ctx)?;
        let base = block_data(blk);
        let pool = base.cast::<PoolCore>();

        pool.as_ptr().write(PoolCore {
            current: base.as_ptr().add(POOL_RESERVED),
            coalesce,
            current_block: blk,
            first_block: blk,
            remnants: MemTree::new(),
            nonstd_blocks: None,
            ctx,
            parent: None,
            sibling: None,
            child: None,
            track: Registration::Used(UsedReg {
                tracked: pool.cast::<()>(),
                cleanup: track::pool_cleanup,
                owners: None,
                dependents: None,
            }),
        });

        Some(pool)
    }
}

/// Creates a root pool and links it into the context's root list.
pub(crate) unsafe fn create_root_core(
    ctx: NonNull<ContextCore>,
    coalesce: bool,
) -> Option<NonNull<PoolCore>> {
    // SAFETY: Caller guarantees a live context.
    unsafe {
        let pool = create_core(ctx, coalesce)?;
        (*pool.as_ptr()).sibling = (*ctx.as_ptr()).roots;
        (*ctx.as_ptr()).roots = Some(pool);
        Some(pool)
    }
}

/// Creates a child pool at the head of the parent's child list.
pub(crate) unsafe fn create_child_core(
    parent: NonNull<PoolCore>,
    coalesce: bool,
) -> Option<NonNull<PoolCore>> {
    // SAFETY: Caller guarantees a live parent pool, which implies a live
    // context.
    unsafe {
        let pool = create_core((*parent.as_ptr()).ctx, coalesce)?;
        (*pool.as_ptr()).parent = Some(parent);
        (*pool.as_ptr()).sibling = (*parent.as_ptr()).child;
        (*parent.as_ptr()).child = Some(pool);
        Some(pool)
    }
}

/// The allocation search: bump, remnants, fresh standard block, oversized
/// block, in that order. `amt` is already aligned.
unsafe fn alloc_aligned(pool: NonNull<PoolCore>, amt: usize) -> Option<NonNull<u8>> {
    // SAFETY: Caller guarantees a live pool; all blocks and remnants
    // reachable from it are owned by it or its context.
    unsafe {
        let p = pool.as_ptr();
        debug_assert!(!(*p).current.is_null(), "pool used after destroy");

        let end = block_end((*p).current_block);
        let remaining = end as usize - (*p).current as usize;
        if remaining >= amt {
            let r = (*p).current;
            (*p).current = r.add(amt);
            return Some(NonNull::new_unchecked(r));
        }

        if let Some(frag) = (*p).remnants.fetch(amt) {
            let fsize = (*frag.as_ptr()).size;
            let base = frag.cast::<u8>();
            let tail = fsize - amt;
            if tail >= MIN_FRAGMENT {
                (*p).remnants
                    .insert(NonNull::new_unchecked(base.as_ptr().add(amt)), tail);
            }
            return Some(base);
        }

        let ctx = (*p).ctx;
        let stdsize = (*ctx.as_ptr()).stdsize;
        debug_assert!(stdsize > BLOCK_HEADER_SIZE);

        if amt <= stdsize - BLOCK_HEADER_SIZE {
            // The tail of the exhausted block stays reusable.
            if remaining >= MIN_FRAGMENT {
                (*p).remnants
                    .insert(NonNull::new_unchecked((*p).current), remaining);
            }

            let blk = context::acquire_std_block(ctx)?;
            (*(*p).current_block.as_ptr()).next = Some(blk);
            (*p).current_block = blk;

            let r = block_data(blk);
            (*p).current = r.as_ptr().add(amt);
            return Some(r);
        }

        // Oversized: bypass the block chain entirely.
        let total = BLOCK_HEADER_SIZE.checked_add(amt)?;
        let blk = match context::fetch_nonstd(ctx, total) {
            Some(blk) => blk,
            None => {
                let mem = context::alloc_raw(ctx, total)?;
                init_block(mem, total)
            }
        };
        (*blk.as_ptr()).next = (*p).nonstd_blocks;
        (*p).nonstd_blocks = Some(blk);

        let r = block_data(blk);
        let excess = (*blk.as_ptr()).size - total;
        if excess >= MIN_FRAGMENT {
            (*p).remnants
                .insert(NonNull::new_unchecked(r.as_ptr().add(amt)), excess);
        }
        Some(r)
    }
}

pub(crate) unsafe fn try_alloc_core(pool: NonNull<PoolCore>, n: usize) -> Option<NonNull<u8>> {
    // SAFETY: Caller guarantees a live pool.
    unsafe {
        let amt = checked_align_up(n)?;
        if (*pool.as_ptr()).coalesce {
            // Reserve one extra word ahead of the returned address and
            // record the usable length there for `freemem_auto`.
            let head = alloc_aligned(pool, amt.checked_add(ALLOC_ALIGNMENT)?)?;
            head.cast::<usize>().as_ptr().write(amt);
            return Some(NonNull::new_unchecked(head.as_ptr().add(ALLOC_ALIGNMENT)));
        }
        alloc_aligned(pool, amt)
    }
}

/// Allocation for internal bookkeeping structures: exhaustion terminates
/// the process regardless of the fail-allowing policies.
pub(crate) unsafe fn alloc_infallible(pool: NonNull<PoolCore>, n: usize) -> NonNull<u8> {
    // SAFETY: Caller guarantees a live pool.
    match unsafe { try_alloc_core(pool, n) } {
        Some(mem) => mem,
        None => context::oom_abort(n),
    }
}

pub(crate) unsafe fn strmemdup_core(pool: NonNull<PoolCore>, bytes: &[u8]) -> NonNull<u8> {
    // SAFETY: Caller guarantees a live pool; the allocation is at least
    // `bytes.len() + 1` bytes and freshly carved, so the copy cannot
    // overlap.
    unsafe {
        let r = alloc_infallible(pool, bytes.len() + 1);
        ptr::copy_nonoverlapping(bytes.as_ptr(), r.as_ptr(), bytes.len());
        r.as_ptr().add(bytes.len()).write(0);
        r
    }
}

/// Clears the pool: cleanup protocol first, then all memory beyond the
/// first block flows back to the context.
pub(crate) unsafe fn clear_core(pool: NonNull<PoolCore>) {
    // SAFETY: Caller guarantees a live pool.
    unsafe {
        track::run_cleanup_protocol(pool);

        let p = pool.as_ptr();
        let ctx = (*p).ctx;

        context::release_nonstd_chain(ctx, (*p).nonstd_blocks.take());

        let first = (*p).first_block;
        let mut scan = (*first.as_ptr()).next.take();
        while let Some(blk) = scan {
            scan = (*blk.as_ptr()).next.take();
            context::release_std_block(ctx, blk);
        }

        (*p).current_block = first;
        (*p).current = pool.as_ptr().cast::<u8>().add(POOL_RESERVED);
        (*p).remnants.clear();
    }
}

pub(crate) unsafe fn destroy_core(pool: NonNull<PoolCore>) {
    // SAFETY: Caller guarantees a live pool.
    unsafe {
        clear_core(pool);
        track::deregister_pool(pool);

        let p = pool.as_ptr();
        let ctx = (*p).ctx;
        let list = match (*p).parent {
            Some(parent) => &raw mut (*parent.as_ptr()).child,
            None => &raw mut (*ctx.as_ptr()).roots,
        };
        unlink_pool(list, pool);

        let first = (*p).first_block;
        #[cfg(debug_assertions)]
        {
            (*p).current = ptr::null_mut();
        }
        // The pool header rides along: it lives in this block's data area.
        context::release_std_block(ctx, first);
    }
}

unsafe fn unlink_pool(list: *mut Option<NonNull<PoolCore>>, target: NonNull<PoolCore>) {
    // SAFETY: Caller guarantees the sibling chain is intact and contains
    // `target` exactly once.
    unsafe {
        let mut slot = list;
        while let Some(cur) = *slot {
            if cur == target {
                *slot = (*cur.as_ptr()).sibling.take();
                return;
            }
            slot = &raw mut (*cur.as_ptr()).sibling;
        }
        debug_assert!(false, "pool missing from its sibling chain");
    }
}

/// An allocation arena whose contents live and die as a unit.
///
/// Obtained from [`Context::root_pool`] or [`Pool::child`]. The handle
/// borrows its context, so a context cannot be dropped while pool handles
/// exist; destruction of individual pools is explicit.
///
/// Allocations are raw byte ranges: writing through the returned pointers
/// is the caller's unsafe business, as is keeping them away from
/// [`clear`](Self::clear) and [`destroy`](Self::destroy).
pub struct Pool<'ctx> {
    core: NonNull<PoolCore>,
    _context: PhantomData<&'ctx Context>,
}

impl fmt::Debug for Pool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("at", &self.core).finish()
    }
}

impl<'ctx> Pool<'ctx> {
    pub(crate) fn from_core(core: NonNull<PoolCore>) -> Self {
        Self {
            core,
            _context: PhantomData,
        }
    }

    /// Creates a child pool. It is destroyed transitively when this pool
    /// is cleared or destroyed.
    #[must_use]
    pub fn child(&self) -> Pool<'ctx> {
        // SAFETY: The handle vouches for a live pool.
        match unsafe { create_child_core(self.core, false) } {
            Some(core) => Pool::from_core(core),
            None => context::oom_abort(BLOCK_HEADER_SIZE),
        }
    }

    /// Creates a child pool whose allocations record their length, making
    /// [`freemem_auto`](Self::freemem_auto) available at the cost of one
    /// word per allocation.
    #[must_use]
    pub fn child_coalescing(&self) -> Pool<'ctx> {
        // SAFETY: The handle vouches for a live pool.
        match unsafe { create_child_core(self.core, true) } {
            Some(core) => Pool::from_core(core),
            None => context::oom_abort(BLOCK_HEADER_SIZE),
        }
    }

    /// Allocates `n` bytes, aligned to [`ALLOC_ALIGNMENT`]. The memory is
    /// uninitialized and stays valid until the pool is cleared or
    /// destroyed. Exhaustion is resolved by the context's OOM policy; if
    /// the policy allows failure, the process is terminated anyway — use
    /// [`try_alloc`](Self::try_alloc) to observe it.
    #[must_use]
    pub fn alloc(&self, n: usize) -> NonNull<u8> {
        // SAFETY: The handle vouches for a live pool.
        match unsafe { try_alloc_core(self.core, n) } {
            Some(mem) => mem,
            None => context::oom_abort(n),
        }
    }

    /// Fallible variant of [`alloc`](Self::alloc): returns `None` when the
    /// OOM policy permits failure and raw allocation is exhausted (or `n`
    /// overflows when padded).
    #[must_use]
    pub fn try_alloc(&self, n: usize) -> Option<NonNull<u8>> {
        // SAFETY: The handle vouches for a live pool.
        unsafe { try_alloc_core(self.core, n) }
    }

    /// Returns an allocation to this pool for reuse. Fragments too small
    /// to index (below the memtree node size) are silently dropped.
    ///
    /// The length is **not** recorded anywhere for ordinary pools — the
    /// caller must pass the exact allocated length. Coalescing pools can
    /// use [`freemem_auto`](Self::freemem_auto) instead.
    ///
    /// # Safety
    ///
    /// `[mem, mem + len)` must be an unused range previously returned by
    /// an allocation from this pool (with `len` its exact padded length),
    /// and nothing may touch it after this call.
    pub unsafe fn freemem(&self, mem: NonNull<u8>, len: usize) {
        // SAFETY: Forwarded caller contract.
        unsafe {
            if len < MIN_FRAGMENT {
                return;
            }
            (*self.core.as_ptr()).remnants.insert(mem, len);
        }
    }

    /// Returns an allocation made from a coalescing pool, recovering its
    /// length from the recorded word.
    ///
    /// # Safety
    ///
    /// `mem` must have been returned by an allocation from this pool
    /// (which must be coalescing), be unused, and never touched again.
    pub unsafe fn freemem_auto(&self, mem: NonNull<u8>) {
        // SAFETY: Coalescing allocations place their padded length one
        // word ahead of the returned address.
        unsafe {
            assert!(
                (*self.core.as_ptr()).coalesce,
                "freemem_auto requires a coalescing pool"
            );
            let head = mem.as_ptr().sub(ALLOC_ALIGNMENT);
            let amt = head.cast::<usize>().read();
            self.freemem(NonNull::new_unchecked(head), amt + ALLOC_ALIGNMENT);
        }
    }

    /// Runs the cleanup protocol, destroys all child pools and recycles
    /// every block except the first, whose bump pointer is rewound. The
    /// pool is immediately usable again; clearing an already-clear pool is
    /// a no-op.
    ///
    /// # Safety
    ///
    /// All allocations from this pool and all handles to its descendant
    /// pools become invalid and must not be used afterwards.
    pub unsafe fn clear(&self) {
        // SAFETY: Forwarded caller contract.
        unsafe { clear_core(self.core) };
    }

    /// Clears the pool, unlinks it from its parent and returns its own
    /// block — the one holding the pool header — to the context.
    ///
    /// # Safety
    ///
    /// As for [`clear`](Self::clear); additionally the pool itself is gone
    /// afterwards. Pools not destroyed explicitly are destroyed by their
    /// parent or the context, so destroying is optional but must not
    /// happen twice.
    pub unsafe fn destroy(self) {
        // SAFETY: Forwarded caller contract.
        unsafe { destroy_core(self.core) };
    }

    /// Registers this pool in the context's tracking registry so it can
    /// participate in the ownership graph like any other entity (for
    /// example as an owner of another pool).
    pub fn track(&self) {
        // SAFETY: The handle vouches for a live pool.
        unsafe { track::track_pool(self.core) };
    }

    /// The pool's identity in the tracking graph: pass this to
    /// [`cleanup_register`](Self::cleanup_register) on another pool (after
    /// calling [`track`](Self::track)) to have this pool destroyed when
    /// the other one is cleared.
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<()> {
        self.core.cast::<()>()
    }

    /// Registers `tracked` as an owner of this pool: `cleanup(tracked)`
    /// runs before the pool's memory is reused, on every exit path (clear,
    /// destroy, context teardown). Cleanups run newest-first; handlers may
    /// re-register work on the pool, which the protocol drains before
    /// returning.
    ///
    /// # Safety
    ///
    /// `tracked` must remain valid until its cleanup has run, and
    /// `cleanup` must be safe to invoke with it at that point.
    pub unsafe fn cleanup_register(&self, tracked: NonNull<()>, cleanup: CleanupFn) {
        // SAFETY: Forwarded caller contract.
        unsafe { track::register_owner(self.core, tracked, cleanup) };
    }

    /// Copies `s` into the pool, appending a trailing NUL byte.
    #[must_use]
    pub fn strdup(&self, s: &str) -> NonNull<u8> {
        self.strmemdup(s.as_bytes())
    }

    /// Copies `bytes` into the pool, appending a trailing NUL byte.
    #[must_use]
    pub fn strmemdup(&self, bytes: &[u8]) -> NonNull<u8> {
        // SAFETY: The handle vouches for a live pool.
        unsafe { strmemdup_core(self.core, bytes) }
    }

    /// Copies at most `limit` bytes of `bytes`, stopping early at the
    /// first NUL, then appends a trailing NUL byte.
    #[must_use]
    pub fn strndup(&self, bytes: &[u8], limit: usize) -> NonNull<u8> {
        let capped = &bytes[..bytes.len().min(limit)];
        let len = capped.iter().position(|&b| b == 0).unwrap_or(capped.len());
        self.strmemdup(&capped[..len])
    }

    /// Copies `bytes` into the pool verbatim, no terminator.
    #[must_use]
    pub fn memdup(&self, bytes: &[u8]) -> NonNull<u8> {
        let r = self.alloc(bytes.len());
        // SAFETY: `r` addresses at least `bytes.len()` fresh bytes, which
        // cannot overlap the source.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), r.as_ptr(), bytes.len()) };
        r
    }

    /// Formats into the pool, appending a trailing NUL byte. This is the
    /// message-formatting seam the error subsystem uses.
    #[must_use]
    pub fn sprintf(&self, args: fmt::Arguments<'_>) -> NonNull<u8> {
        let formatted = fmt::format(args);
        self.strmemdup(formatted.as_bytes())
    }

    /// Snapshots the pool's allocation state. [`Post::reset`] rewinds to
    /// it, releasing everything allocated since.
    #[must_use]
    pub fn post(&self) -> Post<'_> {
        // SAFETY: The handle vouches for a live pool.
        unsafe {
            let p = self.core.as_ptr();
            Post {
                pool: self.core,
                saved_current: (*p).current,
                saved_block: (*p).current_block,
                saved_nonstd: (*p).nonstd_blocks,
                saved_owners: (*p).track.used_mut().owners,
                _pool: PhantomData,
            }
        }
    }

    /// Whether allocations from this pool record their length.
    #[must_use]
    pub fn is_coalescing(&self) -> bool {
        // SAFETY: The handle vouches for a live pool.
        unsafe { (*self.core.as_ptr()).coalesce }
    }

    /// Number of standard blocks currently backing this pool.
    #[must_use]
    pub fn standard_block_count(&self) -> usize {
        // SAFETY: The handle vouches for a live pool and an intact chain.
        unsafe {
            let mut n = 0;
            let mut scan = Some((*self.core.as_ptr()).first_block);
            while let Some(blk) = scan {
                n += 1;
                scan = (*blk.as_ptr()).next;
            }
            n
        }
    }

    /// Number of oversized blocks currently charged to this pool.
    #[must_use]
    pub fn oversized_block_count(&self) -> usize {
        // SAFETY: The handle vouches for a live pool and an intact chain.
        unsafe {
            let mut n = 0;
            let mut scan = (*self.core.as_ptr()).nonstd_blocks;
            while let Some(blk) = scan {
                n += 1;
                scan = (*blk.as_ptr()).next;
            }
            n
        }
    }
}

/// A snapshot of a pool's allocation state, taken with [`Pool::post`].
///
/// Resetting runs the cleanups registered since the snapshot and releases
/// the blocks acquired since, rewinding the bump pointer. Child pools
/// created after the snapshot are not touched.
pub struct Post<'pool> {
    pool: NonNull<PoolCore>,
    saved_current: *mut u8,
    saved_block: NonNull<BlockHeader>,
    saved_nonstd: Option<NonNull<BlockHeader>>,
    saved_owners: Option<NonNull<TrackLink>>,
    _pool: PhantomData<&'pool ()>,
}

impl fmt::Debug for Post<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Post").field("pool", &self.pool).finish()
    }
}

impl Post<'_> {
    /// Rewinds the pool to this snapshot. The same post may be reset
    /// repeatedly.
    ///
    /// # Safety
    ///
    /// Every allocation made from the pool since the snapshot becomes
    /// invalid. The pool must not have been cleared (or destroyed) since
    /// the snapshot was taken — clearing invalidates all of its posts.
    pub unsafe fn reset(&self) {
        // SAFETY: The caller guarantees the snapshot is still current, so
        // the saved block and owner cell are still on the pool's lists.
        unsafe {
            let p = self.pool.as_ptr();

            track::cleanup_owners_until(self.pool, self.saved_owners);

            let ctx = (*p).ctx;
            while (*p).nonstd_blocks != self.saved_nonstd {
                let Some(blk) = (*p).nonstd_blocks else {
                    debug_assert!(false, "post snapshot no longer matches the pool");
                    break;
                };
                (*p).nonstd_blocks = (*blk.as_ptr()).next.take();
                context::release_nonstd_block(ctx, blk);
            }

            let mut scan = (*self.saved_block.as_ptr()).next.take();
            while let Some(blk) = scan {
                scan = (*blk.as_ptr()).next.take();
                context::release_std_block(ctx, blk);
            }

            // Remnants may point into the released blocks; drop them all.
            (*p).remnants.clear();
            (*p).current_block = self.saved_block;
            (*p).current = self.saved_current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn allocations_bump_within_one_block() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let a = pool.alloc(24);
        let b = pool.alloc(8);
        // SAFETY: Both allocations are live and adjacent by construction.
        unsafe {
            assert_eq!(b.as_ptr(), a.as_ptr().add(24));
        }
        assert_eq!(pool.standard_block_count(), 1);
    }

    #[test]
    fn unaligned_sizes_are_padded() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let a = pool.alloc(1);
        let b = pool.alloc(1);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, ALLOC_ALIGNMENT);
        assert_eq!(a.as_ptr() as usize % ALLOC_ALIGNMENT, 0);
    }

    #[test]
    fn exhausted_block_rolls_over_to_a_fresh_one() {
        let ctx = Context::builder().stdsize(512).build();
        let pool = ctx.root_pool();

        // Burn through the first block.
        while pool.standard_block_count() == 1 {
            let _ = pool.alloc(64);
        }
        assert_eq!(pool.standard_block_count(), 2);
        assert_eq!(pool.oversized_block_count(), 0);
    }

    #[test]
    fn oversized_requests_bypass_the_block_chain() {
        let ctx = Context::builder().stdsize(1024).build();
        let pool = ctx.root_pool();

        let big = pool.alloc(4000);
        assert_eq!(pool.oversized_block_count(), 1);
        assert_eq!(pool.standard_block_count(), 1);

        // SAFETY: The 4000 bytes are live; prove they are writable.
        unsafe { big.as_ptr().write_bytes(0xA5, 4000) };
    }

    /// Fills the root pool's current block completely so the next
    /// allocation cannot take the bump path. Assumes a 256-byte stdsize.
    fn exhaust_first_block(pool: &Pool<'_>) {
        let free = 256 - BLOCK_HEADER_SIZE - POOL_RESERVED;
        let _ = pool.alloc(free);
    }

    #[test]
    fn freed_memory_is_reused_best_fit() {
        let ctx = Context::builder().stdsize(256).build();
        let pool = ctx.root_pool();
        exhaust_first_block(&pool);

        // Fill a fresh block exactly: 64 + 104 + 72 = 240 data bytes.
        let a = pool.alloc(64);
        let _b = pool.alloc(104);
        let c = pool.alloc(72);
        assert_eq!(pool.standard_block_count(), 2);

        // SAFETY: Both ranges were allocated above and are unused.
        unsafe {
            pool.freemem(a, 64);
            pool.freemem(c, 72);
        }

        // Bump space is gone, so the remnant tree answers: best fit for
        // 70 bytes is the 72-byte fragment, not the 64-byte one.
        let d = pool.alloc(70);
        assert_eq!(d.as_ptr(), c.as_ptr());
        let e = pool.alloc(48);
        assert_eq!(e.as_ptr(), a.as_ptr());
        assert_eq!(pool.standard_block_count(), 2, "no new block needed");
    }

    #[test]
    fn fragment_split_leaves_usable_tail() {
        let ctx = Context::builder().stdsize(256).build();
        let pool = ctx.root_pool();
        exhaust_first_block(&pool);

        let a = pool.alloc(240);
        // SAFETY: `a` was allocated above and is unused.
        unsafe { pool.freemem(a, 240) };

        let head = pool.alloc(64);
        assert_eq!(head.as_ptr(), a.as_ptr());
        let tail = pool.alloc(160);
        // SAFETY: Address arithmetic on live allocations.
        unsafe { assert_eq!(tail.as_ptr(), a.as_ptr().add(64)) };
    }

    #[test]
    fn tiny_freed_fragments_are_dropped() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let a = pool.alloc(8);
        let next_before = pool.alloc(8);
        // SAFETY: `a` was allocated above and is unused. Too small to
        // index, so it must simply vanish.
        unsafe { pool.freemem(a, 8) };
        let c = pool.alloc(8);
        // SAFETY: Address arithmetic on live allocations.
        unsafe { assert_eq!(c.as_ptr(), next_before.as_ptr().add(8)) };
    }

    #[test]
    fn clear_rewinds_to_the_first_block() {
        let ctx = Context::builder().stdsize(512).build();
        let pool = ctx.root_pool();

        let first = pool.alloc(16);
        for _ in 0..64 {
            let _ = pool.alloc(128);
        }
        assert!(pool.standard_block_count() > 1);

        // SAFETY: No allocation from this pool is used afterwards.
        unsafe { pool.clear() };
        assert_eq!(pool.standard_block_count(), 1);

        let again = pool.alloc(16);
        assert_eq!(again.as_ptr(), first.as_ptr());
    }

    #[test]
    fn clear_is_idempotent() {
        let ctx = Context::new();
        let pool = ctx.root_pool();
        let first = pool.alloc(32);

        // SAFETY: No allocation from this pool is used afterwards.
        unsafe {
            pool.clear();
            pool.clear();
        }
        let again = pool.alloc(32);
        assert_eq!(again.as_ptr(), first.as_ptr());
    }

    #[test]
    fn destroyed_children_return_their_blocks() {
        let ctx = Context::new();
        let pool = ctx.root_pool();
        let child = pool.child();
        let _ = child.alloc(64);

        let cached_before = ctx.cached_standard_blocks();
        // SAFETY: `child` has no descendants and no live allocations.
        unsafe { child.destroy() };
        assert_eq!(ctx.cached_standard_blocks(), cached_before + 1);
    }

    #[test]
    fn coalescing_allocations_carry_a_length_word() {
        let ctx = Context::new();
        let pool = ctx.root_pool();
        let co = pool.child_coalescing();
        assert!(co.is_coalescing());

        let a = co.alloc(100);
        let b = co.alloc(10);
        // Prefix word: consecutive allocations sit one word apart beyond
        // their padded sizes.
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            104 + ALLOC_ALIGNMENT
        );
    }

    #[test]
    fn coalescing_pool_recovers_lengths() {
        let ctx = Context::builder().stdsize(256).build();
        let pool = ctx.root_pool();
        let co = pool.child_coalescing();

        // First block data after the pool header, filled completely by
        // one prefixed 104-byte allocation plus one exact filler.
        let free = 256 - BLOCK_HEADER_SIZE - POOL_RESERVED;
        let a = co.alloc(100); // 104 + 8 prefix = 112 bytes consumed
        let remaining = free - 112;
        if remaining >= ALLOC_ALIGNMENT {
            let _fill = co.alloc(remaining - ALLOC_ALIGNMENT);
        }

        // SAFETY: `a` is unused; the pool is coalescing.
        unsafe { co.freemem_auto(a) };

        // Bump space is gone, so the recovered 112-byte fragment (prefix
        // word included) is reused for an identical request.
        let c = co.alloc(100);
        assert_eq!(c.as_ptr(), a.as_ptr());
        assert_eq!(co.standard_block_count(), 1);
    }

    #[test]
    fn string_helpers_copy_and_terminate() {
        let ctx = Context::new();
        let pool = ctx.root_pool();

        let s = pool.strdup("hello");
        // SAFETY: strdup returned six live bytes.
        unsafe {
            assert_eq!(std::slice::from_raw_parts(s.as_ptr(), 5), b"hello");
            assert_eq!(*s.as_ptr().add(5), 0);
        }

        let n = pool.strndup(b"ab\0cd", 4);
        // SAFETY: strndup stops at the NUL and terminates.
        unsafe {
            assert_eq!(std::slice::from_raw_parts(n.as_ptr(), 3), b"ab\0");
        }

        let m = pool.memdup(&[1, 2, 3]);
        // SAFETY: memdup returned three live bytes.
        unsafe {
            assert_eq!(std::slice::from_raw_parts(m.as_ptr(), 3), &[1, 2, 3]);
        }

        let f = pool.sprintf(format_args!("x={}", 41 + 1));
        // SAFETY: sprintf NUL-terminates its output.
        unsafe {
            assert_eq!(std::slice::from_raw_parts(f.as_ptr(), 5), b"x=42\0");
        }
    }

    #[test]
    fn post_reset_rewinds_allocations() {
        let ctx = Context::builder().stdsize(512).build();
        let pool = ctx.root_pool();

        let keep = pool.alloc(32);
        let post = pool.post();

        for _ in 0..32 {
            let _ = pool.alloc(100);
        }
        let _big = pool.alloc(4096);
        assert!(pool.standard_block_count() > 1);
        assert_eq!(pool.oversized_block_count(), 1);

        // SAFETY: Nothing allocated after the post is used again.
        unsafe { post.reset() };
        assert_eq!(pool.standard_block_count(), 1);
        assert_eq!(pool.oversized_block_count(), 0);

        // SAFETY: `keep` predates the post and is still valid memory.
        unsafe { keep.as_ptr().write(7) };
        let next = pool.alloc(8);
        // SAFETY: Address arithmetic on live allocations.
        unsafe { assert_eq!(next.as_ptr(), keep.as_ptr().add(32)) };
    }
}
