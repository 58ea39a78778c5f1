//! The allocator root: block caches, configuration, tracking storage and
//! the unhandled-error list.

use std::alloc::{Layout, handle_alloc_error};
use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;
use std::ptr::NonNull;

use foldhash::{HashMap, HashMapExt};

use crate::block::{self, ALLOC_ALIGNMENT, BlockHeader};
use crate::builder::ContextBuilder;
use crate::error::{self, Error, ErrorCode, ErrorLink};
use crate::memtree::{MIN_FRAGMENT, MemTree};
use crate::oom::{OomPolicy, OomResponse};
use crate::pool::{self, Pool, PoolCore};
use crate::track::{Registration, TrackLink};

/// Bound on consecutive raw-allocation attempts under [`OomPolicy::Retry`].
const OOM_RETRY_LIMIT: usize = 3;

/// The state behind a [`Context`] handle. Heap-pinned so that pools and
/// errors can keep stable back-pointers to it.
pub(crate) struct ContextCore {
    /// Standard block size in bytes, clamped to the crate minimum.
    pub(crate) stdsize: usize,

    pub(crate) oom: OomPolicy,

    /// Free standard-size blocks, most recently released first.
    pub(crate) std_blocks: Option<NonNull<BlockHeader>>,

    /// Free oversized blocks, keyed by size for best-fit reuse.
    pub(crate) nonstd_blocks: MemTree,

    /// Tracked pointer -> registration record.
    pub(crate) ptr_to_reg: HashMap<*const (), NonNull<Registration>>,

    /// Recycled registration records and list cells.
    pub(crate) free_regs: Option<NonNull<Registration>>,
    pub(crate) free_links: Option<NonNull<TrackLink>>,

    /// Internal root pools, created on first use and owned by the context.
    pub(crate) track_pool: Option<NonNull<PoolCore>>,
    pub(crate) error_pool: Option<NonNull<PoolCore>>,

    /// Root pools, linked through their sibling field. Destroyed head
    /// first at teardown.
    pub(crate) roots: Option<NonNull<PoolCore>>,

    /// Whether errors are linked onto the unhandled list at creation.
    pub(crate) track_unhandled: bool,

    /// Doubly-linked list of top-level errors not yet acknowledged.
    pub(crate) unhandled: Option<NonNull<ErrorLink>>,

    /// Whether trace records are materialized.
    pub(crate) tracing: bool,
}

/// Terminates the process the way a failed infallible allocation does.
pub(crate) fn oom_abort(size: usize) -> ! {
    let layout = Layout::from_size_align(size.max(1), ALLOC_ALIGNMENT)
        .unwrap_or_else(|_| Layout::new::<u8>());
    handle_alloc_error(layout)
}

/// Raw allocation with the context's OOM policy applied. `None` is only
/// ever returned under a policy that permits failure.
pub(crate) unsafe fn alloc_raw(ctx: NonNull<ContextCore>, size: usize) -> Option<NonNull<u8>> {
    let mut retries = 0;
    loop {
        if let Some(mem) = block::raw_alloc(size) {
            return Some(mem);
        }
        // SAFETY: Caller guarantees a live context.
        match unsafe { (*ctx.as_ptr()).oom } {
            OomPolicy::Abort => oom_abort(size),
            OomPolicy::Retry => {
                retries += 1;
                if retries > OOM_RETRY_LIMIT {
                    return None;
                }
                log::debug!("raw allocation of {size} bytes failed; retrying ({retries})");
            }
            OomPolicy::Handler(handler) => match handler(size) {
                OomResponse::Retry => {
                    log::debug!("raw allocation of {size} bytes failed; handler requested retry");
                }
                OomResponse::Fail => return None,
                OomResponse::Abort => oom_abort(size),
            },
        }
    }
}

/// Pops a cached standard block or allocates a fresh one.
pub(crate) unsafe fn acquire_std_block(
    ctx: NonNull<ContextCore>,
) -> Option<NonNull<BlockHeader>> {
    // SAFETY: Caller guarantees a live context; cached blocks are live
    // regions owned by it.
    unsafe {
        if let Some(blk) = (*ctx.as_ptr()).std_blocks {
            (*ctx.as_ptr()).std_blocks = (*blk.as_ptr()).next.take();
            debug_assert_eq!((*blk.as_ptr()).size, (*ctx.as_ptr()).stdsize);
            return Some(blk);
        }
        let size = (*ctx.as_ptr()).stdsize;
        let mem = alloc_raw(ctx, size)?;
        Some(block::init_block(mem, size))
    }
}

/// Returns a standard block to the cache. Blocks never go back to the OS
/// before the context is destroyed.
pub(crate) unsafe fn release_std_block(ctx: NonNull<ContextCore>, blk: NonNull<BlockHeader>) {
    // SAFETY: Caller guarantees both are live and the block is unused.
    unsafe {
        debug_assert_eq!((*blk.as_ptr()).size, (*ctx.as_ptr()).stdsize);
        (*blk.as_ptr()).next = (*ctx.as_ptr()).std_blocks;
        (*ctx.as_ptr()).std_blocks = Some(blk);
    }
}

/// Best-fit fetch from the oversized cache. The whole block is handed
/// over, its possibly-generous size intact.
pub(crate) unsafe fn fetch_nonstd(
    ctx: NonNull<ContextCore>,
    size: usize,
) -> Option<NonNull<BlockHeader>> {
    // SAFETY: Caller guarantees a live context.
    unsafe { (*ctx.as_ptr()).nonstd_blocks.fetch(size) }
}

/// Returns one oversized block to the best-fit cache.
pub(crate) unsafe fn release_nonstd_block(ctx: NonNull<ContextCore>, blk: NonNull<BlockHeader>) {
    // SAFETY: Caller guarantees both are live and the block is unused.
    // Oversized blocks always exceed the standard size, which the crate
    // minimum keeps far above the memtree node size.
    unsafe {
        let size = (*blk.as_ptr()).size;
        debug_assert!(size >= MIN_FRAGMENT);
        (*ctx.as_ptr()).nonstd_blocks.insert(blk.cast::<u8>(), size);
    }
}

/// Returns a whole chain of oversized blocks to the cache.
pub(crate) unsafe fn release_nonstd_chain(
    ctx: NonNull<ContextCore>,
    mut chain: Option<NonNull<BlockHeader>>,
) {
    // SAFETY: Caller guarantees the chain is intact, live and unused.
    unsafe {
        while let Some(blk) = chain {
            chain = (*blk.as_ptr()).next.take();
            release_nonstd_block(ctx, blk);
        }
    }
}

/// The allocator root. Owns the block caches, configuration and error
/// bookkeeping; every pool and error belongs to exactly one context.
///
/// A context and everything created from it is single-threaded by
/// contract (the handle is neither `Send` nor `Sync`). Independent
/// contexts may be used from different threads freely.
///
/// Dropping the context destroys all remaining pools (running their
/// cleanups), surfaces unhandled errors through the `log` facade and
/// returns every cached block to the OS.
pub struct Context {
    core: NonNull<ContextCore>,
    _single_threaded: PhantomData<*const ()>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("stdsize", &self.stdsize())
            .field("track_unhandled", &self.tracks_unhandled())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Creates a context with the default configuration: 8 KiB standard
    /// blocks, aborting OOM policy, unhandled-error tracking on.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring a context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub(crate) fn from_parts(stdsize: usize, oom: OomPolicy, track_unhandled: bool) -> Self {
        let core = Box::new(ContextCore {
            stdsize,
            oom,
            std_blocks: None,
            nonstd_blocks: MemTree::new(),
            ptr_to_reg: HashMap::new(),
            free_regs: None,
            free_links: None,
            track_pool: None,
            error_pool: None,
            roots: None,
            track_unhandled,
            unhandled: None,
            tracing: false,
        });
        Self {
            // Box::into_raw never returns null.
            core: unsafe { NonNull::new_unchecked(Box::into_raw(core)) },
            _single_threaded: PhantomData,
        }
    }

    pub(crate) fn core(&self) -> NonNull<ContextCore> {
        self.core
    }

    /// Creates a root pool: a pool without a parent, destroyed at the
    /// latest when the context is dropped.
    #[must_use]
    pub fn root_pool(&self) -> Pool<'_> {
        // SAFETY: The handle vouches for a live context.
        match unsafe { pool::create_root_core(self.core, false) } {
            Some(core) => Pool::from_core(core),
            None => oom_abort(self.stdsize()),
        }
    }

    /// Standard block size in bytes.
    #[must_use]
    pub fn stdsize(&self) -> usize {
        // SAFETY: The handle vouches for a live context.
        unsafe { (*self.core.as_ptr()).stdsize }
    }

    /// Whether errors are linked onto the unhandled list at creation.
    #[must_use]
    pub fn tracks_unhandled(&self) -> bool {
        // SAFETY: The handle vouches for a live context.
        unsafe { (*self.core.as_ptr()).track_unhandled }
    }

    /// Turns trace-record materialization on or off. Off by default;
    /// while off, [`Error::trace`] returns its input unchanged.
    pub fn set_tracing(&self, enabled: bool) {
        // SAFETY: The handle vouches for a live context.
        unsafe { (*self.core.as_ptr()).tracing = enabled };
    }

    /// Whether trace records are materialized.
    #[must_use]
    pub fn tracing(&self) -> bool {
        // SAFETY: The handle vouches for a live context.
        unsafe { (*self.core.as_ptr()).tracing }
    }

    /// Head of the unhandled-error list: the most recently created
    /// top-level error nobody has acknowledged yet.
    #[must_use]
    pub fn unhandled(&self) -> Option<Error<'_>> {
        // SAFETY: The handle vouches for a live context.
        unsafe { (*self.core.as_ptr()).unhandled.map(Error::from_link) }
    }

    /// Creates an error associated with this context, recording the call
    /// site. With unhandled tracking on, the error starts out at the head
    /// of the unhandled list.
    #[track_caller]
    pub fn error_create(&self, code: ErrorCode, msg: &str) -> Error<'_> {
        // SAFETY: The handle vouches for a live context.
        let link = unsafe {
            error::create_error(self.core, code, Some(msg), Location::caller(), None)
        };
        Error::from_link(link)
    }

    /// [`error_create`](Self::error_create) with a formatted message,
    /// composed directly into the context's error pool.
    #[track_caller]
    pub fn error_createf(&self, code: ErrorCode, args: fmt::Arguments<'_>) -> Error<'_> {
        // SAFETY: The handle vouches for a live context.
        let link = unsafe { error::create_error_fmt(self.core, code, args, Location::caller()) };
        Error::from_link(link)
    }

    /// Number of standard blocks sitting in the free list.
    #[must_use]
    pub fn cached_standard_blocks(&self) -> usize {
        // SAFETY: The handle vouches for a live context and intact chain.
        unsafe {
            let mut n = 0;
            let mut scan = (*self.core.as_ptr()).std_blocks;
            while let Some(blk) = scan {
                n += 1;
                scan = (*blk.as_ptr()).next;
            }
            n
        }
    }

    /// Number of oversized blocks in the best-fit cache.
    #[must_use]
    pub fn cached_oversized_blocks(&self) -> usize {
        // SAFETY: The handle vouches for a live context.
        unsafe { (*self.core.as_ptr()).nonstd_blocks.len() }
    }

    /// Smallest cached oversized block of at least `size` bytes (total,
    /// header included), without removing it. Diagnostic.
    #[must_use]
    pub fn cached_oversized_fit(&self, size: usize) -> Option<usize> {
        // SAFETY: The handle vouches for a live context. Peeking is a
        // fetch immediately undone by a re-insert.
        unsafe {
            let tree = &mut (*self.core.as_ptr()).nonstd_blocks;
            let blk = tree.fetch(size)?;
            let found = (*blk.as_ptr()).size;
            tree.insert(blk.cast::<u8>(), found);
            Some(found)
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // SAFETY: The handle owns the core; nothing can use the context
        // after drop because every dependent handle borrows it.
        unsafe {
            let ctx = self.core;

            // Error storage dies with the error pool below; surface what
            // nobody acknowledged first.
            error::log_unhandled(ctx);

            // Destroy user root pools first: their cleanup handlers may
            // still create errors or registrations, which live in the
            // internal pools. Handlers may also add new roots; the scan
            // restarts until only the internal pools remain.
            loop {
                let mut scan = (*ctx.as_ptr()).roots;
                let user_root = loop {
                    let Some(root) = scan else { break None };
                    let internal = Some(root) == (*ctx.as_ptr()).track_pool
                        || Some(root) == (*ctx.as_ptr()).error_pool;
                    if !internal {
                        break Some(root);
                    }
                    scan = (*root.as_ptr()).sibling;
                };
                match user_root {
                    Some(root) => pool::destroy_core(root),
                    None => break,
                }
            }

            if let Some(epool) = (*ctx.as_ptr()).error_pool.take() {
                pool::destroy_core(epool);
            }
            if let Some(tpool) = (*ctx.as_ptr()).track_pool.take() {
                pool::destroy_core(tpool);
            }
            // Late arrivals from teardown handlers, if any.
            while let Some(root) = (*ctx.as_ptr()).roots {
                pool::destroy_core(root);
            }
            (*ctx.as_ptr()).free_regs = None;
            (*ctx.as_ptr()).free_links = None;
            (*ctx.as_ptr()).unhandled = None;

            while let Some(blk) = (*ctx.as_ptr()).std_blocks {
                (*ctx.as_ptr()).std_blocks = (*blk.as_ptr()).next.take();
                let size = (*blk.as_ptr()).size;
                block::raw_free(blk.cast::<u8>(), size);
            }

            // Drain the tree smallest-first until nothing remains.
            while let Some(blk) = (*ctx.as_ptr()).nonstd_blocks.fetch(0) {
                let size = (*blk.as_ptr()).size;
                block::raw_free(blk.cast::<u8>(), size);
            }

            drop(Box::from_raw(ctx.as_ptr()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};

    #[test]
    fn default_configuration() {
        let ctx = Context::new();
        assert_eq!(ctx.stdsize(), DEFAULT_BLOCK_SIZE.get());
        assert!(ctx.tracks_unhandled());
        assert!(!ctx.tracing());
        assert_eq!(ctx.cached_standard_blocks(), 0);
        assert_eq!(ctx.cached_oversized_blocks(), 0);
    }

    #[test]
    fn stdsize_is_clamped_to_the_minimum() {
        let ctx = Context::builder().stdsize(64).build();
        assert_eq!(ctx.stdsize(), MIN_BLOCK_SIZE.get());
    }

    #[test]
    fn cleared_pools_feed_the_block_cache() {
        let ctx = Context::builder().stdsize(512).build();
        let pool = ctx.root_pool();

        for _ in 0..8 {
            let _ = pool.alloc(256);
        }
        let blocks = pool.standard_block_count();
        assert!(blocks > 1);

        // SAFETY: No allocation from this pool is used afterwards.
        unsafe { pool.clear() };
        assert_eq!(ctx.cached_standard_blocks(), blocks - 1);

        // A sibling pool drinks from the cache instead of the OS.
        let other = ctx.root_pool();
        let _ = other.alloc(256);
        assert!(ctx.cached_standard_blocks() < blocks - 1);
    }

    #[test]
    fn oversized_blocks_round_trip_through_the_cache() {
        let ctx = Context::builder().stdsize(512).build();
        let pool = ctx.root_pool();

        let big = pool.alloc(10_000);
        // SAFETY: No allocation from this pool is used afterwards.
        unsafe { pool.clear() };
        assert_eq!(ctx.cached_oversized_blocks(), 1);
        assert!(ctx.cached_oversized_fit(10_000).is_some());

        // The cached block satisfies the next oversized request.
        let again = pool.alloc(10_000);
        assert_eq!(again.as_ptr(), big.as_ptr());
        assert_eq!(ctx.cached_oversized_blocks(), 0);
    }

    #[test]
    fn retry_policy_is_accepted() {
        let ctx = Context::builder()
            .oom_policy(OomPolicy::Retry)
            .track_unhandled(false)
            .build();
        let pool = ctx.root_pool();
        let mem = pool.try_alloc(64).expect("plenty of memory available");
        // SAFETY: 64 fresh bytes were just allocated.
        unsafe { mem.as_ptr().write_bytes(0, 64) };
    }

    #[test]
    fn custom_handler_is_accepted() {
        fn give_up(_amt: usize) -> OomResponse {
            OomResponse::Fail
        }
        let ctx = Context::builder()
            .oom_policy(OomPolicy::Handler(give_up))
            .build();
        let pool = ctx.root_pool();
        assert!(pool.try_alloc(64).is_some(), "no OOM expected here");
    }
}
