//! Cleanup tracking: the owner/dependent graph drained by pool clearing.
//!
//! Every pool embeds one registration record; external resources get their
//! records from the context's lazily created tracking pool, recycled
//! through freelists so steady-state registration never allocates.

use std::ptr::NonNull;

use crate::context::ContextCore;
use crate::pool::{self, PoolCore};

/// Callback invoked for a tracked entity when the pool it was registered
/// on is cleared or destroyed.
///
/// # Safety
///
/// Invoked with the pointer the entity was registered under; the registrar
/// vouches that it is still valid at cleanup time.
pub type CleanupFn = unsafe fn(NonNull<()>);

/// Payload of a live registration.
pub(crate) struct UsedReg {
    /// The registered pointer, also the key in the context's lookup map.
    pub(crate) tracked: NonNull<()>,

    pub(crate) cleanup: CleanupFn,

    /// Entities whose cleanup must run before this one's memory goes away.
    /// For a pool's embedded record this is the pool's cleanup list.
    pub(crate) owners: Option<NonNull<TrackLink>>,

    /// Registrations that list this one among their owners. Severed when
    /// this entity is cleaned up so it can never be invoked twice.
    pub(crate) dependents: Option<NonNull<TrackLink>>,
}

/// A registration record: either live or threaded on the context's record
/// freelist.
pub(crate) enum Registration {
    Used(UsedReg),
    Free { next: Option<NonNull<Registration>> },
}

impl Registration {
    pub(crate) fn used_mut(&mut self) -> &mut UsedReg {
        match self {
            Self::Used(used) => used,
            Self::Free { .. } => unreachable!("registration used after being recycled"),
        }
    }
}

/// List cell linking registrations into owner and dependent lists.
pub(crate) struct TrackLink {
    pub(crate) reg: NonNull<Registration>,
    pub(crate) next: Option<NonNull<TrackLink>>,
}

unsafe fn ensure_track_pool(ctx: NonNull<ContextCore>) -> NonNull<PoolCore> {
    // SAFETY: Caller guarantees a live context; the tracking pool is a
    // root pool owned by it.
    unsafe {
        if let Some(pool) = (*ctx.as_ptr()).track_pool {
            return pool;
        }
        let pool = pool::create_root_core(ctx, false)
            .expect("tracking pool creation failed and the OOM policy allowed returning");
        (*ctx.as_ptr()).track_pool = Some(pool);
        pool
    }
}

unsafe fn alloc_link(ctx: NonNull<ContextCore>) -> NonNull<TrackLink> {
    // SAFETY: Caller guarantees a live context; freelist entries point at
    // recycled cells inside the tracking pool.
    unsafe {
        if let Some(link) = (*ctx.as_ptr()).free_links {
            (*ctx.as_ptr()).free_links = (*link.as_ptr()).next;
            return link;
        }
        let pool = ensure_track_pool(ctx);
        pool::alloc_infallible(pool, size_of::<TrackLink>()).cast::<TrackLink>()
    }
}

unsafe fn free_link(ctx: NonNull<ContextCore>, link: NonNull<TrackLink>) {
    // SAFETY: Caller guarantees `link` is no longer on any list.
    unsafe {
        (*link.as_ptr()).next = (*ctx.as_ptr()).free_links;
        (*ctx.as_ptr()).free_links = Some(link);
    }
}

unsafe fn alloc_reg(ctx: NonNull<ContextCore>) -> NonNull<Registration> {
    // SAFETY: Caller guarantees a live context.
    unsafe {
        if let Some(reg) = (*ctx.as_ptr()).free_regs {
            let Registration::Free { next } = &*reg.as_ptr() else {
                unreachable!("freelist entry not marked free")
            };
            (*ctx.as_ptr()).free_regs = *next;
            return reg;
        }
        let pool = ensure_track_pool(ctx);
        pool::alloc_infallible(pool, size_of::<Registration>()).cast::<Registration>()
    }
}

unsafe fn free_reg(ctx: NonNull<ContextCore>, reg: NonNull<Registration>) {
    // SAFETY: Caller guarantees no list references `reg` any more.
    unsafe {
        reg.as_ptr().write(Registration::Free {
            next: (*ctx.as_ptr()).free_regs,
        });
        (*ctx.as_ptr()).free_regs = Some(reg);
    }
}

/// Unlinks the first cell referencing `target` from `list`, recycling the
/// cell. Missing targets are tolerated (the edge may already be severed).
unsafe fn remove_link(
    ctx: NonNull<ContextCore>,
    list: *mut Option<NonNull<TrackLink>>,
    target: NonNull<Registration>,
) {
    // SAFETY: Caller guarantees the list cells and context are live.
    unsafe {
        let mut slot = list;
        while let Some(link) = *slot {
            if (*link.as_ptr()).reg == target {
                *slot = (*link.as_ptr()).next;
                free_link(ctx, link);
                return;
            }
            slot = &raw mut (*link.as_ptr()).next;
        }
    }
}

/// Registers the pool's embedded record in the context's pointer lookup so
/// the pool can participate in the tracking graph like any other entity.
pub(crate) unsafe fn track_pool(pool: NonNull<PoolCore>) {
    // SAFETY: Caller guarantees a live pool; the embedded record lives in
    // the pool header and dies with it.
    unsafe {
        let ctx = (*pool.as_ptr()).ctx;
        let key = pool.as_ptr().cast::<()>().cast_const();
        let reg = NonNull::from(&mut (*pool.as_ptr()).track);
        (*ctx.as_ptr()).ptr_to_reg.insert(key, reg);
    }
}

/// Registers `tracked` as an owner of `pool`: its cleanup runs before the
/// pool's memory is reused. Repeated registration of the same pointer
/// reuses the record, adding another owning pool and replacing the
/// callback.
pub(crate) unsafe fn register_owner(
    pool: NonNull<PoolCore>,
    tracked: NonNull<()>,
    cleanup: CleanupFn,
) {
    // SAFETY: Caller guarantees a live pool; records and cells come from
    // the context's tracking storage.
    unsafe {
        let ctx = (*pool.as_ptr()).ctx;
        let key = tracked.as_ptr().cast_const();

        let reg = match (*ctx.as_ptr()).ptr_to_reg.get(&key) {
            Some(&reg) => {
                // A tracked pool keeps its destructor; for anything else
                // the latest callback wins.
                if !is_embedded(reg, tracked) {
                    (*reg.as_ptr()).used_mut().cleanup = cleanup;
                }
                reg
            }
            None => {
                let reg = alloc_reg(ctx);
                reg.as_ptr().write(Registration::Used(UsedReg {
                    tracked,
                    cleanup,
                    owners: None,
                    dependents: None,
                }));
                (*ctx.as_ptr()).ptr_to_reg.insert(key, reg);
                reg
            }
        };

        let pool_reg = NonNull::from(&mut (*pool.as_ptr()).track);

        // Owner edge: head insert gives LIFO-ish cleanup ordering.
        let owner_link = alloc_link(ctx);
        owner_link.as_ptr().write(TrackLink {
            reg,
            next: (*pool.as_ptr()).track.used_mut().owners,
        });
        (*pool.as_ptr()).track.used_mut().owners = Some(owner_link);

        // Back edge so the entity can be detached from every owning pool
        // once its cleanup has run.
        let dep_link = alloc_link(ctx);
        dep_link.as_ptr().write(TrackLink {
            reg: pool_reg,
            next: (*reg.as_ptr()).used_mut().dependents,
        });
        (*reg.as_ptr()).used_mut().dependents = Some(dep_link);
    }
}

/// Whether `reg` is a pool's embedded record. Embedded records sit at a
/// fixed offset inside the pool header they track, so the addresses agree
/// exactly when (and only when) the tracked pointer is the pool itself.
fn is_embedded(reg: NonNull<Registration>, tracked: NonNull<()>) -> bool {
    let embedded_at = tracked
        .as_ptr()
        .cast::<u8>()
        .wrapping_add(std::mem::offset_of!(PoolCore, track));
    reg.as_ptr().cast::<u8>().cast_const() == embedded_at.cast_const()
}

/// Pops and runs one owner of `pool`. Returns false when the owner list
/// was empty.
unsafe fn cleanup_one_owner(pool: NonNull<PoolCore>) -> bool {
    // SAFETY: Caller guarantees a live pool whose graph edges are intact.
    unsafe {
        let ctx = (*pool.as_ptr()).ctx;
        let Some(link) = (*pool.as_ptr()).track.used_mut().owners else {
            return false;
        };
        (*pool.as_ptr()).track.used_mut().owners = (*link.as_ptr()).next;
        let reg = (*link.as_ptr()).reg;
        free_link(ctx, link);

        // Sever the back edge to this pool before the callback runs; the
        // callback may mutate the graph arbitrarily.
        let pool_reg = NonNull::from(&mut (*pool.as_ptr()).track);
        remove_link(ctx, &raw mut (*reg.as_ptr()).used_mut().dependents, pool_reg);

        let used = (*reg.as_ptr()).used_mut();
        let tracked = used.tracked;
        let cleanup = used.cleanup;

        if is_embedded(reg, tracked) {
            // The owner is itself a pool: the callback destroys it, and
            // destruction severs the embedded record's remaining edges.
            cleanup(tracked);
            return true;
        }

        // Retire the registration before the callback runs: a callback
        // that registers the same pointer again gets a fresh record whose
        // edges survive this pass (and re-runs — registering one's own
        // cleanup from inside it loops forever, by contract).
        (*ctx.as_ptr()).ptr_to_reg.remove(&tracked.as_ptr().cast_const());

        cleanup(tracked);

        // Detach from every other pool still listing this entity so the
        // cleanup can never run twice.
        while let Some(dep) = (*reg.as_ptr()).used_mut().dependents {
            (*reg.as_ptr()).used_mut().dependents = (*dep.as_ptr()).next;
            let holder = (*dep.as_ptr()).reg;
            free_link(ctx, dep);
            remove_link(ctx, &raw mut (*holder.as_ptr()).used_mut().owners, reg);
        }

        free_reg(ctx, reg);
        true
    }
}

/// Drains the pool's owner list down to `stop` (all the way when `stop` is
/// `None`). Owners registered by the callbacks themselves are head-inserted
/// and therefore drained as well.
pub(crate) unsafe fn cleanup_owners_until(
    pool: NonNull<PoolCore>,
    stop: Option<NonNull<TrackLink>>,
) {
    // SAFETY: Caller guarantees a live pool.
    unsafe {
        while (*pool.as_ptr()).track.used_mut().owners != stop {
            if !cleanup_one_owner(pool) {
                debug_assert!(stop.is_none(), "post owner snapshot no longer on the list");
                break;
            }
        }
    }
}

/// The clear/destroy protocol: owners first (their callbacks may still
/// look at this pool or its children), then children, repeated until a
/// pass finds nothing new. Converges as long as callbacks do not register
/// new work unboundedly; a callback re-registering itself loops forever
/// and is a caller error this deliberately does not detect.
pub(crate) unsafe fn run_cleanup_protocol(pool: NonNull<PoolCore>) {
    // SAFETY: Caller guarantees a live pool; child destruction unlinks
    // each child from the list before its memory is released.
    unsafe {
        loop {
            cleanup_owners_until(pool, None);

            while let Some(child) = (*pool.as_ptr()).child {
                pool::destroy_core(child);
            }

            let done = (*pool.as_ptr()).track.used_mut().owners.is_none()
                && (*pool.as_ptr()).child.is_none();
            if done {
                break;
            }
        }
    }
}

/// Severs every edge of the pool's embedded record and drops it from the
/// pointer lookup. Called on destroy, after the owner list was drained.
pub(crate) unsafe fn deregister_pool(pool: NonNull<PoolCore>) {
    // SAFETY: Caller guarantees a live pool whose owner list is empty.
    unsafe {
        let ctx = (*pool.as_ptr()).ctx;
        let reg = NonNull::from(&mut (*pool.as_ptr()).track);
        debug_assert!((*reg.as_ptr()).used_mut().owners.is_none());

        while let Some(dep) = (*reg.as_ptr()).used_mut().dependents {
            (*reg.as_ptr()).used_mut().dependents = (*dep.as_ptr()).next;
            let holder = (*dep.as_ptr()).reg;
            free_link(ctx, dep);
            remove_link(ctx, &raw mut (*holder.as_ptr()).used_mut().owners, reg);
        }

        let key = pool.as_ptr().cast::<()>().cast_const();
        (*ctx.as_ptr()).ptr_to_reg.remove(&key);
    }
}

/// Cleanup callback of a pool's embedded registration: destroying the
/// owning entity destroys the pool.
pub(crate) unsafe fn pool_cleanup(tracked: NonNull<()>) {
    // SAFETY: The embedded record registers the pool's own address.
    unsafe { pool::destroy_core(tracked.cast::<PoolCore>()) };
}
