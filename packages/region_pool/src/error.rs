//! Error objects: chained error values with call-site traces and
//! unhandled-error accounting.
//!
//! Errors are allocated from a lazily created pool owned by the context
//! and handed around as small `Copy` handles. A context that tracks
//! unhandled errors keeps every top-level error on a doubly-linked list
//! until [`Error::handled`] acknowledges it; wrapping and joining maintain
//! the list so exactly the outermost error of each tree is on it.
//!
//! Records stay readable until the context is destroyed, even after being
//! handled. That keeps every handle memory-safe and makes contract
//! violations (double-handle, double-wrap) detectable instead of
//! undefined: the offending record is frozen with a stop marker and a
//! misuse error is filed on the list.

use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;
use std::ptr::NonNull;

use crate::context::{Context, ContextCore};
use crate::pool::{self, PoolCore};

/// Numeric error code. Negative values are reserved for the well-known
/// codes below; applications pick their own positive domain codes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    /// No error.
    pub const SUCCESS: Self = Self(0);

    /// A trace record: annotates a call site, transparent to accessors.
    pub const TRACE: Self = Self(-1);

    /// Filed when an error that is not on the unhandled list is wrapped
    /// or joined again.
    pub const IMPROPER_WRAP: Self = Self(-2);

    /// Filed when [`Error::handled`] is invoked on an error that is not
    /// on the unhandled list (most likely: handled twice, or handled
    /// while wrapped).
    pub const IMPROPER_UNHANDLED_CALL: Self = Self(-3);

    /// Whether this is a trace record.
    #[must_use]
    pub fn is_trace(self) -> bool {
        self == Self::TRACE
    }

    /// Whether this code reports a violation of the wrap/handle contract.
    #[must_use]
    pub fn is_misuse(self) -> bool {
        self == Self::IMPROPER_WRAP || self == Self::IMPROPER_UNHANDLED_CALL
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SUCCESS => f.write_str("success"),
            Self::TRACE => f.write_str("trace"),
            Self::IMPROPER_WRAP => f.write_str("improper wrap"),
            Self::IMPROPER_UNHANDLED_CALL => f.write_str("improper handled call"),
            Self(code) => write!(f, "code {code}"),
        }
    }
}

/// Message bytes duplicated into the error pool, NUL-terminated.
#[derive(Clone, Copy)]
pub(crate) struct Msg {
    ptr: NonNull<u8>,
    len: usize,
}

/// Unhandled-list membership of an error record.
#[derive(Clone, Copy)]
pub(crate) enum LinkState {
    /// On the context's unhandled list.
    Active {
        previous: Option<NonNull<ErrorLink>>,
        next: Option<NonNull<ErrorLink>>,
    },

    /// Not on the list: wrapped into another error, already handled, or
    /// created with tracking off.
    Detached,

    /// Frozen after a contract violation; never walked or detached again.
    Stop,
}

/// An error record, allocated from the context's error pool.
pub(crate) struct ErrorLink {
    pub(crate) ctx: NonNull<ContextCore>,
    pub(crate) code: ErrorCode,
    pub(crate) msg: Option<Msg>,
    pub(crate) location: &'static Location<'static>,

    /// The wrapped inner error this one adds information to.
    pub(crate) original: Option<NonNull<ErrorLink>>,

    /// A concurrent error, typically raised while recovering from
    /// `original`. Forms a chain through the same field.
    pub(crate) separate: Option<NonNull<ErrorLink>>,

    pub(crate) link: LinkState,
}

unsafe fn ensure_error_pool(ctx: NonNull<ContextCore>) -> NonNull<PoolCore> {
    // SAFETY: Caller guarantees a live context; the error pool is a root
    // pool owned by it.
    unsafe {
        if let Some(epool) = (*ctx.as_ptr()).error_pool {
            return epool;
        }
        let epool = pool::create_root_core(ctx, false)
            .expect("error pool creation failed and the OOM policy allowed returning");
        (*ctx.as_ptr()).error_pool = Some(epool);
        epool
    }
}

fn is_active(link: NonNull<ErrorLink>) -> bool {
    // SAFETY: Error records stay allocated until context teardown, so any
    // reachable link is readable.
    unsafe { matches!((*link.as_ptr()).link, LinkState::Active { .. }) }
}

unsafe fn set_previous(link: NonNull<ErrorLink>, value: Option<NonNull<ErrorLink>>) {
    // SAFETY: Caller guarantees `link` is on the unhandled list.
    unsafe {
        match &mut (*link.as_ptr()).link {
            LinkState::Active { previous, .. } => *previous = value,
            _ => unreachable!("list neighbor is not on the list"),
        }
    }
}

unsafe fn set_next(link: NonNull<ErrorLink>, value: Option<NonNull<ErrorLink>>) {
    // SAFETY: Caller guarantees `link` is on the unhandled list.
    unsafe {
        match &mut (*link.as_ptr()).link {
            LinkState::Active { next, .. } => *next = value,
            _ => unreachable!("list neighbor is not on the list"),
        }
    }
}

/// Removes an `Active` link from the unhandled list, leaving it
/// `Detached`.
unsafe fn unlink(link: NonNull<ErrorLink>) {
    // SAFETY: Caller guarantees the link is `Active` and the list intact.
    unsafe {
        let ctx = (*link.as_ptr()).ctx;
        let LinkState::Active { previous, next } = (*link.as_ptr()).link else {
            unreachable!("unlinking a link that is not on the list")
        };
        match previous {
            Some(prev) => set_next(prev, next),
            None => {
                debug_assert_eq!((*ctx.as_ptr()).unhandled, Some(link));
                (*ctx.as_ptr()).unhandled = next;
            }
        }
        if let Some(nxt) = next {
            set_previous(nxt, previous);
        }
        (*link.as_ptr()).link = LinkState::Detached;
    }
}

/// Allocates and links a new error record.
pub(crate) unsafe fn create_error(
    ctx: NonNull<ContextCore>,
    code: ErrorCode,
    msg: Option<&str>,
    location: &'static Location<'static>,
    original: Option<NonNull<ErrorLink>>,
) -> NonNull<ErrorLink> {
    // SAFETY: Caller guarantees a live context.
    unsafe {
        let epool = ensure_error_pool(ctx);

        let msg = msg.map(|s| Msg {
            ptr: pool::strmemdup_core(epool, s.as_bytes()),
            len: s.len(),
        });

        let link = pool::alloc_infallible(epool, size_of::<ErrorLink>()).cast::<ErrorLink>();
        let state = if (*ctx.as_ptr()).track_unhandled {
            LinkState::Active {
                previous: None,
                next: (*ctx.as_ptr()).unhandled,
            }
        } else {
            LinkState::Detached
        };

        link.as_ptr().write(ErrorLink {
            ctx,
            code,
            msg,
            location,
            original,
            separate: None,
            link: state,
        });

        if (*ctx.as_ptr()).track_unhandled {
            if let Some(old_head) = (*ctx.as_ptr()).unhandled {
                set_previous(old_head, Some(link));
            }
            (*ctx.as_ptr()).unhandled = Some(link);
        }

        link
    }
}

/// [`create_error`] with a message formatted straight into the error pool.
pub(crate) unsafe fn create_error_fmt(
    ctx: NonNull<ContextCore>,
    code: ErrorCode,
    args: fmt::Arguments<'_>,
    location: &'static Location<'static>,
) -> NonNull<ErrorLink> {
    let formatted = fmt::format(args);
    // SAFETY: Forwarded caller contract.
    unsafe { create_error(ctx, code, Some(&formatted), location, None) }
}

/// Takes an error off the unhandled list because it is about to become
/// the inner part of a wrapper. An error that is not on the list has been
/// wrapped (or handled) before; it is frozen and an [`ErrorCode::IMPROPER_WRAP`]
/// error referencing it is filed and returned instead.
unsafe fn detach_for_wrap(
    link: NonNull<ErrorLink>,
    location: &'static Location<'static>,
) -> Result<(), NonNull<ErrorLink>> {
    // SAFETY: Caller guarantees a link belonging to a live context.
    unsafe {
        let ctx = (*link.as_ptr()).ctx;
        if !(*ctx.as_ptr()).track_unhandled {
            // No list is maintained, so there is no membership to fix up.
            return Ok(());
        }
        if !is_active(link) {
            (*link.as_ptr()).link = LinkState::Stop;
            return Err(create_error(
                ctx,
                ErrorCode::IMPROPER_WRAP,
                None,
                location,
                Some(link),
            ));
        }
        unlink(link);
        Ok(())
    }
}

pub(crate) unsafe fn wrap_error(
    original: NonNull<ErrorLink>,
    code: ErrorCode,
    msg: Option<&str>,
    location: &'static Location<'static>,
) -> NonNull<ErrorLink> {
    // SAFETY: Caller guarantees a link belonging to a live context.
    unsafe {
        let ctx = (*original.as_ptr()).ctx;
        match detach_for_wrap(original, location) {
            Ok(()) => create_error(ctx, code, msg, location, Some(original)),
            Err(improper) => improper,
        }
    }
}

pub(crate) unsafe fn join_error(
    error: NonNull<ErrorLink>,
    separate: NonNull<ErrorLink>,
    location: &'static Location<'static>,
) -> NonNull<ErrorLink> {
    // SAFETY: Caller guarantees links of the same live context.
    unsafe {
        debug_assert_eq!((*error.as_ptr()).ctx, (*separate.as_ptr()).ctx);

        if let Err(improper) = detach_for_wrap(separate, location) {
            return improper;
        }

        // Append at the end of the receiver's separate chain.
        let mut scan = scan_useful(Some(error)).unwrap_or(error);
        while let Some(next) = (*scan.as_ptr()).separate {
            scan = next;
        }
        (*scan.as_ptr()).separate = Some(separate);

        // Annotate where the join happened.
        trace_error(error, location)
    }
}

pub(crate) unsafe fn trace_error(
    error: NonNull<ErrorLink>,
    location: &'static Location<'static>,
) -> NonNull<ErrorLink> {
    // SAFETY: Caller guarantees a link belonging to a live context.
    unsafe {
        let ctx = (*error.as_ptr()).ctx;
        if !(*ctx.as_ptr()).tracing {
            return error;
        }
        // The wrapper becomes the top-level entry; the inner error leaves
        // the list so membership stays canonical. Unlike wrapping, tracing
        // a detached error is fine (its wrapper just joins it off-list).
        if is_active(error) {
            unlink(error);
        }
        create_error(ctx, ErrorCode::TRACE, None, location, Some(error))
    }
}

/// Marks every record of the tree handled (`Detached`), skipping frozen
/// subtrees. Storage is reclaimed wholesale when the error pool goes away
/// with its context.
unsafe fn detach_tree(link: NonNull<ErrorLink>) {
    // SAFETY: Caller guarantees a link belonging to a live context; the
    // original/separate graph is acyclic.
    unsafe {
        if matches!((*link.as_ptr()).link, LinkState::Stop) {
            return;
        }
        (*link.as_ptr()).link = LinkState::Detached;
        if let Some(original) = (*link.as_ptr()).original {
            detach_tree(original);
        }
        if let Some(separate) = (*link.as_ptr()).separate {
            detach_tree(separate);
        }
    }
}

pub(crate) unsafe fn handled_error(
    link: NonNull<ErrorLink>,
    location: &'static Location<'static>,
) {
    // SAFETY: Caller guarantees a link belonging to a live context.
    unsafe {
        let ctx = (*link.as_ptr()).ctx;
        if !(*ctx.as_ptr()).track_unhandled {
            detach_tree(link);
            return;
        }
        if !is_active(link) {
            // Handled twice, or handled while wrapped by someone else.
            // Freeze it and file the misuse so the application can see it.
            (*link.as_ptr()).link = LinkState::Stop;
            create_error(
                ctx,
                ErrorCode::IMPROPER_UNHANDLED_CALL,
                None,
                location,
                Some(link),
            );
            return;
        }
        unlink(link);
        detach_tree(link);
    }
}

/// Skips trace records: the first error in the original chain that is not
/// a trace annotation.
unsafe fn scan_useful(mut link: Option<NonNull<ErrorLink>>) -> Option<NonNull<ErrorLink>> {
    // SAFETY: Caller guarantees reachable links belong to a live context.
    unsafe {
        while let Some(l) = link {
            if !(*l.as_ptr()).code.is_trace() {
                return Some(l);
            }
            link = (*l.as_ptr()).original;
        }
        None
    }
}

/// Message of the first non-trace record. The caller chooses a lifetime
/// not outliving the context, which owns the message storage.
unsafe fn message_bytes<'a>(link: NonNull<ErrorLink>) -> Option<&'a str> {
    // SAFETY: Caller guarantees a live context; message bytes were copied
    // from a `&str` and stay allocated until context teardown.
    unsafe {
        let useful = scan_useful(Some(link))?;
        let msg = (*useful.as_ptr()).msg?;
        let bytes = std::slice::from_raw_parts(msg.ptr.as_ptr(), msg.len);
        Some(std::str::from_utf8_unchecked(bytes))
    }
}

/// Reports every error still on the unhandled list through the `log`
/// facade. Invoked at context teardown, before error storage goes away.
pub(crate) unsafe fn log_unhandled(ctx: NonNull<ContextCore>) {
    // SAFETY: Caller guarantees a live context with an intact list.
    unsafe {
        let mut scan = (*ctx.as_ptr()).unhandled;
        while let Some(link) = scan {
            let code = (*link.as_ptr()).code;
            let location = (*link.as_ptr()).location;
            match message_bytes(link) {
                Some(msg) => {
                    log::warn!("unhandled error ({code}) from {location}: {msg}");
                }
                None => log::warn!("unhandled error ({code}) from {location}"),
            }
            let LinkState::Active { next, .. } = (*link.as_ptr()).link else {
                unreachable!("unhandled list contains a detached link")
            };
            scan = next;
        }
    }
}

/// A chained error value belonging to a [`Context`].
///
/// Handles are small and `Copy`; the record they point at stays readable
/// until the context is destroyed, so a stale handle is harmless (though
/// the contract-violation errors it can provoke are not silent — see
/// [`handled`](Self::handled)).
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Error<'ctx> {
    link: NonNull<ErrorLink>,
    _context: PhantomData<&'ctx Context>,
}

impl fmt::Debug for Error<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("code", &self.code())
            .field("message", &self.message())
            .field("location", &self.raw_location())
            .finish()
    }
}

impl<'ctx> Error<'ctx> {
    pub(crate) fn from_link(link: NonNull<ErrorLink>) -> Self {
        Self {
            link,
            _context: PhantomData,
        }
    }

    /// The error's code, trace records skipped. [`ErrorCode::SUCCESS`]
    /// when the chain consists of nothing but trace records.
    #[must_use]
    pub fn code(self) -> ErrorCode {
        // SAFETY: The handle vouches for a record of a live context.
        unsafe {
            scan_useful(Some(self.link))
                .map_or(ErrorCode::SUCCESS, |l| (*l.as_ptr()).code)
        }
    }

    /// The error's message, trace records skipped. Stays readable until
    /// the context is destroyed, even after the error was handled.
    #[must_use]
    pub fn message(self) -> Option<&'ctx str> {
        // SAFETY: The handle vouches for a record of a live context; the
        // returned str borrows storage that lives as long as the context.
        unsafe { message_bytes(self.link) }
    }

    /// This error with any trace records stripped: the first error of the
    /// chain carrying real information. `None` when there is none.
    #[must_use]
    pub fn original(self) -> Option<Error<'ctx>> {
        // SAFETY: The handle vouches for a record of a live context.
        unsafe { scan_useful(Some(self.link)).map(Error::from_link) }
    }

    /// The first concurrent error attached to this one, trace records
    /// skipped on both levels.
    #[must_use]
    pub fn separate(self) -> Option<Error<'ctx>> {
        // SAFETY: The handle vouches for a record of a live context.
        unsafe {
            let useful = scan_useful(Some(self.link))?;
            scan_useful((*useful.as_ptr()).separate).map(Error::from_link)
        }
    }

    /// The call site recorded on this exact record, trace records not
    /// skipped. Trace records exist for precisely this accessor.
    #[must_use]
    pub fn raw_location(self) -> &'static Location<'static> {
        // SAFETY: The handle vouches for a record of a live context.
        unsafe { (*self.link.as_ptr()).location }
    }

    /// Raw record fields, nothing skipped: the tracing view.
    #[must_use]
    pub fn trace_info(self) -> TraceInfo<'ctx> {
        // SAFETY: The handle vouches for a record of a live context.
        unsafe {
            TraceInfo {
                location: (*self.link.as_ptr()).location,
                code: (*self.link.as_ptr()).code,
                original: (*self.link.as_ptr()).original.map(Error::from_link),
                separate: (*self.link.as_ptr()).separate.map(Error::from_link),
            }
        }
    }

    /// Whether this error is currently on its context's unhandled list.
    #[must_use]
    pub fn is_unhandled(self) -> bool {
        is_active(self.link)
    }

    /// Wraps this error in a new one carrying additional information. The
    /// inner error leaves the unhandled list; the wrapper takes its
    /// place.
    ///
    /// Wrapping an error that is no longer top-level (already wrapped or
    /// handled) freezes it and returns an [`ErrorCode::IMPROPER_WRAP`]
    /// error instead.
    #[track_caller]
    #[must_use]
    pub fn wrap(self, code: ErrorCode, msg: &str) -> Error<'ctx> {
        // SAFETY: The handle vouches for a record of a live context.
        let link = unsafe { wrap_error(self.link, code, Some(msg), Location::caller()) };
        Error::from_link(link)
    }

    /// Attaches `separate` — an unrelated error, typically raised while
    /// recovering from this one — to the end of this error's separate
    /// chain, and returns this error behind a trace record marking the
    /// join site.
    #[track_caller]
    #[must_use]
    pub fn join(self, separate: Error<'ctx>) -> Error<'ctx> {
        // SAFETY: Both handles vouch for records of a live context.
        let link = unsafe { join_error(self.link, separate.link, Location::caller()) };
        Error::from_link(link)
    }

    /// Wraps this error in a trace record marking the call site, if the
    /// context has tracing enabled; otherwise returns it unchanged.
    #[track_caller]
    #[must_use]
    pub fn trace(self) -> Error<'ctx> {
        // SAFETY: The handle vouches for a record of a live context.
        let link = unsafe { trace_error(self.link, Location::caller()) };
        Error::from_link(link)
    }

    /// Acknowledges this error: removes it from the unhandled list and
    /// marks its whole tree handled. Record storage is reclaimed with the
    /// context.
    ///
    /// Calling this on an error that is not top-level on the list — most
    /// commonly a second time — freezes the record and files an
    /// [`ErrorCode::IMPROPER_UNHANDLED_CALL`] error so the application
    /// can detect the violation. It never crashes.
    #[track_caller]
    pub fn handled(self) {
        // SAFETY: The handle vouches for a record of a live context.
        unsafe { handled_error(self.link, Location::caller()) };
    }
}

/// Raw view of one error record, as exposed by [`Error::trace_info`].
#[derive(Clone, Copy)]
pub struct TraceInfo<'ctx> {
    /// Call site that created this record.
    pub location: &'static Location<'static>,

    /// Code of this record itself (possibly [`ErrorCode::TRACE`]).
    pub code: ErrorCode,

    /// The directly wrapped inner error, if any.
    pub original: Option<Error<'ctx>>,

    /// The directly attached concurrent error, if any.
    pub separate: Option<Error<'ctx>>,
}
