//! A hierarchical region allocator with cached memory blocks and scoped
//! cleanup.
//!
//! Applications obtain a [`Context`] — the allocator root — and create
//! [`Pool`]s inside it that form a parent/child tree. Allocations are
//! untyped byte ranges carved out of a pool with a bump pointer; they are
//! never freed individually. Instead, a whole pool is cleared or destroyed
//! at once, and its memory flows back into the context's caches: a free
//! list for standard-size blocks and a best-fit tree for oversized ones.
//! Nothing returns to the OS before the context itself is dropped.
//!
//! # Key Features
//!
//! - **Bump allocation**: the hot path is a pointer increment
//! - **Block recycling**: cleared pools feed a context-wide cache instead
//!   of the OS allocator
//! - **Pool trees**: child pools are destroyed transitively with their
//!   parent
//! - **Scoped cleanup**: callbacks registered on a pool run before its
//!   memory is reused, on every exit path, re-entrancy included
//! - **Remnant reuse**: freed ranges and block tails are indexed in a
//!   best-fit tree inside each pool
//! - **Posts**: lightweight allocation snapshots a pool can rewind to
//! - **Error objects**: chained error values with call-site traces and
//!   unhandled-error accounting on the context
//!
//! # Example
//!
//! ```rust
//! use region_pool::Context;
//!
//! let ctx = Context::new();
//! let pool = ctx.root_pool();
//!
//! // Carve a scratch buffer out of the pool.
//! let scratch = pool.alloc(256);
//! // SAFETY: 256 fresh bytes, valid until the pool is cleared.
//! unsafe { scratch.as_ptr().write_bytes(0, 256) };
//!
//! // Pool-allocated string copies.
//! let greeting = pool.strdup("hello");
//! // SAFETY: strdup returned a NUL-terminated copy.
//! unsafe { assert_eq!(*greeting.as_ptr().add(5), 0) };
//!
//! // Subtasks get their own pool, reclaimed in one stroke.
//! let child = pool.child();
//! let _ = child.alloc(64);
//! // SAFETY: No allocation from `child` is used afterwards.
//! unsafe { child.destroy() };
//! ```
//!
//! # Thread Safety
//!
//! A context and everything belonging to it is single-threaded by
//! contract; none of the handle types are [`Send`] or [`Sync`].
//! Independent contexts are fully isolated and may live on different
//! threads.

mod block;
mod builder;
mod context;
mod error;
mod memtree;
mod oom;
mod pool;
mod track;

pub use block::{ALLOC_ALIGNMENT, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use builder::ContextBuilder;
pub use context::Context;
pub use error::{Error, ErrorCode, TraceInfo};
pub use oom::{OomPolicy, OomResponse};
pub use pool::{Pool, Post};
pub use track::CleanupFn;

/// The crate version, for diagnostics.
#[must_use]
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
