/// What a custom out-of-memory handler wants the allocator to do after a
/// raw allocation came back empty.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OomResponse {
    /// Try the raw allocation once more (the handler presumably released
    /// some memory).
    Retry,

    /// Give up on this request: `try_alloc` returns `None` and the
    /// infallible entry points terminate the process.
    Fail,

    /// Terminate the process immediately.
    Abort,
}

/// Policy applied when the OS allocator reports exhaustion.
///
/// Configured through [`ContextBuilder::oom_policy`][crate::ContextBuilder::oom_policy].
/// Whatever the policy, memory already cached by the context is always
/// preferred over a raw allocation, so the policy only fires once the
/// caches are empty too.
#[derive(Clone, Copy, Debug)]
pub enum OomPolicy {
    /// Terminate the process on exhaustion. The default.
    Abort,

    /// Retry the raw allocation a bounded number of times before giving up.
    Retry,

    /// Consult a caller-supplied handler. The handler runs inline on the
    /// allocating thread and must not touch the context it was invoked for.
    Handler(fn(usize) -> OomResponse),
}

impl Default for OomPolicy {
    fn default() -> Self {
        Self::Abort
    }
}
