use crate::block::{DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::context::Context;
use crate::oom::OomPolicy;

/// Builder for configuring and constructing a [`Context`].
///
/// All settings are optional; [`Context::new`] is shorthand for building
/// with the defaults.
///
/// # Examples
///
/// ```
/// use region_pool::{Context, OomPolicy};
///
/// let ctx = Context::builder()
///     .stdsize(16 * 1024)
///     .oom_policy(OomPolicy::Retry)
///     .track_unhandled(false)
///     .build();
/// assert_eq!(ctx.stdsize(), 16 * 1024);
/// ```
#[derive(Debug)]
#[must_use]
pub struct ContextBuilder {
    stdsize: Option<usize>,
    oom: OomPolicy,
    track_unhandled: bool,
}

impl ContextBuilder {
    pub(crate) fn new() -> Self {
        Self {
            stdsize: None,
            oom: OomPolicy::default(),
            track_unhandled: true,
        }
    }

    /// Sets the standard block size in bytes. Values below the crate
    /// minimum (256) are clamped up; the default is 8192.
    pub fn stdsize(mut self, bytes: usize) -> Self {
        self.stdsize = Some(bytes);
        self
    }

    /// Sets the policy applied when raw allocation fails. The default
    /// terminates the process.
    pub fn oom_policy(mut self, policy: OomPolicy) -> Self {
        self.oom = policy;
        self
    }

    /// Controls whether errors are linked onto the context's unhandled
    /// list when created (and checked off by [`Error::handled`]). On by
    /// default; with tracking off, handling an error simply detaches its
    /// tree.
    ///
    /// [`Error::handled`]: crate::Error::handled
    pub fn track_unhandled(mut self, enabled: bool) -> Self {
        self.track_unhandled = enabled;
        self
    }

    /// Builds the context.
    #[must_use]
    pub fn build(self) -> Context {
        let stdsize = match self.stdsize {
            Some(bytes) => bytes.max(MIN_BLOCK_SIZE.get()),
            None => DEFAULT_BLOCK_SIZE.get(),
        };
        Context::from_parts(stdsize, self.oom, self.track_unhandled)
    }
}
