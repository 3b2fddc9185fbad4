use crate::runtime::Runtime;
use crate::Error;
use std::ops::Deref;
use tracing::warn;

/// A runtime that is closed exactly once when it goes out of scope.
///
/// Close failures during drop are logged. Call [`ScopedRuntime::close`] to
/// observe them instead.
pub struct ScopedRuntime {
    runtime: Option<Runtime>,
}

impl ScopedRuntime {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime: Some(runtime),
        }
    }

    /// Close now and report the outcome. Succeeds if already closed.
    pub fn close(mut self) -> Result<(), Error> {
        match self.runtime.take() {
            Some(rt) if !rt.is_closed() => rt.close(),
            _ => Ok(()),
        }
    }

    /// Give up the guard; the caller becomes responsible for closing.
    pub fn into_inner(mut self) -> Runtime {
        self.runtime.take().expect("scoped runtime already released")
    }
}

impl Deref for ScopedRuntime {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        // Only `close` and `into_inner` take the runtime, and both consume self.
        self.runtime.as_ref().expect("scoped runtime already released")
    }
}

impl Drop for ScopedRuntime {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.take() {
            if rt.is_closed() {
                return;
            }
            if let Err(e) = rt.close() {
                warn!("failed to close runtime {} on drop: {e}", rt.id());
            }
        }
    }
}
