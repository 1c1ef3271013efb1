use tokio_util::sync::CancellationToken;

/// Per-dispatch context threaded through every middleware, handler and transport call.
///
/// Carries the cancellation signal that receive loops and long-running handlers
/// observe during shutdown, plus an optional trace identifier for log correlation.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    /// Cancelled when the owning runtime or receive loop shuts down.
    pub cancel: CancellationToken,
    /// Correlation identifier propagated into tracing fields, if any.
    pub trace_id: Option<String>,
}

impl DispatchContext {
    /// Creates a context with a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context driven by an existing cancellation token.
    #[must_use]
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            trace_id: None,
        }
    }

    /// Returns a derived context whose token is cancelled together with this one,
    /// but can also be cancelled on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            trace_id: self.trace_id.clone(),
        }
    }

    /// Attaches a trace identifier.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Returns `true` once the context has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_is_cancelled_with_parent() {
        let parent = DispatchContext::new();
        let child = parent.child();
        assert!(!child.is_cancelled());

        parent.cancel.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancelling_child_leaves_parent_running() {
        let parent = DispatchContext::new().with_trace_id("trace-1");
        let child = parent.child();
        child.cancel.cancel();

        assert!(!parent.is_cancelled());
        assert_eq!(child.trace_id.as_deref(), Some("trace-1"));
    }
}
