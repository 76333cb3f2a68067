use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::error::ContextError;
use crate::runtime::{purge_decoupled, schedule_decoupled};
use crate::signal::Signal;

/// Cancellation context. Carries a "stop waiting" intent that resolves either through explicit
/// cancellation or when a deadline passes.
///
/// Contexts form a tree. A context derived with [`Context::with_cancel`], [`Context::with_deadline`]
/// or [`Context::with_timeout`] resolves when it is cancelled itself, when its own deadline passes,
/// or when its parent resolves, in which case it reports the parent's reason. The first reason to
/// resolve a context sticks.
///
/// Cancellation is advisory. Resolving a context does not stop any work: a work function that wants
/// to stop early has to check [`Context::err`] or wait on [`Context::done`] itself.
///
/// Cloning a [`Context`] is cheap and yields a handle to the same context.
///
/// # Usage
///
/// ```
/// # use async_future::{Context, ContextError};
/// # use std::time::Duration;
/// let (ctx, cancel) = Context::background().with_timeout(Duration::from_secs(10));
/// assert_eq!(ctx.err(), None);
/// cancel.cancel();
/// assert_eq!(ctx.err(), Some(ContextError::Cancelled));
/// ```
#[derive(Clone, Default)]
pub struct Context {
    /// `None` for the background context, which never resolves.
    inner: Option<Arc<Inner>>,
}

impl Context {
    /// The root context. It is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self { inner: None }
    }

    /// Derive a child context that can be cancelled explicitly through the returned
    /// [`CancelHandle`].
    ///
    /// The child keeps the deadline of this context, if any.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let inner = self.derive(self.deadline());
        (
            Context {
                inner: Some(inner.clone()),
            },
            CancelHandle { inner },
        )
    }

    /// Derive a child context that resolves with [`ContextError::DeadlineExceeded`] once
    /// `deadline` passes.
    ///
    /// If this context already has an earlier deadline, the child keeps that one instead. A
    /// deadline that has already passed resolves the child immediately.
    ///
    /// # Arguments
    ///
    /// * `deadline` - Point in time at which the child expires.
    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        if matches!(self.deadline(), Some(current) if current <= deadline) {
            return self.with_cancel();
        }

        let inner = self.derive(Some(deadline));
        if deadline <= Instant::now() {
            inner.resolve(ContextError::DeadlineExceeded);
        } else {
            inner.mark_timed();
            let expire = Arc::downgrade(&inner);
            schedule_decoupled(deadline, inner.token.clone(), move || {
                if let Some(inner) = expire.upgrade() {
                    inner.resolve(ContextError::DeadlineExceeded);
                }
            });
            // Resolved before the timer reached the runtime, so the purge sent on resolve may
            // have arrived first.
            if inner.token.is_cancelled() {
                purge_decoupled();
            }
        }
        (
            Context {
                inner: Some(inner.clone()),
            },
            CancelHandle { inner },
        )
    }

    /// Derive a child context that expires `timeout` from now. See [`Context::with_deadline`].
    ///
    /// # Arguments
    ///
    /// * `timeout` - Time until the child expires.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            // Too far in the future to represent, which is the same as no deadline.
            None => self.with_cancel(),
        }
    }

    /// Signal that fires once the context resolves.
    ///
    /// The signal of the background context never fires.
    pub fn done(&self) -> Signal {
        match &self.inner {
            Some(inner) => Signal::from_token(inner.token.clone()),
            None => Signal::new(),
        }
    }

    /// Reason the context resolved, or `None` while it has not.
    pub fn err(&self) -> Option<ContextError> {
        self.inner.as_ref().and_then(|inner| inner.err())
    }

    /// Whether the context has resolved.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Point in time at which the context expires, if it has a deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.as_ref().and_then(|inner| inner.deadline)
    }

    /// Create the shared state of a child context. Its token is a child of this context's token,
    /// so resolving this context resolves the child as well.
    fn derive(&self, deadline: Option<Instant>) -> Arc<Inner> {
        let token = match &self.inner {
            Some(parent) => parent.token.child_token(),
            None => CancellationToken::new(),
        };
        Arc::new(Inner {
            token,
            reason: OnceCell::new(),
            deadline,
            timed: AtomicBool::new(false),
            parent: self.inner.clone(),
        })
    }

    #[cfg(test)]
    fn inner(&self) -> &Arc<Inner> {
        self.inner.as_ref().expect("not a background context")
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("Context")
                .field("err", &inner.err())
                .field("deadline", &inner.deadline)
                .finish(),
            None => write!(f, "Context::background"),
        }
    }
}

/// Handle to cancel a [`Context`] and all contexts derived from it.
///
/// Dropping the handle does not cancel the context.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

impl CancelHandle {
    /// Cancel the context. Has no effect if the context already resolved, whether through an
    /// earlier cancel, its deadline or its parent.
    pub fn cancel(&self) {
        self.inner.resolve(ContextError::Cancelled);
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("err", &self.inner.err())
            .finish()
    }
}

/// Shared state of a non-background context.
struct Inner {
    /// Cancelled once the context resolves, either directly or through an ancestor.
    token: CancellationToken,
    /// Set before `token` is cancelled when this context resolves itself. A context resolved
    /// through an ancestor takes the ancestor's reason the first time it is asked.
    reason: OnceCell<ContextError>,
    deadline: Option<Instant>,
    /// Whether this context or a descendant has a deadline timer queued on the runtime.
    timed: AtomicBool,
    /// Keeps the parent, and with it any pending cancellation, alive for as long as the child is.
    parent: Option<Arc<Inner>>,
}

impl Inner {
    fn err(&self) -> Option<ContextError> {
        if !self.token.is_cancelled() {
            return None;
        }
        Some(*self.reason.get_or_init(|| self.inherited_reason()))
    }

    /// Reason of the closest ancestor that has one. The token of a context is only cancelled by
    /// its own resolve or by an ancestor's, and both set a reason first.
    fn inherited_reason(&self) -> ContextError {
        let mut ancestor = self.parent.as_deref();
        while let Some(inner) = ancestor {
            if let Some(reason) = inner.reason.get() {
                return *reason;
            }
            ancestor = inner.parent.as_deref();
        }
        ContextError::Cancelled
    }

    fn resolve(&self, err: ContextError) {
        if self.token.is_cancelled() || self.reason.set(err).is_err() {
            return;
        }
        self.token.cancel();
        tracing::trace!(reason = %err, "context resolved");
        if self.timed.load(Ordering::SeqCst) {
            purge_decoupled();
        }
    }

    /// Flag this context and its ancestors as having a queued timer, so that resolving any of
    /// them purges it from the runtime.
    fn mark_timed(&self) {
        let mut node = Some(self);
        while let Some(inner) = node {
            if inner.timed.swap(true, Ordering::SeqCst) {
                break;
            }
            node = inner.parent.as_deref();
        }
    }
}

impl Drop for Inner {
    // Unlinks the parent chain one node at a time, so dropping a deeply nested context does not
    // recurse.
    fn drop(&mut self) {
        let mut parent = self.parent.take();
        while let Some(inner) = parent {
            match Arc::try_unwrap(inner) {
                Ok(mut inner) => parent = inner.parent.take(),
                Err(_) => break,
            }
        }
    }
}
