use std::cmp::Ordering;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

/// Message sent to the runtime thread.
pub enum Message {
    /// Run the work once its deadline has passed.
    Schedule(Work),
    /// Drop all pending work whose cancellation token has been cancelled. Also used to wake the
    /// worker loop.
    Purge,
}

/// Represents a unit of work passed to the runtime. Holds a closure and the point in time at which
/// the runtime should run it.
///
/// The closure is explictly [`Send`] because it will be sent over the thread boundary to be
/// executed in the runtime thread. For the same reason, the closure must be `'static`.
///
/// Work items order by deadline only, which is all the runtime's queue needs.
///
/// # Usage
///
/// ```ignore
/// let work = Work::new(Instant::now(), || {
///     // ...
/// });
/// work.run();
/// ```
pub struct Work {
    deadline: Instant,
    cancellation: Option<CancellationToken>,
    f: Box<dyn FnOnce() + Send + 'static>,
}

impl Work {
    /// Create a new work item.
    ///
    /// # Arguments
    ///
    /// * `deadline` - Point in time at which the work becomes due.
    /// * `f` - Closure to execute.
    pub fn new(deadline: Instant, f: impl FnOnce() + Send + 'static) -> Self {
        Work {
            deadline,
            cancellation: None,
            f: Box::new(f),
        }
    }

    /// Tie the work to `token`. Once the token is cancelled the work is no longer needed: the
    /// runtime skips it when it becomes due and drops it on the next [`Message::Purge`].
    ///
    /// # Arguments
    ///
    /// * `token` - Token that marks the work as no longer needed.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Point in time at which the work becomes due.
    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the token the work is tied to has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Execute work.
    pub fn run(self) {
        let Work { f, .. } = self;
        f();
    }
}

impl PartialEq for Work {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for Work {}

impl PartialOrd for Work {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Work {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline.cmp(&other.deadline)
    }
}
