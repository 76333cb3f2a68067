use std::sync::mpsc::{SendError, Sender};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use once_cell::sync::Lazy;

use crate::runtime::execution::RUNTIME;
use crate::runtime::work::{Message, Work};

thread_local! {
    /// Thread-local runtime delegate.
    ///
    /// This object serves as the per-thread reference to the [`RUNTIME`] that can be used to
    /// enqueue timed work on the runtime thread.
    ///
    /// # Usage
    ///
    /// ```ignore
    /// assert!(
    ///     RUNTIME_THREAD_LOCAL.with(|runtime|
    ///         runtime.enqueue(Message::Schedule(Work::new(Instant::now(), || ())))
    ///     ).is_ok()
    /// )
    /// ```
    pub(super) static RUNTIME_THREAD_LOCAL: Lazy<RuntimeThreadLocal> = Lazy::new(|| {
        RUNTIME
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .thread_local()
    });
}

/// Per-thread delegate for global runtime.
pub struct RuntimeThreadLocal(Sender<Message>);

impl RuntimeThreadLocal {
    /// Initialize [`RuntimeThreadLocal`] from [`Sender`] that allows the delegate to send work to
    /// the actual [`crate::runtime::execution::Runtime`].
    ///
    /// # Arguments
    ///
    /// * `sender` - Sender through which messages can be sent to runtime.
    pub(super) fn from_sender(sender: Sender<Message>) -> Self {
        RuntimeThreadLocal(sender)
    }

    /// Enqueue message on runtime. Hands the message back if the runtime is gone.
    ///
    /// # Arguments
    ///
    /// * `message` - Timed work or purge request.
    pub(super) fn enqueue(&self, message: Message) -> Result<(), SendError<Message>> {
        self.0.send(message)
    }
}

/// Schedule work on the runtime to run once `deadline` has passed, without caring about the
/// return value. Used to expire context deadlines.
///
/// The work is skipped once `cancellation` is cancelled, and dropped from the runtime on the next
/// [`purge_decoupled`].
///
/// # Arguments
///
/// * `deadline` - Point in time at which to run `f`. Never earlier.
/// * `cancellation` - Token that marks the work as no longer needed.
/// * `f` - Function closure to execute on runtime.
///
/// # Example
///
/// ```ignore
/// schedule_decoupled(Instant::now() + Duration::from_millis(10), token.clone(), move || {
///     // ...
/// });
/// ```
#[inline]
pub fn schedule_decoupled(
    deadline: Instant,
    cancellation: CancellationToken,
    f: impl FnOnce() + Send + 'static,
) {
    tracing::trace!(delay = ?deadline.saturating_duration_since(Instant::now()), "scheduling timed work");
    let work = Work::new(deadline, f).with_cancellation(cancellation);
    RUNTIME_THREAD_LOCAL
        .with(|runtime| runtime.enqueue(Message::Schedule(work)))
        .expect("runtime broken")
}

/// Ask the runtime to drop all scheduled work whose cancellation token has been cancelled, so it
/// does not stay queued until its deadline.
#[inline]
pub fn purge_decoupled() {
    RUNTIME_THREAD_LOCAL
        .with(|runtime| runtime.enqueue(Message::Purge))
        .expect("runtime broken")
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::RecvTimeoutError;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_enqueue_works() {
        let (tx, rx) = std::sync::mpsc::channel();
        assert!(RUNTIME_THREAD_LOCAL
            .with(|runtime| {
                runtime.enqueue(Message::Schedule(Work::new(Instant::now(), move || {
                    assert!(tx.send(true).is_ok());
                })))
            })
            .is_ok());
        assert!(matches!(
            rx.recv_timeout(std::time::Duration::from_millis(100)),
            Ok(true),
        ));
    }

    #[test]
    fn test_schedule_decoupled_works() {
        let (tx, rx) = std::sync::mpsc::channel();
        schedule_decoupled(
            Instant::now() + Duration::from_millis(5),
            CancellationToken::new(),
            move || {
                assert!(tx.send(true).is_ok());
            },
        );
        assert!(matches!(
            rx.recv_timeout(std::time::Duration::from_millis(100)),
            Ok(true),
        ));
    }

    #[test]
    fn test_schedule_decoupled_from_other_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            schedule_decoupled(Instant::now(), CancellationToken::new(), move || {
                assert!(tx.send(true).is_ok());
            });
        })
        .join()
        .unwrap();
        assert!(matches!(
            rx.recv_timeout(std::time::Duration::from_millis(100)),
            Ok(true),
        ));
    }

    #[test]
    fn test_purge_decoupled_drops_cancelled_work() {
        let token = CancellationToken::new();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        schedule_decoupled(
            Instant::now() + Duration::from_secs(3600),
            token.clone(),
            move || drop(tx),
        );
        token.cancel();
        purge_decoupled();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)),
            Err(RecvTimeoutError::Disconnected),
        );
    }
}
