use std::cmp::Reverse;
use std::collections::binary_heap::{BinaryHeap, PeekMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use once_cell::sync::Lazy;

use crate::runtime::thread_local::RuntimeThreadLocal;
use crate::runtime::work::{Message, Work};

/// Refers to the global runtime. The runtime owns a dedicated thread that runs timed work, such as
/// expiring the deadline of a [`crate::Context`], once it becomes due.
///
/// The runtime never runs the work launched through [`crate::launch`]. Each launched future gets
/// its own thread.
///
/// Note that this object should not be used by callers because each thread gets its own delegate
/// object to communicate with the runtime.
///
/// # Usage
///
/// Each thread should get its own [`RuntimeThreadLocal`] object, which acts as delegate object.
///
/// Use `Runtime::thread_local` to get the thread local object:
///
/// ```ignore
/// let runtime = RUNTIME.lock().unwrap().thread_local();
/// ```
pub(super) static RUNTIME: Lazy<Mutex<Runtime>> = Lazy::new(|| Mutex::new(Runtime::new()));

/// Runtime object that holds the runtime thread and a channel
/// to send messages onto the worker queue.
pub struct Runtime {
    join_handle: Option<std::thread::JoinHandle<()>>,
    run_flag: Arc<AtomicBool>,
    message_tx: Sender<Message>,
}

impl Runtime {
    /// Acquire a thread local delegate for the runtime.
    pub(super) fn thread_local(&self) -> RuntimeThreadLocal {
        RuntimeThreadLocal::from_sender(self.message_tx.clone())
    }

    /// Create runtime.
    fn new() -> Self {
        let run_flag = Arc::new(AtomicBool::new(true));
        let (message_tx, message_rx) = channel::<Message>();

        let join_handle = std::thread::Builder::new()
            .name("async-future-timer".to_string())
            .spawn({
                let run_flag = run_flag.clone();
                move || Self::worker(run_flag, message_rx)
            })
            .expect("failed to spawn runtime thread");

        Runtime {
            join_handle: Some(join_handle),
            run_flag,
            message_tx,
        }
    }

    /// Worker loop. Receives timed work from the worker queue, keeps it ordered by deadline, and
    /// executes each item once its deadline has passed, until [`run_flag`] becomes `false`.
    ///
    /// Work is never executed before its deadline. Work whose cancellation token has been
    /// cancelled is dropped without running, either when it becomes due or when a
    /// [`Message::Purge`] arrives. Work that is still pending when the runtime stops is dropped
    /// without running.
    ///
    /// # Arguments
    ///
    /// * `run_flag` - Atomic flag that indicates whether the worker should continue running.
    /// * `message_rx` - Receives work to execute and purge requests.
    fn worker(run_flag: Arc<AtomicBool>, message_rx: Receiver<Message>) {
        let mut pending = BinaryHeap::<Reverse<Work>>::new();
        while run_flag.load(Ordering::Relaxed) {
            let now = Instant::now();
            while let Some(next) = pending.peek_mut() {
                if next.0.deadline() > now {
                    break;
                }
                let Reverse(work) = PeekMut::pop(next);
                if work.is_cancelled() {
                    continue;
                }
                tracing::trace!(overdue = ?now.duration_since(work.deadline()), "running timed work");
                work.run();
            }

            let received = match pending.peek() {
                Some(Reverse(next)) => {
                    message_rx.recv_timeout(next.deadline().saturating_duration_since(now))
                }
                None => message_rx
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(Message::Schedule(work)) => pending.push(Reverse(work)),
                Ok(Message::Purge) => {
                    let before = pending.len();
                    pending.retain(|Reverse(work)| !work.is_cancelled());
                    let dropped = before - pending.len();
                    if dropped > 0 {
                        tracing::trace!(dropped, remaining = pending.len(), "dropped cancelled timed work");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.run_flag.store(false, Ordering::Relaxed);

        // Put a purge message into the queue to trigger the loop to continue and encounter the
        // `run_flag` that is now false, then stop. Note that if this fails, it means the underlying
        // channel is broken. It is not a problem, since that must mean the worker already quit
        // before, and it will join immediatly.
        let _ = self.message_tx.send(Message::Purge);

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .join()
                .expect("failed to join on runtime thread");
        }
    }
}
