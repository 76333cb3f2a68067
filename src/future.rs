use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use once_cell::sync::OnceCell;

use crate::context::Context;
use crate::error::Error;
use crate::signal::{self, Signal};

type Outcome<T, E> = Result<T, Error<E>>;

/// Handle to the eventual result of work running on its own thread.
///
/// A [`Future`] is created by [`launch`] (or [`Builder::launch`]) and completes exactly once, when
/// the work function returns or panics. The result can then be read any number of times, from any
/// number of threads, through [`Future::get`]. Cloning a [`Future`] yields another handle to the
/// same work.
///
/// Not to be confused with [`std::future::Future`]: this handle is driven by a dedicated thread,
/// not by an executor. Use [`Future::get_async`] or `.await` the [`Future::done`] signal to wait
/// on it from async code.
///
/// # Usage
///
/// ```
/// # use async_future::{launch, Context};
/// let future = launch(&Context::background(), |_ctx| {
///     // Doing some stuff
///     Ok::<_, String>(42)
/// });
///
/// // Do other stuff meanwhile, then wait for the result.
/// let value = future.get(&Context::background()).unwrap();
/// assert_eq!(value, 42);
/// ```
pub struct Future<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Future<T, E> {
    /// Block the current thread until the work has completed or `ctx` resolves, whichever happens
    /// first.
    ///
    /// If the work completed first, returns a copy of its value, [`Error::Computation`] with the
    /// error it returned, or [`Error::Panicked`] if it panicked. If `ctx` resolved first, returns
    /// [`Error::Cancelled`] or [`Error::DeadlineExceeded`]; the work keeps running and its outcome
    /// stays available to later calls.
    ///
    /// If `ctx` has already resolved when [`Future::get`] looks at it, the context error is
    /// returned even if the work has also completed. An already cancelled context therefore never
    /// blocks and never yields a value.
    ///
    /// Safe to call any number of times, concurrently, each call with its own context.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Context that bounds this wait only.
    ///
    /// # Example
    ///
    /// ```
    /// # use async_future::{launch, Context, Error};
    /// # use std::time::Duration;
    /// let future = launch(&Context::background(), |ctx| {
    ///     ctx.done().wait();
    ///     Ok::<u32, ()>(1)
    /// });
    /// let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(10));
    /// assert_eq!(future.get(&ctx), Err(Error::DeadlineExceeded));
    /// ```
    pub fn get(&self, ctx: &Context) -> Result<T, Error<E>>
    where
        T: Clone,
        E: Clone,
    {
        let waker = signal::thread_waker();
        let mut fired = [ctx.done().fired(), self.shared.done.fired()];
        loop {
            // Both the context error and the outcome are set before their signal fires, so after
            // `poll_any` returns one of these checks succeeds.
            if let Some(err) = ctx.err() {
                return Err(err.into());
            }
            if let Some(outcome) = self.shared.outcome.get() {
                return outcome.clone();
            }
            signal::poll_any(&mut fired, &waker, None);
        }
    }

    /// Asynchronous version of [`Future::get`], for callers that run inside an async executor.
    /// Resolves under the same rules, and does not block the executor thread.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Context that bounds this wait only.
    ///
    /// # Example
    ///
    /// ```
    /// # use async_future::{launch, Context};
    /// # tokio_test::block_on(async {
    /// let future = launch(&Context::background(), |_| Ok::<_, ()>("done"));
    /// assert_eq!(future.get_async(&Context::background()).await, Ok("done"));
    /// # })
    /// ```
    pub async fn get_async(&self, ctx: &Context) -> Result<T, Error<E>>
    where
        T: Clone,
        E: Clone,
    {
        let mut cancelled = ctx.done().fired();
        let mut completed = self.shared.done.fired();
        std::future::poll_fn(|cx| loop {
            if let Some(err) = ctx.err() {
                return Poll::Ready(Err(err.into()));
            }
            if let Some(outcome) = self.shared.outcome.get() {
                return Poll::Ready(outcome.clone());
            }
            let cancelled_ready = std::future::Future::poll(Pin::new(&mut cancelled), cx);
            let completed_ready = std::future::Future::poll(Pin::new(&mut completed), cx);
            if cancelled_ready.is_pending() && completed_ready.is_pending() {
                return Poll::Pending;
            }
        })
        .await
    }

    /// Read the outcome without blocking. Returns `None` while the work is still running.
    pub fn try_get(&self) -> Option<Result<T, Error<E>>>
    where
        T: Clone,
        E: Clone,
    {
        self.shared.outcome.get().cloned()
    }

    /// Completion signal of the work, for use in a multi-way wait next to other signals.
    ///
    /// The signal fires once the work has completed, and after that [`Future::get`] returns
    /// without blocking. Never blocks itself.
    ///
    /// # Example
    ///
    /// ```
    /// # use async_future::{launch, select, Context};
    /// # use std::time::Duration;
    /// let (ctx, _cancel) = Context::background().with_timeout(Duration::from_secs(10));
    /// let future = launch(&ctx, |_| Ok::<_, ()>(1));
    /// match select(&[&future.done(), &ctx.done()]) {
    ///     0 => assert_eq!(future.get(&Context::background()), Ok(1)),
    ///     _ => println!("gave up: {:?}", ctx.err()),
    /// }
    /// ```
    pub fn done(&self) -> Signal {
        self.shared.done.clone()
    }

    /// Whether the work has completed.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.shared.outcome.get().is_some()
    }
}

impl<T, E> Clone for Future<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for Future<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = if self.is_done() {
            "Completed"
        } else {
            "Pending"
        };
        f.debug_struct("Future").field("state", &state).finish()
    }
}

/// Run `f` on a new thread and return a [`Future`] for its result.
///
/// `f` receives a clone of `ctx`. Cancellation is cooperative: `f` keeps running when `ctx`
/// resolves unless it checks [`Context::err`] or waits on [`Context::done`] itself. Returns right
/// away, without waiting for `f` to start.
///
/// If `f` panics, the panic is caught on its thread and the future completes with
/// [`Error::Panicked`].
///
/// `T` and `E` must be [`Sync`] as well as [`Send`]: the outcome is stored once and then read by
/// reference from every thread that holds a handle, so it is shared, not moved.
///
/// # Panics
///
/// Panics if the operating system fails to create a thread. Use [`Builder::launch`] to handle that
/// case.
///
/// # Example
///
/// ```
/// # use async_future::{launch, Context};
/// let future = launch(&Context::background(), |ctx| {
///     if ctx.err().is_some() {
///         return Err("stopped early");
///     }
///     Ok(1)
/// });
/// assert_eq!(future.get(&Context::background()), Ok(1));
/// ```
pub fn launch<T, E, F>(ctx: &Context, f: F) -> Future<T, E>
where
    F: FnOnce(Context) -> Result<T, E> + Send + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    Builder::new()
        .launch(ctx, f)
        .expect("failed to spawn thread")
}

/// Thread configuration for launching work, similar to [`std::thread::Builder`].
///
/// # Example
///
/// ```
/// # use async_future::{Builder, Context};
/// let future = Builder::new()
///     .name("worker".to_string())
///     .stack_size(256 * 1024)
///     .launch(&Context::background(), |_| {
///         Ok::<_, ()>(std::thread::current().name().map(str::to_string))
///     })
///     .unwrap();
/// assert_eq!(future.get(&Context::background()), Ok(Some("worker".to_string())));
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    /// Create builder with default thread configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the thread that runs the work.
    ///
    /// # Arguments
    ///
    /// * `name` - Thread name. Must not contain null bytes, or [`Builder::launch`] panics.
    pub fn name(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    /// Set the stack size of the thread that runs the work.
    ///
    /// # Arguments
    ///
    /// * `size` - Stack size in bytes.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Run `f` on a new thread with this configuration. Same as [`launch`], but returns an error
    /// instead of panicking if the thread cannot be created.
    ///
    /// See [`launch`] for why `T` and `E` must be [`Sync`].
    ///
    /// # Arguments
    ///
    /// * `ctx` - Context passed to `f`.
    /// * `f` - Work function.
    pub fn launch<T, E, F>(self, ctx: &Context, f: F) -> std::io::Result<Future<T, E>>
    where
        F: FnOnce(Context) -> Result<T, E> + Send + 'static,
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let Builder { name, stack_size } = self;
        let mut builder = std::thread::Builder::new();
        if let Some(name) = name {
            builder = builder.name(name);
        }
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }

        let shared = Arc::new(Shared::new());
        builder.spawn({
            let shared = shared.clone();
            let ctx = ctx.clone();
            move || {
                let current = std::thread::current();
                let thread = current.name().unwrap_or("<unnamed>");
                tracing::debug!(thread, "work started");
                let outcome = match catch_unwind(AssertUnwindSafe(move || f(ctx))) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(Error::Computation(err)),
                    Err(payload) => {
                        let message = panic_message(payload);
                        tracing::error!(thread, panic = %message, "work panicked");
                        Err(Error::Panicked(message))
                    }
                };
                tracing::debug!(thread, ok = outcome.is_ok(), "work completed");
                shared.complete(outcome);
            }
        })?;

        Ok(Future { shared })
    }
}

/// State shared between the handles of a future and the thread that runs its work.
///
/// Handles on any thread read `outcome` through `&`, which is why the outcome types must be
/// [`Sync`].
struct Shared<T, E> {
    /// Written once by the work thread, before `done` fires.
    outcome: OnceCell<Outcome<T, E>>,
    done: Signal,
}

impl<T, E> Shared<T, E> {
    fn new() -> Self {
        Shared {
            outcome: OnceCell::new(),
            done: Signal::new(),
        }
    }

    /// Store the outcome, then release every waiter. Called once, from the work thread.
    ///
    /// # Panics
    ///
    /// Panics if the outcome was already stored.
    fn complete(&self, outcome: Outcome<T, E>) {
        if self.outcome.set(outcome).is_err() {
            unreachable!("future completed twice");
        }
        self.done.fire();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "Box<dyn Any>".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::error::ContextError;

    #[test]
    fn test_get_value() {
        let future = launch(&Context::background(), |_| Ok::<_, ()>(1));
        assert_eq!(future.get(&Context::background()), Ok(1));
    }

    #[test]
    fn test_get_computation_error() {
        let future = launch(&Context::background(), |_| Err::<u32, _>("failed"));
        assert_eq!(
            future.get(&Context::background()),
            Err(Error::Computation("failed"))
        );
    }

    #[test]
    fn test_get_cancelled_context_wins_over_completed_work() {
        let future = launch(&Context::background(), |_| Ok::<_, ()>(1));
        future.done().wait();
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        assert_eq!(future.get(&ctx), Err(Error::Cancelled));
        assert_eq!(future.get(&Context::background()), Ok(1));
    }

    #[test]
    fn test_get_cancelled_while_waiting() {
        let (release_tx, release_rx) = channel::<()>();
        let future = launch(&Context::background(), move |_| {
            let _ = release_rx.recv();
            Ok::<_, ()>(1)
        });
        let (ctx, cancel) = Context::background().with_cancel();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            cancel.cancel();
        });
        assert_eq!(future.get(&ctx), Err(Error::Cancelled));
        canceller.join().unwrap();
        release_tx.send(()).unwrap();
        assert_eq!(future.get(&Context::background()), Ok(1));
    }

    #[test]
    fn test_get_deadline_exceeded() {
        let (_release_tx, release_rx) = channel::<()>();
        let future = launch(&Context::background(), move |_| {
            let _ = release_rx.recv();
            Ok::<_, ()>(1)
        });
        let start = Instant::now();
        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(10));
        assert_eq!(future.get(&ctx), Err(Error::DeadlineExceeded));
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(!future.is_done());
    }

    #[test]
    fn test_get_is_idempotent() {
        let future = launch(&Context::background(), |_| Ok::<_, ()>(vec![1, 2, 3]));
        let first = future.get(&Context::background());
        for _ in 0..10 {
            assert_eq!(future.get(&Context::background()), first);
        }
        assert_eq!(future.try_get(), Some(first));
    }

    #[test]
    fn test_try_get_pending() {
        let (release_tx, release_rx) = channel::<()>();
        let future = launch(&Context::background(), move |_| {
            let _ = release_rx.recv();
            Ok::<_, ()>(1)
        });
        assert_eq!(future.try_get(), None);
        assert!(!future.is_done());
        release_tx.send(()).unwrap();
        assert_eq!(future.get(&Context::background()), Ok(1));
        assert!(future.is_done());
    }

    #[test]
    fn test_panic_becomes_error() {
        let future = launch(&Context::background(), |_| -> Result<u32, ()> {
            panic!("boom");
        });
        assert_eq!(
            future.get(&Context::background()),
            Err(Error::Panicked("boom".to_string()))
        );
    }

    #[test]
    fn test_panic_with_formatted_message() {
        let future = launch(&Context::background(), |_| -> Result<u32, ()> {
            panic!("boom {}", 42);
        });
        assert_eq!(
            future.get(&Context::background()),
            Err(Error::Panicked("boom 42".to_string()))
        );
    }

    #[test]
    fn test_work_receives_context() {
        let (ctx, cancel) = Context::background().with_cancel();
        let future = launch(&ctx, |ctx| {
            ctx.done().wait();
            Err::<(), _>(ctx.err())
        });
        cancel.cancel();
        assert_eq!(
            future.get(&Context::background()),
            Err(Error::Computation(Some(ContextError::Cancelled)))
        );
    }

    #[test]
    fn test_work_runs_exactly_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let future = launch(&Context::background(), {
            let runs = runs.clone();
            move |_| Ok::<_, ()>(runs.fetch_add(1, Ordering::SeqCst))
        });
        let clone = future.clone();
        assert_eq!(future.get(&Context::background()), Ok(0));
        assert_eq!(clone.get(&Context::background()), Ok(0));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_launch_returns_before_work_finishes() {
        let (release_tx, release_rx) = channel::<()>();
        let start = Instant::now();
        let future = launch(&Context::background(), move |_| {
            let _ = release_rx.recv();
            Ok::<_, ()>(())
        });
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!future.is_done());
        release_tx.send(()).unwrap();
        assert!(future.done().wait_timeout(Duration::from_secs(1)));
    }

    #[test]
    fn test_builder_names_thread() {
        let future = Builder::new()
            .name("named-work".to_string())
            .launch(&Context::background(), |_| {
                Ok::<_, ()>(std::thread::current().name().map(str::to_string))
            })
            .unwrap();
        assert_eq!(
            future.get(&Context::background()),
            Ok(Some("named-work".to_string()))
        );
    }

    #[test]
    fn test_debug() {
        let (release_tx, release_rx) = channel::<()>();
        let future = launch(&Context::background(), move |_| {
            let _ = release_rx.recv();
            Ok::<_, ()>(())
        });
        assert_eq!(format!("{future:?}"), "Future { state: \"Pending\" }");
        release_tx.send(()).unwrap();
        future.done().wait();
        assert_eq!(format!("{future:?}"), "Future { state: \"Completed\" }");
    }

    #[test]
    #[should_panic(expected = "future completed twice")]
    fn test_complete_twice_panics() {
        let shared = Shared::<u32, ()>::new();
        shared.complete(Ok(1));
        shared.complete(Ok(2));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(1)), "Box<dyn Any>");
    }

    #[test]
    fn test_get_survives_spurious_wake_ups() {
        let (release_tx, release_rx) = channel::<()>();
        let future = launch(&Context::background(), move |_| {
            let _ = release_rx.recv();
            Ok::<_, ()>(1)
        });
        let waiter = std::thread::spawn({
            let future = future.clone();
            move || future.get(&Context::background())
        });
        for _ in 0..100 {
            waiter.thread().unpark();
            std::thread::sleep(Duration::from_micros(100));
        }
        assert!(!waiter.is_finished());
        release_tx.send(()).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(1));
    }

    #[tokio::test]
    async fn test_get_async() {
        let future = launch(&Context::background(), |_| {
            std::thread::sleep(Duration::from_millis(10));
            Ok::<_, ()>(1)
        });
        assert_eq!(future.get_async(&Context::background()).await, Ok(1));
    }

    #[tokio::test]
    async fn test_get_async_deadline_exceeded() {
        let (_release_tx, release_rx) = channel::<()>();
        let future = launch(&Context::background(), move |_| {
            let _ = release_rx.recv();
            Ok::<_, ()>(1)
        });
        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(10));
        assert_eq!(future.get_async(&ctx).await, Err(Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_get_async_cancelled_context_wins() {
        let future = launch(&Context::background(), |_| Ok::<_, ()>(1));
        future.done().await;
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        assert_eq!(future.get_async(&ctx).await, Err(Error::Cancelled));
    }
}
