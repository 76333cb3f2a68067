use std::future::Future as _;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::Thread;
use std::time::{Duration, Instant};

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// One-shot completion signal that can be observed by any number of waiters.
///
/// A [`Signal`] starts out pending and fires at most once. Once fired it stays fired, and every
/// waiter observes the transition no matter when it started waiting. Cloning a [`Signal`] produces
/// another handle to the same event.
///
/// Only the owner of the event (a [`crate::Future`] or a [`crate::Context`]) can fire it. Callers
/// receive read-only handles through [`crate::Future::done`] and [`crate::Context::done`].
///
/// # Usage
///
/// Wait on a single signal by blocking the current thread:
///
/// ```
/// # use async_future::{launch, Context};
/// let future = launch(&Context::background(), |_| Ok::<_, ()>(1));
/// future.done().wait();
/// assert!(future.is_done());
/// ```
///
/// Wait on several signals at once with [`select`], or `.await` a signal from async code:
///
/// ```
/// # use async_future::{launch, Context};
/// # tokio_test::block_on(async {
/// let future = launch(&Context::background(), |_| Ok::<_, ()>(1));
/// future.done().await;
/// assert_eq!(future.try_get(), Some(Ok(1)));
/// # })
/// ```
#[derive(Clone)]
pub struct Signal {
    source: Source,
}

/// What fires a [`Signal`].
#[derive(Clone)]
enum Source {
    /// Latch owned by a [`crate::Future`], fired through [`Signal::fire`].
    Latch(Arc<Shared>),
    /// Cancellation token of a [`crate::Context`]. Fires when the token is cancelled.
    Cancellation(CancellationToken),
}

impl Signal {
    /// Create a pending signal.
    pub(crate) fn new() -> Self {
        Self {
            source: Source::Latch(Arc::new(Shared {
                state: Mutex::new(State {
                    fired: false,
                    wakers: Vec::new(),
                    next_key: 0,
                }),
                fired: Condvar::new(),
            })),
        }
    }

    /// Create a signal that fires once `token` is cancelled.
    ///
    /// # Arguments
    ///
    /// * `token` - Cancellation token to observe.
    pub(crate) fn from_token(token: CancellationToken) -> Self {
        Self {
            source: Source::Cancellation(token),
        }
    }

    /// Fire the signal and release all current and future waiters. Returns `false` if the signal
    /// had already fired.
    pub(crate) fn fire(&self) -> bool {
        match &self.source {
            Source::Latch(shared) => shared.fire(),
            Source::Cancellation(token) => {
                let fired = !token.is_cancelled();
                token.cancel();
                fired
            }
        }
    }

    /// Whether the signal has fired. Never blocks.
    pub fn is_fired(&self) -> bool {
        match &self.source {
            Source::Latch(shared) => shared.lock().fired,
            Source::Cancellation(token) => token.is_cancelled(),
        }
    }

    /// Block the current thread until the signal fires.
    pub fn wait(&self) {
        match &self.source {
            Source::Latch(shared) => {
                let mut state = shared.lock();
                while !state.fired {
                    state = shared
                        .fired
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            Source::Cancellation(token) => futures::executor::block_on(token.cancelled()),
        }
    }

    /// Block the current thread until the signal fires or `timeout` elapses. Returns whether the
    /// signal fired.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum amount of time to wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_deadline(deadline),
            None => {
                self.wait();
                true
            }
        }
    }

    /// Block the current thread until the signal fires or `deadline` passes. Returns whether the
    /// signal fired.
    ///
    /// # Arguments
    ///
    /// * `deadline` - Point in time after which to give up.
    pub fn wait_deadline(&self, deadline: Instant) -> bool {
        match &self.source {
            Source::Latch(shared) => {
                let mut state = shared.lock();
                while !state.fired {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = shared
                        .fired
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                true
            }
            Source::Cancellation(_) => select_deadline(&[self], deadline).is_some(),
        }
    }

    /// Future that becomes ready once the signal fires.
    ///
    /// This is what makes a [`Signal`] usable inside `tokio::select!` or `futures::select!`.
    /// Awaiting the [`Signal`] itself is equivalent.
    pub fn fired(&self) -> Fired {
        let state = match &self.source {
            Source::Latch(shared) => FiredState::Latch {
                shared: shared.clone(),
                key: None,
            },
            Source::Cancellation(token) => {
                FiredState::Cancellation(Box::pin(token.clone().cancelled_owned()))
            }
        };
        Fired { state }
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("fired", &self.is_fired())
            .finish()
    }
}

impl std::future::IntoFuture for Signal {
    type Output = ();
    type IntoFuture = Fired;

    fn into_future(self) -> Fired {
        self.fired()
    }
}

impl std::future::IntoFuture for &Signal {
    type Output = ();
    type IntoFuture = Fired;

    fn into_future(self) -> Fired {
        self.fired()
    }
}

/// Future returned by [`Signal::fired`]. Resolves once the signal fires, and keeps resolving
/// immediately if polled again afterwards.
pub struct Fired {
    state: FiredState,
}

enum FiredState {
    Latch {
        shared: Arc<Shared>,
        /// Key of the registered waker, if any.
        key: Option<usize>,
    },
    Cancellation(Pin<Box<WaitForCancellationFutureOwned>>),
}

impl std::future::Future for Fired {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match &mut self.state {
            FiredState::Latch { shared, key } => {
                if shared.register(key, cx.waker()) {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
            FiredState::Cancellation(cancelled) => cancelled.as_mut().poll(cx),
        }
    }
}

impl Drop for Fired {
    fn drop(&mut self) {
        if let FiredState::Latch { shared, key } = &mut self.state {
            if let Some(key) = key.take() {
                shared.deregister(key);
            }
        }
    }
}

impl std::fmt::Debug for Fired {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let source = match &self.state {
            FiredState::Latch { .. } => "Latch",
            FiredState::Cancellation(_) => "Cancellation",
        };
        f.debug_struct("Fired").field("source", &source).finish()
    }
}

/// Block the current thread until at least one of `signals` fires and return its index.
///
/// If several signals have fired by the time [`select`] looks at them, the lowest index wins.
///
/// # Arguments
///
/// * `signals` - Signals to wait on. Must not be empty.
///
/// # Panics
///
/// Panics if `signals` is empty, since such a wait could never return.
///
/// # Example
///
/// ```
/// # use async_future::{launch, select, Context};
/// # use std::time::Duration;
/// let (ctx, _cancel) = Context::background().with_timeout(Duration::from_secs(10));
/// let future = launch(&ctx, |_| Ok::<_, ()>(1));
/// match select(&[&future.done(), &ctx.done()]) {
///     0 => assert_eq!(future.get(&ctx), Ok(1)),
///     _ => unreachable!("work finishes well within the deadline"),
/// }
/// ```
pub fn select(signals: &[&Signal]) -> usize {
    match select_inner(signals, None) {
        Some(index) => index,
        None => unreachable!("select without deadline returned without a fired signal"),
    }
}

/// Like [`select`], but gives up once `deadline` passes and returns `None` in that case.
///
/// # Arguments
///
/// * `signals` - Signals to wait on. Must not be empty.
/// * `deadline` - Point in time after which to give up.
pub fn select_deadline(signals: &[&Signal], deadline: Instant) -> Option<usize> {
    select_inner(signals, Some(deadline))
}

fn select_inner(signals: &[&Signal], deadline: Option<Instant>) -> Option<usize> {
    assert!(!signals.is_empty(), "select requires at least one signal");

    let mut fired = signals
        .iter()
        .map(|signal| signal.fired())
        .collect::<Vec<_>>();
    // Dropping `fired` deregisters every waker that is still registered.
    poll_any(&mut fired, &thread_waker(), deadline)
}

/// Waker that unparks the current thread. Build it once per blocking wait and pass it to
/// [`poll_any`] for every round.
pub(crate) fn thread_waker() -> Waker {
    Waker::from(Arc::new(ThreadWaker(std::thread::current())))
}

/// Poll `fired` in order until one is ready and return its index, parking the current thread in
/// between. Returns `None` once `deadline` passes.
///
/// The futures keep their registration between calls, so a caller that waits in a loop can reuse
/// the same slice and `waker` for every round.
///
/// # Arguments
///
/// * `fired` - Futures to poll. The lowest ready index wins.
/// * `waker` - Waker that unparks the current thread, see [`thread_waker`].
/// * `deadline` - Point in time after which to give up, if any.
pub(crate) fn poll_any(
    fired: &mut [Fired],
    waker: &Waker,
    deadline: Option<Instant>,
) -> Option<usize> {
    let mut cx = Context::from_waker(waker);
    loop {
        // Polling registers the waker before parking, so a fire that happens in between unparks
        // us even if we have not parked yet.
        let ready = fired
            .iter_mut()
            .position(|fired| Pin::new(fired).poll(&mut cx).is_ready());
        if ready.is_some() {
            return ready;
        }
        match deadline {
            None => std::thread::park(),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                std::thread::park_timeout(deadline - now);
            }
        }
    }
}

/// Waker that unparks a blocked thread.
struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

struct Shared {
    /// Fired flag and registered wakers.
    state: Mutex<State>,
    /// Notified once when the signal fires.
    fired: Condvar,
}

impl Shared {
    fn fire(&self) -> bool {
        let wakers = {
            let mut state = self.lock();
            if state.fired {
                return false;
            }
            state.fired = true;
            std::mem::take(&mut state.wakers)
        };
        self.fired.notify_all();
        for (_, waker) in wakers {
            waker.wake();
        }
        true
    }

    /// Register `waker` to be woken when the signal fires, unless it already has. Returns whether
    /// the signal has fired.
    ///
    /// A waker that was registered before under `key` is replaced in place, so polling repeatedly
    /// does not grow the waker list.
    fn register(&self, key: &mut Option<usize>, waker: &Waker) -> bool {
        let mut state = self.lock();
        if state.fired {
            return true;
        }
        let registered = match *key {
            Some(key) => state
                .wakers
                .iter_mut()
                .find(|(registered_key, _)| *registered_key == key),
            None => None,
        };
        match registered {
            Some((_, registered_waker)) => {
                if !registered_waker.will_wake(waker) {
                    *registered_waker = waker.clone();
                }
            }
            None => {
                let new_key = state.next_key;
                state.next_key += 1;
                state.wakers.push((new_key, waker.clone()));
                *key = Some(new_key);
            }
        }
        false
    }

    /// Remove the waker registered under `key`. No-op if the signal already fired.
    fn deregister(&self, key: usize) {
        self.lock()
            .wakers
            .retain(|(registered_key, _)| *registered_key != key);
    }

    /// No user code runs while the lock is held, so a poisoned lock still holds a consistent
    /// state.
    #[inline]
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct State {
    fired: bool,
    /// Wakers of async and [`select`] waiters, keyed so they can deregister.
    wakers: Vec<(usize, Waker)>,
    next_key: usize,
}
