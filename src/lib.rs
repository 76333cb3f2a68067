//! Launch work on its own thread and wait for its result later, with cancellation.
//!
//! [`launch`] runs a work function on a new thread and returns a [`Future`] right away. The
//! result is read with [`Future::get`], which blocks until the work completes or until the
//! [`Context`] passed to that call is cancelled or runs past its deadline, whichever comes first.
//! [`Future::done`] exposes the completion [`Signal`] for waiting on several events at once, either
//! with [`select`] or by awaiting it from async code.
//!
//! ```
//! use std::time::Duration;
//!
//! use async_future::{launch, Context, Error};
//!
//! let future = launch(&Context::background(), |ctx| {
//!     // Cancellation is cooperative: the work decides when to look at its context.
//!     match ctx.err() {
//!         Some(err) => Err(err),
//!         None => Ok(1),
//!     }
//! });
//!
//! let (ctx, _cancel) = Context::background().with_timeout(Duration::from_secs(10));
//! match future.get(&ctx) {
//!     Ok(value) => assert_eq!(value, 1),
//!     Err(Error::Cancelled | Error::DeadlineExceeded) => println!("stopped waiting"),
//!     Err(Error::Computation(err)) => println!("work failed: {err}"),
//!     Err(Error::Panicked(message)) => println!("work panicked: {message}"),
//! }
//! ```

pub mod context;
pub mod error;
pub mod future;
pub mod signal;

mod runtime;

pub use context::{CancelHandle, Context};
pub use error::{ContextError, Error};
pub use future::{launch, Builder, Future};
pub use signal::{select, select_deadline, Fired, Signal};
