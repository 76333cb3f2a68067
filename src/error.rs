/// Reason a [`crate::Context`] resolved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ContextError {
    /// The context, or one of its ancestors, was cancelled through its [`crate::CancelHandle`].
    Cancelled,
    /// The deadline of the context, or of one of its ancestors, has passed.
    DeadlineExceeded,
}

impl std::fmt::Display for ContextError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ContextError::Cancelled => write!(f, "context cancelled"),
            ContextError::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

impl std::error::Error for ContextError {}

/// An error returned when retrieving the result of a [`crate::Future`].
///
/// Callers should match on the variant to tell apart "my wait was cut short"
/// ([`Error::Cancelled`], [`Error::DeadlineExceeded`]) from "the work itself failed"
/// ([`Error::Computation`], [`Error::Panicked`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// The context passed to the wait was cancelled before the work completed. The work itself
    /// keeps running.
    Cancelled,
    /// The deadline of the context passed to the wait elapsed before the work completed. The work
    /// itself keeps running.
    DeadlineExceeded,
    /// The work completed and returned this error. It is handed back exactly as the work function
    /// produced it.
    Computation(E),
    /// The work function panicked. Holds the panic message if it was a string.
    Panicked(String),
}

impl<E> Error<E> {
    /// Whether the error stems from the wait context rather than from the work.
    pub fn is_context(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    /// Borrow the error the work function returned, if this is one.
    pub fn computation(&self) -> Option<&E> {
        match self {
            Error::Computation(err) => Some(err),
            _ => None,
        }
    }

    /// Take out the error the work function returned, if this is one.
    pub fn into_computation(self) -> Option<E> {
        match self {
            Error::Computation(err) => Some(err),
            _ => None,
        }
    }
}

impl<E> From<ContextError> for Error<E> {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => Error::Cancelled,
            ContextError::DeadlineExceeded => Error::DeadlineExceeded,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for Error<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Cancelled => write!(f, "{}", ContextError::Cancelled),
            Error::DeadlineExceeded => write!(f, "{}", ContextError::DeadlineExceeded),
            Error::Computation(err) => write!(f, "{err}"),
            Error::Panicked(message) => write!(f, "work panicked: {message}"),
        }
    }
}

impl<E> std::error::Error for Error<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Computation(err) => Some(err),
            _ => None,
        }
    }
}
