//! Terminal-state signalling shared by connection, session, and link drivers.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// A cancellation token paired with the error that caused it.
///
/// Only the driver task owning a component sets its terminal error; every
/// other task observes it through [`closed`](Self::closed) and
/// [`error`](Self::error). Setting the error is idempotent: the first cause
/// wins and later causes are dropped.
#[derive(Clone, Debug, Default)]
pub(crate) struct Shutdown {
    token: CancellationToken,
    cause: Arc<OnceLock<Error>>,
}

impl Shutdown {
    pub fn new() -> Self { Self::default() }

    /// A child whose token is cancelled when this one is, with its own cause
    /// slot.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            cause: Arc::new(OnceLock::new()),
        }
    }

    /// Record the terminal error and cancel the token.
    pub fn close(&self, cause: Error) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    /// `true` once the component has terminated.
    pub fn is_closed(&self) -> bool { self.token.is_cancelled() }

    /// Wait for termination.
    pub async fn closed(&self) { self.token.cancelled().await; }

    /// The terminal error, defaulting to `fallback` when the component was
    /// cancelled through a parent token without a recorded cause.
    pub fn error_or(&self, fallback: Error) -> Error {
        self.cause.get().cloned().unwrap_or(fallback)
    }

    /// The recorded terminal error, if any.
    pub fn error(&self) -> Option<Error> { self.cause.get().cloned() }
}
