//! Consume lifecycle observers.
//!
//! An observer is notified at three points of every message's processing:
//! before consumption, after a successful consumption, and on fault. All three
//! hooks default to doing nothing, so an observer implements only what it needs.

use crate::context::ConsumeContext;
use crate::error::{BoxError, ConsumeError};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Future returned by observer hooks.
pub type ObserverFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ObserverError>> + Send + 'a>>;

/// Lifecycle observer for consumed messages.
///
/// # Example
///
/// ```
/// use scopebus_core::context::ConsumeContext;
/// use scopebus_core::observer::{ConsumeObserver, ObserverFuture};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct CountingObserver {
///     consumed: AtomicUsize,
/// }
///
/// impl ConsumeObserver for CountingObserver {
///     fn post_consume<'a>(&'a self, _context: &'a ConsumeContext) -> ObserverFuture<'a> {
///         self.consumed.fetch_add(1, Ordering::Relaxed);
///         Box::pin(async { Ok(()) })
///     }
/// }
/// ```
pub trait ConsumeObserver: Send + Sync + 'static {
    /// Called before the consumer is resolved
    ///
    /// # Errors
    ///
    /// An error aborts consumption of the message and faults it.
    fn pre_consume<'a>(&'a self, context: &'a ConsumeContext) -> ObserverFuture<'a> {
        let _ = context;
        Box::pin(std::future::ready(Ok(())))
    }

    /// Called after the consumer returned successfully
    ///
    /// # Errors
    ///
    /// An error is reported but does not change the message's outcome.
    fn post_consume<'a>(&'a self, context: &'a ConsumeContext) -> ObserverFuture<'a> {
        let _ = context;
        Box::pin(std::future::ready(Ok(())))
    }

    /// Called once when consumption faulted
    ///
    /// # Errors
    ///
    /// An error is reported but does not change the message's outcome.
    fn consume_fault<'a>(&'a self, context: &'a ConsumeContext, error: &'a ConsumeError) -> ObserverFuture<'a> {
        let _ = (context, error);
        Box::pin(std::future::ready(Ok(())))
    }
}

/// Lifecycle point an observer was called at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserverPhase {
    /// Before consumption
    PreConsume,
    /// After successful consumption
    PostConsume,
    /// After a fault
    ConsumeFault,
}

impl ObserverPhase {
    /// Phase name as used in logs and metric labels
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreConsume => "pre_consume",
            Self::PostConsume => "post_consume",
            Self::ConsumeFault => "consume_fault",
        }
    }
}

impl fmt::Display for ObserverPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by an observer hook.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct ObserverError {
    #[source]
    source: BoxError,
}

impl ObserverError {
    /// Wrap any error
    #[must_use]
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self { source: source.into() }
    }

    /// Error from a plain message
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::new(message)
    }

    /// The underlying error, if it is an `E`
    #[must_use]
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.downcast_ref::<E>()
    }
}

/// An observer hook failure, located by phase and registration index.
#[derive(Error, Debug)]
#[error("Observer #{index} failed during {phase}: {error}")]
pub struct ObserverFailure {
    /// Phase the failure happened in
    pub phase: ObserverPhase,
    /// Registration index of the observer
    pub index: usize,
    /// What the observer raised
    #[source]
    pub error: ObserverError,
}
