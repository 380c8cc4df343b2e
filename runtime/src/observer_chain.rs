//! Ordered fan-out of lifecycle notifications to the registered observers.

use futures::FutureExt;
use scopebus_core::{
    ConsumeContext, ConsumeError, ConsumeObserver, ObserverError, ObserverFailure, ObserverFuture,
    ObserverPhase, PanicError,
};
use smallvec::SmallVec;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Observers in registration order.
///
/// Built while the bus is being configured and frozen (shared behind an `Arc`)
/// once it starts.
#[derive(Clone, Default)]
pub struct ObserverChain {
    observers: SmallVec<[Arc<dyn ConsumeObserver>; 4]>,
}

impl ObserverChain {
    /// Empty chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer; it is notified after every observer pushed before it
    pub fn push(&mut self, observer: Arc<dyn ConsumeObserver>) {
        self.observers.push(observer);
    }

    /// Number of observers
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether no observer is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Notify every observer before consumption.
    ///
    /// # Errors
    ///
    /// Stops at the first failing observer and returns its failure; later
    /// observers are not called.
    pub async fn pre_consume(&self, context: &ConsumeContext) -> Result<(), ObserverFailure> {
        for (index, observer) in self.observers.iter().enumerate() {
            notify(ObserverPhase::PreConsume, index, || observer.pre_consume(context)).await?;
        }
        Ok(())
    }

    /// Notify every observer of a successful consumption.
    ///
    /// Every observer is called; the failures are returned in registration order.
    pub async fn post_consume(&self, context: &ConsumeContext) -> Vec<ObserverFailure> {
        let mut failures = Vec::new();
        for (index, observer) in self.observers.iter().enumerate() {
            if let Err(failure) =
                notify(ObserverPhase::PostConsume, index, || observer.post_consume(context)).await
            {
                failures.push(failure);
            }
        }
        failures
    }

    /// Notify every observer of a fault.
    ///
    /// Every observer is called; the failures are returned in registration order.
    pub async fn consume_fault(
        &self,
        context: &ConsumeContext,
        error: &ConsumeError,
    ) -> Vec<ObserverFailure> {
        let mut failures = Vec::new();
        for (index, observer) in self.observers.iter().enumerate() {
            if let Err(failure) = notify(ObserverPhase::ConsumeFault, index, || {
                observer.consume_fault(context, error)
            })
            .await
            {
                failures.push(failure);
            }
        }
        failures
    }
}

impl fmt::Debug for ObserverChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverChain")
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Run one hook, turning an error or a panic into an [`ObserverFailure`].
async fn notify<'a, F>(phase: ObserverPhase, index: usize, hook: F) -> Result<(), ObserverFailure>
where
    F: FnOnce() -> ObserverFuture<'a>,
{
    tracing::trace!(%phase, index, "Notifying observer");
    let outcome = AssertUnwindSafe(async move { hook().await })
        .catch_unwind()
        .await;

    let error = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(error)) => error,
        Err(payload) => ObserverError::new(PanicError::from_payload(payload.as_ref())),
    };
    tracing::debug!(%phase, index, error = %error, "Observer failed");
    Err(ObserverFailure { phase, index, error })
}
