//! Consumer trait and handler errors.

use crate::context::ConsumeContext;
use crate::error::{BoxError, PanicError};
use crate::message::Message;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Future returned by [`Consumer::consume`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Business logic for one message type.
///
/// Consumers are resolved from the message's scope, so every dependency they hold
/// was built for this message only. A consumer must not keep itself or its
/// dependencies alive past the returned future.
///
/// # Example
///
/// ```
/// use scopebus_core::consumer::{Consumer, HandlerError, HandlerFuture};
/// use scopebus_core::context::ConsumeContext;
/// use scopebus_core::message::Message;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct OrderPlaced {
///     order_id: u64,
/// }
///
/// impl Message for OrderPlaced {
///     const MESSAGE_TYPE: &'static str = "urn:message:OrderPlaced";
/// }
///
/// struct OrderPlacedConsumer;
///
/// impl Consumer<OrderPlaced> for OrderPlacedConsumer {
///     fn consume<'a>(&'a self, _context: &'a ConsumeContext, message: &'a OrderPlaced) -> HandlerFuture<'a> {
///         Box::pin(async move {
///             if message.order_id == 0 {
///                 return Err(HandlerError::msg("order id must be set"));
///             }
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait Consumer<M: Message>: Send + Sync + 'static {
    /// Handle one message
    ///
    /// # Errors
    ///
    /// Any error faults the message: observers see it through `consume_fault`
    /// and it is published on the fault channel.
    fn consume<'a>(&'a self, context: &'a ConsumeContext, message: &'a M) -> HandlerFuture<'a>;
}

/// Error raised by consumer logic.
#[derive(Error, Debug)]
#[error("Consumer failed: {source}")]
pub struct HandlerError {
    #[source]
    source: BoxError,
}

impl HandlerError {
    /// Wrap any error (including `anyhow::Error`)
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

    /// The handler panicked
    #[must_use]
    pub fn panicked(panic: PanicError) -> Self {
        Self::new(panic)
    }

    /// The underlying error, if it is an `E`
    #[must_use]
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.downcast_ref::<E>()
    }

    /// The underlying error
    #[must_use]
    pub fn into_inner(self) -> BoxError {
        self.source
    }
}
