//! Transport abstraction feeding deliveries into the pipeline.
//!
//! The pipeline does not implement a transport. It consumes a [`DeliveryStream`]
//! from any [`Transport`] and expects each delivered message exactly once per
//! receipt; redelivery policy belongs to the transport.

use crate::message::Delivery;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur on the transport side.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Receiving from the queue failed
    #[error("Receive failed on '{queue}': {reason}")]
    ReceiveFailed {
        /// Queue being received from
        queue: String,
        /// Failure reason
        reason: String,
    },

    /// The transport was closed
    #[error("Transport closed")]
    Closed,
}

/// Stream of deliveries from a transport.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, TransportError>> + Send>>;

/// A source of deliveries.
///
/// # Dyn Compatibility
///
/// Returns an explicit boxed future so the bus can hold `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    /// Start receiving deliveries
    ///
    /// The stream ends when the transport has no more deliveries to offer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the transport cannot start.
    fn receive(&self) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, TransportError>> + Send + '_>>;
}
