//! In-memory transport for fast, deterministic bus tests.

use scopebus_core::{Delivery, DeliveryStream, Message, MessageId, Transport, TransportError};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

type Item = Result<Delivery, TransportError>;

/// Errors from [`InMemoryTransport::publish`].
#[derive(Error, Debug)]
pub enum PublishError {
    /// The message could not be encoded
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// The transport was closed
    #[error("Transport closed")]
    Closed,
}

struct Channel {
    sender: Option<mpsc::UnboundedSender<Item>>,
    receiver: Option<mpsc::UnboundedReceiver<Item>>,
}

/// Unbounded queue implementing [`Transport`].
///
/// Deliveries published before the bus starts are buffered. The stream ends
/// once [`InMemoryTransport::close`] is called and the buffer is drained.
///
/// # Example
///
/// ```
/// use scopebus_testing::InMemoryTransport;
/// use scopebus_core::Delivery;
///
/// let transport = InMemoryTransport::new();
/// transport.send(Delivery::new("urn:message:Ping", b"{}".to_vec()));
/// assert_eq!(transport.published(), 1);
/// ```
#[derive(Clone)]
pub struct InMemoryTransport {
    channel: Arc<Mutex<Channel>>,
    published: Arc<AtomicUsize>,
}

impl InMemoryTransport {
    /// Create an open transport
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            channel: Arc::new(Mutex::new(Channel {
                sender: Some(sender),
                receiver: Some(receiver),
            })),
            published: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enqueue a raw delivery
    ///
    /// Returns `false` once the transport is closed.
    pub fn send(&self, delivery: Delivery) -> bool {
        let accepted = self.push(Ok(delivery));
        if accepted {
            self.published.fetch_add(1, Ordering::SeqCst);
        }
        accepted
    }

    /// Encode a message as JSON and enqueue it
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Encode`] if serialization fails and
    /// [`PublishError::Closed`] once the transport is closed.
    pub fn publish<M>(&self, message: &M) -> Result<MessageId, PublishError>
    where
        M: Message + Serialize,
    {
        let delivery = Delivery::json(message)?;
        let id = delivery.message_id().clone();
        if self.send(delivery) {
            Ok(id)
        } else {
            Err(PublishError::Closed)
        }
    }

    /// Enqueue a receive error
    pub fn fail(&self, error: TransportError) -> bool {
        self.push(Err(error))
    }

    /// End the delivery stream once buffered deliveries are consumed
    pub fn close(&self) {
        self.lock().sender = None;
    }

    /// Number of deliveries accepted so far
    #[must_use]
    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    fn push(&self, item: Item) -> bool {
        self.lock()
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(item).is_ok())
    }

    fn lock(&self) -> MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("published", &self.published())
            .finish_non_exhaustive()
    }
}

impl Transport for InMemoryTransport {
    fn receive(&self) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let receiver = self.lock().receiver.take().ok_or_else(|| {
                TransportError::ConnectionFailed("in-memory transport is already being received".into())
            })?;

            let stream = async_stream::stream! {
                let mut receiver = receiver;
                while let Some(item) = receiver.recv().await {
                    yield item;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn buffered_deliveries_are_streamed_in_order() {
        let transport = InMemoryTransport::new();
        transport.send(Delivery::new("urn:message:A", Vec::new()));
        transport.send(Delivery::new("urn:message:B", Vec::new()));
        transport.close();

        let mut stream = transport.receive().await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();

        assert_eq!(first.message_type().as_str(), "urn:message:A");
        assert_eq!(second.message_type().as_str(), "urn:message:B");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn second_receive_is_rejected() {
        let transport = InMemoryTransport::new();
        let _stream = transport.receive().await.unwrap();

        let second = transport.receive().await;
        assert!(matches!(second, Err(TransportError::ConnectionFailed(_))));
    }

    #[test]
    fn closed_transport_refuses_deliveries() {
        let transport = InMemoryTransport::new();
        transport.close();

        assert!(!transport.send(Delivery::new("urn:message:A", Vec::new())));
        assert_eq!(transport.published(), 0);
    }
}
