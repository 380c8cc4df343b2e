//! Message identity and the raw delivery handed over by a transport.
//!
//! A [`Delivery`] is what a transport produces: a message type name, a JSON body
//! and some metadata. The pipeline decodes the body into the registered message
//! type and keeps the metadata as the immutable part of the
//! [`ConsumeContext`](crate::context::ConsumeContext).
//!
//! # Example
//!
//! ```
//! use scopebus_core::message::{Delivery, Message};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SimpleMessage {
//!     name: String,
//! }
//!
//! impl Message for SimpleMessage {
//!     const MESSAGE_TYPE: &'static str = "urn:message:SimpleMessage";
//! }
//!
//! let delivery = Delivery::json(&SimpleMessage { name: "Joe".into() })?;
//! assert_eq!(delivery.message_type().as_str(), "urn:message:SimpleMessage");
//! # Ok::<(), serde_json::Error>(())
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A message type that can be consumed by the pipeline.
///
/// The message type name is the routing identity: a delivery is matched to a
/// consumer binding by comparing [`Delivery::message_type`] with
/// [`Message::MESSAGE_TYPE`].
pub trait Message: DeserializeOwned + Send + Sync + 'static {
    /// Wire name of the message type (e.g. `"urn:message:OrderPlaced"`)
    const MESSAGE_TYPE: &'static str;

    /// The [`MessageType`] for this message
    #[must_use]
    fn message_type() -> MessageType {
        MessageType::new(Self::MESSAGE_TYPE)
    }
}

/// Message type identity carried by every delivery and context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(String);

impl MessageType {
    /// Create a message type from its wire name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The wire name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Identifier of a single delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap an identifier assigned by the transport
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random (v4 UUID) identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable metadata of a delivered message.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Message identifier
    pub message_id: MessageId,
    /// Message type identity
    pub message_type: MessageType,
    /// When the message was sent
    pub sent_at: DateTime<Utc>,
    /// Transport headers
    pub headers: BTreeMap<String, String>,
}

/// A raw message as delivered by a transport.
#[derive(Debug, Clone)]
pub struct Delivery {
    envelope: Envelope,
    body: Vec<u8>,
}

impl Delivery {
    /// Create a delivery from a message type name and an encoded body
    #[must_use]
    pub fn new(message_type: impl Into<MessageType>, body: Vec<u8>) -> Self {
        Self {
            envelope: Envelope {
                message_id: MessageId::generate(),
                message_type: message_type.into(),
                sent_at: Utc::now(),
                headers: BTreeMap::new(),
            },
            body,
        }
    }

    /// Encode a message as a JSON delivery
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the message cannot be encoded.
    pub fn json<M>(message: &M) -> Result<Self, serde_json::Error>
    where
        M: Message + Serialize,
    {
        Ok(Self::new(M::message_type(), serde_json::to_vec(message)?))
    }

    /// Replace the generated message id with one assigned by the transport
    #[must_use]
    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.envelope.message_id = id;
        self
    }

    /// Attach a header
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envelope.headers.insert(key.into(), value.into());
        self
    }

    /// Set the sent timestamp
    #[must_use]
    pub const fn with_sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.envelope.sent_at = sent_at;
        self
    }

    /// Message identifier
    #[must_use]
    pub const fn message_id(&self) -> &MessageId {
        &self.envelope.message_id
    }

    /// Message type identity
    #[must_use]
    pub const fn message_type(&self) -> &MessageType {
        &self.envelope.message_type
    }

    /// Encoded body
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Split into metadata and body
    #[must_use]
    pub fn into_parts(self) -> (Envelope, Vec<u8>) {
        (self.envelope, self.body)
    }
}
