//! Per-message consume context.

use crate::message::{Envelope, MessageId, MessageType};
use crate::payload::{PayloadBag, PayloadError};
use crate::scope::ResourceScope;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Envelope of one message being consumed.
///
/// The message and its metadata are immutable. The [`PayloadBag`] is the only
/// mutable part and lives exactly as long as the context, which the pipeline
/// drops right before the message's scope is closed.
pub struct ConsumeContext {
    envelope: Envelope,
    message: Box<dyn Any + Send + Sync>,
    payload: PayloadBag,
}

impl ConsumeContext {
    /// Build a context around a decoded message
    #[must_use]
    pub fn new(envelope: Envelope, message: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            envelope,
            message,
            payload: PayloadBag::new(),
        }
    }

    /// The message, if it is of type `M`
    #[must_use]
    pub fn message<M: 'static>(&self) -> Option<&M> {
        self.message.downcast_ref::<M>()
    }

    /// Message metadata
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
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

    /// When the message was sent
    #[must_use]
    pub const fn sent_at(&self) -> DateTime<Utc> {
        self.envelope.sent_at
    }

    /// A transport header
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.envelope.headers.get(key).map(String::as_str)
    }

    /// All transport headers
    #[must_use]
    pub const fn headers(&self) -> &BTreeMap<String, String> {
        &self.envelope.headers
    }

    /// The context's payload bag
    #[must_use]
    pub const fn payload(&self) -> &PayloadBag {
        &self.payload
    }

    /// The scope this message is being consumed in
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::NotFound`] if the context was not tagged with a scope.
    pub fn scope(&self) -> Result<Arc<ResourceScope>, PayloadError> {
        self.payload.get::<ResourceScope>()
    }
}

impl fmt::Debug for ConsumeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeContext")
            .field("message_id", &self.envelope.message_id)
            .field("message_type", &self.envelope.message_type)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Delivery;
    use crate::registry::ServiceRegistry;
    use crate::scope::ScopeFactory;

    #[derive(Debug, PartialEq)]
    struct Greeting {
        name: String,
    }

    fn context() -> ConsumeContext {
        let (envelope, _) = Delivery::new("urn:message:Greeting", Vec::new())
            .with_header("tenant", "acme")
            .into_parts();
        ConsumeContext::new(envelope, Box::new(Greeting { name: "Joe".into() }))
    }

    #[test]
    fn message_downcasts_only_to_its_own_type() {
        let ctx = context();
        assert_eq!(ctx.message::<Greeting>().map(|g| g.name.as_str()), Some("Joe"));
        assert!(ctx.message::<String>().is_none());
        assert_eq!(ctx.header("tenant"), Some("acme"));
    }

    #[test]
    fn scope_is_read_back_from_the_payload() -> Result<(), PayloadError> {
        let factory = ScopeFactory::new(Arc::new(ServiceRegistry::new()));
        let scope = factory.open();
        let ctx = context();

        assert!(ctx.scope().is_err());
        ctx.payload().set(Arc::clone(&scope))?;
        assert!(Arc::ptr_eq(&ctx.scope()?, &scope));
        Ok(())
    }
}
