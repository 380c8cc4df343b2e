//! Consumer bindings: message type name → (decoder, consumer type).
//!
//! A binding is the type-erased bridge between a raw [`Delivery`](scopebus_core::Delivery)
//! and a typed [`Consumer<M>`]. It knows how to decode the body into `M` and
//! which consumer type to resolve from the message's scope.

use scopebus_core::{
    ConsumeContext, Consumer, HandlerError, HandlerFuture, Message, MessageType, ResolutionError,
    ResourceScope,
};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Decoded message, as stored in the [`ConsumeContext`].
pub type DecodedMessage = Box<dyn Any + Send + Sync>;

/// Type-erased consumer binding.
pub trait ConsumerBinding: Send + Sync + 'static {
    /// Message type this binding accepts
    fn message_type(&self) -> &MessageType;

    /// Name of the consumer type, for logs
    fn consumer_name(&self) -> &'static str;

    /// Decode a delivery body into the bound message type
    ///
    /// # Errors
    ///
    /// Returns the decoder error when the body is not a valid message.
    fn decode(&self, body: &[u8]) -> Result<DecodedMessage, serde_json::Error>;

    /// Resolve the consumer from the message's scope
    ///
    /// # Errors
    ///
    /// Returns the resolver's error when the consumer or one of its
    /// dependencies cannot be built.
    fn resolve(&self, scope: &ResourceScope) -> Result<Box<dyn ErasedConsumer>, ResolutionError>;
}

/// A resolved consumer that reads its message from the context.
pub trait ErasedConsumer: Send + Sync {
    /// Invoke the consumer with the context's message
    fn consume<'a>(&'a self, context: &'a ConsumeContext) -> HandlerFuture<'a>;
}

/// Binding of message `M` to consumer `C`.
pub struct ConsumerPipe<M, C> {
    message_type: MessageType,
    _marker: PhantomData<fn() -> (M, C)>,
}

impl<M, C> ConsumerPipe<M, C>
where
    M: Message,
    C: Consumer<M>,
{
    /// Bind `C` to `M::MESSAGE_TYPE`
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_type: M::message_type(),
            _marker: PhantomData,
        }
    }
}

impl<M, C> Default for ConsumerPipe<M, C>
where
    M: Message,
    C: Consumer<M>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M, C> ConsumerBinding for ConsumerPipe<M, C>
where
    M: Message,
    C: Consumer<M>,
{
    fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    fn consumer_name(&self) -> &'static str {
        std::any::type_name::<C>()
    }

    fn decode(&self, body: &[u8]) -> Result<DecodedMessage, serde_json::Error> {
        let message: M = serde_json::from_slice(body)?;
        Ok(Box::new(message))
    }

    fn resolve(&self, scope: &ResourceScope) -> Result<Box<dyn ErasedConsumer>, ResolutionError> {
        let consumer = scope.resolve::<C>()?;
        Ok(Box::new(Resolved::<M, C> {
            consumer,
            _message: PhantomData,
        }))
    }
}

impl<M, C> fmt::Debug for ConsumerPipe<M, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerPipe")
            .field("message_type", &self.message_type)
            .field("consumer", &std::any::type_name::<C>())
            .finish()
    }
}

struct Resolved<M, C> {
    consumer: Arc<C>,
    _message: PhantomData<fn() -> M>,
}

impl<M, C> ErasedConsumer for Resolved<M, C>
where
    M: Message,
    C: Consumer<M>,
{
    fn consume<'a>(&'a self, context: &'a ConsumeContext) -> HandlerFuture<'a> {
        match context.message::<M>() {
            Some(message) => self.consumer.consume(context, message),
            None => Box::pin(std::future::ready(Err(HandlerError::msg(format!(
                "context does not carry a {} message",
                M::MESSAGE_TYPE
            ))))),
        }
    }
}

/// Bindings by message type.
#[derive(Clone, Default)]
pub struct BindingTable {
    bindings: HashMap<MessageType, Arc<dyn ConsumerBinding>>,
}

impl BindingTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding, replacing any earlier binding for the same message type
    pub fn insert(&mut self, binding: Arc<dyn ConsumerBinding>) {
        let message_type = binding.message_type().clone();
        if let Some(previous) = self.bindings.insert(message_type.clone(), binding) {
            tracing::warn!(
                %message_type,
                replaced = previous.consumer_name(),
                "Consumer binding replaced"
            );
        }
    }

    /// Binding for a message type
    #[must_use]
    pub fn get(&self, message_type: &MessageType) -> Option<&Arc<dyn ConsumerBinding>> {
        self.bindings.get(message_type)
    }

    /// Number of bindings
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Debug for BindingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.bindings.keys()).finish()
    }
}
