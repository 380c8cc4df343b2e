//! Consumption error taxonomy.
//!
//! [`ConsumeError`] is the fault payload handed to
//! [`ConsumeObserver::consume_fault`](crate::observer::ConsumeObserver::consume_fault)
//! and published on the runtime's fault channel. Lifecycle misuse errors live with
//! the bus in `scopebus-runtime`.

use crate::consumer::HandlerError;
use crate::message::MessageType;
use crate::observer::ObserverFailure;
use crate::resolver::ResolutionError;
use std::any::Any;
use thiserror::Error;

/// Boxed error used as the source of user-raised failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why consuming a single message failed.
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// The consumer (or one of its dependencies) could not be resolved from the scope
    #[error("Failed to resolve consumer: {0}")]
    Resolution(#[from] ResolutionError),

    /// The consumer's handler returned an error or panicked
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// A pre-consume observer failed, aborting consumption
    #[error("Consumption aborted: {0}")]
    Observer(#[from] ObserverFailure),

    /// The delivery body could not be decoded into the bound message type
    #[error("Malformed {message_type} message: {source}")]
    Malformed {
        /// Message type the body was decoded as
        message_type: MessageType,
        /// Decoder error
        #[source]
        source: serde_json::Error,
    },
}

impl ConsumeError {
    /// The handler error, when the handler itself failed
    #[must_use]
    pub const fn handler_error(&self) -> Option<&HandlerError> {
        match self {
            Self::Handler(error) => Some(error),
            _ => None,
        }
    }

    /// Short label used for log fields and metric labels
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Resolution(_) => "resolution",
            Self::Handler(_) => "handler",
            Self::Observer(_) => "observer",
            Self::Malformed { .. } => "malformed",
        }
    }
}

/// A panic captured while running user code, turned into an error value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("panicked: {0}")]
pub struct PanicError(pub String);

impl PanicError {
    /// Build from the payload returned by `catch_unwind`
    #[must_use]
    pub fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self(message)
    }
}
