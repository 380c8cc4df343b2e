//! Type-keyed payload bag attached to every [`ConsumeContext`](crate::context::ConsumeContext).
//!
//! The bag lets cross-cutting state travel with a message without being threaded
//! through every call signature. The pipeline stores the active
//! [`ResourceScope`](crate::scope::ResourceScope) here before any observer or
//! consumer runs, so nested code can keep resolving from the same scope.
//!
//! Keys are Rust types. A key is written at most once: the first value set for a
//! type stays visible for the rest of the context's life.
//!
//! ```
//! use scopebus_core::payload::{PayloadBag, PayloadError};
//! use std::sync::Arc;
//!
//! struct TenantId(&'static str);
//!
//! let bag = PayloadBag::new();
//! bag.set(Arc::new(TenantId("acme")))?;
//!
//! assert_eq!(bag.get::<TenantId>()?.0, "acme");
//! assert!(matches!(bag.set(Arc::new(TenantId("other"))), Err(PayloadError::AlreadySet { .. })));
//! # Ok::<(), PayloadError>(())
//! ```

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Errors returned by [`PayloadBag`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// No value has been set for the requested type
    #[error("No payload of type {type_name}")]
    NotFound {
        /// Name of the requested type
        type_name: &'static str,
    },

    /// A value for this type is already present
    #[error("Payload of type {type_name} is already set")]
    AlreadySet {
        /// Name of the type
        type_name: &'static str,
    },
}

type Entry = Arc<dyn Any + Send + Sync>;

/// Mapping from capability type to instance, scoped to one message.
#[derive(Default)]
pub struct PayloadBag {
    entries: RwLock<HashMap<TypeId, Entry>>,
}

impl PayloadBag {
    /// Create an empty bag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a value under its type
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::AlreadySet`] if a value of type `T` is present.
    pub fn set<T>(&self, value: Arc<T>) -> Result<(), PayloadError>
    where
        T: Send + Sync + 'static,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&TypeId::of::<T>()) {
            return Err(PayloadError::AlreadySet {
                type_name: type_name::<T>(),
            });
        }
        entries.insert(TypeId::of::<T>(), value);
        Ok(())
    }

    /// Read the value stored for `T`
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::NotFound`] if nothing was set for `T`.
    pub fn get<T>(&self) -> Result<Arc<T>, PayloadError>
    where
        T: Send + Sync + 'static,
    {
        self.try_get::<T>().ok_or(PayloadError::NotFound {
            type_name: type_name::<T>(),
        })
    }

    /// Read the value stored for `T`, if any
    #[must_use]
    pub fn try_get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| Arc::clone(entry).downcast::<T>().ok())
    }

    /// Return the value for `T`, creating it with `create` when absent
    pub fn get_or_insert_with<T, F>(&self, create: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.try_get::<T>() {
            return existing;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // Another writer may have won the race between the read and write locks.
        if let Some(existing) = entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| Arc::clone(entry).downcast::<T>().ok())
        {
            return existing;
        }

        let value = Arc::new(create());
        entries.insert(TypeId::of::<T>(), Arc::clone(&value) as Entry);
        value
    }

    /// Whether a value for `T` is present
    #[must_use]
    pub fn contains<T: 'static>(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<T>())
    }

    /// Number of stored values
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the bag is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PayloadBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadBag")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
