//! Resource scopes: one isolated resolution boundary per message.
//!
//! A [`ResourceScope`] owns every instance resolved within it. Closing the scope
//! runs the release hook of each tracked instance in reverse creation order and
//! aggregates failures into a single [`ScopeDisposalError`]. A scope is closed
//! exactly once; resolving from a closed scope fails with [`ScopeClosed`].
//!
//! Scopes are opened and closed through a [`ScopeFactory`], which also counts the
//! scopes still open so leaks are observable.
//!
//! ```
//! use scopebus_core::registry::ServiceRegistry;
//! use scopebus_core::scope::ScopeFactory;
//! use std::sync::Arc;
//!
//! struct Clock;
//!
//! # tokio_test::block_on(async {
//! let mut registry = ServiceRegistry::new();
//! registry.add_scoped(|_| Ok(Clock));
//!
//! let factory = ScopeFactory::new(Arc::new(registry));
//! let scope = factory.open();
//!
//! let first = scope.resolve::<Clock>()?;
//! let second = scope.resolve::<Clock>()?;
//! assert!(Arc::ptr_eq(&first, &second));
//!
//! factory.close(&scope).await?;
//! assert!(scope.resolve::<Clock>().is_err());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

use crate::error::{BoxError, PanicError};
use crate::resolver::{Instance, Provided, ResolutionError, Resolver, TypeKey};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Boxed future returned by dyn-compatible async hooks.
pub type DisposeFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Release hook for instances owned by a scope.
///
/// # Example
///
/// ```
/// use scopebus_core::error::BoxError;
/// use scopebus_core::scope::{AsyncDispose, DisposeFuture};
///
/// struct Connection;
///
/// impl AsyncDispose for Connection {
///     fn dispose(&self) -> DisposeFuture<'_, Result<(), BoxError>> {
///         Box::pin(async {
///             // flush, close sockets...
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait AsyncDispose: Send + Sync + 'static {
    /// Release the resources held by this instance
    ///
    /// # Errors
    ///
    /// A failure is collected into the owning scope's [`ScopeDisposalError`];
    /// the remaining instances are still released.
    fn dispose(&self) -> DisposeFuture<'_, Result<(), BoxError>>;
}

/// Identifier of a scope, unique per [`ScopeFactory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    /// The root scope (process-wide singletons)
    pub const ROOT: Self = Self(0);

    /// Numeric value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ROOT {
            f.write_str("scope-root")
        } else {
            write!(f, "scope-{}", self.0)
        }
    }
}

/// The scope has already been closed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Scope {scope_id} is closed")]
pub struct ScopeClosed {
    /// The closed scope
    pub scope_id: ScopeId,
}

/// One release hook that failed.
#[derive(Error, Debug)]
#[error("Failed to dispose {type_name}: {source}")]
pub struct DisposalFailure {
    /// Type of the instance whose hook failed
    pub type_name: &'static str,
    /// Hook error (or captured panic)
    #[source]
    pub source: BoxError,
}

/// Aggregated release failures of one scope.
#[derive(Error, Debug)]
#[error("{} disposal(s) failed while closing {scope_id}", failures.len())]
pub struct ScopeDisposalError {
    /// Scope being closed
    pub scope_id: ScopeId,
    /// Every failed hook, in the order the hooks ran
    pub failures: Vec<DisposalFailure>,
}

/// Errors returned by [`ScopeFactory::close`].
#[derive(Error, Debug)]
pub enum ScopeCloseError {
    /// Close was called a second time
    #[error(transparent)]
    AlreadyClosed(#[from] ScopeClosed),

    /// The scope was closed but some release hooks failed
    #[error(transparent)]
    Disposal(#[from] ScopeDisposalError),
}

/// A release hook registered with its instance's type name.
pub(crate) struct Tracked {
    pub(crate) type_name: &'static str,
    pub(crate) disposer: Arc<dyn AsyncDispose>,
}

/// Run release hooks last-created first, collecting every failure.
pub(crate) async fn dispose_in_reverse(
    scope_id: ScopeId,
    tracked: Vec<Tracked>,
) -> Result<(), ScopeDisposalError> {
    let mut failures = Vec::new();

    for entry in tracked.into_iter().rev() {
        let disposer = Arc::clone(&entry.disposer);
        let outcome = AssertUnwindSafe(async move { disposer.dispose().await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                tracing::trace!(%scope_id, type_name = entry.type_name, "Disposed instance");
            },
            Ok(Err(source)) => {
                tracing::warn!(%scope_id, type_name = entry.type_name, error = %source, "Dispose hook failed");
                failures.push(DisposalFailure { type_name: entry.type_name, source });
            },
            Err(payload) => {
                let panic = PanicError::from_payload(payload.as_ref());
                tracing::error!(%scope_id, type_name = entry.type_name, error = %panic, "Dispose hook panicked");
                failures.push(DisposalFailure {
                    type_name: entry.type_name,
                    source: Box::new(panic),
                });
            },
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ScopeDisposalError { scope_id, failures })
    }
}

#[derive(Default)]
struct ScopeState {
    closed: bool,
    scoped: HashMap<TypeKey, Instance>,
    tracked: Vec<Tracked>,
    resolving: Vec<TypeKey>,
}

/// Isolated resolution boundary owning every instance created within it.
///
/// Obtained from [`ScopeFactory::open`]; the pipeline keeps it in the message's
/// [`PayloadBag`](crate::payload::PayloadBag) as `Arc<ResourceScope>`.
pub struct ResourceScope {
    id: ScopeId,
    resolver: Arc<dyn Resolver>,
    state: Mutex<ScopeState>,
    open_scopes: Arc<AtomicUsize>,
}

impl ResourceScope {
    /// Scope identifier
    #[must_use]
    pub const fn id(&self) -> ScopeId {
        self.id
    }

    /// The root resolver this scope resolves through
    #[must_use]
    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    /// Whether the scope has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of release hooks registered so far
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.lock().tracked.len()
    }

    /// Resolve an instance of `T`
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::ScopeClosed`] after close, or whatever the
    /// resolver reports for `T`.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolutionError> {
        let key = TypeKey::of::<T>();
        self.resolve_key(&key)?
            .downcast::<T>()
            .map_err(|_| ResolutionError::TypeMismatch { type_name: key.name() })
    }

    /// Resolve a type-erased instance for `key`
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::ScopeClosed`] after close and
    /// [`ResolutionError::Circular`] if `key` is already being resolved in this scope.
    pub fn resolve_key(&self, key: &TypeKey) -> Result<Instance, ResolutionError> {
        let _guard = self.enter(key)?;
        self.resolver.resolve(self, key)
    }

    /// Return the scope-local singleton for `key`, building it with `create` on first use
    ///
    /// For resolver implementations. `create` runs without the scope lock held, so
    /// it may resolve further dependencies from this scope.
    ///
    /// # Errors
    ///
    /// Propagates `create`'s error; returns [`ResolutionError::ScopeClosed`] if the
    /// scope closed while the instance was being built.
    pub fn scoped_instance<F>(&self, key: &TypeKey, create: F) -> Result<Instance, ResolutionError>
    where
        F: FnOnce() -> Result<Provided, ResolutionError>,
    {
        if let Some(existing) = self.lock().scoped.get(key) {
            return Ok(Arc::clone(existing));
        }

        let provided = create()?;

        let mut state = self.lock();
        if state.closed {
            tracing::warn!(
                scope_id = %self.id,
                type_name = provided.type_name,
                "Instance built after its scope closed was dropped without disposal"
            );
            return Err(ScopeClosed { scope_id: self.id }.into());
        }

        Self::push_tracked(&mut state, &provided);
        let instance = state
            .scoped
            .entry(*key)
            .or_insert_with(|| Arc::clone(&provided.instance));
        Ok(Arc::clone(instance))
    }

    /// Register a per-resolution instance so its release hook runs when the scope closes
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::ScopeClosed`] if the scope is already closed.
    pub fn track(&self, provided: Provided) -> Result<Instance, ResolutionError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ScopeClosed { scope_id: self.id }.into());
        }
        Self::push_tracked(&mut state, &provided);
        Ok(provided.instance)
    }

    fn push_tracked(state: &mut ScopeState, provided: &Provided) {
        if let Some(disposer) = &provided.disposer {
            state.tracked.push(Tracked {
                type_name: provided.type_name,
                disposer: Arc::clone(disposer),
            });
        }
    }

    fn enter(&self, key: &TypeKey) -> Result<ResolvingGuard<'_>, ResolutionError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ScopeClosed { scope_id: self.id }.into());
        }
        if state.resolving.contains(key) {
            let mut chain: Vec<&'static str> = state.resolving.iter().map(TypeKey::name).collect();
            chain.push(key.name());
            return Err(ResolutionError::Circular { chain });
        }
        state.resolving.push(*key);
        Ok(ResolvingGuard { scope: self, key: *key })
    }

    async fn close(&self) -> Result<(), ScopeCloseError> {
        let (tracked, scoped) = {
            let mut state = self.lock();
            if state.closed {
                return Err(ScopeClosed { scope_id: self.id }.into());
            }
            state.closed = true;
            (std::mem::take(&mut state.tracked), std::mem::take(&mut state.scoped))
        };
        self.open_scopes.fetch_sub(1, Ordering::AcqRel);

        tracing::debug!(scope_id = %self.id, disposables = tracked.len(), "Closing scope");
        let result = dispose_in_reverse(self.id, tracked).await;
        drop(scoped);
        result.map_err(ScopeCloseError::from)
    }

    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ResourceScope")
            .field("id", &self.id)
            .field("closed", &state.closed)
            .field("scoped", &state.scoped.len())
            .field("tracked", &state.tracked.len())
            .finish_non_exhaustive()
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.closed {
            tracing::warn!(
                scope_id = %self.id,
                undisposed = state.tracked.len(),
                "Resource scope dropped without being closed"
            );
            self.open_scopes.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Pops the key off the resolution chain even if the resolver panics.
struct ResolvingGuard<'a> {
    scope: &'a ResourceScope,
    key: TypeKey,
}

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.scope.lock();
        if let Some(pos) = state.resolving.iter().rposition(|k| *k == self.key) {
            state.resolving.remove(pos);
        }
    }
}

/// Opens and closes per-message scopes over a shared root resolver.
pub struct ScopeFactory {
    root: Arc<dyn Resolver>,
    next_id: AtomicU64,
    open_scopes: Arc<AtomicUsize>,
}

impl ScopeFactory {
    /// Create a factory over the shared root resolver
    #[must_use]
    pub fn new(root: Arc<dyn Resolver>) -> Self {
        Self {
            root,
            next_id: AtomicU64::new(1),
            open_scopes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Open a fresh child scope
    #[must_use]
    pub fn open(&self) -> Arc<ResourceScope> {
        let id = ScopeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.open_scopes.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(scope_id = %id, "Opened scope");

        Arc::new(ResourceScope {
            id,
            resolver: Arc::clone(&self.root),
            state: Mutex::new(ScopeState::default()),
            open_scopes: Arc::clone(&self.open_scopes),
        })
    }

    /// Close a scope, releasing its instances in reverse creation order
    ///
    /// # Errors
    ///
    /// Returns [`ScopeCloseError::AlreadyClosed`] on a second call and
    /// [`ScopeCloseError::Disposal`] when any release hook failed. In the latter case
    /// the scope is still closed and every other hook has run.
    pub async fn close(&self, scope: &ResourceScope) -> Result<(), ScopeCloseError> {
        scope.close().await
    }

    /// The shared root resolver
    #[must_use]
    pub const fn root(&self) -> &Arc<dyn Resolver> {
        &self.root
    }

    /// Number of scopes opened and not yet closed (or dropped)
    #[must_use]
    pub fn open_scopes(&self) -> usize {
        self.open_scopes.load(Ordering::Acquire)
    }

    /// Release the root resolver's singletons
    ///
    /// # Errors
    ///
    /// Returns the aggregated release failures of the root.
    pub async fn release_root(&self) -> Result<(), ScopeDisposalError> {
        self.root.release().await
    }
}

impl fmt::Debug for ScopeFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeFactory")
            .field("open_scopes", &self.open_scopes())
            .finish_non_exhaustive()
    }
}
