//! # Scopebus Testing
//!
//! Testing utilities for the scoped consumption pipeline.
//!
//! This crate provides:
//! - [`InMemoryTransport`]: an mpsc-backed [`Transport`](scopebus_core::Transport)
//! - [`RecordingObserver`] and [`EventJournal`]: ordered observer notifications
//! - [`DisposalProbe`] and [`TrackedDependency`]: a disposable dependency whose
//!   creation, use and release are counted
//! - [`init_tracing`]: log output for failing tests
//!
//! Observer and probe events share one process-wide timeline
//! ([`next_sequence`]), so a test can assert that a release hook ran after a
//! given observer notification.
//!
//! ## Example
//!
//! ```ignore
//! use scopebus_testing::{DisposalProbe, InMemoryTransport, RecordingObserver};
//!
//! #[tokio::test]
//! async fn consumes_one_message() -> anyhow::Result<()> {
//!     let probe = DisposalProbe::new();
//!     let transport = InMemoryTransport::new();
//!     let observer = Arc::new(RecordingObserver::new("observer"));
//!
//!     let bus = build_bus(&probe, transport.clone());
//!     bus.connect_observer(observer.clone())?;
//!     let handle = bus.start().await?;
//!
//!     transport.publish(&SimpleMessage { name: "Joe".into() })?;
//!     transport.close();
//!     handle.stop(None).await?;
//!
//!     assert_eq!(probe.disposed(), 1);
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

pub mod observer;
pub mod probe;
pub mod transport;

pub use observer::{EventJournal, ObservedEvent, RecordingObserver};
pub use probe::{DisposalProbe, ProbeAction, ProbeDisposalError, ProbeEvent, TrackedDependency};
pub use transport::{InMemoryTransport, PublishError};

static SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Next position in the process-wide test timeline.
#[must_use]
pub fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// Install a test-friendly tracing subscriber.
///
/// Honours `RUST_LOG` (default: debug for the scopebus crates). Safe to call from every test;
/// only the first call installs the subscriber.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scopebus_core=debug,scopebus_runtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer().with_target(false))
        .try_init();
}
