//! Lifecycle contract shared by every managed service.
//!
//! State moves strictly through
//! `Uninitialized -> Initializing -> Ready -> ShuttingDown -> Uninitialized`,
//! with a rollback from `Initializing` to `Uninitialized` when setup fails.
//! The state lives in an atomic byte so any thread can read it without
//! locking; transitions on one service are serialized by an async gate.

use std::{
    fmt,
    future::Future,
    sync::atomic::{AtomicU8, Ordering},
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{container::Resolver, error::ServiceError};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Uninitialized = 0,
    Initializing  = 1,
    Ready         = 2,
    ShuttingDown  = 3,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServiceState::Initializing,
            2 => ServiceState::Ready,
            3 => ServiceState::ShuttingDown,
            _ => ServiceState::Uninitialized,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Uninitialized => "uninitialized",
            ServiceState::Initializing => "initializing",
            ServiceState::Ready => "ready",
            ServiceState::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// A service owned by the [`ServiceContainer`](crate::container::ServiceContainer).
#[async_trait]
pub trait ManagedService: Send + Sync + 'static {
    fn identifier(&self) -> &str;

    fn state(&self) -> ServiceState;

    /// Lock-free readiness check
    fn is_usable(&self) -> bool {
        self.state() == ServiceState::Ready
    }

    /// Resolve dependencies through `resolver` and become ready.
    /// Fails with `InvalidState` unless the service is uninitialized.
    async fn initialize(&self, resolver: &Resolver<'_>) -> Result<(), ServiceError>;

    /// Release owned resources. A no-op unless the service is ready.
    async fn shutdown(&self) -> Result<(), ServiceError>;
}

/// Atomic state plus transition gate, embedded by each service
pub struct Lifecycle {
    identifier: String,
    state:      AtomicU8,
    gate:       Mutex<()>,
}

impl Lifecycle {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            state:      AtomicU8::new(ServiceState::Uninitialized as u8),
            gate:       Mutex::new(()),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ServiceState::Ready
    }

    /// `InvalidState` unless ready
    pub fn ensure_ready(&self) -> Result<(), ServiceError> {
        match self.state() {
            ServiceState::Ready => Ok(()),
            state => Err(ServiceError::InvalidState {
                service: self.identifier.clone(),
                state,
                expected: ServiceState::Ready,
            }),
        }
    }

    fn set(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Run `setup` between `Initializing` and `Ready`.
    ///
    /// A failing or cancelled `setup` leaves the service `Uninitialized`.
    pub async fn initialize_with<F, Fut>(&self, setup: F) -> Result<(), ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ServiceError>>,
    {
        let _gate = self.gate.lock().await;

        let state = self.state();
        if state != ServiceState::Uninitialized {
            return Err(ServiceError::InvalidState {
                service: self.identifier.clone(),
                state,
                expected: ServiceState::Uninitialized,
            });
        }

        self.set(ServiceState::Initializing);
        let mut reset = ResetOnDrop::new(self);

        match setup().await {
            Ok(()) => {
                reset.disarm();
                self.set(ServiceState::Ready);
                tracing::info!(service = %self.identifier, "Service ready");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(service = %self.identifier, "Initialization failed: {}", err);
                Err(err)
            }
        }
    }

    /// Run `teardown` between `ShuttingDown` and `Uninitialized`.
    ///
    /// Outside `Ready` this does nothing. The service ends `Uninitialized`
    /// whether or not `teardown` succeeds; its error is returned.
    pub async fn shutdown_with<F, Fut>(&self, teardown: F) -> Result<(), ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ServiceError>>,
    {
        let _gate = self.gate.lock().await;

        if self.state() != ServiceState::Ready {
            return Ok(());
        }

        self.set(ServiceState::ShuttingDown);
        let _reset = ResetOnDrop::new(self);

        let result = teardown().await;
        match &result {
            Ok(()) => tracing::info!(service = %self.identifier, "Service shut down"),
            Err(err) => {
                tracing::warn!(service = %self.identifier, "Shutdown finished with error: {}", err)
            }
        }
        result
    }
}

// Returns the service to `Uninitialized` unless disarmed, including when the
// transition future is dropped mid-way.
struct ResetOnDrop<'a> {
    lifecycle: &'a Lifecycle,
    armed:     bool,
}

impl<'a> ResetOnDrop<'a> {
    fn new(lifecycle: &'a Lifecycle) -> Self {
        Self {
            lifecycle,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lifecycle.set(ServiceState::Uninitialized);
        }
    }
}
