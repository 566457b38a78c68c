//! Umbra application-side library.
//!
//! Services are registered with a [`ServiceContainer`] and resolved on
//! demand; the container initializes dependencies first and shuts everything
//! down in reverse. Cryptographic work goes to the privileged helper through
//! a [`SecurityBridge`], and filesystem grants are tracked by the
//! [`AccessLedger`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use umbra_client::{
//!     AccessLedger, BridgeConfig, CryptoService, FileSystemProvider, MemoryBlobStore,
//!     ProxyConfig, SecurityBridge, SecurityService, ServiceContainer, ServiceError,
//!     SocketProxy,
//! };
//!
//! # async fn run() -> Result<(), ServiceError> {
//! let container = ServiceContainer::new();
//! container.register(|| {
//!     let proxy = SocketProxy::connect(&ProxyConfig::new())
//!         .map_err(|e| ServiceError::Configuration(e.to_string()))?;
//!     Ok(CryptoService::new(SecurityBridge::new(Arc::new(proxy), BridgeConfig::new())))
//! });
//! container.register(|| {
//!     Ok(AccessLedger::new(
//!         Arc::new(FileSystemProvider::new()),
//!         Arc::new(MemoryBlobStore::new()),
//!     ))
//! });
//! container.register(|| Ok(SecurityService::new(Arc::new(MemoryBlobStore::new()))));
//!
//! let security = container.resolve::<SecurityService>().await?;
//! let password = security.load_credential("main", "repository-key").await?;
//! # drop(password);
//! container.shutdown_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod container;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod proxy;
pub mod services;

pub use bridge::{
    BridgeConfig, Completion, ConnectionState, RandomBytes, RandomSource, SecurityBridge,
    SecurityProxy,
};
pub use container::{Resolver, ServiceContainer};
pub use error::{LedgerError, ServiceError};
pub use ledger::{
    AccessLedger, BlobStore, BookmarkToken, FileBlobStore, FileSystemProvider, MemoryBlobStore,
    ResolvedBookmark, ScopedAccess, ScopedResourceProvider,
};
pub use lifecycle::{Lifecycle, ManagedService, ServiceState};
pub use proxy::{ProxyConfig, SocketProxy};
pub use services::{CryptoService, SecurityService};
// Re-export boundary types for convenience
pub use umbra_common::{ErrorKind, SecureBytes, SecurityError};
