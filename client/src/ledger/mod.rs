//! Security-scoped resource access ledger.
//!
//! Tracks which paths currently hold an access grant and which have a
//! persisted bookmark. Every successful `start_accessing` is matched by
//! exactly one release: explicitly through `stop_accessing`, through the
//! drop of a [`ScopedAccess`] guard, or through `stop_accessing_all` when
//! the ledger shuts down.

mod provider;
mod store;

use std::{
    collections::{HashMap, HashSet},
    ffi::OsString,
    future::Future,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
    sync::Arc,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;

pub use provider::{BookmarkToken, FileSystemProvider, ResolvedBookmark, ScopedResourceProvider};
pub use store::{BlobStore, FileBlobStore, MemoryBlobStore};

use crate::{
    container::Resolver,
    error::{LedgerError, ServiceError},
    lifecycle::{Lifecycle, ManagedService, ServiceState},
};

const BOOKMARK_PREFIX: &str = "bookmark:";

// Hex of the raw path bytes, so distinct non UTF-8 paths keep distinct keys
fn bookmark_key(path: &Path) -> String {
    format!("{BOOKMARK_PREFIX}{}", hex::encode(path.as_os_str().as_bytes()))
}

fn path_from_key(key: &str) -> Option<PathBuf> {
    let encoded = key.strip_prefix(BOOKMARK_PREFIX)?;
    let bytes = hex::decode(encoded).ok()?;
    Some(PathBuf::from(OsString::from_vec(bytes)))
}

pub struct AccessLedger {
    lifecycle: Lifecycle,
    provider:  Arc<dyn ScopedResourceProvider>,
    store:     Arc<dyn BlobStore>,
    // Published snapshot of active paths; replaced under `writer`
    active:    ArcSwap<HashSet<PathBuf>>,
    writer:    Mutex<()>,
    bookmarks: Mutex<HashMap<PathBuf, BookmarkToken>>,
}

impl AccessLedger {
    pub fn new(provider: Arc<dyn ScopedResourceProvider>, store: Arc<dyn BlobStore>) -> Self {
        Self {
            lifecycle: Lifecycle::new("access-ledger"),
            provider,
            store,
            active: ArcSwap::from_pointee(HashSet::new()),
            writer: Mutex::new(()),
            bookmarks: Mutex::new(HashMap::new()),
        }
    }

    /// Create (or return the existing) bookmark for `path` and persist it
    pub async fn create_bookmark(&self, path: &Path) -> Result<BookmarkToken, LedgerError> {
        if let Some(token) = self.bookmarks.lock().get(path) {
            return Ok(token.clone());
        }

        let token = self.provider.create_bookmark(path)?;
        self.store
            .put(&bookmark_key(path), token.as_bytes())
            .await?;

        tracing::info!("Created bookmark for {}", path.display());
        Ok(self
            .bookmarks
            .lock()
            .entry(path.to_path_buf())
            .or_insert(token)
            .clone())
    }

    /// Resolve a token to its path. Staleness is reported, never repaired.
    pub fn resolve_bookmark(&self, token: &BookmarkToken) -> Result<ResolvedBookmark, LedgerError> {
        self.provider.resolve_bookmark(token)
    }

    /// Bookmark recorded for `path`, if any
    pub fn bookmark(&self, path: &Path) -> Result<BookmarkToken, LedgerError> {
        self.bookmarks
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| LedgerError::BookmarkNotFound(path.to_path_buf()))
    }

    /// Forget the bookmark for `path` and its persisted copy
    pub async fn remove_bookmark(&self, path: &Path) -> Result<(), LedgerError> {
        self.bookmarks.lock().remove(path);
        self.store.remove(&bookmark_key(path)).await
    }

    /// Begin access to `path`.
    ///
    /// Returns `Ok(false)` without asking the provider when the path is
    /// already active, and `Ok(true)` when this call acquired it.
    pub fn start_accessing(&self, path: &Path) -> Result<bool, LedgerError> {
        let _writer = self.writer.lock();

        if self.active.load().contains(path) {
            return Ok(false);
        }

        self.provider.start_accessing(path).map_err(|err| {
            tracing::warn!("Access to {} refused: {}", path.display(), err);
            err
        })?;

        let mut next = HashSet::clone(&self.active.load());
        next.insert(path.to_path_buf());
        self.active.store(Arc::new(next));

        tracing::debug!("Started accessing {}", path.display());
        Ok(true)
    }

    /// Release `path` if active; otherwise nothing happens
    pub fn stop_accessing(&self, path: &Path) {
        let _writer = self.writer.lock();

        if !self.active.load().contains(path) {
            return;
        }

        self.provider.stop_accessing(path);
        let mut next = HashSet::clone(&self.active.load());
        next.remove(path);
        self.active.store(Arc::new(next));

        tracing::debug!("Stopped accessing {}", path.display());
    }

    /// Release every active path
    pub fn stop_accessing_all(&self) {
        let _writer = self.writer.lock();

        let active = self.active.swap(Arc::new(HashSet::new()));
        for path in active.iter() {
            self.provider.stop_accessing(path);
        }
        if !active.is_empty() {
            tracing::info!("Released {} active path(s)", active.len());
        }
    }

    /// Wait-free membership check
    pub fn is_accessing(&self, path: &Path) -> bool {
        self.active.load().contains(path)
    }

    pub fn active_paths(&self) -> Vec<PathBuf> {
        self.active.load().iter().cloned().collect()
    }

    /// Acquire `path` for the lifetime of the returned guard
    pub fn scoped(&self, path: &Path) -> Result<ScopedAccess<'_>, LedgerError> {
        let acquired = self.start_accessing(path)?;
        Ok(ScopedAccess {
            ledger: self,
            path: path.to_path_buf(),
            acquired,
        })
    }

    /// Run `body` while holding access to `path`.
    ///
    /// `body` is not called if access cannot be acquired. Access taken here
    /// is released however `body` ends, including when this future is
    /// dropped; a path that was already active stays active.
    pub async fn with_scoped_access<T, E, F, Fut>(&self, path: &Path, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LedgerError>,
    {
        let _scope = self.scoped(path)?;
        body().await
    }

    async fn restore_bookmarks(&self) -> Result<(), LedgerError> {
        let mut restored = HashMap::new();

        for key in self.store.keys().await? {
            if !key.starts_with(BOOKMARK_PREFIX) {
                continue;
            }
            let Some(recorded) = path_from_key(&key) else {
                tracing::warn!("Skipping malformed bookmark key {}", key);
                continue;
            };
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            let token = BookmarkToken::from_bytes(bytes);

            match self.provider.resolve_bookmark(&token) {
                Ok(resolved) => {
                    if resolved.is_stale {
                        tracing::warn!("Bookmark for {} is stale", recorded.display());
                    }
                    restored.insert(recorded, token);
                }
                Err(e) => tracing::warn!("Skipping bookmark for {}: {}", recorded.display(), e),
            }
        }

        tracing::info!("Restored {} bookmark(s)", restored.len());
        *self.bookmarks.lock() = restored;
        Ok(())
    }
}

#[async_trait]
impl ManagedService for AccessLedger {
    fn identifier(&self) -> &str {
        self.lifecycle.identifier()
    }

    fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    async fn initialize(&self, _resolver: &Resolver<'_>) -> Result<(), ServiceError> {
        self.lifecycle
            .initialize_with(|| async { Ok(self.restore_bookmarks().await?) })
            .await
    }

    async fn shutdown(&self) -> Result<(), ServiceError> {
        self.lifecycle
            .shutdown_with(|| async {
                self.stop_accessing_all();
                self.bookmarks.lock().clear();
                Ok(())
            })
            .await
    }
}

/// Access held on behalf of a scope; released on drop if this scope took it
pub struct ScopedAccess<'a> {
    ledger:   &'a AccessLedger,
    path:     PathBuf,
    acquired: bool,
}

impl ScopedAccess<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this scope started the access (false if it was already active)
    pub fn acquired(&self) -> bool {
        self.acquired
    }
}

impl Drop for ScopedAccess<'_> {
    fn drop(&mut self) {
        if self.acquired {
            self.ledger.stop_accessing(&self.path);
        }
    }
}
