use std::{
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Opaque, persistable grant for a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkToken(Vec<u8>);

impl BookmarkToken {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Outcome of resolving a bookmark. A stale bookmark still names a path but
/// the resource behind it has changed since the bookmark was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBookmark {
    pub path:     PathBuf,
    pub is_stale: bool,
}

/// Host facility that grants scoped access to resources
pub trait ScopedResourceProvider: Send + Sync {
    fn create_bookmark(&self, path: &Path) -> Result<BookmarkToken, LedgerError>;

    fn resolve_bookmark(&self, token: &BookmarkToken) -> Result<ResolvedBookmark, LedgerError>;

    /// Begin access; `AuthorizationDenied` when refused
    fn start_accessing(&self, path: &Path) -> Result<(), LedgerError>;

    fn stop_accessing(&self, path: &Path);
}

#[derive(Serialize, Deserialize)]
struct TokenBody {
    // Path as the caller named it; this is what resolution hands back
    requested: PathBuf,
    canonical: PathBuf,
    dev:       u64,
    inode:     u64,
}

/// Plain filesystem provider.
///
/// Tokens record the path as given, its canonical form and the file's
/// device/inode identity. Resolution checks the canonical path and reports
/// the bookmark stale when a different file now lives there.
/// Access is granted to existing paths, optionally limited to a set of
/// allowed roots.
#[derive(Debug, Clone, Default)]
pub struct FileSystemProvider {
    allowed_roots: Vec<PathBuf>,
}

impl FileSystemProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only grant access beneath `root` (and any other added roots)
    pub fn with_allowed_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = fs::canonicalize(&root).unwrap_or(root);
        self.allowed_roots.push(root);
        self
    }

    fn permitted(&self, canonical: &Path) -> bool {
        self.allowed_roots.is_empty() || self.allowed_roots.iter().any(|root| canonical.starts_with(root))
    }
}

impl ScopedResourceProvider for FileSystemProvider {
    fn create_bookmark(&self, path: &Path) -> Result<BookmarkToken, LedgerError> {
        let creation_error = |reason: String| LedgerError::BookmarkCreation {
            path: path.to_path_buf(),
            reason,
        };

        let canonical = fs::canonicalize(path).map_err(|e| creation_error(e.to_string()))?;
        if !self.permitted(&canonical) {
            return Err(creation_error("outside the allowed roots".into()));
        }
        let metadata = fs::metadata(&canonical).map_err(|e| creation_error(e.to_string()))?;

        let body = TokenBody {
            requested: path.to_path_buf(),
            canonical,
            dev: metadata.dev(),
            inode: metadata.ino(),
        };
        let bytes = bincode::serialize(&body).map_err(|e| creation_error(e.to_string()))?;
        Ok(BookmarkToken(bytes))
    }

    fn resolve_bookmark(&self, token: &BookmarkToken) -> Result<ResolvedBookmark, LedgerError> {
        let body: TokenBody = bincode::deserialize(&token.0)
            .map_err(|e| LedgerError::BookmarkResolution(format!("malformed token: {e}")))?;

        let metadata = fs::metadata(&body.canonical).map_err(|e| {
            LedgerError::BookmarkResolution(format!("{}: {}", body.canonical.display(), e))
        })?;
        let is_stale = metadata.dev() != body.dev || metadata.ino() != body.inode;
        if is_stale {
            tracing::debug!("Bookmark for {} is stale", body.requested.display());
        }

        Ok(ResolvedBookmark {
            path: body.requested,
            is_stale,
        })
    }

    fn start_accessing(&self, path: &Path) -> Result<(), LedgerError> {
        let denied = |reason: String| LedgerError::AuthorizationDenied {
            path: path.to_path_buf(),
            reason,
        };

        let canonical = fs::canonicalize(path).map_err(|e| denied(e.to_string()))?;
        if !self.permitted(&canonical) {
            return Err(denied("outside the allowed roots".into()));
        }
        Ok(())
    }

    fn stop_accessing(&self, path: &Path) {
        tracing::trace!("Released {}", path.display());
    }
}
