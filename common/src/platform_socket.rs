use std::{
    os::unix::{
        fs::{FileTypeExt, PermissionsExt},
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials as SoPeerCred};

/// Read/write timeout applied to every accepted or connected socket
pub const SOCKET_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials of the process on the other end of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Process ID of the peer
    pub pid: u32,
    /// User ID of the peer
    pub uid: u32,
}

/// Extract the peer's credentials from a connected Unix socket
pub fn peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let creds = getsockopt(stream, SoPeerCred).context("Failed to get peer credentials")?;
        Ok(PeerCredentials {
            pid: creds.pid() as u32,
            uid: creds.uid(),
        })
    }

    #[cfg(target_os = "macos")]
    {
        use std::os::unix::io::AsRawFd;

        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;

        // SAFETY: getpeereid only writes to the two stack variables and the fd
        // comes from a live UnixStream.
        let result = unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) };
        if result != 0 {
            return Err(anyhow!(
                "Failed to get peer UID on macOS: {}",
                std::io::Error::last_os_error()
            ));
        }

        let mut pid: libc::pid_t = 0;
        let mut pid_len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;

        // SAFETY: valid fd, LOCAL_PEERPID writes a pid_t into `pid` and
        // `pid_len` matches its size.
        let result = unsafe {
            libc::getsockopt(
                stream.as_raw_fd(),
                libc::SOL_LOCAL,
                libc::LOCAL_PEERPID,
                &mut pid as *mut _ as *mut libc::c_void,
                &mut pid_len,
            )
        };
        if result != 0 {
            return Err(anyhow!(
                "Failed to get peer PID on macOS: {}",
                std::io::Error::last_os_error()
            ));
        }

        tracing::debug!("macOS peer credentials: PID={}, UID={}", pid, uid);
        Ok(PeerCredentials {
            pid: pid as u32,
            uid,
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    {
        let _ = stream;
        Err(anyhow!(
            "Peer credentials extraction not supported on this platform. Supported platforms: \
             Linux (SO_PEERCRED), macOS (getpeereid/LOCAL_PEERPID)."
        ))
    }
}

fn configure_blocking(stream: &UnixStream) -> Result<()> {
    stream
        .set_nonblocking(false)
        .context("Failed to set socket to blocking mode")?;
    stream
        .set_read_timeout(Some(SOCKET_IO_TIMEOUT))
        .context("Failed to set read timeout")?;
    stream
        .set_write_timeout(Some(SOCKET_IO_TIMEOUT))
        .context("Failed to set write timeout")?;
    Ok(())
}

/// Listening side of the helper socket
pub struct HelperListener {
    listener: UnixListener,
    path:     PathBuf,
}

impl HelperListener {
    /// Bind the helper socket at `path`.
    ///
    /// A leftover socket file from a previous run is removed first. The new
    /// socket is restricted to its owner, and when the helper runs under sudo
    /// ownership is handed back to the invoking user.
    pub fn bind(path: &Path) -> Result<Self> {
        tracing::info!("Setting up helper socket at {}", path.display());

        if path.exists() {
            tracing::warn!("Existing socket file found, removing it...");
            std::fs::remove_file(path).map_err(|e| {
                anyhow!(
                    "Could not remove existing socket file '{}': {}. Another helper may still be \
                     running.",
                    path.display(),
                    e
                )
            })?;
        }

        if let Some(parent) = path.parent() {
            let metadata = std::fs::metadata(parent).with_context(|| {
                format!("Cannot access parent directory '{}'", parent.display())
            })?;
            if !metadata.is_dir() {
                return Err(anyhow!(
                    "Parent path '{}' exists but is not a directory",
                    parent.display()
                ));
            }
        }

        let listener = UnixListener::bind(path).map_err(|e| {
            tracing::error!("Failed to bind to socket: {} (kind: {:?})", e, e.kind());
            match e.kind() {
                std::io::ErrorKind::PermissionDenied => anyhow!(
                    "Permission denied creating socket '{}'. Check permissions of the socket \
                     directory.",
                    path.display()
                ),
                std::io::ErrorKind::AddrInUse | std::io::ErrorKind::AlreadyExists => anyhow!(
                    "Socket '{}' is already in use. Another helper instance may be running.",
                    path.display()
                ),
                _ => anyhow!("Failed to bind socket '{}': {}", path.display(), e),
            }
        })?;

        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            tracing::warn!("Failed to set socket permissions: {}", e);
        }

        hand_back_to_sudo_user(path);

        tracing::info!("Helper socket ready at {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Switch accept between blocking and non-blocking
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener
            .set_nonblocking(nonblocking)
            .context("Failed to change listener blocking mode")
    }

    /// Accept one connection, configured for blocking I/O with timeouts
    pub fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _) = self.listener.accept()?;
        configure_blocking(&stream).map_err(std::io::Error::other)?;
        Ok(stream)
    }

    /// Path the listener is bound to
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HelperListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connect to the helper socket at `path`
pub fn connect_socket(path: &Path) -> Result<UnixStream> {
    tracing::debug!("Attempting to connect to helper socket: {}", path.display());

    let metadata = std::fs::metadata(path).map_err(|e| {
        anyhow!(
            "Socket file '{}' does not exist. The helper is not running or is bound elsewhere: {}",
            path.display(),
            e
        )
    })?;
    if !metadata.file_type().is_socket() {
        tracing::warn!("File exists but is not a socket: {}", path.display());
    }

    let stream = UnixStream::connect(path)
        .with_context(|| format!("Failed to connect to helper socket '{}'", path.display()))?;
    configure_blocking(&stream)?;

    tracing::debug!("Connected to helper socket");
    Ok(stream)
}

// Best effort: a helper started with sudo should leave a socket the invoking
// user can connect to.
fn hand_back_to_sudo_user(path: &Path) {
    // SAFETY: geteuid has no preconditions
    if unsafe { libc::geteuid() } != 0 {
        return;
    }
    let Ok(sudo_user) = std::env::var("SUDO_USER") else {
        tracing::info!("Running as root but SUDO_USER not set, keeping root ownership");
        return;
    };

    match nix::unistd::User::from_name(&sudo_user) {
        Ok(Some(user)) => match nix::unistd::chown(path, Some(user.uid), Some(user.gid)) {
            Ok(()) => tracing::info!("Socket ownership changed to {}", sudo_user),
            Err(e) => tracing::warn!("Failed to change socket ownership: {}", e),
        },
        Ok(None) => tracing::warn!("Sudo user '{}' not found", sudo_user),
        Err(e) => tracing::warn!("Failed to look up sudo user '{}': {}", sudo_user, e),
    }
}

/// Look up a user's UID by name
pub fn user_uid(username: &str) -> Result<u32> {
    nix::unistd::User::from_name(username)
        .with_context(|| format!("Failed to look up user '{username}'"))?
        .map(|user| user.uid.as_raw())
        .ok_or_else(|| anyhow!("User '{}' not found", username))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_credentials_of_socket_pair_are_ours() {
        let (a, _b) = UnixStream::pair().unwrap();
        let creds = peer_credentials(&a).unwrap();

        // SAFETY: getuid has no preconditions
        let uid = unsafe { libc::getuid() };
        assert_eq!(creds.uid, uid);
        assert_eq!(creds.pid, std::process::id());
    }

    #[test]
    fn test_bind_connect_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper.sock");

        let listener = HelperListener::bind(&path).unwrap();
        let _client = connect_socket(&path).unwrap();
        let accepted = listener.accept().unwrap();
        assert!(peer_credentials(&accepted).is_ok());

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect_socket(&dir.path().join("absent.sock")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
