use std::{
    env, fs,
    io::{BufReader, Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use rustls::{server::WebPkiClientVerifier, RootCertStore, ServerConfig, ServerConnection};
use rustls_pemfile::{certs, private_key};
use sha2::{Digest, Sha256};
use umbra_common::{
    frame::is_disconnect,
    platform_socket::{peer_credentials, user_uid},
    FramedStream, HelperCertPath, HelperListener, IpcMessage, PeerCredentials, TlsStream,
};

pub mod crypto;
pub mod handler;
pub mod keystore;

pub use handler::RequestHandler;
pub use keystore::KeyStore;

const CLIENT_HASHES_ENV: &str = "UMBRA_CLIENT_BINARY_HASHES";
const CLIENT_HASH_ENV: &str = "UMBRA_CLIENT_BINARY_HASH";
const ENFORCE_HASH_ENV: &str = "UMBRA_ENFORCE_CLIENT_HASH_VALIDATION";

/// Allow-list of client binary hashes.
/// Read from the helper's environment only; clients cannot influence it.
#[derive(Debug, Clone, Default)]
struct ClientHashPolicy {
    allowed_hashes:     Vec<String>,
    enforce_validation: bool,
}

impl ClientHashPolicy {
    /// Reads UMBRA_CLIENT_BINARY_HASH(ES) and
    /// UMBRA_ENFORCE_CLIENT_HASH_VALIDATION
    fn from_env() -> Self {
        let allowed_hashes = match env::var(CLIENT_HASHES_ENV) {
            Ok(list) => list
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => env::var(CLIENT_HASH_ENV)
                .ok()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .into_iter()
                .collect(),
        };

        let enforce_validation = env::var(ENFORCE_HASH_ENV)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            allowed_hashes,
            enforce_validation,
        }
    }

    fn is_hash_allowed(&self, hash: &str) -> bool {
        !self.enforce_validation || self.allowed_hashes.iter().any(|allowed| allowed == hash)
    }
}

/// Build the mutual TLS configuration: helper certificate plus a verifier
/// that only accepts client certificates issued by the root CA.
pub fn load_tls_config(cert_path: &HelperCertPath) -> Result<Arc<ServerConfig>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    tracing::info!("Loading helper certificates:");
    tracing::info!("  - Helper cert: {:?}", cert_path.cert_path);
    tracing::info!("  - Helper key: {:?}", cert_path.key_path);
    tracing::info!("  - CA cert: {:?}", cert_path.ca_path);

    let cert_pem = fs::read(&cert_path.cert_path)
        .with_context(|| format!("Failed to read certificate from {:?}", cert_path.cert_path))?;
    let key_pem = fs::read(&cert_path.key_path)
        .with_context(|| format!("Failed to read private key from {:?}", cert_path.key_path))?;
    let ca_pem = fs::read(&cert_path.ca_path)
        .with_context(|| format!("Failed to read root CA from {:?}", cert_path.ca_path))?;

    let cert_chain = certs(&mut BufReader::new(&*cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificate")?;
    let key = private_key(&mut BufReader::new(&*key_pem))
        .context("Failed to parse private key")?
        .ok_or_else(|| anyhow!("No private key found in {:?}", cert_path.key_path))?;

    let mut root_store = RootCertStore::empty();
    let ca_certs = certs(&mut BufReader::new(&*ca_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse root CA certificate")?;
    root_store.add_parsable_certificates(ca_certs);

    if root_store.is_empty() {
        return Err(anyhow!(
            "No valid CA certificates found in {:?}",
            cert_path.ca_path
        ));
    }

    let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
        .build()
        .context("Failed to build client verifier")?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(cert_chain, key)
        .context("Failed to create TLS config")?;

    Ok(Arc::new(config))
}

/// Privileged helper: authenticates each client, then answers bridge
/// requests on its connection until the client disconnects.
#[derive(Clone)]
pub struct HelperServer {
    socket_path: PathBuf,
    tls_config:  Option<Arc<ServerConfig>>,
    handler:     RequestHandler,
}

impl HelperServer {
    /// Plain-socket helper bound at `socket_path` with an empty key store
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            tls_config:  None,
            handler:     RequestHandler::default(),
        }
    }

    /// Require mutual TLS on every connection
    pub fn with_tls(mut self, cert_path: &HelperCertPath) -> Result<Self> {
        self.tls_config = Some(load_tls_config(cert_path)?);
        Ok(self)
    }

    /// Serve requests from an existing handler (and its key store)
    pub fn with_handler(mut self, handler: RequestHandler) -> Self {
        self.handler = handler;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn handler(&self) -> &RequestHandler {
        &self.handler
    }

    /// Accept connections until `running` is cleared.
    ///
    /// Each connection is served on its own thread so a slow client cannot
    /// stall others.
    pub fn run_with_shutdown(&self, running: Arc<AtomicBool>) -> Result<()> {
        let listener = HelperListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to socket: {}", self.socket_path.display()))?;
        listener.set_nonblocking(true)?;

        tracing::info!("Helper listening on: {}", self.socket_path.display());

        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok(stream) => {
                    tracing::info!("New connection received");
                    let server = self.clone();
                    std::thread::spawn(move || {
                        if let Err(e) = server.handle_client(stream) {
                            tracing::error!("Client error: {:#}", e);
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => tracing::error!("Connection error: {}", e),
            }
        }

        tracing::info!("Shutdown signal received, helper stopping");
        Ok(())
    }

    fn handle_client(&self, stream: UnixStream) -> Result<()> {
        let credentials = peer_credentials(&stream).context("Failed to get client credentials")?;
        tracing::info!("Client PID: {}, UID: {}", credentials.pid, credentials.uid);

        if !self.verify_client_user(&credentials) {
            return Err(anyhow!("Client user verification failed"));
        }
        if !self.verify_client_binary(credentials.pid)? {
            return Err(anyhow!("Client binary verification failed"));
        }

        match &self.tls_config {
            Some(config) => {
                let conn = ServerConnection::new(config.clone())?;
                let tls = TlsStream::from_server(stream, conn)?;
                tracing::info!("TLS connection established with client certificate verification");
                // Authenticated clients may idle between requests
                tls.get_ref().set_read_timeout(None)?;
                serve_connection(&self.handler, tls)
            }
            None => {
                stream.set_read_timeout(None)?;
                serve_connection(&self.handler, stream)
            }
        }
    }

    /// Same UID as the helper, or the invoking user when the helper runs
    /// under sudo
    fn verify_client_user(&self, credentials: &PeerCredentials) -> bool {
        // SAFETY: getuid has no preconditions
        let current_uid = unsafe { libc::getuid() };

        if credentials.uid == current_uid {
            tracing::debug!("Client UID {} matches helper UID", credentials.uid);
            return true;
        }

        if current_uid == 0 {
            match env::var("SUDO_USER") {
                Ok(sudo_user) => match user_uid(&sudo_user) {
                    Ok(sudo_uid) if sudo_uid == credentials.uid => {
                        tracing::info!(
                            "Client UID {} matches sudo user '{}'",
                            credentials.uid,
                            sudo_user
                        );
                        return true;
                    }
                    Ok(sudo_uid) => tracing::warn!(
                        "Client UID {} does not match sudo user '{}' (UID {})",
                        credentials.uid,
                        sudo_user,
                        sudo_uid
                    ),
                    Err(e) => tracing::warn!("Failed to get UID for sudo user '{}': {}", sudo_user, e),
                },
                Err(_) => tracing::warn!("Helper running as root but SUDO_USER not set"),
            }
        }

        tracing::warn!(
            "User verification failed: client UID {} != helper UID {}",
            credentials.uid,
            current_uid
        );
        false
    }

    fn verify_client_binary(&self, pid: u32) -> Result<bool> {
        let policy = ClientHashPolicy::from_env();
        if !policy.enforce_validation {
            tracing::debug!("Binary hash validation disabled ({ENFORCE_HASH_ENV} != true)");
            return Ok(true);
        }

        let exe_path = process_executable_path(pid)?;
        let mut file = fs::File::open(&exe_path)
            .with_context(|| format!("Failed to open client binary {:?}", exe_path))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)
            .with_context(|| format!("Failed to hash client binary {:?}", exe_path))?;
        let computed = hex::encode(hasher.finalize());

        let allowed = policy.is_hash_allowed(&computed);
        if allowed {
            tracing::info!("Binary hash verification passed");
        } else {
            tracing::error!("Binary hash mismatch for {:?}", exe_path);
            tracing::error!("Computed: {}", computed);
            for (i, hash) in policy.allowed_hashes.iter().enumerate() {
                tracing::error!("  allowed[{}]: {}", i + 1, hash);
            }
            tracing::info!("Set {CLIENT_HASH_ENV}=\"{computed}\" to allow this binary");
        }
        Ok(allowed)
    }
}

/// Answer framed messages on an authenticated stream until the peer
/// disconnects or sends `Shutdown`.
pub fn serve_connection<S: Read + Write>(handler: &RequestHandler, mut stream: S) -> Result<()> {
    loop {
        let message = match stream.recv_message() {
            Ok(message) => message,
            Err(e) if is_disconnect(&e) => {
                tracing::info!("Client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.context("Failed to receive message")),
        };

        match message {
            IpcMessage::Ping => stream.send_message(&IpcMessage::Pong)?,
            IpcMessage::Request { id, request } => {
                tracing::debug!("Processing request {}: {}", id, request.operation);
                let response = handler.handle(&request);
                stream.send_message(&IpcMessage::Response { id, response })?;
            }
            IpcMessage::Shutdown => {
                tracing::info!("Client disconnected via shutdown");
                return Ok(());
            }
            other => tracing::warn!("Ignoring unexpected message from client: {:?}", other),
        }
    }
}

#[cfg(target_os = "linux")]
fn process_executable_path(pid: u32) -> Result<PathBuf> {
    fs::read_link(format!("/proc/{pid}/exe")).context("Failed to read process executable path")
}

#[cfg(target_os = "macos")]
fn process_executable_path(pid: u32) -> Result<PathBuf> {
    use std::ffi::CStr;

    let mut path_buf = [0 as libc::c_char; libc::PROC_PIDPATHINFO_MAXSIZE as usize];

    // SAFETY: the buffer is a live stack array and its length is passed
    // alongside it.
    let ret = unsafe {
        libc::proc_pidpath(
            pid as i32,
            path_buf.as_mut_ptr() as *mut libc::c_void,
            path_buf.len() as u32,
        )
    };
    if ret <= 0 {
        return Err(anyhow!(
            "Failed to get process path for PID {}: proc_pidpath returned {}",
            pid,
            ret
        ));
    }

    // SAFETY: proc_pidpath succeeded, so the buffer holds a NUL-terminated path
    let path = unsafe { CStr::from_ptr(path_buf.as_ptr()) };
    Ok(PathBuf::from(
        path.to_str().context("Process path contains invalid UTF-8")?,
    ))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn process_executable_path(pid: u32) -> Result<PathBuf> {
    fs::read_link(format!("/proc/{pid}/exe")).map_err(|_| {
        anyhow!(
            "Unable to determine executable path for PID {}. Supported systems: Linux \
             (/proc/*/exe), macOS (proc_pidpath).",
            pid
        )
    })
}

#[cfg(test)]
mod tests {
    use umbra_common::{BridgeRequest, BridgeResponse, OperationKind};

    use super::*;

    #[test]
    fn test_disabled_policy_allows_everything() {
        let policy = ClientHashPolicy::default();
        assert!(policy.is_hash_allowed("anything"));
    }

    #[test]
    fn test_enforced_policy_checks_allow_list() {
        let policy = ClientHashPolicy {
            allowed_hashes:     vec!["abc".into(), "def".into()],
            enforce_validation: true,
        };
        assert!(policy.is_hash_allowed("def"));
        assert!(!policy.is_hash_allowed("123"));
    }

    #[test]
    fn test_own_uid_is_accepted() {
        let server = HelperServer::new("/nonexistent/helper.sock");
        let (a, _b) = UnixStream::pair().unwrap();
        let creds = peer_credentials(&a).unwrap();
        assert!(server.verify_client_user(&creds));
    }

    #[test]
    fn test_serve_connection_answers_requests() {
        let (mut client, server_side) = UnixStream::pair().unwrap();
        let handler = RequestHandler::default();
        let worker = {
            let handler = handler.clone();
            std::thread::spawn(move || serve_connection(&handler, server_side))
        };

        client.send_message(&IpcMessage::Ping).unwrap();
        assert!(matches!(client.recv_message().unwrap(), IpcMessage::Pong));

        let request = BridgeRequest::new(OperationKind::Hash).with_payload("abc".into());
        client
            .send_message(&IpcMessage::Request { id: 42, request })
            .unwrap();
        match client.recv_message().unwrap() {
            IpcMessage::Response {
                id: 42,
                response: BridgeResponse::Success(digest),
            } => assert_eq!(digest.len(), 32),
            other => panic!("unexpected message: {other:?}"),
        }

        client.send_message(&IpcMessage::Shutdown).unwrap();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_serve_connection_ends_cleanly_on_disconnect() {
        let (client, server_side) = UnixStream::pair().unwrap();
        drop(client);
        serve_connection(&RequestHandler::default(), server_side).unwrap();
    }
}
