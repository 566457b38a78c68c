use std::{env, path::PathBuf, time::Duration};

/// The socket the helper and its clients communicate over
pub const SOCKET_NAME: &str = "umbra-helper.sock";

/// TLS server name the helper certificate is issued for
pub const HELPER_SERVER_NAME: &str = "umbra-helper";

const CERTS_DIR_ENV: &str = "UMBRA_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = "certs";

const SOCKET_DIR_ENV: &str = "UMBRA_SOCKET_DIR";
const DEFAULT_SOCKET_DIR: &str = "/tmp";

const DATA_DIR_ENV: &str = "UMBRA_DATA_DIR";
const DEFAULT_DATA_DIR: &str = ".umbra";

const OPERATION_TIMEOUT_ENV: &str = "UMBRA_OPERATION_TIMEOUT_MS";
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

// Subdirectories of the certs dir for each side of the connection
const HELPER_CERTS_SUBDIR: &str = "helper";
const APP_CERTS_SUBDIR: &str = "app";

fn get_certs_dir() -> PathBuf {
    let dir = env::var(CERTS_DIR_ENV).unwrap_or(DEFAULT_CERTS_DIR.to_string());
    PathBuf::from(dir)
}

/// Directory the helper socket lives in (`UMBRA_SOCKET_DIR`, default `/tmp`)
pub fn socket_dir() -> PathBuf {
    env::var(SOCKET_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_DIR))
}

/// Full path of a named socket inside [`socket_dir`]
pub fn socket_path(socket_name: &str) -> PathBuf {
    socket_dir().join(socket_name)
}

/// Root directory for persisted blobs (`UMBRA_DATA_DIR`, default `.umbra`)
pub fn data_dir() -> PathBuf {
    env::var(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Per-operation bound for bridge calls (`UMBRA_OPERATION_TIMEOUT_MS`)
pub fn operation_timeout() -> Duration {
    env::var(OPERATION_TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_OPERATION_TIMEOUT)
}

/// Helper certificate paths for TLS authentication
#[derive(Debug, Clone)]
pub struct HelperCertPath {
    /// Path to the helper certificate file
    pub cert_path: PathBuf,
    /// Path to the helper private key file
    pub key_path:  PathBuf,
    /// Path to the certificate authority file
    pub ca_path:   PathBuf,
}

impl HelperCertPath {
    /// Creates HelperCertPath with default certificate locations.
    /// Certificates are expected in a 'helper' subdirectory within the base
    /// certs directory.
    pub fn new() -> Self {
        let base = get_certs_dir().join(HELPER_CERTS_SUBDIR);
        Self {
            cert_path: base.join("helper.pem"),
            key_path:  base.join("helper.key.pem"),
            ca_path:   get_certs_dir().join("root-ca.pem"),
        }
    }
}

impl Default for HelperCertPath {
    fn default() -> Self {
        Self::new()
    }
}

/// Certificate paths for the application side of the connection
#[derive(Debug, Clone)]
pub struct AppCertPath {
    /// Path to the client certificate file
    pub cert_path: PathBuf,
    /// Path to the client private key file
    pub key_path:  PathBuf,
    /// Path to the certificate authority file
    pub ca_path:   PathBuf,
}

impl AppCertPath {
    /// Creates AppCertPath with default certificate locations.
    /// Certificates are expected in an 'app' subdirectory within the base
    /// certs directory.
    pub fn new() -> Self {
        let base = get_certs_dir().join(APP_CERTS_SUBDIR);
        Self {
            cert_path: base.join("app.pem"),
            key_path:  base.join("app.key.pem"),
            ca_path:   get_certs_dir().join("root-ca.pem"),
        }
    }
}

impl Default for AppCertPath {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_joins_name() {
        let path = socket_path("x.sock");
        assert!(path.ends_with("x.sock"));
    }

    #[test]
    fn test_cert_paths_use_subdirectories() {
        let helper = HelperCertPath::new();
        let app = AppCertPath::new();
        assert!(helper.cert_path.to_string_lossy().contains("helper"));
        assert!(app.cert_path.to_string_lossy().contains("app"));
        assert_eq!(helper.ca_path, app.ca_path);
    }
}
