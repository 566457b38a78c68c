use std::{
    fs,
    io::BufReader,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use rustls::{pki_types::ServerName, ClientConfig, ClientConnection, RootCertStore};
use rustls_pemfile::{certs, private_key};
use umbra_common::{
    config::{socket_path, HELPER_SERVER_NAME},
    platform_socket::connect_socket,
    AppCertPath, BoundaryData, BridgeRequest, BridgeResponse, Duplex, ErrorKind, FramedStream,
    IpcMessage, SecurityError, TlsStream, SOCKET_NAME,
};

use crate::bridge::{Completion, SecurityProxy};

/// How to reach the helper
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Helper socket
    pub socket_path: PathBuf,
    /// Client certificates for mutual TLS; plain socket when `None`
    pub tls:         Option<AppCertPath>,
    /// Name the helper certificate must carry
    pub server_name: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socket_path: socket_path(SOCKET_NAME),
            tls:         None,
            server_name: HELPER_SERVER_NAME.to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_tls(mut self, cert_path: AppCertPath) -> Self {
        self.tls = Some(cert_path);
        self
    }

    pub fn with_server_name<S: Into<String>>(mut self, server_name: S) -> Self {
        self.server_name = server_name.into();
        self
    }
}

/// Client certificate and trusted root for talking to the helper
pub fn load_tls_config(cert_path: &AppCertPath) -> Result<Arc<ClientConfig>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    tracing::debug!("Loading client certificates...");
    tracing::debug!("  - Client cert: {:?}", cert_path.cert_path);
    tracing::debug!("  - Client key: {:?}", cert_path.key_path);
    tracing::debug!("  - CA cert: {:?}", cert_path.ca_path);

    let cert_pem = fs::read(&cert_path.cert_path).with_context(|| {
        format!("Failed to read client certificate from {:?}", cert_path.cert_path)
    })?;
    let key_pem = fs::read(&cert_path.key_path).with_context(|| {
        format!("Failed to read client private key from {:?}", cert_path.key_path)
    })?;
    let ca_pem = fs::read(&cert_path.ca_path)
        .with_context(|| format!("Failed to read CA certificate from {:?}", cert_path.ca_path))?;

    let cert_chain = certs(&mut BufReader::new(&*cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse client certificate PEM data")?;
    let key = private_key(&mut BufReader::new(&*key_pem))
        .context("Failed to parse client private key PEM data")?
        .ok_or_else(|| anyhow!("No private key found in client key file"))?;

    let mut root_store = RootCertStore::empty();
    let ca_certs = certs(&mut BufReader::new(&*ca_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse CA certificate PEM data")?;
    root_store.add_parsable_certificates(ca_certs);

    if root_store.is_empty() {
        return Err(anyhow!(
            "No valid CA certificates found in {:?}. Please check the CA certificate file.",
            cert_path.ca_path
        ));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(cert_chain, key)
        .context("Failed to build TLS client configuration")?;
    Ok(Arc::new(config))
}

enum Job {
    Call {
        request:    BridgeRequest,
        completion: Completion,
    },
    Ping(Completion),
}

impl Job {
    fn fail(self, err: SecurityError) {
        let completion = match self {
            Job::Call { completion, .. } | Job::Ping(completion) => completion,
        };
        completion(BridgeResponse::failure(err));
    }
}

fn interrupted(reason: impl Into<String>) -> SecurityError {
    SecurityError::new(ErrorKind::ConnectionInterrupted, reason)
}

/// [`SecurityProxy`] over the helper socket.
///
/// A dedicated connection thread owns the stream and works through queued
/// requests one at a time. Once the connection fails, that request and
/// every queued or later one complete with `ConnectionInterrupted`.
pub struct SocketProxy {
    jobs:      Mutex<Option<Sender<Job>>>,
    connected: Arc<AtomicBool>,
    worker:    Mutex<Option<JoinHandle<()>>>,
}

impl SocketProxy {
    /// Connect to the helper described by `config`
    pub fn connect(config: &ProxyConfig) -> Result<Self> {
        let stream = connect_socket(&config.socket_path)?;

        match &config.tls {
            Some(cert_path) => {
                let tls_config = load_tls_config(cert_path)?;
                let server_name = ServerName::try_from(config.server_name.clone())
                    .map_err(|_| anyhow!("Invalid server name '{}'", config.server_name))?;
                let conn = ClientConnection::new(tls_config, server_name)?;
                let tls = TlsStream::from_client(stream, conn)
                    .context("TLS handshake with helper failed")?;
                tracing::info!("Secure connection to helper established");
                Ok(Self::from_stream(tls))
            }
            None => {
                tracing::info!("Connected to helper at {}", config.socket_path.display());
                Ok(Self::from_stream(stream))
            }
        }
    }

    /// Drive an already authenticated stream
    pub fn from_stream<S: Duplex + 'static>(stream: S) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let connected = Arc::new(AtomicBool::new(true));

        let worker = {
            let connected = connected.clone();
            std::thread::Builder::new()
                .name("umbra-proxy".into())
                .spawn(move || run_connection(stream, rx, connected))
        };

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!("Failed to start proxy connection thread: {}", e);
                connected.store(false, Ordering::SeqCst);
                None
            }
        };

        Self {
            jobs: Mutex::new(worker.as_ref().map(|_| tx)),
            connected,
            worker: Mutex::new(worker),
        }
    }

    fn enqueue(&self, job: Job) {
        let sender = self.jobs.lock().clone();
        match sender {
            Some(sender) => {
                if let Err(rejected) = sender.send(job) {
                    rejected.into_inner().fail(interrupted("proxy connection thread has exited"));
                }
            }
            None => job.fail(interrupted("proxy is invalidated")),
        }
    }
}

impl SecurityProxy for SocketProxy {
    fn submit(&self, request: BridgeRequest, completion: Completion) {
        self.enqueue(Job::Call {
            request,
            completion,
        });
    }

    fn ping(&self, completion: Completion) {
        self.enqueue(Job::Ping(completion));
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn invalidate(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Closing the queue lets the connection thread finish
        self.jobs.lock().take();
    }
}

impl Drop for SocketProxy {
    fn drop(&mut self) {
        self.jobs.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Proxy connection thread panicked");
            }
        }
    }
}

fn run_connection<S: Duplex>(mut stream: S, jobs: Receiver<Job>, connected: Arc<AtomicBool>) {
    let mut next_id: u64 = 1;

    for job in jobs.iter() {
        if !connected.load(Ordering::SeqCst) {
            job.fail(interrupted("connection to the helper was lost"));
            continue;
        }

        let outcome = match job {
            Job::Call {
                request,
                completion,
            } => {
                let id = next_id;
                next_id += 1;
                (exchange(&mut stream, id, request), completion)
            }
            Job::Ping(completion) => (ping(&mut stream), completion),
        };

        match outcome {
            (Ok(response), completion) => completion(response),
            (Err(e), completion) => {
                tracing::warn!("Helper connection failed: {:#}", e);
                connected.store(false, Ordering::SeqCst);
                completion(BridgeResponse::failure(interrupted(format!(
                    "connection to the helper failed: {e}"
                ))));
            }
        }
    }

    if connected.load(Ordering::SeqCst) {
        let _ = stream.send_message(&IpcMessage::Shutdown);
    }
    tracing::debug!("Proxy connection thread finished");
}

fn exchange<S: Duplex>(stream: &mut S, id: u64, request: BridgeRequest) -> Result<BridgeResponse> {
    tracing::debug!("Sending request {}: {}", id, request.operation);
    stream.send_message(&IpcMessage::Request { id, request })?;

    match stream.recv_message()? {
        IpcMessage::Response {
            id: answered,
            response,
        } if answered == id => Ok(response),
        IpcMessage::Response { id: answered, .. } => Err(anyhow!(
            "Response ID mismatch: expected {}, got {}",
            id,
            answered
        )),
        other => Err(anyhow!("Expected response, got: {:?}", other)),
    }
}

fn ping<S: Duplex>(stream: &mut S) -> Result<BridgeResponse> {
    stream.send_message(&IpcMessage::Ping)?;
    match stream.recv_message()? {
        IpcMessage::Pong => Ok(BridgeResponse::Success(BoundaryData::empty())),
        other => Err(anyhow!("Expected pong, got: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use std::{os::unix::net::UnixStream, sync::mpsc, time::Duration};

    use umbra_common::OperationKind;

    use super::*;

    fn call(proxy: &SocketProxy, request: BridgeRequest) -> BridgeResponse {
        let (tx, rx) = mpsc::channel();
        proxy.submit(request, Box::new(move |response| tx.send(response).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_request_and_response_ids_match() {
        let (client, mut helper) = UnixStream::pair().unwrap();
        let proxy = SocketProxy::from_stream(client);

        let helper_thread = std::thread::spawn(move || {
            for _ in 0..2 {
                match helper.recv_message().unwrap() {
                    IpcMessage::Request { id, request } => helper
                        .send_message(&IpcMessage::Response {
                            id,
                            response: BridgeResponse::Success(request.payload),
                        })
                        .unwrap(),
                    other => panic!("unexpected message: {other:?}"),
                }
            }
            // Dropping the proxy announces the disconnect
            assert!(matches!(helper.recv_message().unwrap(), IpcMessage::Shutdown));
        });

        for word in ["alpha", "beta"] {
            let response = call(
                &proxy,
                BridgeRequest::new(OperationKind::Hash).with_payload(word.into()),
            );
            assert_eq!(response.into_result().unwrap().as_bytes(), word.as_bytes());
        }

        drop(proxy);
        helper_thread.join().unwrap();
    }

    #[test]
    fn test_lost_connection_interrupts_requests() {
        let (client, helper) = UnixStream::pair().unwrap();
        drop(helper);
        let proxy = SocketProxy::from_stream(client);

        let err = call(&proxy, BridgeRequest::new(OperationKind::ListKeyIdentifiers))
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionInterrupted);
        assert!(!proxy.is_connected());

        let err = call(&proxy, BridgeRequest::new(OperationKind::ListKeyIdentifiers))
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionInterrupted);
    }

    #[test]
    fn test_mismatched_response_id_invalidates() {
        let (client, mut helper) = UnixStream::pair().unwrap();
        let proxy = SocketProxy::from_stream(client);

        let helper_thread = std::thread::spawn(move || {
            if let IpcMessage::Request { id, .. } = helper.recv_message().unwrap() {
                helper
                    .send_message(&IpcMessage::Response {
                        id:       id + 100,
                        response: BridgeResponse::Success(BoundaryData::empty()),
                    })
                    .unwrap();
            }
        });

        let err = call(&proxy, BridgeRequest::new(OperationKind::DeleteKey).with_key("k"))
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionInterrupted);
        assert!(!proxy.is_connected());
        helper_thread.join().unwrap();
    }

    #[test]
    fn test_invalidated_proxy_rejects_immediately() {
        let (client, _helper) = UnixStream::pair().unwrap();
        let proxy = SocketProxy::from_stream(client);
        proxy.invalidate();

        let err = call(&proxy, BridgeRequest::new(OperationKind::ListKeyIdentifiers))
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionInterrupted);
    }
}
