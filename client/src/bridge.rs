//! # Security Bridge
//!
//! Async front for the helper's completion-handler proxy.
//!
//! Every operation:
//! 1. fails fast with `ServiceUnavailable` once the bridge is invalidated,
//!    without touching the proxy;
//! 2. marshals its arguments into a [`BridgeRequest`];
//! 3. submits it with a completion that feeds a oneshot channel, so the
//!    caller resumes exactly once (a completion dropped unused reads as
//!    `ConnectionInterrupted`);
//! 4. bounds the wait with the configured operation timeout;
//! 5. maps the remote error, if any, into the local taxonomy.
//!
//! Dropping an in-flight operation drops the receiver; the late completion
//! is discarded.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::{rngs::OsRng, RngCore};
use tokio::sync::oneshot;
use umbra_common::{
    bytes_from_buffer, buffer_from_bytes, config,
    protocol::{
        MAX_RANDOM_LEN, META_ALGORITHM, META_FORMAT, META_KEY_TYPE, META_LENGTH, META_SIGNATURE,
    },
    BoundaryData, BridgeRequest, BridgeResponse, ErrorKind, OperationKind, SecureBytes,
    SecurityError,
};

/// Called exactly once with the helper's answer
pub type Completion = Box<dyn FnOnce(BridgeResponse) + Send>;

/// Remote end of the bridge, in completion-handler style
pub trait SecurityProxy: Send + Sync {
    fn submit(&self, request: BridgeRequest, completion: Completion);

    /// Liveness probe; completes with an empty success when the helper
    /// answers
    fn ping(&self, completion: Completion) {
        let response = if self.is_connected() {
            BridgeResponse::Success(BoundaryData::empty())
        } else {
            BridgeResponse::failure(SecurityError::new(
                ErrorKind::ConnectionInterrupted,
                "proxy is not connected",
            ))
        };
        completion(response);
    }

    fn is_connected(&self) -> bool;

    fn invalidate(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Invalidated,
}

/// Where random bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomSource {
    Remote,
    /// Local OS CSPRNG, used when the helper was unreachable
    Local,
}

#[derive(Debug, Clone)]
pub struct RandomBytes {
    pub bytes:  SecureBytes,
    pub source: RandomSource,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub operation_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            operation_timeout: config::operation_timeout(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

pub struct SecurityBridge {
    proxy:       Arc<dyn SecurityProxy>,
    config:      BridgeConfig,
    invalidated: AtomicBool,
}

impl SecurityBridge {
    pub fn new(proxy: Arc<dyn SecurityProxy>, config: BridgeConfig) -> Self {
        Self {
            proxy,
            config,
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.invalidated.load(Ordering::Acquire) || !self.proxy.is_connected() {
            ConnectionState::Invalidated
        } else {
            ConnectionState::Connected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Stop using the proxy; every later operation fails with
    /// `ServiceUnavailable`
    pub fn invalidate(&self) {
        if !self.invalidated.swap(true, Ordering::AcqRel) {
            tracing::info!("Security bridge invalidated");
            self.proxy.invalidate();
        }
    }

    fn ensure_connected(&self) -> Result<(), SecurityError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Invalidated => Err(SecurityError::unavailable(
                "connection to the security helper is invalidated",
            )),
        }
    }

    async fn await_completion(
        &self,
        label: &str,
        rx: oneshot::Receiver<BridgeResponse>,
    ) -> Result<BoundaryData, SecurityError> {
        match tokio::time::timeout(self.config.operation_timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(SecurityError::new(
                ErrorKind::ConnectionInterrupted,
                format!("{label}: the helper dropped the request without answering"),
            )),
            Err(_) => {
                tracing::warn!("{} timed out after {:?}", label, self.config.operation_timeout);
                Err(SecurityError::new(
                    ErrorKind::Timeout,
                    format!("{label} timed out after {:?}", self.config.operation_timeout),
                ))
            }
        }
    }

    async fn call(&self, request: BridgeRequest) -> Result<BoundaryData, SecurityError> {
        self.ensure_connected()?;

        let operation = request.operation;
        let (tx, rx) = oneshot::channel();
        self.proxy.submit(
            request,
            Box::new(move |response| {
                // Receiver gone means the caller stopped waiting
                let _ = tx.send(response);
            }),
        );

        let result = self.await_completion(&operation.to_string(), rx).await;
        if let Err(err) = &result {
            tracing::debug!(%operation, kind = %err.kind, "Bridge operation failed");
        }
        result
    }

    /// Round trip to the helper without touching any key
    pub async fn ping(&self) -> Result<(), SecurityError> {
        self.ensure_connected()?;
        let (tx, rx) = oneshot::channel();
        self.proxy.ping(Box::new(move |response| {
            let _ = tx.send(response);
        }));
        self.await_completion("ping", rx).await.map(|_| ())
    }

    /// Encrypt under `key_id`; output is `nonce || ciphertext`
    pub async fn encrypt(&self, data: &SecureBytes, key_id: &str) -> Result<SecureBytes, SecurityError> {
        let request = BridgeRequest::new(OperationKind::Encrypt)
            .with_payload(buffer_from_bytes(data))
            .with_key(key_id);
        self.call(request).await.map(bytes_from_buffer)
    }

    pub async fn decrypt(&self, data: &SecureBytes, key_id: &str) -> Result<SecureBytes, SecurityError> {
        let request = BridgeRequest::new(OperationKind::Decrypt)
            .with_payload(buffer_from_bytes(data))
            .with_key(key_id);
        self.call(request).await.map(bytes_from_buffer)
    }

    /// Digest with `algorithm` (`sha256` when `None`)
    pub async fn hash(&self, data: &SecureBytes, algorithm: Option<&str>) -> Result<SecureBytes, SecurityError> {
        let mut request =
            BridgeRequest::new(OperationKind::Hash).with_payload(buffer_from_bytes(data));
        if let Some(algorithm) = algorithm {
            request = request.with_meta(META_ALGORITHM, algorithm);
        }
        self.call(request).await.map(bytes_from_buffer)
    }

    pub async fn sign(&self, data: &SecureBytes, key_id: &str) -> Result<SecureBytes, SecurityError> {
        let request = BridgeRequest::new(OperationKind::Sign)
            .with_payload(buffer_from_bytes(data))
            .with_key(key_id);
        self.call(request).await.map(bytes_from_buffer)
    }

    /// `Ok(false)` when the signature does not match; an error only when
    /// verification could not be attempted
    pub async fn verify(
        &self,
        data: &SecureBytes,
        signature: &[u8],
        key_id: &str,
    ) -> Result<bool, SecurityError> {
        let request = BridgeRequest::new(OperationKind::Verify)
            .with_payload(buffer_from_bytes(data))
            .with_key(key_id)
            .with_meta(META_SIGNATURE, hex::encode(signature));
        let verdict = self.call(request).await?;
        match verdict.as_bytes() {
            [1] => Ok(true),
            [0] => Ok(false),
            other => Err(SecurityError::internal(format!(
                "unexpected verify result of {} bytes",
                other.len()
            ))),
        }
    }

    /// Generate a key of `key_type` (`symmetric` or `signing`); returns its
    /// identifier, generated by the helper when `key_id` is `None`
    pub async fn generate_key(&self, key_type: &str, key_id: Option<&str>) -> Result<String, SecurityError> {
        let mut request = BridgeRequest::new(OperationKind::GenerateKey).with_meta(META_KEY_TYPE, key_type);
        if let Some(id) = key_id {
            request = request.with_key(id);
        }
        let id = self.call(request).await?;
        id.to_utf8()
            .ok_or_else(|| SecurityError::internal("helper returned a non UTF-8 key identifier"))
    }

    /// Export raw material, or the public half of a signing key
    pub async fn export_key(&self, key_id: &str, public: bool) -> Result<SecureBytes, SecurityError> {
        let request = BridgeRequest::new(OperationKind::ExportKey)
            .with_key(key_id)
            .with_meta(META_FORMAT, if public { "public" } else { "raw" });
        self.call(request).await.map(bytes_from_buffer)
    }

    pub async fn import_key(
        &self,
        material: &SecureBytes,
        key_type: &str,
        key_id: &str,
    ) -> Result<(), SecurityError> {
        let request = BridgeRequest::new(OperationKind::ImportKey)
            .with_payload(buffer_from_bytes(material))
            .with_key(key_id)
            .with_meta(META_KEY_TYPE, key_type);
        self.call(request).await.map(|_| ())
    }

    pub async fn delete_key(&self, key_id: &str) -> Result<(), SecurityError> {
        let request = BridgeRequest::new(OperationKind::DeleteKey).with_key(key_id);
        self.call(request).await.map(|_| ())
    }

    pub async fn list_key_identifiers(&self) -> Result<Vec<String>, SecurityError> {
        let encoded = self
            .call(BridgeRequest::new(OperationKind::ListKeyIdentifiers))
            .await?;
        bincode::deserialize(encoded.as_bytes())
            .map_err(|e| SecurityError::internal(format!("malformed key list: {e}")))
    }

    /// Exactly `length` random bytes from the helper, or from the local OS
    /// CSPRNG when the helper cannot be reached. Lengths above
    /// [`MAX_RANDOM_LEN`] are `InvalidInput` from either source.
    pub async fn generate_random_bytes(&self, length: usize) -> Result<RandomBytes, SecurityError> {
        if length > MAX_RANDOM_LEN {
            return Err(SecurityError::invalid_input(format!(
                "requested {length} random bytes, limit is {MAX_RANDOM_LEN}"
            )));
        }

        let request =
            BridgeRequest::new(OperationKind::GenerateRandomBytes).with_meta(META_LENGTH, length.to_string());

        match self.call(request).await {
            Ok(buffer) if buffer.len() == length => Ok(RandomBytes {
                bytes:  bytes_from_buffer(buffer),
                source: RandomSource::Remote,
            }),
            Ok(buffer) => Err(SecurityError::internal(format!(
                "helper returned {} random bytes, expected {}",
                buffer.len(),
                length
            ))),
            Err(err)
                if matches!(
                    err.kind,
                    ErrorKind::ServiceUnavailable | ErrorKind::ConnectionInterrupted | ErrorKind::Timeout
                ) =>
            {
                tracing::warn!("Helper unavailable for random bytes ({}), using local source", err);
                let mut bytes = SecureBytes::zeroed(length);
                OsRng.fill_bytes(bytes.as_mut_bytes());
                Ok(RandomBytes {
                    bytes,
                    source: RandomSource::Local,
                })
            }
            Err(err) => Err(err),
        }
    }
}
