use std::{collections::HashMap, future::Future, path::Path, sync::Arc};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use umbra_common::{ErrorKind, SecureBytes, SecurityError};

use crate::{
    bridge::{RandomBytes, SecurityBridge},
    container::Resolver,
    error::ServiceError,
    ledger::{AccessLedger, BlobStore},
    lifecycle::{Lifecycle, ManagedService, ServiceState},
};

/// Cryptographic operations, executed by the helper through the bridge
pub struct CryptoService {
    lifecycle: Lifecycle,
    bridge:    SecurityBridge,
}

impl CryptoService {
    pub fn new(bridge: SecurityBridge) -> Self {
        Self {
            lifecycle: Lifecycle::new("crypto"),
            bridge,
        }
    }

    pub fn bridge(&self) -> &SecurityBridge {
        &self.bridge
    }

    pub async fn encrypt(&self, data: &SecureBytes, key_id: &str) -> Result<SecureBytes, ServiceError> {
        self.lifecycle.ensure_ready()?;
        Ok(self.bridge.encrypt(data, key_id).await?)
    }

    pub async fn decrypt(&self, data: &SecureBytes, key_id: &str) -> Result<SecureBytes, ServiceError> {
        self.lifecycle.ensure_ready()?;
        Ok(self.bridge.decrypt(data, key_id).await?)
    }

    pub async fn hash(&self, data: &SecureBytes, algorithm: Option<&str>) -> Result<SecureBytes, ServiceError> {
        self.lifecycle.ensure_ready()?;
        Ok(self.bridge.hash(data, algorithm).await?)
    }

    pub async fn sign(&self, data: &SecureBytes, key_id: &str) -> Result<SecureBytes, ServiceError> {
        self.lifecycle.ensure_ready()?;
        Ok(self.bridge.sign(data, key_id).await?)
    }

    pub async fn verify(
        &self,
        data: &SecureBytes,
        signature: &[u8],
        key_id: &str,
    ) -> Result<bool, ServiceError> {
        self.lifecycle.ensure_ready()?;
        Ok(self.bridge.verify(data, signature, key_id).await?)
    }

    pub async fn generate_key(&self, key_type: &str, key_id: Option<&str>) -> Result<String, ServiceError> {
        self.lifecycle.ensure_ready()?;
        Ok(self.bridge.generate_key(key_type, key_id).await?)
    }

    pub async fn delete_key(&self, key_id: &str) -> Result<(), ServiceError> {
        self.lifecycle.ensure_ready()?;
        Ok(self.bridge.delete_key(key_id).await?)
    }

    pub async fn list_key_identifiers(&self) -> Result<Vec<String>, ServiceError> {
        self.lifecycle.ensure_ready()?;
        Ok(self.bridge.list_key_identifiers().await?)
    }

    pub async fn random_bytes(&self, length: usize) -> Result<RandomBytes, ServiceError> {
        self.lifecycle.ensure_ready()?;
        Ok(self.bridge.generate_random_bytes(length).await?)
    }
}

#[async_trait]
impl ManagedService for CryptoService {
    fn identifier(&self) -> &str {
        self.lifecycle.identifier()
    }

    fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    async fn initialize(&self, _resolver: &Resolver<'_>) -> Result<(), ServiceError> {
        self.lifecycle
            .initialize_with(|| async {
                self.bridge
                    .ping()
                    .await
                    .map_err(|e| ServiceError::Initialization {
                        service: self.identifier().to_string(),
                        reason:  format!("security helper did not answer: {e}"),
                    })
            })
            .await
    }

    async fn shutdown(&self) -> Result<(), ServiceError> {
        self.lifecycle
            .shutdown_with(|| async {
                self.bridge.invalidate();
                Ok(())
            })
            .await
    }
}

const CREDENTIAL_PREFIX: &str = "credential:";

struct Dependencies {
    crypto: Arc<CryptoService>,
    ledger: Arc<AccessLedger>,
}

/// Repository credentials and scoped resource use for the application.
///
/// Credentials are stored sealed by the helper; plaintext is cached only
/// while the service is ready and zeroized on shutdown.
pub struct SecurityService {
    lifecycle:    Lifecycle,
    store:        Arc<dyn BlobStore>,
    dependencies: RwLock<Option<Arc<Dependencies>>>,
    credentials:  Mutex<HashMap<String, SecureBytes>>,
}

impl SecurityService {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            lifecycle: Lifecycle::new("security"),
            store,
            dependencies: RwLock::new(None),
            credentials: Mutex::new(HashMap::new()),
        }
    }

    fn dependencies(&self) -> Result<Arc<Dependencies>, ServiceError> {
        self.lifecycle.ensure_ready()?;
        self.dependencies
            .read()
            .clone()
            .ok_or_else(|| ServiceError::Configuration("security service has no dependencies".into()))
    }

    /// Seal `secret` under `key_id` and persist it as credential `id`
    pub async fn store_credential(
        &self,
        id: &str,
        secret: &SecureBytes,
        key_id: &str,
    ) -> Result<(), ServiceError> {
        let deps = self.dependencies()?;

        let sealed = deps.crypto.encrypt(secret, key_id).await?;
        self.store
            .put(&format!("{CREDENTIAL_PREFIX}{id}"), sealed.as_bytes())
            .await?;
        self.credentials.lock().insert(id.to_string(), secret.clone());

        tracing::info!(credential = id, "Stored credential");
        Ok(())
    }

    /// Plaintext of credential `id`, unsealed with `key_id` on first use
    pub async fn load_credential(&self, id: &str, key_id: &str) -> Result<SecureBytes, ServiceError> {
        let deps = self.dependencies()?;

        if let Some(secret) = self.credentials.lock().get(id) {
            return Ok(secret.clone());
        }

        let sealed = self
            .store
            .get(&format!("{CREDENTIAL_PREFIX}{id}"))
            .await?
            .ok_or_else(|| {
                SecurityError::new(ErrorKind::KeyNotFound, format!("no credential stored as '{id}'"))
            })?;
        let secret = deps.crypto.decrypt(&SecureBytes::new(sealed), key_id).await?;
        self.credentials.lock().insert(id.to_string(), secret.clone());
        Ok(secret)
    }

    pub async fn remove_credential(&self, id: &str) -> Result<(), ServiceError> {
        self.lifecycle.ensure_ready()?;
        self.credentials.lock().remove(id);
        self.store.remove(&format!("{CREDENTIAL_PREFIX}{id}")).await?;
        Ok(())
    }

    /// Run `body` while holding scoped access to `path`
    pub async fn with_resource<T, F, Fut>(&self, path: &Path, body: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let deps = self.dependencies()?;
        deps.ledger.with_scoped_access(path, body).await
    }
}

#[async_trait]
impl ManagedService for SecurityService {
    fn identifier(&self) -> &str {
        self.lifecycle.identifier()
    }

    fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    async fn initialize(&self, resolver: &Resolver<'_>) -> Result<(), ServiceError> {
        self.lifecycle
            .initialize_with(|| async {
                let crypto = resolver.resolve::<CryptoService>().await?;
                let ledger = resolver.resolve::<AccessLedger>().await?;
                *self.dependencies.write() = Some(Arc::new(Dependencies { crypto, ledger }));
                Ok(())
            })
            .await
    }

    async fn shutdown(&self) -> Result<(), ServiceError> {
        self.lifecycle
            .shutdown_with(|| async {
                let cleared = {
                    let mut credentials = self.credentials.lock();
                    let n = credentials.len();
                    credentials.clear();
                    n
                };
                tracing::debug!("Zeroized {} cached credential(s)", cleared);
                self.dependencies.write().take();
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use umbra_common::{BridgeRequest, BridgeResponse, OperationKind};

    use super::*;
    use crate::{
        bridge::{BridgeConfig, Completion, SecurityProxy},
        container::ServiceContainer,
        ledger::{FileSystemProvider, MemoryBlobStore},
    };

    /// Reversible "encryption" so sealed blobs differ from plaintext
    struct XorProxy {
        connected: AtomicBool,
    }

    impl SecurityProxy for XorProxy {
        fn submit(&self, request: BridgeRequest, completion: Completion) {
            let response = match request.operation {
                OperationKind::Encrypt | OperationKind::Decrypt => {
                    match request.key_identifier.as_deref() {
                        Some("vault") => BridgeResponse::Success(
                            request.payload.as_bytes().iter().map(|b| b ^ 0x5a).collect::<Vec<_>>().into(),
                        ),
                        other => BridgeResponse::failure(SecurityError::key_not_found(
                            other.unwrap_or_default(),
                        )),
                    }
                }
                _ => BridgeResponse::failure(SecurityError::new(ErrorKind::NotImplemented, "stub")),
            };
            completion(response);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn invalidate(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    fn container(store: Arc<MemoryBlobStore>) -> ServiceContainer {
        let container = ServiceContainer::new();
        container.register(|| {
            let proxy = Arc::new(XorProxy {
                connected: AtomicBool::new(true),
            });
            Ok(CryptoService::new(SecurityBridge::new(proxy, BridgeConfig::new())))
        });
        container.register(|| {
            Ok(AccessLedger::new(
                Arc::new(FileSystemProvider::new()),
                Arc::new(MemoryBlobStore::new()),
            ))
        });
        container.register(move || Ok(SecurityService::new(store.clone())));
        container
    }

    #[tokio::test]
    async fn test_dependencies_ready_before_security_service() {
        let container = container(Arc::new(MemoryBlobStore::new()));

        let security = container.resolve::<SecurityService>().await.unwrap();
        assert!(security.is_usable());

        let crypto = container.resolve::<CryptoService>().await.unwrap();
        let ledger = container.resolve::<AccessLedger>().await.unwrap();
        assert!(crypto.is_usable() && ledger.is_usable());
        assert_eq!(container.len(), 3);
    }

    #[tokio::test]
    async fn test_credential_roundtrip_through_store() {
        let store = Arc::new(MemoryBlobStore::new());
        let container = container(store.clone());
        let security = container.resolve::<SecurityService>().await.unwrap();

        let secret = SecureBytes::from("correct horse");
        security.store_credential("main", &secret, "vault").await.unwrap();

        let sealed = store.get("credential:main").await.unwrap().unwrap();
        assert_ne!(sealed, secret.as_bytes());

        // Drop the cache so the next load goes through decrypt
        security.credentials.lock().clear();
        let loaded = security.load_credential("main", "vault").await.unwrap();
        assert_eq!(loaded, secret);
    }

    #[tokio::test]
    async fn test_missing_credential_is_key_not_found() {
        let container = container(Arc::new(MemoryBlobStore::new()));
        let security = container.resolve::<SecurityService>().await.unwrap();

        let err = security.load_credential("absent", "vault").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    }

    #[tokio::test]
    async fn test_shutdown_clears_cache_and_blocks_use() {
        let container = container(Arc::new(MemoryBlobStore::new()));
        let security = container.resolve::<SecurityService>().await.unwrap();
        let crypto = container.resolve::<CryptoService>().await.unwrap();
        security
            .store_credential("main", &SecureBytes::from("pw"), "vault")
            .await
            .unwrap();

        container.shutdown_all().await.unwrap();

        assert!(security.credentials.lock().is_empty());
        assert!(!crypto.bridge().is_connected());
        let err = security.load_credential("main", "vault").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_with_resource_scopes_access() {
        let dir = tempfile::tempdir().unwrap();
        let container = container(Arc::new(MemoryBlobStore::new()));
        let security = container.resolve::<SecurityService>().await.unwrap();
        let ledger = container.resolve::<AccessLedger>().await.unwrap();

        let path = dir.path().to_path_buf();
        let seen_active = security
            .with_resource(&path, || async { Ok(ledger.is_accessing(&path)) })
            .await
            .unwrap();

        assert!(seen_active);
        assert!(!ledger.is_accessing(&path));
    }

    #[tokio::test]
    async fn test_operations_require_ready() {
        let proxy = Arc::new(XorProxy {
            connected: AtomicBool::new(true),
        });
        let crypto = CryptoService::new(SecurityBridge::new(proxy, BridgeConfig::new()));

        let err = crypto
            .encrypt(&SecureBytes::from("x"), "vault")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_crypto_initialize_fails_without_helper() {
        let proxy = Arc::new(XorProxy {
            connected: AtomicBool::new(false),
        });
        let crypto = CryptoService::new(SecurityBridge::new(proxy, BridgeConfig::new()));
        let container = ServiceContainer::new();

        let err = crypto
            .initialize(&Resolver::for_tests(&container))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Initialization { .. }));
        assert_eq!(crypto.state(), ServiceState::Uninitialized);
    }
}
