use std::sync::Arc;

use umbra_common::{
    protocol::{
        MAX_RANDOM_LEN, META_ALGORITHM, META_FORMAT, META_KEY_TYPE, META_LENGTH, META_SIGNATURE,
    },
    BoundaryData, BridgeRequest, BridgeResponse, OperationKind, SecurityError,
};

use crate::{
    crypto::{self, CryptoError, HashAlgorithm},
    keystore::{KeyMaterial, KeyStore, KeyType},
};

/// Executes bridge requests against the helper's key store.
///
/// Every operation validates its inputs before touching the store, so a
/// failed request never leaves a partial mutation behind.
#[derive(Clone, Default)]
pub struct RequestHandler {
    keys: Arc<KeyStore>,
}

impl RequestHandler {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self { keys }
    }

    /// Key store backing this handler
    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Run one request and encode the outcome for the boundary
    pub fn handle(&self, request: &BridgeRequest) -> BridgeResponse {
        let result = self.dispatch(request);
        if let Err(err) = &result {
            tracing::debug!(operation = %request.operation, kind = %err.kind, "Operation failed: {}", err.description);
        }
        BridgeResponse::from(result)
    }

    fn dispatch(&self, request: &BridgeRequest) -> Result<BoundaryData, SecurityError> {
        let payload = request.payload.as_bytes();

        match request.operation {
            OperationKind::Encrypt => {
                let id = required_key(request)?;
                self.keys.with_key(id, |material| match material {
                    KeyMaterial::Symmetric(key) => Ok(crypto::encrypt(key, payload)?.into()),
                    KeyMaterial::Signing(_) => Err(wrong_type(id, "symmetric")),
                })
            }
            OperationKind::Decrypt => {
                let id = required_key(request)?;
                self.keys.with_key(id, |material| match material {
                    KeyMaterial::Symmetric(key) => Ok(crypto::decrypt(key, payload)?.into()),
                    KeyMaterial::Signing(_) => Err(wrong_type(id, "symmetric")),
                })
            }
            OperationKind::Hash => {
                let algorithm = HashAlgorithm::parse(request.meta(META_ALGORITHM))?;
                Ok(crypto::hash(algorithm, payload).into())
            }
            OperationKind::Sign => {
                let id = required_key(request)?;
                self.keys.with_key(id, |material| match material {
                    KeyMaterial::Signing(key) => Ok(crypto::sign(key, payload).into()),
                    KeyMaterial::Symmetric(_) => Err(wrong_type(id, "signing")),
                })
            }
            OperationKind::Verify => {
                let id = required_key(request)?;
                let signature = request
                    .meta(META_SIGNATURE)
                    .ok_or_else(|| SecurityError::invalid_input("verify requires a signature"))
                    .and_then(|sig| {
                        hex::decode(sig).map_err(|e| {
                            SecurityError::invalid_input(format!("signature is not valid hex: {e}"))
                        })
                    })?;
                self.keys.with_key(id, |material| match material {
                    KeyMaterial::Signing(key) => {
                        let valid = crypto::verify(&key.verifying_key(), payload, &signature)?;
                        Ok(vec![u8::from(valid)].into())
                    }
                    KeyMaterial::Symmetric(_) => Err(wrong_type(id, "signing")),
                })
            }
            OperationKind::GenerateKey => {
                let key_type = KeyType::parse(request.meta(META_KEY_TYPE))?;
                let id = request
                    .key_identifier
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                self.keys.insert(&id, KeyMaterial::generate(key_type))?;
                tracing::info!(key = %id, ?key_type, "Generated key");
                Ok(BoundaryData::from(id.as_str()))
            }
            OperationKind::ExportKey => {
                let id = required_key(request)?;
                let public = match request.meta(META_FORMAT) {
                    None | Some("raw") => false,
                    Some("public") => true,
                    Some(other) => {
                        return Err(SecurityError::invalid_input(format!(
                            "unknown export format '{other}'"
                        )))
                    }
                };
                self.keys.with_key(id, |material| {
                    if public {
                        material
                            .public_bytes()
                            .map(BoundaryData::new)
                            .ok_or_else(|| wrong_type(id, "signing"))
                    } else {
                        Ok(umbra_common::buffer_from_bytes(&material.raw_bytes()))
                    }
                })
            }
            OperationKind::ImportKey => {
                let id = required_key(request)?;
                let key_type = KeyType::parse(request.meta(META_KEY_TYPE))?;
                let material = KeyMaterial::from_raw(key_type, payload)?;
                self.keys.insert(id, material)?;
                tracing::info!(key = %id, ?key_type, "Imported key");
                Ok(BoundaryData::empty())
            }
            OperationKind::DeleteKey => {
                let id = required_key(request)?;
                self.keys.remove(id)?;
                tracing::info!(key = %id, "Deleted key");
                Ok(BoundaryData::empty())
            }
            OperationKind::ListKeyIdentifiers => {
                let ids = self.keys.identifiers();
                let encoded = bincode::serialize(&ids)
                    .map_err(|e| SecurityError::internal(format!("failed to encode key list: {e}")))?;
                Ok(encoded.into())
            }
            OperationKind::GenerateRandomBytes => {
                let len: usize = request
                    .meta(META_LENGTH)
                    .ok_or_else(|| SecurityError::invalid_input("random generation requires a length"))?
                    .parse()
                    .map_err(|e| SecurityError::invalid_input(format!("invalid length: {e}")))?;
                if len > MAX_RANDOM_LEN {
                    return Err(SecurityError::invalid_input(format!(
                        "requested {len} random bytes, limit is {MAX_RANDOM_LEN}"
                    )));
                }
                Ok(crypto::random_bytes(len).into())
            }
        }
    }
}

fn required_key(request: &BridgeRequest) -> Result<&str, SecurityError> {
    request
        .key_identifier
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            SecurityError::invalid_input(format!("{} requires a key identifier", request.operation))
        })
}

fn wrong_type(id: &str, expected: &str) -> SecurityError {
    CryptoError::WrongKeyType(format!("key '{id}' is not a {expected} key")).into()
}

#[cfg(test)]
mod tests {
    use umbra_common::ErrorKind;

    use super::*;

    fn handler_with(id: &str, key_type: KeyType) -> RequestHandler {
        let handler = RequestHandler::default();
        handler
            .keys()
            .insert(id, KeyMaterial::generate(key_type))
            .unwrap();
        handler
    }

    fn run(handler: &RequestHandler, request: BridgeRequest) -> Result<BoundaryData, SecurityError> {
        handler.handle(&request).into_result()
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let handler = handler_with("vault", KeyType::Symmetric);

        let sealed = run(
            &handler,
            BridgeRequest::new(OperationKind::Encrypt)
                .with_key("vault")
                .with_payload("hello".into()),
        )
        .unwrap();
        let opened = run(
            &handler,
            BridgeRequest::new(OperationKind::Decrypt)
                .with_key("vault")
                .with_payload(sealed),
        )
        .unwrap();

        assert_eq!(opened.as_bytes(), b"hello");
    }

    #[test]
    fn test_missing_key_maps_to_key_not_found() {
        let handler = RequestHandler::default();
        let err = run(
            &handler,
            BridgeRequest::new(OperationKind::Encrypt)
                .with_key("ghost")
                .with_payload("x".into()),
        )
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::KeyNotFound);
    }

    #[test]
    fn test_bad_ciphertext_is_cryptographic_error() {
        let handler = handler_with("vault", KeyType::Symmetric);
        let err = run(
            &handler,
            BridgeRequest::new(OperationKind::Decrypt)
                .with_key("vault")
                .with_payload(BoundaryData::new(vec![0u8; 64])),
        )
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::CryptographicError);
    }

    #[test]
    fn test_verify_reports_mismatch_as_false() {
        let handler = handler_with("signer", KeyType::Signing);
        let signature = run(
            &handler,
            BridgeRequest::new(OperationKind::Sign)
                .with_key("signer")
                .with_payload("document".into()),
        )
        .unwrap();

        let verify = |message: &str| {
            run(
                &handler,
                BridgeRequest::new(OperationKind::Verify)
                    .with_key("signer")
                    .with_payload(message.into())
                    .with_meta(META_SIGNATURE, hex::encode(signature.as_bytes())),
            )
        };

        assert_eq!(verify("document").unwrap().as_bytes(), &[1]);
        assert_eq!(verify("forged").unwrap().as_bytes(), &[0]);
    }

    #[test]
    fn test_verify_without_signature_is_invalid_input() {
        let handler = handler_with("signer", KeyType::Signing);
        let err = run(
            &handler,
            BridgeRequest::new(OperationKind::Verify)
                .with_key("signer")
                .with_payload("document".into()),
        )
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn test_key_management_lifecycle() {
        let handler = RequestHandler::default();

        let id = run(
            &handler,
            BridgeRequest::new(OperationKind::GenerateKey).with_meta(META_KEY_TYPE, "signing"),
        )
        .unwrap()
        .to_utf8()
        .unwrap();

        let listed = run(&handler, BridgeRequest::new(OperationKind::ListKeyIdentifiers)).unwrap();
        let ids: Vec<String> = bincode::deserialize(listed.as_bytes()).unwrap();
        assert_eq!(ids, vec![id.clone()]);

        let public = run(
            &handler,
            BridgeRequest::new(OperationKind::ExportKey)
                .with_key(id.as_str())
                .with_meta(META_FORMAT, "public"),
        )
        .unwrap();
        assert_eq!(public.len(), 32);

        run(&handler, BridgeRequest::new(OperationKind::DeleteKey).with_key(id.as_str())).unwrap();
        assert!(handler.keys().is_empty());
    }

    #[test]
    fn test_failed_import_does_not_touch_store() {
        let handler = RequestHandler::default();
        let err = run(
            &handler,
            BridgeRequest::new(OperationKind::ImportKey)
                .with_key("short")
                .with_payload(BoundaryData::new(vec![1, 2, 3])),
        )
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert!(handler.keys().is_empty());
    }

    #[test]
    fn test_random_bytes_honours_length() {
        let handler = RequestHandler::default();
        for n in [0usize, 1, 16, 1024] {
            let bytes = run(
                &handler,
                BridgeRequest::new(OperationKind::GenerateRandomBytes)
                    .with_meta(META_LENGTH, n.to_string()),
            )
            .unwrap();
            assert_eq!(bytes.len(), n);
        }
    }

    #[test]
    fn test_unknown_hash_algorithm_is_not_implemented() {
        let handler = RequestHandler::default();
        let err = run(
            &handler,
            BridgeRequest::new(OperationKind::Hash)
                .with_payload("abc".into())
                .with_meta(META_ALGORITHM, "md5"),
        )
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::NotImplemented);
    }

    #[test]
    fn test_random_bytes_over_limit_is_invalid_input() {
        let handler = RequestHandler::default();
        let err = run(
            &handler,
            BridgeRequest::new(OperationKind::GenerateRandomBytes)
                .with_meta(META_LENGTH, (MAX_RANDOM_LEN + 1).to_string()),
        )
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn test_key_type_mismatch_is_invalid_input() {
        let handler = handler_with("vault", KeyType::Symmetric);
        let err = run(
            &handler,
            BridgeRequest::new(OperationKind::Sign)
                .with_key("vault")
                .with_payload("document".into()),
        )
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert!(err.description.starts_with("Key type mismatch"));
        assert!(err.description.contains("not a signing key"));
    }
}
