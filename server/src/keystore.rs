use std::collections::HashMap;

use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use umbra_common::{SecureBytes, SecurityError};

use crate::crypto::{self, SymmetricKey};

/// Kind of key material held under an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyType {
    /// XChaCha20-Poly1305 key
    #[default]
    Symmetric,
    /// Ed25519 signing key
    Signing,
}

impl KeyType {
    /// Parse the `key_type` metadata value; absent means symmetric
    pub fn parse(name: Option<&str>) -> Result<Self, SecurityError> {
        match name {
            None | Some("symmetric") => Ok(KeyType::Symmetric),
            Some("signing") | Some("ed25519") => Ok(KeyType::Signing),
            Some(other) => Err(SecurityError::invalid_input(format!("unknown key type '{other}'"))),
        }
    }
}

/// Key material, zeroized when dropped
pub enum KeyMaterial {
    Symmetric(SymmetricKey),
    Signing(SigningKey),
}

impl KeyMaterial {
    /// Fresh random material of the given type
    pub fn generate(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Symmetric => KeyMaterial::Symmetric(SymmetricKey::generate()),
            KeyType::Signing => KeyMaterial::Signing(crypto::generate_signing_key()),
        }
    }

    /// Material from raw bytes (symmetric key or Ed25519 seed)
    pub fn from_raw(key_type: KeyType, raw: &[u8]) -> Result<Self, SecurityError> {
        Ok(match key_type {
            KeyType::Symmetric => KeyMaterial::Symmetric(SymmetricKey::from_slice(raw)?),
            KeyType::Signing => KeyMaterial::Signing(crypto::signing_key_from_seed(raw)?),
        })
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            KeyMaterial::Symmetric(_) => KeyType::Symmetric,
            KeyMaterial::Signing(_) => KeyType::Signing,
        }
    }

    /// Raw secret bytes (symmetric key or Ed25519 seed)
    pub fn raw_bytes(&self) -> SecureBytes {
        match self {
            KeyMaterial::Symmetric(key) => SecureBytes::from_slice(key.as_bytes()),
            KeyMaterial::Signing(key) => SecureBytes::from_slice(key.as_bytes()),
        }
    }

    /// Public half, only defined for signing keys
    pub fn public_bytes(&self) -> Option<Vec<u8>> {
        match self {
            KeyMaterial::Symmetric(_) => None,
            KeyMaterial::Signing(key) => Some(key.verifying_key().to_bytes().to_vec()),
        }
    }
}

/// Identifier to key material mapping owned by the helper.
///
/// Every mutation either fully applies or leaves the store untouched.
#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<String, KeyMaterial>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert material under a new identifier. Existing identifiers are
    /// never overwritten.
    pub fn insert(&self, identifier: &str, material: KeyMaterial) -> Result<(), SecurityError> {
        if identifier.is_empty() {
            return Err(SecurityError::invalid_input("key identifier must not be empty"));
        }
        let mut keys = self.keys.write();
        if keys.contains_key(identifier) {
            return Err(SecurityError::invalid_input(format!(
                "a key with identifier '{identifier}' already exists"
            )));
        }
        keys.insert(identifier.to_string(), material);
        tracing::debug!(key = identifier, "Key stored");
        Ok(())
    }

    /// Run `f` against the material stored under `identifier`
    pub fn with_key<T>(
        &self,
        identifier: &str,
        f: impl FnOnce(&KeyMaterial) -> Result<T, SecurityError>,
    ) -> Result<T, SecurityError> {
        let keys = self.keys.read();
        let material = keys
            .get(identifier)
            .ok_or_else(|| SecurityError::key_not_found(identifier))?;
        f(material)
    }

    /// Remove and drop the material stored under `identifier`
    pub fn remove(&self, identifier: &str) -> Result<(), SecurityError> {
        match self.keys.write().remove(identifier) {
            Some(_) => {
                tracing::debug!(key = identifier, "Key deleted");
                Ok(())
            }
            None => Err(SecurityError::key_not_found(identifier)),
        }
    }

    /// Sorted list of stored identifiers
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.keys.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}
