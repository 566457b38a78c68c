//! # Crypto Engine
//!
//! Primitives the helper runs on behalf of the application.
//!
//! - **XChaCha20-Poly1305** for symmetric encryption. Output is
//!   `nonce (24 bytes) || ciphertext`, with a fresh random nonce per call.
//! - **SHA-256 / SHA-512** for hashing.
//! - **Ed25519** for signatures.
//! - The OS CSPRNG for random bytes.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use umbra_common::{ErrorKind, SecurityError};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;
/// XChaCha20 nonce length in bytes
pub const NONCE_LEN: usize = 24;
/// Ed25519 signature length in bytes
pub const SIGNATURE_LEN: usize = 64;

/// Cryptographic operation errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (wrong key, tampered or truncated ciphertext)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Invalid key length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes
        expected: usize,
        /// Actual key length in bytes
        actual:   usize,
    },

    /// Signature bytes could not be parsed
    #[error("Invalid signature format")]
    InvalidSignatureFormat,

    /// Key material has the wrong type for the operation
    #[error("Key type mismatch: {0}")]
    WrongKeyType(String),

    /// Unsupported algorithm name
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

impl From<CryptoError> for SecurityError {
    fn from(err: CryptoError) -> Self {
        let kind = match err {
            CryptoError::EncryptionFailed(_) | CryptoError::DecryptionFailed(_) => {
                ErrorKind::CryptographicError
            }
            CryptoError::InvalidKeyLength { .. }
            | CryptoError::InvalidSignatureFormat
            | CryptoError::WrongKeyType(_) => ErrorKind::InvalidInput,
            CryptoError::UnsupportedAlgorithm(_) => ErrorKind::NotImplemented,
        };
        SecurityError::new(kind, err.to_string())
    }
}

/// 256-bit symmetric key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build from raw bytes, checking the length
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            actual:   bytes.len(),
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Encrypt `plaintext`, returning `nonce || ciphertext`
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt `nonce || ciphertext` produced by [`encrypt`]
pub fn decrypt(key: &SymmetricKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::DecryptionFailed(format!(
            "sealed payload is {} bytes, shorter than the nonce",
            sealed.len()
        )));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Parse the `algorithm` metadata value; absent means SHA-256
    pub fn parse(name: Option<&str>) -> Result<Self, CryptoError> {
        match name.map(str::to_ascii_lowercase).as_deref() {
            None | Some("sha256") | Some("sha-256") => Ok(HashAlgorithm::Sha256),
            Some("sha512") | Some("sha-512") => Ok(HashAlgorithm::Sha512),
            Some(other) => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// One-shot digest
pub fn hash(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
    }
}

/// Generate a random Ed25519 signing key
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Build a signing key from its 32-byte seed
pub fn signing_key_from_seed(seed: &[u8]) -> Result<SigningKey, CryptoError> {
    let seed: [u8; KEY_LEN] = seed.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LEN,
        actual:   seed.len(),
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Sign a message (deterministic)
pub fn sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    key.sign(message).to_bytes().to_vec()
}

/// Verify a signature.
///
/// `Ok(false)` means the signature was checked and does not match;
/// `Err` means the signature bytes could not be checked at all.
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignatureFormat);
    }
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignatureFormat)?;
    Ok(key.verify(message, &signature).is_ok())
}

/// Fill a buffer of `len` bytes from the OS CSPRNG
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SymmetricKey::generate();
        let plaintext = b"repository password";

        let sealed = encrypt(&key, plaintext).unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + plaintext.len() + 16);
        assert_eq!(decrypt(&key, &sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt(&SymmetricKey::generate(), b"secret").unwrap();
        let result = decrypt(&SymmetricKey::generate(), &sealed);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = SymmetricKey::generate();
        let mut sealed = encrypt(&key, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;

        assert!(decrypt(&key, &sealed).is_err());
    }

    #[test]
    fn test_truncated_payload_fails() {
        let key = SymmetricKey::generate();
        assert!(decrypt(&key, &[0u8; 5]).is_err());
    }

    #[test]
    fn test_hash_lengths() {
        assert_eq!(hash(HashAlgorithm::Sha256, b"abc").len(), 32);
        assert_eq!(hash(HashAlgorithm::Sha512, b"abc").len(), 64);
        assert_eq!(
            hex::encode(hash(HashAlgorithm::Sha256, b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_unknown_algorithm_is_rejected() {
        assert!(matches!(
            HashAlgorithm::parse(Some("md5")),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));
        assert_eq!(HashAlgorithm::parse(None).unwrap(), HashAlgorithm::Sha256);
    }

    #[test]
    fn test_sign_verify() {
        let key = generate_signing_key();
        let signature = sign(&key, b"message");
        assert_eq!(signature.len(), SIGNATURE_LEN);

        assert!(verify(&key.verifying_key(), b"message", &signature).unwrap());
        assert!(!verify(&key.verifying_key(), b"other message", &signature).unwrap());
    }

    #[test]
    fn test_malformed_signature_is_an_error() {
        let key = generate_signing_key();
        assert!(matches!(
            verify(&key.verifying_key(), b"m", &[1, 2, 3]),
            Err(CryptoError::InvalidSignatureFormat)
        ));
    }

    #[test]
    fn test_random_bytes_length() {
        for n in [0, 1, 16, 1024] {
            assert_eq!(random_bytes(n).len(), n);
        }
    }
}
