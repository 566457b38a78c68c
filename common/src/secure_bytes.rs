//! Byte buffers on either side of the boundary.
//!
//! [`SecureBytes`] is the in-process representation of sensitive material: it
//! zeroes its storage when dropped and never prints its contents.
//! [`BoundaryData`] is what actually travels in a frame. The two adapter
//! functions are the only place one turns into the other.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Sensitive bytes, zeroed on drop
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecureBytes(Vec<u8>);

impl SecureBytes {
    /// Takes ownership of `bytes`
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Copies `bytes` into a new buffer
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Buffer of `len` zero bytes
    pub fn zeroed(len: usize) -> Self {
        Self(vec![0u8; len])
    }

    /// Borrow the contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Mutable access to the contents
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes({} bytes, redacted)", self.0.len())
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for SecureBytes {
    fn from(bytes: &[u8]) -> Self {
        Self::from_slice(bytes)
    }
}

impl From<&str> for SecureBytes {
    fn from(text: &str) -> Self {
        Self::from_slice(text.as_bytes())
    }
}

impl AsRef<[u8]> for SecureBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Payload bytes in their boundary representation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryData(Vec<u8>);

impl BoundaryData {
    /// Wraps raw bytes for transport
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Empty payload
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Unwraps into the inner vector
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    /// Interprets the payload as UTF-8 text
    pub fn to_utf8(&self) -> Option<String> {
        std::str::from_utf8(&self.0).ok().map(str::to_owned)
    }
}

impl From<Vec<u8>> for BoundaryData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&str> for BoundaryData {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}

/// Converts a local secure buffer into its boundary representation
pub fn buffer_from_bytes(bytes: &SecureBytes) -> BoundaryData {
    BoundaryData(bytes.as_bytes().to_vec())
}

/// Converts a boundary payload back into a local secure buffer. The boundary
/// copy is zeroed once its contents have moved.
pub fn bytes_from_buffer(mut buffer: BoundaryData) -> SecureBytes {
    let bytes = SecureBytes::from_slice(&buffer.0);
    buffer.0.zeroize();
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_bytes() {
        for sample in [vec![], vec![0u8], b"correct horse battery staple".to_vec(), vec![0xff; 4096]] {
            let local = SecureBytes::new(sample.clone());
            let back = bytes_from_buffer(buffer_from_bytes(&local));
            assert_eq!(back.as_bytes(), sample.as_slice());
        }
    }

    #[test]
    fn test_debug_does_not_leak_contents() {
        let secret = SecureBytes::from("hunter2");
        let printed = format!("{secret:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("7 bytes"));
    }

    #[test]
    fn test_boundary_data_survives_bincode() {
        let data = BoundaryData::new(vec![1, 2, 3, 0, 255]);
        let encoded = bincode::serialize(&data).unwrap();
        let decoded: BoundaryData = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, data);
    }
}
