use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    error::{RemoteError, SecurityError},
    secure_bytes::BoundaryData,
};

/// Metadata key selecting the hash algorithm (`sha256` or `sha512`)
pub const META_ALGORITHM: &str = "algorithm";
/// Metadata key carrying a hex encoded signature for verification
pub const META_SIGNATURE: &str = "signature";
/// Metadata key selecting the key type (`symmetric` or `signing`)
pub const META_KEY_TYPE: &str = "key_type";
/// Metadata key selecting the export format (`raw` or `public`)
pub const META_FORMAT: &str = "format";
/// Metadata key carrying the requested random byte count
pub const META_LENGTH: &str = "length";

/// Upper bound for a single random byte request, whichever side serves it
pub const MAX_RANDOM_LEN: usize = 64 * 1024;

/// Operations the helper executes on behalf of the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Encrypt,
    Decrypt,
    Hash,
    Sign,
    Verify,
    GenerateKey,
    ExportKey,
    ImportKey,
    DeleteKey,
    ListKeyIdentifiers,
    GenerateRandomBytes,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single security operation crossing the boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRequest {
    /// What to do
    pub operation:      OperationKind,
    /// Operation input
    pub payload:        BoundaryData,
    /// Key the operation acts on, if any
    pub key_identifier: Option<String>,
    /// Operation specific options, see the `META_*` constants
    pub metadata:       BTreeMap<String, String>,
}

impl BridgeRequest {
    /// Creates a request with an empty payload and no key
    pub fn new(operation: OperationKind) -> Self {
        Self {
            operation,
            payload: BoundaryData::empty(),
            key_identifier: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: BoundaryData) -> Self {
        self.payload = payload;
        self
    }

    /// Set the key identifier
    pub fn with_key<S: Into<String>>(mut self, key_identifier: S) -> Self {
        self.key_identifier = Some(key_identifier.into());
        self
    }

    /// Add a metadata entry
    pub fn with_meta<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Look up a metadata entry
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Outcome of a [`BridgeRequest`] in its boundary representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeResponse {
    /// Operation succeeded with this output
    Success(BoundaryData),
    /// Operation failed
    Failure(RemoteError),
}

impl BridgeResponse {
    /// Failure response built from a local error
    pub fn failure(err: SecurityError) -> Self {
        BridgeResponse::Failure(err.to_remote())
    }

    /// Maps into the uniform local result
    pub fn into_result(self) -> Result<BoundaryData, SecurityError> {
        match self {
            BridgeResponse::Success(data) => Ok(data),
            BridgeResponse::Failure(err) => Err(err.into_local()),
        }
    }
}

impl From<Result<BoundaryData, SecurityError>> for BridgeResponse {
    fn from(result: Result<BoundaryData, SecurityError>) -> Self {
        match result {
            Ok(data) => BridgeResponse::Success(data),
            Err(err) => BridgeResponse::failure(err),
        }
    }
}

/// Messages exchanged over IPC channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IpcMessage {
    /// Ping message to check connection health
    Ping,
    /// Pong response to ping
    Pong,
    /// Request carrying a security operation
    Request {
        /// Unique identifier for the request
        id:      u64,
        /// The operation to run
        request: BridgeRequest,
    },
    /// Response to a request
    Response {
        /// Unique identifier matching the request
        id:       u64,
        /// Operation outcome
        response: BridgeResponse,
    },
    /// Signal to shutdown the connection
    Shutdown,
}
