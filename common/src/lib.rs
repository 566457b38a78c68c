//! Umbra Common Library
//!
//! Shared building blocks for both sides of the security bridge: the
//! application process (`umbra-client`) and the privileged helper
//! (`umbra-helper`). It includes:
//!
//! - The closed [`ErrorKind`] taxonomy and its boundary mapping
//! - [`SecureBytes`] and the adapters to and from [`BoundaryData`]
//! - Protocol definitions for bridge requests and IPC envelopes
//! - Length-prefixed message framing over any byte stream
//! - Unix socket setup with peer credential extraction
//! - A TLS stream wrapper for mutually authenticated connections

/// Configuration defaults and environment overrides
pub mod config;

/// Error taxonomy and boundary error mapping
pub mod error;

/// Message framing over blocking byte streams
pub mod frame;

/// Unix socket listener/connector and peer credentials
pub mod platform_socket;

/// Bridge requests, responses and IPC envelopes
pub mod protocol;

/// Secure byte buffers and boundary adapters
pub mod secure_bytes;

/// TLS stream wrapper for encrypted IPC communication
pub mod tls_stream;

// Re-export commonly used types for convenience
pub use config::{AppCertPath, HelperCertPath, SOCKET_NAME};
pub use error::{ErrorKind, RemoteError, SecurityError};
pub use frame::{Duplex, FramedStream};
pub use platform_socket::{HelperListener, PeerCredentials};
pub use protocol::{BridgeRequest, BridgeResponse, IpcMessage, OperationKind};
pub use secure_bytes::{buffer_from_bytes, bytes_from_buffer, BoundaryData, SecureBytes};
pub use tls_stream::TlsStream;
