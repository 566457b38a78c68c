use std::io::{Read, Write};

use anyhow::{anyhow, Context, Result};

use crate::protocol::IpcMessage;

/// Largest frame either side will accept
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Byte stream that can carry framed messages in both directions
pub trait Duplex: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> Duplex for T {}

/// Length-prefixed bincode messages over any byte stream.
///
/// Each frame is a little-endian `u32` length followed by that many bytes of
/// a bincode encoded [`IpcMessage`].
pub trait FramedStream: Read + Write {
    /// Send an IPC message over the stream
    fn send_message(&mut self, msg: &IpcMessage) -> Result<()> {
        let serialized = bincode::serialize(msg).context("Failed to serialize message")?;
        if serialized.len() > MAX_FRAME_LEN {
            return Err(anyhow!("Message too large: {} bytes", serialized.len()));
        }
        let len = serialized.len() as u32;

        self.write_all(&len.to_le_bytes())
            .context("Failed to send message length")?;

        self.write_all(&serialized)
            .context("Failed to send message data")?;

        self.flush().context("Failed to flush stream")?;
        Ok(())
    }

    /// Receive an IPC message from the stream
    fn recv_message(&mut self) -> Result<IpcMessage> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf)
            .context("Failed to read message length")?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_FRAME_LEN {
            return Err(anyhow!("Message too large: {} bytes", len));
        }

        let mut msg_buf = vec![0u8; len];
        self.read_exact(&mut msg_buf)
            .context("Failed to read message data")?;

        let msg = bincode::deserialize(&msg_buf).context("Failed to deserialize message")?;
        Ok(msg)
    }
}

impl<T: Read + Write + ?Sized> FramedStream for T {}

/// Whether an error from [`FramedStream::recv_message`] means the peer went
/// away cleanly rather than something actually broke
pub fn is_disconnect(err: &anyhow::Error) -> bool {
    if let Some(io_err) = err.root_cause().downcast_ref::<std::io::Error>() {
        if matches!(
            io_err.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        ) {
            return true;
        }
    }
    err.to_string().contains("Connection closed")
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::protocol::{BridgeRequest, OperationKind};

    #[test]
    fn test_messages_cross_a_socket_pair() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        let request = BridgeRequest::new(OperationKind::ListKeyIdentifiers);
        a.send_message(&IpcMessage::Request { id: 7, request: request.clone() })
            .unwrap();

        match b.recv_message().unwrap() {
            IpcMessage::Request { id, request: got } => {
                assert_eq!(id, 7);
                assert_eq!(got, request);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        a.write_all(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes()).unwrap();

        let err = b.recv_message().unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_closed_peer_reads_as_disconnect() {
        let (a, mut b) = UnixStream::pair().unwrap();
        drop(a);

        let err = b.recv_message().unwrap_err();
        assert!(is_disconnect(&err));
    }
}
