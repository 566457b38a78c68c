use std::io::{self, Read, Write};

use anyhow::Result;
use rustls::{ClientConnection, Connection, ServerConnection};

/// Synchronous TLS wrapper over any blocking byte stream
pub struct TlsStream<S: Read + Write> {
    socket: S,
    tls:    Connection,
}

impl<S: Read + Write> TlsStream<S> {
    /// Wrap the helper side of a connection and complete the handshake
    pub fn from_server(socket: S, tls: ServerConnection) -> Result<Self> {
        let mut stream = Self {
            socket,
            tls: Connection::Server(tls),
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    /// Wrap the application side of a connection and complete the handshake
    pub fn from_client(socket: S, tls: ClientConnection) -> Result<Self> {
        let mut stream = Self {
            socket,
            tls: Connection::Client(tls),
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    /// Borrow the underlying stream
    pub fn get_ref(&self) -> &S {
        &self.socket
    }

    fn complete_handshake(&mut self) -> Result<()> {
        while self.tls.is_handshaking() {
            if self.tls.wants_write() {
                self.tls.write_tls(&mut self.socket)?;
            }
            if self.tls.wants_read() {
                if self.tls.read_tls(&mut self.socket)? == 0 {
                    return Err(anyhow::anyhow!("Connection closed during TLS handshake"));
                }
                self.tls
                    .process_new_packets()
                    .map_err(|e| anyhow::anyhow!("TLS handshake error: {}", e))?;
            }
        }
        Ok(())
    }
}

impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if !self.tls.wants_read() {
                return Ok(0);
            }

            if self.tls.read_tls(&mut self.socket)? == 0 {
                return Ok(0);
            }
            self.tls
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
    }
}

impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.tls.writer().write(buf)?;

        while self.tls.wants_write() {
            if let Err(e) = self.tls.write_tls(&mut self.socket) {
                if e.kind() != io::ErrorKind::WouldBlock {
                    return Err(e);
                }
                break;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tls.writer().flush()?;

        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.socket) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        self.socket.flush()
    }
}
