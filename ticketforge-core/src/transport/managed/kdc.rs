//! KDC exchange over TCP (RFC 4120 section 7.2.2).
//!
//! Each message is prefixed with its length as a 4-byte big-endian integer.
//! KDCs are tried in configured order until one answers.

use bytes::{BufMut, BytesMut};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

/// Replies larger than this are refused.
const MAX_REPLY_LEN: usize = 1 << 20;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for KDC traffic.
#[derive(Debug, Error)]
pub enum KdcError {
    /// The realm has no KDC configured.
    #[error("no KDC configured for realm {realm}")]
    NoKdc { realm: String },

    /// Every configured KDC failed.
    #[error("no KDC for realm {realm} answered: {message}")]
    Unreachable { realm: String, message: String },
}

/// Sends one request to a realm's KDCs and returns the raw reply.
pub trait KdcExchange: Send + 'static {
    fn exchange(
        &self,
        realm: &str,
        kdcs: &[(String, u16)],
        request: &[u8],
    ) -> Result<Vec<u8>, KdcError>;

    /// Bound for connect, read and write.
    fn set_timeout(&mut self, _timeout: Duration) {}
}

/// Blocking TCP transport to the KDC.
#[derive(Debug, Clone)]
pub struct TcpKdc {
    timeout: Duration,
}

impl TcpKdc {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn exchange_one(&self, host: &str, port: u16, request: &[u8]) -> Result<Vec<u8>, String> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| format!("{}:{}: {}", host, port, e))?;

        let mut last_error = format!("{}:{}: no addresses", host, port);
        for addr in addrs {
            let mut stream = match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => stream,
                Err(e) => {
                    last_error = format!("{}: {}", addr, e);
                    continue;
                }
            };
            return self
                .round_trip(&mut stream, request)
                .map_err(|e| format!("{}: {}", addr, e));
        }
        Err(last_error)
    }

    fn round_trip(&self, stream: &mut TcpStream, request: &[u8]) -> std::io::Result<Vec<u8>> {
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;

        stream.write_all(&frame(request))?;
        stream.flush()?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf);
        if len & 0x8000_0000 != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "reserved length bit set",
            ));
        }
        let len = len as usize;
        if len > MAX_REPLY_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("reply of {} bytes exceeds limit", len),
            ));
        }

        let mut reply = vec![0u8; len];
        stream.read_exact(&mut reply)?;
        Ok(reply)
    }
}

impl Default for TcpKdc {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl KdcExchange for TcpKdc {
    fn exchange(
        &self,
        realm: &str,
        kdcs: &[(String, u16)],
        request: &[u8],
    ) -> Result<Vec<u8>, KdcError> {
        if kdcs.is_empty() {
            return Err(KdcError::NoKdc {
                realm: realm.to_string(),
            });
        }

        let mut failures = Vec::new();
        for (host, port) in kdcs {
            match self.exchange_one(host, *port, request) {
                Ok(reply) => return Ok(reply),
                Err(e) => failures.push(e),
            }
        }

        Err(KdcError::Unreachable {
            realm: realm.to_string(),
            message: failures.join("; "),
        })
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

/// Length-prefix a message for TCP.
pub fn frame(message: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + message.len());
    buf.put_u32(message.len() as u32);
    buf.put_slice(message);
    buf
}
