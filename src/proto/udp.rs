//! Non-blocking UDP endpoint with a single-slot outbound backpressure buffer.
//!
//! An endpoint is "connected" when it remembers a single remote address
//! (datagrams from any other source are silently dropped) or "listening"
//! when it accepts datagrams from anyone and sends only via explicit
//! [`UdpEndpoint::sendto`]. Either way, at most one outbound datagram is ever
//! buffered: a second `send`/`sendto` while one is already pending overwrites
//! it and logs a warning. This is a lossy tunnel by design.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{lookup_host, UdpSocket};

use crate::constants::UDP_MTU;

/// A single buffered outbound datagram, held while the socket is unwritable.
struct Pending {
    data: Vec<u8>,
    addr: SocketAddr,
}

/// A non-blocking UDP socket in either connected or listening mode.
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    remote: Option<SocketAddr>,
    pending: Option<Pending>,
}

impl UdpEndpoint {
    /// Binds a listening endpoint that accepts datagrams from any source.
    pub async fn listen(addr: &str, port: u16) -> Result<UdpEndpoint, EndpointError> {
        let local = resolve(addr, port).await?;
        let socket = UdpSocket::bind(local).await.map_err(EndpointError::Socket)?;

        Ok(UdpEndpoint {
            socket: Arc::new(socket),
            remote: None,
            pending: None,
        })
    }

    /// Binds an endpoint to a single remembered remote address. No OS-level
    /// `connect()` is issued; instead, datagrams whose source does not match
    /// `addr:port` are silently dropped in [`UdpEndpoint::recv`].
    pub async fn connect(addr: &str, port: u16) -> Result<UdpEndpoint, EndpointError> {
        let remote = resolve(addr, port).await?;

        let bind_any = match remote {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let socket = UdpSocket::bind(bind_any).await.map_err(EndpointError::Socket)?;

        Ok(UdpEndpoint {
            socket: Arc::new(socket),
            remote: Some(remote),
            pending: None,
        })
    }

    /// Sends to the remembered remote address.
    ///
    /// Fails if this endpoint was never connected to a remote.
    pub fn send(&mut self, data: &[u8]) -> Result<(), EndpointError> {
        let remote = self.remote.ok_or(EndpointError::NotConnected)?;
        self.sendto(data, remote)
    }

    /// Sends to an explicit address, regardless of connection mode.
    pub fn sendto(&mut self, data: &[u8], addr: SocketAddr) -> Result<(), EndpointError> {
        if data.len() > UDP_MTU {
            return Err(EndpointError::TooLarge(data.len()));
        }

        match self.socket.try_send_to(data, addr) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if self.pending.is_some() {
                    log::warn!("UDP send buffer overrun, dropping previous datagram");
                }
                self.pending = Some(Pending {
                    data: data.to_vec(),
                    addr,
                });
                Ok(())
            }
            Err(err) => {
                log::warn!("sendto() failed: {}", err);
                Ok(())
            }
        }
    }

    /// `true` while a datagram is buffered waiting for write readiness.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolves once the socket is writable. Only meaningful (and only ever
    /// awaited by callers) while [`UdpEndpoint::has_pending`] is true.
    pub async fn writable(&self) -> io::Result<()> {
        self.socket.writable().await
    }

    /// Attempts the buffered datagram exactly once and clears the slot
    /// unconditionally, returning the number of bytes sent on success.
    pub fn flush(&mut self) -> Option<usize> {
        let pending = self.pending.take()?;

        match self.socket.try_send_to(&pending.data, pending.addr) {
            Ok(sent) => Some(sent),
            Err(err) => {
                log::warn!("sendto() failed: {}", err);
                None
            }
        }
    }

    /// Receives one datagram, filtering out any source that does not match
    /// the remembered remote when connected.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let (n, from) = self.socket.recv_from(buf).await?;

            if let Some(remote) = self.remote {
                if from != remote {
                    log::debug!("dropping packet from non-connected party {}", from);
                    continue;
                }
            }

            return Ok((n, from));
        }
    }

    /// A cheap handle to the underlying socket, for spawning an independent
    /// reader task (used for the server's per-flow outbound endpoints).
    pub fn socket_handle(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// The remembered remote address, if any.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Resolves `addr:port`, preferring the numeric-IP fast path over DNS.
async fn resolve(addr: &str, port: u16) -> Result<SocketAddr, EndpointError> {
    if let Ok(ip) = addr.parse() {
        return Ok(SocketAddr::new(ip, port));
    }

    lookup_host((addr, port))
        .await
        .map_err(EndpointError::Resolve)?
        .next()
        .ok_or_else(|| EndpointError::Resolve(io::Error::new(io::ErrorKind::NotFound, "no addresses")))
}

/// Errors from endpoint construction or send.
#[derive(Debug)]
pub enum EndpointError {
    Resolve(io::Error),
    Socket(io::Error),
    NotConnected,
    TooLarge(usize),
}

impl Display for EndpointError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            EndpointError::Resolve(err) => write!(f, "failed to resolve address: {}", err),
            EndpointError::Socket(err) => write!(f, "socket error: {}", err),
            EndpointError::NotConnected => f.write_str("socket not connected"),
            EndpointError::TooLarge(len) => {
                write!(f, "datagram of {} bytes exceeds maximum UDP size", len)
            }
        }
    }
}

impl std::error::Error for EndpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EndpointError::Resolve(err) | EndpointError::Socket(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listen_then_connect_roundtrip() {
        let mut listener = UdpEndpoint::listen("127.0.0.1", 0).await.unwrap();
        let listen_addr = listener.local_addr().unwrap();

        let mut client = UdpEndpoint::connect("127.0.0.1", listen_addr.port())
            .await
            .unwrap();

        client.send(b"hello").unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = listener.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        listener.sendto(b"world", from).unwrap();

        let mut buf2 = [0u8; 64];
        let (n2, _) = client.recv(&mut buf2).await.unwrap();
        assert_eq!(&buf2[..n2], b"world");
    }

    #[tokio::test]
    async fn sendto_rejects_oversized_datagram() {
        let mut endpoint = UdpEndpoint::listen("127.0.0.1", 0).await.unwrap();
        let target = endpoint.local_addr().unwrap();

        let data = vec![0u8; UDP_MTU + 1];
        assert!(matches!(
            endpoint.sendto(&data, target),
            Err(EndpointError::TooLarge(_))
        ));
        assert!(!endpoint.has_pending());
    }

    #[tokio::test]
    async fn send_without_connect_fails() {
        let mut endpoint = UdpEndpoint::listen("127.0.0.1", 0).await.unwrap();
        assert!(matches!(endpoint.send(b"x"), Err(EndpointError::NotConnected)));
    }
}
