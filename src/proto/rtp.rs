//! RTP framing: packs/unpacks datagrams as encrypted RTPv2 packets and keeps
//! the per-SSRC destination table (timestamp, payload type, learned peer).
//!
//! Wire layout of one packet: `header(12) ‖ ciphertext(L) ‖ nonce(12) ‖
//! tag(16)`, so on-wire size is always `L + 40`. The header's bit-packed
//! first two bytes are serialized with explicit byte masks rather than a
//! `#[repr(C)]` struct, since the bit-field layout C compilers choose for
//! `u8:4`-style fields is not portable.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::SocketAddr;

use rand::random;

use crate::constants::{
    NONCE_LEN, OVERHEAD, RTP_HEADER_LEN, RTP_MAX_PAYLOAD_SIZE, RTP_PAYLOAD_TYPE,
    RTP_TIMESTAMP_INCREMENT, RTP_VERSION, TAG_LEN, UDP_MTU,
};
use crate::crypto::{Cipher, KeyError};
use crate::proto::udp::{EndpointError, UdpEndpoint};

/// Whether an [`RtpSocket`] has a single remembered peer or accepts/learns
/// many peers keyed by SSRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Connected,
    Listening,
}

/// Per-SSRC destination state: where to send, and the send-side RTP clock.
struct Dest {
    peer: Option<SocketAddr>,
    timestamp: u32,
    payload_type: u8,
}

/// An RTP-framed, AEAD-encrypted UDP socket.
pub struct RtpSocket {
    endpoint: UdpEndpoint,
    cipher: Cipher,
    seq_num: u16,
    dest_map: HashMap<u32, Dest>,
    mode: Mode,
}

impl RtpSocket {
    /// Opens a connected endpoint to a single peer. Sends use the
    /// endpoint's remembered remote address.
    pub async fn connect(addr: &str, port: u16, key: &str) -> Result<RtpSocket, RtpError> {
        let endpoint = UdpEndpoint::connect(addr, port)
            .await
            .map_err(RtpError::Endpoint)?;
        let cipher = Cipher::init(key).map_err(RtpError::Key)?;

        Ok(RtpSocket {
            endpoint,
            cipher,
            seq_num: random(),
            dest_map: HashMap::new(),
            mode: Mode::Connected,
        })
    }

    /// Opens a listening endpoint. Sends go via `sendto` to per-SSRC
    /// addresses learned from inbound traffic.
    pub async fn listen(addr: &str, port: u16, key: &str) -> Result<RtpSocket, RtpError> {
        let endpoint = UdpEndpoint::listen(addr, port)
            .await
            .map_err(RtpError::Endpoint)?;
        let cipher = Cipher::init(key).map_err(RtpError::Key)?;

        Ok(RtpSocket {
            endpoint,
            cipher,
            seq_num: random(),
            dest_map: HashMap::new(),
            mode: Mode::Listening,
        })
    }

    /// Encrypts and sends `data` tagged with `ssrc`.
    ///
    /// In listening mode, fails with [`RtpError::NoDestination`] if no peer
    /// has been learned yet for this SSRC.
    pub fn send(&mut self, data: &[u8], ssrc: u32) -> Result<(), RtpError> {
        if data.len() > RTP_MAX_PAYLOAD_SIZE {
            return Err(RtpError::TooLarge(data.len()));
        }

        let (payload_type, timestamp, target) = match self.mode {
            Mode::Connected => {
                let dest = self.dest_map.entry(ssrc).or_insert_with(|| Dest {
                    peer: None,
                    timestamp: random(),
                    payload_type: RTP_PAYLOAD_TYPE,
                });
                let (pt, ts) = (dest.payload_type, dest.timestamp);
                dest.timestamp = dest.timestamp.wrapping_add(RTP_TIMESTAMP_INCREMENT);
                (pt, ts, None)
            }
            Mode::Listening => {
                let dest = self.dest_map.get_mut(&ssrc).ok_or(RtpError::NoDestination)?;
                let (pt, ts) = (dest.payload_type, dest.timestamp);
                let peer = dest.peer.expect("listening-mode dest always has a learned peer");
                dest.timestamp = dest.timestamp.wrapping_add(RTP_TIMESTAMP_INCREMENT);
                (pt, ts, Some(peer))
            }
        };

        let (ciphertext, tag, nonce) = self.cipher.encrypt(data);

        let mut buf = Vec::with_capacity(RTP_HEADER_LEN + ciphertext.len() + NONCE_LEN + TAG_LEN);
        buf.resize(RTP_HEADER_LEN, 0);
        encode_header(&mut buf, payload_type, self.seq_num, timestamp, ssrc);
        buf.extend_from_slice(&ciphertext);
        buf.extend_from_slice(&nonce);
        buf.extend_from_slice(&tag);

        self.seq_num = self.seq_num.wrapping_add(1);

        match target {
            Some(addr) => self.endpoint.sendto(&buf, addr),
            None => self.endpoint.send(&buf),
        }
        .map_err(RtpError::Endpoint)
    }

    /// Receives one packet, decrypting and validating it. Malformed or
    /// unauthenticated datagrams are dropped silently (logged at debug) and
    /// do not surface as an error; only a transport-level I/O error does.
    pub async fn recv(&mut self) -> Result<(Vec<u8>, u32), RtpError> {
        let mut buf = vec![0u8; UDP_MTU];

        loop {
            let (n, from) = self.endpoint.recv(&mut buf).await.map_err(RtpError::Io)?;

            if n <= OVERHEAD {
                log::debug!("received packet with invalid size ({} bytes)", n);
                continue;
            }

            let header = match decode_header(&buf[..n]) {
                Some(header) if header.version == RTP_VERSION => header,
                _ => {
                    log::debug!("received packet with invalid RTP version");
                    continue;
                }
            };

            let ciphertext_len = n - OVERHEAD;
            let ciphertext = &buf[RTP_HEADER_LEN..RTP_HEADER_LEN + ciphertext_len];

            let nonce_start = RTP_HEADER_LEN + ciphertext_len;
            let nonce: [u8; NONCE_LEN] = buf[nonce_start..nonce_start + NONCE_LEN]
                .try_into()
                .expect("slice is exactly NONCE_LEN bytes");

            let tag_start = nonce_start + NONCE_LEN;
            let tag: [u8; TAG_LEN] = buf[tag_start..tag_start + TAG_LEN]
                .try_into()
                .expect("slice is exactly TAG_LEN bytes");

            let plaintext = match self.cipher.decrypt(ciphertext, &tag, &nonce) {
                Ok(plaintext) => plaintext,
                Err(_) => {
                    log::debug!("AEAD authentication failed for SSRC #{}", header.ssrc);
                    continue;
                }
            };

            if self.mode == Mode::Listening {
                self.learn(header.ssrc, from, header.payload_type);
            }

            return Ok((plaintext, header.ssrc));
        }
    }

    /// Removes the destination record for `ssrc`, if any.
    pub fn close_stream(&mut self, ssrc: u32) {
        self.dest_map.remove(&ssrc);
    }

    /// Picks a 32-bit value not currently present in the destination table.
    pub fn random_ssrc(&self) -> u32 {
        loop {
            let candidate = random();
            if !self.dest_map.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// `true` while a send is buffered waiting for write readiness.
    pub fn has_pending(&self) -> bool {
        self.endpoint.has_pending()
    }

    /// Resolves once the underlying socket is writable.
    pub async fn writable(&self) -> io::Result<()> {
        self.endpoint.writable().await
    }

    /// Flushes a pending send, if any.
    pub fn flush(&mut self) {
        self.endpoint.flush();
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Learns (or re-learns) the peer address for an inbound SSRC.
    ///
    /// If the address is unchanged from what's on file, nothing happens. If
    /// it differs, the destination record is replaced outright: a fresh
    /// random timestamp and the payload type from the current packet. This
    /// is what lets an SSRC survive a NAT rebind, at the cost of resetting
    /// its send-side RTP clock.
    fn learn(&mut self, ssrc: u32, from: SocketAddr, payload_type: u8) {
        if let Some(dest) = self.dest_map.get(&ssrc) {
            if dest.peer == Some(from) {
                return;
            }
        }

        self.dest_map.insert(
            ssrc,
            Dest {
                peer: Some(from),
                timestamp: random(),
                payload_type,
            },
        );
    }
}

/// Decoded fixed RTP header fields we care about.
struct Header {
    version: u8,
    payload_type: u8,
    ssrc: u32,
}

/// Serializes the fixed RTPv2 header: V=2, P=0, X=0, CC=0, M=0.
fn encode_header(buf: &mut [u8], payload_type: u8, seq: u16, timestamp: u32, ssrc: u32) {
    debug_assert!(buf.len() >= RTP_HEADER_LEN);

    buf[0] = (RTP_VERSION << 6) & 0xC0;
    buf[1] = payload_type & 0x7F;
    buf[2..4].copy_from_slice(&seq.to_be_bytes());
    buf[4..8].copy_from_slice(&timestamp.to_be_bytes());
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
}

fn decode_header(buf: &[u8]) -> Option<Header> {
    if buf.len() < RTP_HEADER_LEN {
        return None;
    }

    Some(Header {
        version: (buf[0] >> 6) & 0x03,
        payload_type: buf[1] & 0x7F,
        ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
    })
}

/// Errors from RTP socket construction or send.
#[derive(Debug)]
pub enum RtpError {
    Endpoint(EndpointError),
    Key(KeyError),
    TooLarge(usize),
    NoDestination,
    Io(io::Error),
}

impl Display for RtpError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            RtpError::Endpoint(err) => Display::fmt(err, f),
            RtpError::Key(err) => Display::fmt(err, f),
            RtpError::TooLarge(len) => {
                write!(f, "payload of {} bytes exceeds maximum RTP payload size", len)
            }
            RtpError::NoDestination => f.write_str("no learned peer for this SSRC yet"),
            RtpError::Io(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for RtpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RtpError::Endpoint(err) => Some(err),
            RtpError::Key(err) => Some(err),
            RtpError::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_version_and_fields() {
        let mut buf = [0u8; RTP_HEADER_LEN];
        encode_header(&mut buf, 97, 0x1234, 0xDEADBEEF, 0xCAFEBABE);

        // version bits occupy the top two bits of byte 0
        assert_eq!(buf[0] >> 6, 0b10);

        let header = decode_header(&buf).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.payload_type, 97);
        assert_eq!(header.ssrc, 0xCAFEBABE);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 0x1234);
        assert_eq!(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]), 0xDEADBEEF);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(decode_header(&[0x80, 0x61]).is_none());
    }

    #[tokio::test]
    async fn send_recv_roundtrip_between_connected_sockets() {
        let key = Cipher::gen_key();

        let mut server = RtpSocket::listen("127.0.0.1", 0, &key).await.unwrap();
        let server_port = server.endpoint.local_addr().unwrap().port();

        let mut client = RtpSocket::connect("127.0.0.1", server_port, &key).await.unwrap();

        let ssrc = client.random_ssrc();
        client.send(b"HELLO", ssrc).unwrap();

        let (data, recv_ssrc) = server.recv().await.unwrap();
        assert_eq!(data, b"HELLO");
        assert_eq!(recv_ssrc, ssrc);

        // server learned the client's address and can now reply
        server.send(b"WORLD", ssrc).unwrap();
        let (reply, reply_ssrc) = client.recv().await.unwrap();
        assert_eq!(reply, b"WORLD");
        assert_eq!(reply_ssrc, ssrc);
    }

    #[tokio::test]
    async fn listening_send_without_learned_peer_fails() {
        let key = Cipher::gen_key();
        let mut server = RtpSocket::listen("127.0.0.1", 0, &key).await.unwrap();

        assert!(matches!(
            server.send(b"x", 0x1234),
            Err(RtpError::NoDestination)
        ));
    }

    #[tokio::test]
    async fn mismatched_keys_fail_authentication_and_nothing_is_delivered() {
        let key_a = Cipher::gen_key();
        let key_b = Cipher::gen_key();

        let mut server = RtpSocket::listen("127.0.0.1", 0, &key_a).await.unwrap();
        let server_port = server.endpoint.local_addr().unwrap().port();

        let mut client = RtpSocket::connect("127.0.0.1", server_port, &key_b).await.unwrap();
        let ssrc = client.random_ssrc();
        client.send(b"HELLO", ssrc).unwrap();

        // the malformed/unauthenticated datagram is dropped silently, so a
        // well-formed follow-up is what actually gets delivered.
        client.send(b"SECOND", ssrc).unwrap();

        // swap in the right key for a second client purely to prove the
        // first datagram really is gone rather than merely delayed: a
        // fresh send from here is what arrives, nothing from key_b.
        let mut good_client = RtpSocket::connect("127.0.0.1", server_port, &key_a)
            .await
            .unwrap();
        let good_ssrc = good_client.random_ssrc();
        good_client.send(b"THIRD", good_ssrc).unwrap();

        let (data, recv_ssrc) = server.recv().await.unwrap();
        assert_eq!(data, b"THIRD");
        assert_eq!(recv_ssrc, good_ssrc);
    }

    #[tokio::test]
    async fn send_accepts_max_payload_and_rejects_one_byte_more() {
        let key = Cipher::gen_key();
        let mut client = RtpSocket::connect("127.0.0.1", 0, &key).await.unwrap();
        let ssrc = client.random_ssrc();

        let max_payload = vec![0u8; RTP_MAX_PAYLOAD_SIZE];
        let seq_before = client.seq_num;
        let timestamp_before = client.dest_map.get(&ssrc).map(|d| d.timestamp);
        assert!(client.send(&max_payload, ssrc).is_ok());
        assert_eq!(client.seq_num, seq_before.wrapping_add(1));
        assert_ne!(timestamp_before, client.dest_map.get(&ssrc).map(|d| d.timestamp));

        let seq_before = client.seq_num;
        let timestamp_before = client.dest_map.get(&ssrc).map(|d| d.timestamp);
        let over_payload = vec![0u8; RTP_MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            client.send(&over_payload, ssrc),
            Err(RtpError::TooLarge(len)) if len == RTP_MAX_PAYLOAD_SIZE + 1
        ));
        // a rejected send must not advance any socket or dest-record state
        assert_eq!(client.seq_num, seq_before);
        assert_eq!(timestamp_before, client.dest_map.get(&ssrc).map(|d| d.timestamp));
    }
}
