//! Wire-format and protocol constants.

/// Maximum size of a single UDP datagram we will ever send or accept.
pub const UDP_MTU: usize = 65_536;

/// Size of the fixed RTPv2 header (no CSRC list, no extension).
pub const RTP_HEADER_LEN: usize = 12;

/// Length of the AEAD nonce carried on the wire.
pub const NONCE_LEN: usize = 12;

/// Length of the Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;

/// Total framing overhead added to every payload: header + nonce + tag.
pub const OVERHEAD: usize = RTP_HEADER_LEN + NONCE_LEN + TAG_LEN;

/// Largest payload a single RTP packet can carry.
pub const RTP_MAX_PAYLOAD_SIZE: usize = UDP_MTU - OVERHEAD;

/// RTP version bits we emit and the only version we accept.
pub const RTP_VERSION: u8 = 2;

/// Dynamic payload type used for freshly allocated destinations.
pub const RTP_PAYLOAD_TYPE: u8 = 97;

/// Per-send timestamp increment (90 kHz clock, 30 fps).
pub const RTP_TIMESTAMP_INCREMENT: u32 = 3000;

/// Default idle-flow sweep interval, in seconds.
///
/// Flows survive between this and twice this long with no traffic.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default bind address for a server instance.
pub const DEFAULT_SERVER_LISTEN: &str = "::";

/// Default bind address for a client instance.
pub const DEFAULT_CLIENT_LISTEN: &str = "127.0.0.1";

/// Default forwarding destination address for a server instance.
pub const DEFAULT_DEST_ADDR: &str = "127.0.0.1";

/// Default server listen port, used when `-l` is omitted on `server`.
pub const DEFAULT_SERVER_PORT: u16 = 6942;
