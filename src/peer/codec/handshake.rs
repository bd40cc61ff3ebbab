use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The full handshake: 1 length byte, the 19 byte protocol string, 8
/// reserved bytes, the 20 byte info hash and the 20 byte peer id.
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// The reserved-field bit advertising extension protocol support (BEP 10):
/// bit 0x10 of reserved byte 5 (zero indexed).
const EXTENSION_PROTOCOL_BYTE: usize = 5;
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;

/// The message sent at the beginning of a peer session by both sides of the
/// connection.
///
/// ```text
/// <1 byte prot len><19 byte prot string><8 reserved><20 info hash><20 peer id>
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Handshake {
    /// The protocol string, which must equal "BitTorrent protocol", as
    /// otherwise the connection is aborted.
    pub prot: [u8; 19],
    /// The reserved field announcing the client's supported protocol
    /// extensions.
    pub reserved: [u8; 8],
    /// The torrent's SHA-1 info hash, used to identify the torrent in the
    /// handshake and to verify the peer.
    pub info_hash: [u8; 20],
    /// The arbitrary peer id, usually identifying the torrent client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a new protocol version 1 handshake with the given info hash
    /// and peer id, advertising extension protocol support.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[EXTENSION_PROTOCOL_BYTE] |= EXTENSION_PROTOCOL_BIT;
        Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Returns true if the handshake's reserved field advertises BEP 10
    /// extension protocol support.
    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[EXTENSION_PROTOCOL_BYTE] & EXTENSION_PROTOCOL_BIT != 0
    }

    /// Returns the length of the handshake, in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(&self) -> u64 {
        19 + 8 + 20 + 20
    }
}

fn invalid_protocol_string() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        r#"handshake must start with "BitTorrent protocol""#,
    )
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        // we never put anything but the canonical protocol string on the
        // wire
        debug_assert_eq!(handshake.prot, PROTOCOL_STRING.as_bytes());

        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(handshake.prot.len() as u8);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        // the leading length byte fixes the frame size; with the only
        // accepted protocol string the whole handshake is 68 bytes, so
        // a wrong length byte can be rejected before the rest arrives
        let Some(&prot_len_byte) = buf.first() else {
            return Ok(None);
        };
        if prot_len_byte as usize != PROTOCOL_STRING.len() {
            return Err(invalid_protocol_string());
        }

        if buf.len() < HANDSHAKE_LEN {
            buf.reserve(HANDSHAKE_LEN - buf.len());
            return Ok(None);
        }

        // the frame is complete: detach it and pull the fields out
        let mut frame = buf.split_to(HANDSHAKE_LEN);
        frame.advance(1);

        let mut prot = [0; 19];
        frame.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(invalid_protocol_string());
        }

        let mut handshake = Handshake {
            prot,
            reserved: [0; 8],
            info_hash: [0; 20],
            peer_id: [0; 20],
        };
        frame.copy_to_slice(&mut handshake.reserved);
        frame.copy_to_slice(&mut handshake.info_hash);
        frame.copy_to_slice(&mut handshake.peer_id);
        debug_assert!(frame.is_empty());

        Ok(Some(handshake))
    }
}
