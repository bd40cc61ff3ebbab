pub mod handshake;
pub mod message;
pub mod wire;

pub use handshake::{Handshake, HandshakeCodec, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::PeerCodec;

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;
    use crate::blockinfo::BlockInfo;
    use crate::{Bitfield, BLOCK_LEN};

    /// Tests a stream of arbitrary messages to ensure that not only do they
    /// encode and then decode correctly (like the individual test cases
    /// ascertain), but that the buffer cursor is properly advanced by the
    /// codec implementation in both cases.
    #[test]
    fn test_message_stream() {
        let (handshake, encoded_handshake) = make_handshake();
        let msgs = [
            make_choke(),
            make_unchoke(),
            make_keep_alive(),
            make_interested(),
            make_not_interested(),
            make_bitfield(),
            make_have(),
            make_request(),
            make_block(),
            make_block(),
            make_keep_alive(),
            make_extended(),
            make_interested(),
            make_cancel(),
            make_block(),
            make_not_interested(),
            make_choke(),
            make_choke(),
        ];

        // create a byte stream of all above messages
        let msgs_len = msgs.iter().fold(0, |acc, (_, encoded)| acc + encoded.len());
        let mut read_buf = BytesMut::with_capacity(msgs_len);
        read_buf.extend_from_slice(&encoded_handshake);
        for (_, encoded) in &msgs {
            read_buf.extend_from_slice(encoded);
        }

        // decode messages one by one from the byte stream in the same order
        // as they were encoded, starting with the handshake
        let decoded_handshake = HandshakeCodec.decode(&mut read_buf).unwrap();
        assert_eq!(decoded_handshake, Some(handshake));
        for (msg, _) in &msgs {
            let decoded_msg = PeerCodec.decode(&mut read_buf).unwrap();
            assert_eq!(decoded_msg.unwrap(), *msg);
        }
    }

    // This test attempts to simulate a closer to real world use case than
    // `test_message_stream`, by progressively loading up the codec's read
    // buffer with the encoded message bytes, asserting that messages are
    // decoded correctly even if their bytes arrive in different chunks.
    //
    // This is a regression test in that there used to be a bug that failed
    // to parse block messages (the largest message type) if the full
    // message couldn't be received (as is often the case).
    #[test]
    fn test_chunked_message_stream() {
        let mut read_buf = BytesMut::new();

        // start with the handshake by adding only the first half of it to
        // the buffer
        let (handshake, encoded_handshake) = make_handshake();
        let handshake_split_pos = encoded_handshake.len() / 2;
        read_buf.extend_from_slice(&encoded_handshake[0..handshake_split_pos]);

        // can't decode the handshake without the full message
        assert!(HandshakeCodec.decode(&mut read_buf).unwrap().is_none());

        // the handshake should successfully decode with the second half
        read_buf.extend_from_slice(&encoded_handshake[handshake_split_pos..]);
        let decoded_handshake = HandshakeCodec.decode(&mut read_buf).unwrap();
        assert_eq!(decoded_handshake, Some(handshake));

        let msgs = [
            make_choke(),
            make_unchoke(),
            make_interested(),
            make_not_interested(),
            make_bitfield(),
            make_have(),
            make_request(),
            make_block(),
            make_block(),
            make_extended(),
            make_interested(),
            make_cancel(),
            make_block(),
            make_not_interested(),
            make_choke(),
            make_choke(),
        ];

        // go through all above messages and do the same procedure as with
        // the handshake: add the first half, fail to decode, add the second
        // half, decode successfully
        for (msg, encoded) in &msgs {
            // add the first half of the message
            let split_pos = encoded.len() / 2;
            read_buf.extend_from_slice(&encoded[0..split_pos]);
            // fail to decode
            assert!(PeerCodec.decode(&mut read_buf).unwrap().is_none());
            // add the second half
            read_buf.extend_from_slice(&encoded[split_pos..]);
            let decoded_msg = PeerCodec.decode(&mut read_buf).unwrap();
            assert_eq!(decoded_msg.unwrap(), *msg);
        }
    }

    /// Tests the encoding and subsequent decoding of a valid handshake.
    #[test]
    fn test_handshake_codec() {
        let (handshake, expected_encoded) = make_handshake();

        // encode handshake
        let mut encoded = BytesMut::with_capacity(expected_encoded.len());
        HandshakeCodec.encode(handshake, &mut encoded).unwrap();
        assert_eq!(encoded, expected_encoded);

        // don't decode handshake if there aren't enough bytes in the source
        // buffer
        let mut partial_encoded = encoded[0..30].into();
        let decoded = HandshakeCodec.decode(&mut partial_encoded).unwrap();
        assert_eq!(decoded, None);

        // decode the same handshake
        let decoded = HandshakeCodec.decode(&mut encoded).unwrap();
        assert_eq!(decoded, Some(handshake));
    }

    /// Tests that the decoding of various invalid handshake messages
    /// results in an error.
    #[test]
    fn test_invalid_handshake_decoding() {
        // try to decode a handshake with an invalid protocol string
        let mut invalid_encoded = {
            let prot = "not the BitTorrent protocol";
            // these buffer values don't matter here as we're only expecting
            // invalid encodings
            let reserved = [0; 8];
            let info_hash = [0; 20];
            let peer_id = [0; 20];

            let buf_len = prot.len() + 49;
            let mut buf = BytesMut::with_capacity(buf_len);
            // the message length prefix is not actually included in the
            // value
            let prot_len = prot.len() as u8;
            buf.put_u8(prot_len);
            buf.extend_from_slice(prot.as_bytes());
            buf.extend_from_slice(&reserved);
            buf.extend_from_slice(&info_hash);
            buf.extend_from_slice(&peer_id);
            buf
        };
        let result = HandshakeCodec.decode(&mut invalid_encoded);
        assert!(result.is_err());
    }

    #[test]
    fn test_extension_bit_is_advertised() {
        let (handshake, _) = make_handshake();
        // our own handshakes always advertise BEP 10
        assert!(handshake.supports_extension_protocol());

        let mut plain = handshake;
        plain.reserved = [0; 8];
        assert!(!plain.supports_extension_protocol());
    }

    /// A frame whose length prefix exceeds the cap must be rejected before
    /// any allocation happens, with an error that closes the connection.
    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_u8(MessageId::Block as u8);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    /// An unknown fixed message id closes the connection.
    #[test]
    fn test_unknown_message_id_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(15);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    /// A message with a payload length that contradicts its id closes the
    /// connection rather than desyncing the framing.
    #[test]
    fn test_wrong_payload_len_is_rejected() {
        let mut buf = BytesMut::new();
        // a choke message must have no payload
        buf.put_u32(4);
        buf.put_u8(MessageId::Choke as u8);
        buf.extend_from_slice(&[0; 3]);
        assert!(PeerCodec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        // a request message payload is exactly 12 bytes
        buf.put_u32(1 + 4);
        buf.put_u8(MessageId::Request as u8);
        buf.put_u32(0);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    // Returns a `Handshake` and its expected encoded variant.
    fn make_handshake() -> (Handshake, Bytes) {
        // protocol string
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());

        // the extension protocol bit is set in our handshakes
        let mut reserved = [0u8; 8];
        reserved[5] = 0x10;

        // this is not a valid info hash but it doesn't matter for the
        // purposes of this test
        const INFO_HASH: &str = "da39a3ee5e6b4b0d3255";
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(INFO_HASH.as_bytes());

        const PEER_ID: &str = "rt-2023-000000000000";
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(PEER_ID.as_bytes());

        let handshake = Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        };

        let encoded = {
            let buf_len = 68;
            let mut buf = Vec::with_capacity(buf_len);
            // the message length prefix is not actually included in the
            // value
            let prot_len = prot.len() as u8;
            buf.push(prot_len);
            buf.extend_from_slice(&prot);
            buf.extend_from_slice(&reserved);
            buf.extend_from_slice(&info_hash);
            buf.extend_from_slice(&peer_id);
            buf
        };

        (handshake, encoded.into())
    }

    /// Tests the encoding and subsequent decoding of a valid 'keep alive'
    /// message.
    #[test]
    fn test_keep_alive_codec() {
        let (msg, expected_encoded) = make_keep_alive();
        assert_message_codec(msg, expected_encoded);
    }

    /// Tests the encoding and subsequent decoding of a valid 'choke'
    /// message.
    #[test]
    fn test_choke_codec() {
        let (msg, expected_encoded) = make_choke();
        assert_message_codec(msg, expected_encoded);
    }

    /// Tests the encoding and subsequent decoding of a valid 'unchoke'
    /// message.
    #[test]
    fn test_unchoke_codec() {
        let (msg, expected_encoded) = make_unchoke();
        assert_message_codec(msg, expected_encoded);
    }

    /// Tests the encoding and subsequent decoding of a valid 'interested'
    /// message.
    #[test]
    fn test_interested_codec() {
        let (msg, expected_encoded) = make_interested();
        assert_message_codec(msg, expected_encoded);
    }

    /// Tests the encoding and subsequent decoding of a valid 'not
    /// interested' message.
    #[test]
    fn test_not_interested_codec() {
        let (msg, expected_encoded) = make_not_interested();
        assert_message_codec(msg, expected_encoded);
    }

    /// Tests the encoding and subsequent decoding of a valid 'bitfield'
    /// message.
    #[test]
    fn test_bitfield_codec() {
        let (msg, expected_encoded) = make_bitfield();
        assert_message_codec(msg, expected_encoded);
    }

    /// Tests the encoding and subsequent decoding of a valid 'have'
    /// message.
    #[test]
    fn test_have_codec() {
        let (msg, expected_encoded) = make_have();
        assert_message_codec(msg, expected_encoded);
    }

    /// Tests the encoding and subsequent decoding of a valid 'request'
    /// message.
    #[test]
    fn test_request_codec() {
        let (msg, expected_encoded) = make_request();
        assert_message_codec(msg, expected_encoded);
    }

    /// Tests the encoding and subsequent decoding of a valid 'block'
    /// message.
    #[test]
    fn test_block_codec() {
        let (msg, expected_encoded) = make_block();
        assert_message_codec(msg, expected_encoded);
    }

    /// Tests the encoding and subsequent decoding of a valid 'cancel'
    /// message.
    #[test]
    fn test_cancel_codec() {
        let (msg, expected_encoded) = make_cancel();
        assert_message_codec(msg, expected_encoded);
    }

    /// Tests the encoding and subsequent decoding of a valid 'extended'
    /// message.
    #[test]
    fn test_extended_codec() {
        let (msg, expected_encoded) = make_extended();
        assert_message_codec(msg, expected_encoded);
    }

    /// Helper function that asserts that a message is encoded and
    /// subsequently decoded correctly.
    fn assert_message_codec(msg: Message, expected_encoded: Bytes) {
        // encode message
        let mut encoded = BytesMut::with_capacity(expected_encoded.len());
        PeerCodec.encode(msg.clone(), &mut encoded).unwrap();
        assert_eq!(encoded, expected_encoded);

        // don't decode message if there aren't enough bytes in the source
        // buffer
        let mut partial_encoded = encoded[0..encoded.len() - 1].into();
        let decoded = PeerCodec.decode(&mut partial_encoded).unwrap();
        assert_eq!(decoded, None);

        // decode the same message
        let decoded = PeerCodec.decode(&mut encoded).unwrap();
        assert_eq!(decoded, Some(msg));
    }

    fn make_keep_alive() -> (Message, Bytes) {
        (Message::KeepAlive, Bytes::from_static(&[0; 4]))
    }

    /// Returns `Choke` and its expected encoded variant.
    fn make_choke() -> (Message, Bytes) {
        (
            Message::Choke,
            make_empty_msg_encoded_payload(MessageId::Choke),
        )
    }

    /// Returns `Unchoke` and its expected encoded variant.
    fn make_unchoke() -> (Message, Bytes) {
        (
            Message::Unchoke,
            make_empty_msg_encoded_payload(MessageId::Unchoke),
        )
    }

    /// Returns `Interested` and its expected encoded variant.
    fn make_interested() -> (Message, Bytes) {
        (
            Message::Interested,
            make_empty_msg_encoded_payload(MessageId::Interested),
        )
    }

    /// Returns `NotInterested` and its expected encoded variant.
    fn make_not_interested() -> (Message, Bytes) {
        (
            Message::NotInterested,
            make_empty_msg_encoded_payload(MessageId::NotInterested),
        )
    }

    /// Helper used to create 'choke', 'unchoke', 'interested', and 'not
    /// interested' encoded messages that all have the same format.
    fn make_empty_msg_encoded_payload(id: MessageId) -> Bytes {
        // 1 byte message id
        let msg_len = 1;
        // 4 byte message length prefix and message length
        let buf_len = 4 + msg_len as usize;
        let mut buf = BytesMut::with_capacity(buf_len);
        buf.put_u32(msg_len);
        buf.put_u8(id as u8);
        buf.into()
    }

    /// Returns `Bitfield` and its expected encoded variant.
    fn make_bitfield() -> (Message, Bytes) {
        let bitfield =
            Bitfield::from_vec(vec![0b11001001, 0b10000011, 0b11111011]);
        let encoded = {
            // 1 byte message id and n byte bitfield
            //
            // NOTE: `bitfield.len()` returns the number of _bits_
            let msg_len = 1 + bitfield.len() / 8;
            // 4 byte message length prefix and message length
            let buf_len = 4 + msg_len;
            let mut buf = BytesMut::with_capacity(buf_len);
            buf.put_u32(msg_len as u32);
            buf.put_u8(MessageId::Bitfield as u8);
            buf.extend_from_slice(bitfield.as_raw_slice());
            buf
        };
        let msg = Message::Bitfield(bitfield);
        (msg, encoded.into())
    }

    /// Returns `Have` and its expected encoded variant.
    fn make_have() -> (Message, Bytes) {
        let piece_index = 42;
        let msg = Message::Have { piece_index };
        let encoded = {
            // 1 byte message id and 4 byte piece index
            let msg_len = 1 + 4;
            // 4 byte message length prefix and message length
            let buf_len = 4 + msg_len;
            let mut buf = BytesMut::with_capacity(buf_len);
            buf.put_u32(msg_len as u32);
            buf.put_u8(MessageId::Have as u8);
            // ok to unwrap, only used in tests
            buf.put_u32(piece_index.try_into().unwrap());
            buf
        };
        (msg, encoded.into())
    }

    /// Returns `Request` and its expected encoded variant.
    fn make_request() -> (Message, Bytes) {
        let piece_index = 42;
        let offset = 0x4000;
        let len = BLOCK_LEN;
        let msg = Message::Request(BlockInfo {
            piece_index,
            offset,
            len,
        });
        let encoded = make_block_info_encoded_msg_payload(
            MessageId::Request,
            piece_index,
            offset,
            len,
        );
        (msg, encoded)
    }

    /// Returns `Block` and its expected encoded variant.
    fn make_block() -> (Message, Bytes) {
        let piece_index = 42;
        let offset = 0x4000;
        let data = vec![0; 0x4000];
        let encoded = {
            // 1 byte message id, 4 byte piece index, 4 byte offset, and
            // n byte block
            let msg_len = 1 + 4 + 4 + data.len();
            // 4 byte message length prefix and message length
            let buf_len = 4 + msg_len;
            let mut buf = BytesMut::with_capacity(buf_len);
            buf.put_u32(msg_len as u32);
            buf.put_u8(MessageId::Block as u8);
            // ok to unwrap, only used in tests
            buf.put_u32(piece_index.try_into().unwrap());
            buf.put_u32(offset);
            buf.extend_from_slice(&data);
            buf
        };
        let msg = Message::Block {
            piece_index,
            offset,
            data: data.into(),
        };
        (msg, encoded.into())
    }

    /// Returns `Cancel` and its expected encoded variant.
    fn make_cancel() -> (Message, Bytes) {
        let piece_index = 42;
        let offset = 0x4000;
        let len = BLOCK_LEN;
        let msg = Message::Cancel(BlockInfo {
            piece_index,
            offset,
            len,
        });
        let encoded = make_block_info_encoded_msg_payload(
            MessageId::Cancel,
            piece_index,
            offset,
            len,
        );
        (msg, encoded)
    }

    /// Returns `Extended` and its expected encoded variant.
    fn make_extended() -> (Message, Bytes) {
        let payload = b"d1:md11:ut_metadatai1eee".to_vec();
        let encoded = {
            // 1 byte message id, 1 byte extended id and the payload
            let msg_len = 1 + 1 + payload.len();
            let mut buf = BytesMut::with_capacity(4 + msg_len);
            buf.put_u32(msg_len as u32);
            buf.put_u8(MessageId::Extended as u8);
            buf.put_u8(0);
            buf.extend_from_slice(&payload);
            buf
        };
        let msg = Message::Extended { id: 0, payload };
        (msg, encoded.into())
    }

    /// Helper used to create 'request' and 'cancel' encoded messages that
    /// have the same format.
    fn make_block_info_encoded_msg_payload(
        id: MessageId,
        piece_index: usize,
        offset: u32,
        len: u32,
    ) -> Bytes {
        // 1 byte message id, 4 byte piece index, 4 byte offset, 4 byte
        // length
        let msg_len = 1 + 4 + 4 + 4;
        // 4 byte message length prefix and message length
        let buf_len = 4 + msg_len as usize;
        let mut buf = BytesMut::with_capacity(buf_len);
        buf.put_u32(msg_len);
        buf.put_u8(id as u8);
        // ok to unwrap, only used in tests
        buf.put_u32(piece_index.try_into().unwrap());
        buf.put_u32(offset);
        buf.put_u32(len);
        buf.into()
    }
}
