use std::io::{self, Cursor};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, MessageId};
use crate::{blockinfo::BlockInfo, Bitfield, BLOCK_LEN};

/// The largest frame we accept.
///
/// The longest legitimate message is a block message: 13 bytes of header
/// and the block payload. Clients may use larger than canonical blocks, so
/// the cap leaves generous headroom; anything bigger is either corrupt
/// framing or an attempt to make us allocate unboundedly, and the
/// connection is closed.
const MAX_FRAME_LEN: u32 = 13 + 8 * BLOCK_LEN;

pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                // a message of 0 length is a keep alive
                buf.put_u32(0);
            }
            Bitfield(bitfield) => {
                // NOTE: `bitfield.len()` returns the number of _bits_
                let msg_len = 1 + bitfield.len() / 8;
                buf.put_u32(msg_len as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(bitfield.as_raw_slice());
            }
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have { piece_index } => {
                let piece_index = piece_index.try_into().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "piece index too large",
                    )
                })?;
                // 1 byte message id and 4 byte piece index
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            Request(block) => {
                encode_block_info(buf, MessageId::Request, block)?;
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                let piece_index = piece_index.try_into().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "piece index too large",
                    )
                })?;
                // 1 byte message id, 4 byte piece index, 4 byte offset and
                // the raw block
                let msg_len = 1 + 4 + 4 + data.len() as u32;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Cancel(block) => {
                encode_block_info(buf, MessageId::Cancel, block)?;
            }
            Extended { id, payload } => {
                // 1 byte message id, 1 byte extended id and the payload
                let msg_len = 1 + 1 + payload.len() as u32;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

/// Encodes the `request` and `cancel` messages, which share their format.
fn encode_block_info(
    buf: &mut BytesMut,
    id: MessageId,
    block: BlockInfo,
) -> io::Result<()> {
    let piece_index = block.piece_index.try_into().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "piece index too large")
    })?;
    // 1 byte message id, 4 byte piece index, 4 byte offset, 4 byte length
    buf.put_u32(1 + 4 + 4 + 4);
    buf.put_u8(id as u8);
    buf.put_u32(piece_index);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
    Ok(())
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        // the message length prefix must be present in full
        if buf.remaining() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without advancing the buffer, as the
        // rest of the message may not have arrived yet
        let mut tmp_buf = Cursor::new(&buf);
        let msg_len = tmp_buf.get_u32();

        // a hostile length prefix must be rejected before we reserve any
        // memory for it
        if msg_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {} exceeds the cap", msg_len),
            ));
        }

        if (buf.remaining() as u32) < 4 + msg_len {
            // reserve space for the rest of the frame so that repeated
            // reads while it trickles in don't cause repeated allocations
            buf.reserve(4 + msg_len as usize - buf.remaining());
            return Ok(None);
        }
        buf.advance(4);

        // a message length of 0 is a keep alive
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::try_from(buf.get_u8())?;
        let payload_len = msg_len as usize - 1;

        let msg = match id {
            MessageId::Choke => {
                expect_payload_len(id, payload_len, 0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect_payload_len(id, payload_len, 0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect_payload_len(id, payload_len, 0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect_payload_len(id, payload_len, 0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect_payload_len(id, payload_len, 4)?;
                Message::Have {
                    piece_index: buf.get_u32() as usize,
                }
            }
            MessageId::Bitfield => {
                let mut bits = vec![0; payload_len];
                buf.copy_to_slice(&mut bits);
                Message::Bitfield(Bitfield::from_vec(bits))
            }
            MessageId::Request => {
                expect_payload_len(id, payload_len, 12)?;
                Message::Request(decode_block_info(buf))
            }
            MessageId::Block => {
                if payload_len < 8 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "block message too short",
                    ));
                }
                let piece_index = buf.get_u32() as usize;
                let offset = buf.get_u32();
                let mut data = vec![0; payload_len - 8];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data: data.into(),
                }
            }
            MessageId::Cancel => {
                expect_payload_len(id, payload_len, 12)?;
                Message::Cancel(decode_block_info(buf))
            }
            MessageId::Extended => {
                if payload_len < 1 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "extended message without an id",
                    ));
                }
                let ext_id = buf.get_u8();
                let mut payload = vec![0; payload_len - 1];
                buf.copy_to_slice(&mut payload);
                Message::Extended {
                    id: ext_id,
                    payload,
                }
            }
        };

        Ok(Some(msg))
    }
}

fn decode_block_info(buf: &mut BytesMut) -> BlockInfo {
    BlockInfo {
        piece_index: buf.get_u32() as usize,
        offset: buf.get_u32(),
        len: buf.get_u32(),
    }
}

fn expect_payload_len(
    id: MessageId,
    actual: usize,
    expected: usize,
) -> io::Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{:?} payload is {} bytes, expected {}",
                id, actual, expected
            ),
        ))
    }
}
