// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

pub mod alert;
pub mod avg;
pub mod bencode;
pub mod blockinfo;
pub mod checkpoint;
pub mod chunking;
pub mod conf;
pub mod counter;
pub mod dht;
pub mod disk;
pub mod download;
pub mod engine;
pub mod error;
pub mod iovecs;
pub mod magnet;
pub mod metadata;
pub mod metainfo;
pub mod peer;
pub mod piece_picker;
pub mod storage_info;
pub mod torrent;
pub mod tracker;

use bitvec::prelude::{BitVec, Msb0};

pub use storage_info::FileInfo;

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The 20 byte identity of a torrent, the SHA-1 digest of its bencoded
/// `info` dictionary.
pub type InfoHash = Sha1Hash;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The type of a file's index.
pub type FileIndex = usize;

/// Each torrent gets a randomly assigned ID that is unique within the
/// engine.
pub type TorrentId = u32;

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significant
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001`
/// would mean that we have pieces 0, 1, and 7). A truthy boolean value of
/// a piece's position in this vector means that the peer has the piece, while
/// a falsy value means it doesn't have the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// This is the only block length we're dealing with (except for possibly the
/// last block). It is the widely used and accepted 16 KiB.
pub(crate) const BLOCK_LEN: u32 = 0x4000;
