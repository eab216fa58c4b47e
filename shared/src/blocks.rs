//! Block ids and the section payload codec.
//!
//! A section payload is 4096 unsigned 16-bit block ids. On the wire and in
//! the store it is exactly 8192 little-endian bytes; the wire additionally
//! wraps it in base64.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

use crate::coords::SECTION_VOLUME;

/// Serialized length of one section payload in bytes.
pub const SECTION_BYTE_LEN: usize = SECTION_VOLUME * 2;

pub const AIR: u16 = 0;
pub const STONE: u16 = 1;
pub const GRASS: u16 = 2;
pub const DIRT: u16 = 3;
pub const SAND: u16 = 4;
pub const PLANKS: u16 = 5;
pub const GLASS: u16 = 6;

/// Error raised by the section payload codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockCodecError {
    #[error("expected {SECTION_VOLUME} block ids, got {0}")]
    BadBlockCount(usize),
    #[error("expected {SECTION_BYTE_LEN} payload bytes, got {0}")]
    BadByteLength(usize),
    #[error("section payload is not valid base64")]
    Base64,
}

/// Serializes 4096 block ids to 8192 little-endian bytes.
pub fn blocks_to_bytes(blocks: &[u16]) -> Result<Vec<u8>, BlockCodecError> {
    if blocks.len() != SECTION_VOLUME {
        return Err(BlockCodecError::BadBlockCount(blocks.len()));
    }
    let mut bytes = Vec::with_capacity(SECTION_BYTE_LEN);
    for id in blocks {
        bytes.extend_from_slice(&id.to_le_bytes());
    }
    Ok(bytes)
}

/// Deserializes 8192 little-endian bytes back into 4096 block ids.
pub fn bytes_to_blocks(bytes: &[u8]) -> Result<Vec<u16>, BlockCodecError> {
    if bytes.len() != SECTION_BYTE_LEN {
        return Err(BlockCodecError::BadByteLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encodes a section payload for the wire: base64 of the 8192-byte form.
pub fn encode_blocks(blocks: &[u16]) -> Result<String, BlockCodecError> {
    Ok(BASE64.encode(blocks_to_bytes(blocks)?))
}

/// Decodes a wire payload back into 4096 block ids.
pub fn decode_blocks(encoded: &str) -> Result<Vec<u16>, BlockCodecError> {
    let bytes = BASE64.decode(encoded).map_err(|_| BlockCodecError::Base64)?;
    bytes_to_blocks(&bytes)
}
