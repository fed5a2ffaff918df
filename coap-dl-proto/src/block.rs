//! Block2 option and the offset arithmetic of block-wise transfers

use bytes::BufMut;
use thiserror::Error;

use crate::{coding, etag::ETag};

/// Smallest block size expressible on the wire (SZX 0)
pub const MIN_BLOCK_SIZE: usize = 16;
/// Largest block size expressible on the wire (SZX 6)
pub const MAX_BLOCK_SIZE: usize = 1024;
/// Largest block sequence number that fits in a 3-byte option value
pub const MAX_SEQ_NUM: u32 = (1 << 20) - 1;

/// Fixed message header
pub(crate) const MAX_HEADER_SIZE: usize = 4;
/// Longest token permitted by the header's TKL field
pub(crate) const MAX_TOKEN_LEN: usize = 8;
/// One byte of option header followed by the longest tag
pub(crate) const ETAG_OPT_MAX_SIZE: usize = 1 + ETag::MAX_SIZE;
/// Option header, two bytes of extended delta and a 3-byte value
pub(crate) const BLOCK_OPT_MAX_SIZE: usize = 1 + 2 + 3;
/// 0xFF between options and payload
pub(crate) const PAYLOAD_MARKER_SIZE: usize = 1;

/// Worst-case bytes a response spends on anything but payload
pub(crate) const RESPONSE_OVERHEAD: usize = MAX_HEADER_SIZE
    + MAX_TOKEN_LEN
    + ETAG_OPT_MAX_SIZE
    + BLOCK_OPT_MAX_SIZE
    + PAYLOAD_MARKER_SIZE;

/// Decoded Block2 option
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockInfo {
    seq_num: u32,
    szx: u32,
    has_more: bool,
}

impl BlockInfo {
    /// Describe block `seq_num` of `size` bytes
    pub fn new(seq_num: u32, size: usize, has_more: bool) -> Result<Self, BlockError> {
        let szx = size_exponent(size).ok_or(BlockError::InvalidSize(size))?;
        if seq_num > MAX_SEQ_NUM {
            return Err(BlockError::SeqNumOutOfRange);
        }
        Ok(Self {
            seq_num,
            szx,
            has_more,
        })
    }

    /// Describe the block covering `offset` at the given block size
    pub fn for_offset(offset: usize, size: usize, has_more: bool) -> Result<Self, BlockError> {
        let szx = size_exponent(size).ok_or(BlockError::InvalidSize(size))?;
        let seq_num = u32::try_from(offset / size)
            .ok()
            .filter(|&seq| seq <= MAX_SEQ_NUM)
            .ok_or(BlockError::SeqNumOutOfRange)?;
        Ok(Self {
            seq_num,
            szx,
            has_more,
        })
    }

    /// Index of the block within the representation
    pub fn seq_num(&self) -> u32 {
        self.seq_num
    }

    /// Block size in bytes
    pub fn size(&self) -> usize {
        1 << (self.szx + 4)
    }

    /// Whether further blocks follow this one
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Byte offset of the first byte in this block
    pub fn offset(&self) -> usize {
        self.seq_num as usize * self.size()
    }

    /// Parse the value of a Block1/Block2 option
    pub fn decode(value: &[u8]) -> Result<Self, BlockError> {
        let raw = coding::decode_uint(value)
            .filter(|_| value.len() <= 3)
            .ok_or(BlockError::Malformed)?;
        let szx = raw & 0x7;
        if szx == 7 {
            return Err(BlockError::Malformed);
        }
        Ok(Self {
            seq_num: raw >> 4,
            szx,
            has_more: raw & 0x8 != 0,
        })
    }

    fn raw(&self) -> u32 {
        self.seq_num << 4 | (self.has_more as u32) << 3 | self.szx
    }

    /// Length of the encoded option value
    pub fn encoded_len(&self) -> usize {
        coding::uint_len(self.raw())
    }

    /// Append the option value to `buf`
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        coding::encode_uint(self.raw(), buf);
    }
}

/// SZX field encoding `size`, if `size` is a valid block size
pub(crate) fn size_exponent(size: usize) -> Option<u32> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) || !size.is_power_of_two() {
        return None;
    }
    Some(size.trailing_zeros() - 4)
}

/// Largest block size whose responses fit in an inbound buffer of `capacity` bytes
pub fn max_acceptable_block_size(capacity: usize) -> Option<usize> {
    let payload_capacity = capacity.checked_sub(RESPONSE_OVERHEAD)?;
    if payload_capacity < MIN_BLOCK_SIZE {
        return None;
    }
    // Largest power of two not greater than the capacity
    let size: usize = 1 << (usize::BITS - 1 - payload_capacity.leading_zeros());
    Some(size.min(MAX_BLOCK_SIZE))
}

/// Offset of the block a transfer asks for next
pub(crate) fn expected_offset(bytes_downloaded: usize, block_size: usize) -> usize {
    bytes_downloaded / block_size * block_size
}

/// Errors in Block2 option handling
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum BlockError {
    /// The option value is not a valid block descriptor
    #[error("malformed block option")]
    Malformed,
    /// Block sizes are powers of two between 16 and 1024 bytes
    #[error("invalid block size {0}")]
    InvalidSize(usize),
    /// The offset cannot be addressed with a 20-bit sequence number
    #[error("block sequence number out of range")]
    SeqNumOutOfRange,
}
