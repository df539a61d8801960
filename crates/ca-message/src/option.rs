//! Block option value type and its wire encoding.
//!
//! A block option describes one fragment of a larger body as
//! `(sequence number, more-flag, size exponent)`. On the wire the three
//! fields are packed into a single unsigned value:
//!
//! ```text
//!  0                   1                   2
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          number (variable length)       |M| szx |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The block size in bytes is `16 << szx`, so exponents 0..=6 describe
//! blocks of 16 to 1024 bytes. Exponent 7 is reserved.

use crate::error::{MessageError, Result};

/// Bit position of the block number within the packed option value.
pub const BLOCK_NUMBER_SHIFT: u32 = 4;

/// Bit position of the more-flag within the packed option value.
pub const MORE_BIT_SHIFT: u32 = 3;

/// Mask extracting the size exponent from the packed option value.
pub const SIZE_EXP_MASK: u32 = 0x7;

/// Largest valid size exponent (1024-byte blocks).
pub const MAX_SIZE_EXP: u8 = 6;

/// Returns the block size in bytes for a size exponent.
pub fn block_size(size_exp: u8) -> usize {
    16usize << size_exp
}

/// One fragment descriptor of a blockwise transfer.
///
/// Pure value type; both directions of an exchange carry one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockOption {
    /// Block sequence index.
    pub num: u32,
    /// Whether more blocks follow this one.
    pub more: bool,
    /// Size exponent; block size is `16 << size_exp`.
    pub size_exp: u8,
}

impl BlockOption {
    /// Creates a new block option.
    pub fn new(num: u32, more: bool, size_exp: u8) -> Self {
        Self {
            num,
            more,
            size_exp,
        }
    }

    /// Returns the block size in bytes described by this option.
    pub fn size(&self) -> usize {
        block_size(self.size_exp)
    }

    /// Returns the payload byte offset where this block starts.
    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }

    /// Packs the option into its single-value wire form.
    pub fn to_value(&self) -> u32 {
        (self.num << BLOCK_NUMBER_SHIFT)
            | ((self.more as u32) << MORE_BIT_SHIFT)
            | (self.size_exp as u32 & SIZE_EXP_MASK)
    }

    /// Unpacks an option from its single-value wire form.
    ///
    /// The reserved size exponent 7 is rejected.
    pub fn from_value(value: u32) -> Result<Self> {
        let size_exp = (value & SIZE_EXP_MASK) as u8;
        if size_exp > MAX_SIZE_EXP {
            return Err(MessageError::ReservedSizeExp(size_exp));
        }
        Ok(Self {
            num: value >> BLOCK_NUMBER_SHIFT,
            more: (value >> MORE_BIT_SHIFT) & 1 == 1,
            size_exp,
        })
    }
}
