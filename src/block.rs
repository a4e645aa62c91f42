// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use std::fmt::{Debug, Display, Formatter};

/// Decoded form of a `Block1`/`Block2` option value: block number, more
/// flag, and size exponent.
///
/// The block size is `2^(szx + 4)`; legal exponents are 0 through 6.
/// Exponent 7 is reserved (it only appears in the BERT extension of the
/// stream transport) and is rejected on datagram transports.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Block {
    /// Relative block number within the transfer.
    pub num: u32,

    /// If set, more blocks follow this one.
    pub more: bool,

    /// The block size exponent.
    pub szx: u8,
}

impl Block {
    /// Maximum legal value for `num`.
    pub const NUM_MAX: u32 = (1 << 20) - 1;

    /// The reserved size exponent.
    pub const SZX_RESERVED: u8 = 7;

    /// Maximum legal value for `szx`.
    pub const SZX_MAX: u8 = Self::SZX_RESERVED - 1;

    /// Constructs a new `Block`, validating the number and exponent.
    pub fn new(num: u32, more: bool, szx: u8) -> Option<Block> {
        if num > Self::NUM_MAX || szx > Self::SZX_MAX {
            None
        } else {
            Some(Block { num, more, szx })
        }
    }

    /// Decodes the packed option-value form.
    pub fn from_raw(raw: u32) -> Option<Block> {
        Block::new(raw >> 4, raw & 0b1000 != 0, (raw & 0b0111) as u8)
    }

    /// Encodes into the packed option-value form.
    pub fn to_raw(self) -> u32 {
        (self.num << 4) | ((self.more as u32) << 3) | u32::from(self.szx)
    }

    /// The size of this block, in bytes.
    pub fn size(self) -> usize {
        1 << (self.szx as usize + 4)
    }

    /// The byte offset within the full representation this block starts at.
    pub fn offset(self) -> usize {
        self.num as usize * self.size()
    }

    /// The largest legal exponent whose block size does not exceed `size`.
    /// Sizes below 16 clamp to exponent 0.
    pub fn szx_for_size(size: usize) -> u8 {
        let mut szx = Self::SZX_MAX;
        while szx > 0 && (1usize << (szx as usize + 4)) > size {
            szx -= 1;
        }
        szx
    }

    /// The descriptor of the block following this one, if any.
    pub fn next(self) -> Option<Block> {
        if self.num < Self::NUM_MAX {
            Block::new(self.num + 1, self.more, self.szx)
        } else {
            None
        }
    }

    /// Returns this descriptor with the more flag set as given.
    pub fn with_more(self, more: bool) -> Block {
        Block { more, ..self }
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.num, self.more as u8, self.size())
    }
}

impl Debug for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Block({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for &(num, more, szx) in
            &[(0u32, false, 0u8), (1, true, 6), (Block::NUM_MAX, false, 3)]
        {
            let block = Block::new(num, more, szx).unwrap();
            assert_eq!(Block::from_raw(block.to_raw()), Some(block));
        }
    }

    #[test]
    fn sizes_and_offsets() {
        let block = Block::new(3, false, 2).unwrap();
        assert_eq!(block.size(), 64);
        assert_eq!(block.offset(), 192);

        let block = Block::new(0, true, 6).unwrap();
        assert_eq!(block.size(), 1024);
        assert_eq!(block.offset(), 0);
    }

    #[test]
    fn reserved_szx_rejected() {
        assert_eq!(Block::new(0, false, 7), None);
        assert_eq!(Block::from_raw(0b0111), None);
    }

    #[test]
    fn num_range() {
        assert_eq!(Block::new(Block::NUM_MAX + 1, false, 0), None);
        assert!(Block::new(Block::NUM_MAX, false, 0).unwrap().next().is_none());
        assert_eq!(
            Block::new(4, true, 2).unwrap().next(),
            Block::new(5, true, 2)
        );
    }

    #[test]
    fn szx_for_size() {
        assert_eq!(Block::szx_for_size(1024), 6);
        assert_eq!(Block::szx_for_size(2048), 6);
        assert_eq!(Block::szx_for_size(512), 5);
        assert_eq!(Block::szx_for_size(64), 2);
        assert_eq!(Block::szx_for_size(16), 0);
        assert_eq!(Block::szx_for_size(1), 0);
    }
}
