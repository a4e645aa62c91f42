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

use core::ops::Deref;

/// Type for holding the value of a CoAP message token: zero to eight
/// opaque bytes correlating a request with its response.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone, Ord, PartialOrd)]
pub struct Token {
    len: u8,
    bytes: [u8; 8],
}

impl Token {
    /// Constant representing an empty token.
    pub const EMPTY: Token = Token {
        len: 0u8,
        bytes: [0; 8],
    };

    /// Creates a new token from the given byte slice.
    ///
    /// Note: this will panic if `x` is longer than eight bytes.
    pub fn new(x: &[u8]) -> Token {
        let mut bytes = [0u8; 8];
        let len = x.len();
        bytes[..len].copy_from_slice(x);
        Token {
            len: len as u8,
            bytes,
        }
    }

    /// Creates a new eight-byte token from the system's cryptographic
    /// random number generator.
    pub fn random() -> Token {
        Token::new(&rand::random::<[u8; 8]>())
    }

    /// Returns the length of this token.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true if the length of this token is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a byte slice containing this token.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl Default for Token {
    fn default() -> Self {
        Token::EMPTY
    }
}

impl Deref for Token {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl core::cmp::PartialEq<[u8]> for Token {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl From<&[u8]> for Token {
    fn from(x: &[u8]) -> Self {
        Token::new(x)
    }
}

impl From<u32> for Token {
    fn from(x: u32) -> Self {
        Token::new(&crate::util::encode_uint(x))
    }
}
