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

/// Encodes an unsigned 32-bit number into the minimal big-endian byte
/// vector used by CoAP `uint` option values. Zero encodes as the empty
/// vector.
pub fn encode_uint(value: u32) -> Vec<u8> {
    if value == 0 {
        Vec::new()
    } else if value <= 0xFF {
        vec![value as u8]
    } else if value <= 0xFFFF {
        vec![(value >> 8) as u8, value as u8]
    } else if value <= 0xFF_FFFF {
        vec![(value >> 16) as u8, (value >> 8) as u8, value as u8]
    } else {
        vec![
            (value >> 24) as u8,
            (value >> 16) as u8,
            (value >> 8) as u8,
            value as u8,
        ]
    }
}

/// Attempts to decode a big-endian CoAP `uint` option value into a `u32`.
/// Input may be zero to four bytes long; anything longer returns `None`.
pub fn try_decode_u32(src: &[u8]) -> Option<u32> {
    if src.len() > 4 {
        return None;
    }
    let mut value = 0u32;
    for b in src {
        value = (value << 8) | u32::from(*b);
    }
    Some(value)
}

/// Attempts to decode a big-endian CoAP `uint` option value into a `u16`.
/// Input may be zero to two bytes long; anything longer returns `None`.
pub fn try_decode_u16(src: &[u8]) -> Option<u16> {
    if src.len() > 2 {
        return None;
    }
    let mut value = 0u16;
    for b in src {
        value = (value << 8) | u16::from(*b);
    }
    Some(value)
}
