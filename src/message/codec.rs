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

//! The datagram wire codec: the 4-byte fixed header, token, option stream,
//! and payload marker.

use std::collections::BTreeMap;

use super::{Message, MsgCode, MsgType, Token};
use crate::error::Error;
use crate::option::OptionNumber;

/// The CoAP protocol version carried in every datagram header.
pub const VERSION: u8 = 1;

/// The byte separating the option stream from the payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Serializes a message for a datagram transport.
///
/// Fails with [`Error::InvalidArgument`] when the message has no type or no
/// message-ID assigned yet.
pub fn encode(msg: &Message) -> Result<Vec<u8>, Error> {
    let msg_type = msg.msg_type.ok_or(Error::InvalidArgument)?;
    let mid = msg.mid.ok_or(Error::InvalidArgument)?;

    let mut out = Vec::with_capacity(4 + msg.token.len() + msg.payload.len() + 16);
    out.push((VERSION << 6) | ((msg_type as u8) << 4) | msg.token.len() as u8);
    out.push(msg.code as u8);
    out.push((mid >> 8) as u8);
    out.push(mid as u8);
    out.extend_from_slice(msg.token.as_bytes());

    encode_options_into(msg, &mut out)?;

    Ok(out)
}

/// Deserializes a datagram into a message.
///
/// The endpoint annotations of the returned message are unset; the caller
/// stamps them from the receiving socket.
pub fn decode(buf: &[u8]) -> Result<Message, Error> {
    if buf.len() < 4 {
        return Err(Error::MalformedMessage);
    }

    if buf[0] >> 6 != VERSION {
        return Err(Error::MalformedMessage);
    }

    // Two bits; all four values are valid message types.
    let msg_type = MsgType::try_from((buf[0] >> 4) & 0b11).ok_or(Error::MalformedMessage)?;

    let token_len = (buf[0] & 0x0F) as usize;
    if token_len > 8 {
        return Err(Error::MalformedMessage);
    }

    let code = MsgCode::try_from(buf[1]).ok_or(Error::MalformedMessage)?;
    let mid = (u16::from(buf[2]) << 8) | u16::from(buf[3]);

    if buf.len() < 4 + token_len {
        return Err(Error::MalformedMessage);
    }
    let token = Token::new(&buf[4..4 + token_len]);

    let (options, payload) = decode_option_stream(&buf[4 + token_len..])?;

    Ok(Message {
        msg_type: Some(msg_type),
        code,
        mid: Some(mid),
        token,
        options,
        payload,
        ..Default::default()
    })
}

/// Appends the option stream, payload marker, and payload of `msg` to `out`.
pub(crate) fn encode_options_into(msg: &Message, out: &mut Vec<u8>) -> Result<(), Error> {
    let mut last_number = 0u32;
    for (number, value) in msg.options() {
        let delta = u32::from(number.0) - last_number;
        last_number = u32::from(number.0);

        let (delta_nibble, delta_ext) = encode_nibble(delta)?;
        let (len_nibble, len_ext) = encode_nibble(value.len() as u32)?;

        out.push((delta_nibble << 4) | len_nibble);
        out.extend_from_slice(&delta_ext);
        out.extend_from_slice(&len_ext);
        out.extend_from_slice(value);
    }

    if !msg.payload.is_empty() {
        out.push(PAYLOAD_MARKER);
        out.extend_from_slice(&msg.payload);
    }

    Ok(())
}

/// Parses the option stream and payload that follow the token.
///
/// Unknown elective options are dropped silently; an unknown critical option
/// fails the parse.
pub(crate) fn decode_option_stream(
    cur: &[u8],
) -> Result<(BTreeMap<OptionNumber, Vec<Vec<u8>>>, Vec<u8>), Error> {
    decode_option_stream_with(cur, false)
}

/// Same as [`decode_option_stream`], but optionally keeps every option.
///
/// Signalling messages on the stream transport use a per-code option
/// namespace, so their decoder must not apply the datagram registry.
pub(crate) fn decode_option_stream_with(
    mut cur: &[u8],
    keep_all: bool,
) -> Result<(BTreeMap<OptionNumber, Vec<Vec<u8>>>, Vec<u8>), Error> {
    let mut options: BTreeMap<OptionNumber, Vec<Vec<u8>>> = BTreeMap::new();
    let mut number = 0u32;

    loop {
        let first = match cur.first() {
            Some(b) => *b,
            None => return Ok((options, Vec::new())),
        };
        cur = &cur[1..];

        if first == PAYLOAD_MARKER {
            if cur.is_empty() {
                // A payload marker with nothing after it is malformed.
                return Err(Error::MalformedMessage);
            }
            return Ok((options, cur.to_vec()));
        }

        let delta = decode_nibble(first >> 4, &mut cur)?;
        let len = decode_nibble(first & 0x0F, &mut cur)? as usize;

        number += delta;
        if number > u32::from(u16::MAX) {
            return Err(Error::MalformedMessage);
        }

        if cur.len() < len {
            return Err(Error::MalformedMessage);
        }
        let value = cur[..len].to_vec();
        cur = &cur[len..];

        let option = OptionNumber(number as u16);
        if keep_all || option.is_recognized() {
            options.entry(option).or_insert_with(Vec::new).push(value);
        } else if option.is_critical() {
            return Err(Error::UnknownCriticalOption);
        }
        // Unknown elective options are skipped.
    }
}

fn encode_nibble(value: u32) -> Result<(u8, Vec<u8>), Error> {
    if value < 13 {
        Ok((value as u8, Vec::new()))
    } else if value < 269 {
        Ok((13, vec![(value - 13) as u8]))
    } else if value < 65805 {
        let ext = value - 269;
        Ok((14, vec![(ext >> 8) as u8, ext as u8]))
    } else {
        Err(Error::InvalidArgument)
    }
}

fn decode_nibble(nibble: u8, cur: &mut &[u8]) -> Result<u32, Error> {
    match nibble {
        0..=12 => Ok(u32::from(nibble)),
        13 => {
            let b = *cur.first().ok_or(Error::MalformedMessage)?;
            *cur = &cur[1..];
            Ok(u32::from(b) + 13)
        }
        14 => {
            if cur.len() < 2 {
                return Err(Error::MalformedMessage);
            }
            let v = (u32::from(cur[0]) << 8) | u32::from(cur[1]);
            *cur = &cur[2..];
            Ok(v + 269)
        }
        // 15 is only legal as part of the payload marker.
        _ => Err(Error::MalformedMessage),
    }
}
