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

//! The stream-transport framing of RFC8323: a variable-length prefix in
//! place of the datagram fixed header, no message-ID, and in-band
//! signalling messages.

use super::{codec, Message, MsgCode, Token};
use crate::error::Error;
use crate::option::OptionNumber;
use crate::util::{encode_uint, try_decode_u32};

/// Length values 13, 14, and 15 shift the remaining length into one, two,
/// or four extension bytes with these offsets.
const LEN_OFFSET_1: usize = 13;
const LEN_OFFSET_2: usize = 269;
const LEN_OFFSET_4: usize = 65805;

/// The `Max-Message-Size` option of a CSM signalling message.
pub const CSM_MAX_MESSAGE_SIZE: OptionNumber = OptionNumber(2);

/// The `Block-Wise-Transfer` option of a CSM signalling message.
pub const CSM_BLOCK_WISE_TRANSFER: OptionNumber = OptionNumber(4);

/// The `Custody` option of Ping and Pong signalling messages.
pub const SIGNAL_CUSTODY: OptionNumber = OptionNumber(2);

/// The default `Max-Message-Size` advertised when none was negotiated.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1152;

/// Serializes a message for a stream transport. Message type and
/// message-ID are not transmitted.
pub fn encode(msg: &Message) -> Result<Vec<u8>, Error> {
    let mut body = Vec::new();
    codec::encode_options_into(msg, &mut body)?;

    let mut out = Vec::with_capacity(body.len() + msg.token.len() + 6);
    let tkl = msg.token.len() as u8;
    match body.len() {
        len if len < LEN_OFFSET_1 => {
            out.push(((len as u8) << 4) | tkl);
        }
        len if len < LEN_OFFSET_2 => {
            out.push((13 << 4) | tkl);
            out.push((len - LEN_OFFSET_1) as u8);
        }
        len if len < LEN_OFFSET_4 => {
            let ext = len - LEN_OFFSET_2;
            out.push((14 << 4) | tkl);
            out.push((ext >> 8) as u8);
            out.push(ext as u8);
        }
        len => {
            let ext = (len - LEN_OFFSET_4) as u32;
            out.push((15 << 4) | tkl);
            out.extend_from_slice(&ext.to_be_bytes());
        }
    }
    out.push(msg.code as u8);
    out.extend_from_slice(msg.token.as_bytes());
    out.extend_from_slice(&body);

    Ok(out)
}

/// Attempts to deserialize one message from the front of a stream buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// on success, returns the message and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, Error> {
    let first = match buf.first() {
        Some(b) => *b,
        None => return Ok(None),
    };

    let len_nibble = (first >> 4) as usize;
    let tkl = (first & 0x0F) as usize;
    if tkl > 8 {
        return Err(Error::MalformedMessage);
    }

    let (ext_len, offset) = match len_nibble {
        13 => (1, LEN_OFFSET_1),
        14 => (2, LEN_OFFSET_2),
        15 => (4, LEN_OFFSET_4),
        _ => (0, 0),
    };

    if buf.len() < 1 + ext_len + 1 {
        return Ok(None);
    }

    let body_len = if ext_len == 0 {
        len_nibble
    } else {
        let mut ext = 0usize;
        for b in &buf[1..1 + ext_len] {
            ext = (ext << 8) | usize::from(*b);
        }
        ext + offset
    };

    let code_at = 1 + ext_len;
    let token_at = code_at + 1;
    let total = token_at + tkl + body_len;
    if buf.len() < total {
        return Ok(None);
    }

    let code = MsgCode::try_from(buf[code_at]).ok_or(Error::MalformedMessage)?;
    let token = Token::new(&buf[token_at..token_at + tkl]);

    // Signalling codes carry their own option namespace; bypass the
    // datagram registry for them.
    let (options, payload) =
        codec::decode_option_stream_with(&buf[token_at + tkl..total], code.is_signal())?;

    let msg = Message {
        msg_type: None,
        code,
        mid: None,
        token,
        options,
        payload,
        ..Default::default()
    };

    Ok(Some((msg, total)))
}

/// The settings a peer announces in its Capabilities-and-Settings message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CsmSettings {
    /// The largest message the peer is willing to process.
    pub max_message_size: u32,

    /// Whether the peer understands block-wise transfers.
    pub block_wise_transfer: bool,
}

impl Default for CsmSettings {
    fn default() -> Self {
        CsmSettings {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            block_wise_transfer: false,
        }
    }
}

/// Builds the CSM message announcing our own settings.
pub fn csm(settings: CsmSettings) -> Message {
    let mut msg = Message::new();
    msg.code = MsgCode::SignalCsm;
    msg.set_option(CSM_MAX_MESSAGE_SIZE, encode_uint(settings.max_message_size));
    if settings.block_wise_transfer {
        msg.set_option(CSM_BLOCK_WISE_TRANSFER, Vec::new());
    }
    msg
}

/// Reads the settings out of a received CSM message.
///
/// Unknown critical CSM options abort the connection per RFC8323; unknown
/// elective options are ignored.
pub fn parse_csm(msg: &Message) -> Result<CsmSettings, Error> {
    let mut settings = CsmSettings::default();
    for (number, value) in msg.options() {
        if number == CSM_MAX_MESSAGE_SIZE {
            settings.max_message_size =
                try_decode_u32(value).ok_or(Error::MalformedMessage)?;
        } else if number == CSM_BLOCK_WISE_TRANSFER {
            settings.block_wise_transfer = true;
        } else if number.is_critical() {
            return Err(Error::UnknownCriticalOption);
        }
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;

    #[test]
    fn round_trip_small() {
        let mut msg = Message::request(Method::Get);
        msg.token = Token::new(&[0xAB]);
        msg.set_uri_path("/big");

        let wire = encode(&msg).unwrap();
        let (decoded, consumed) = decode(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded.code, MsgCode::MethodGet);
        assert_eq!(decoded.token, msg.token);
        assert_eq!(decoded.uri_path(), "/big");
        assert_eq!(decoded.mid, None);
    }

    #[test]
    fn length_classes() {
        for &payload_len in &[0usize, 12, 13, 268, 269, 65804, 65805, 70000] {
            let mut msg = Message::request(Method::Put);
            msg.set_uri_path("/x");
            msg.payload = vec![0x42; payload_len];

            let wire = encode(&msg).unwrap();
            let (decoded, consumed) = decode(&wire).unwrap().unwrap();
            assert_eq!(consumed, wire.len(), "payload_len={}", payload_len);
            assert_eq!(decoded.payload.len(), payload_len);
        }
    }

    #[test]
    fn incomplete_frames_need_more() {
        let mut msg = Message::request(Method::Get);
        msg.token = Token::new(&[1, 2, 3, 4]);
        msg.payload = vec![0x55; 300];
        let wire = encode(&msg).unwrap();

        for cut in 0..wire.len() {
            assert!(decode(&wire[..cut]).unwrap().is_none(), "cut={}", cut);
        }
    }

    #[test]
    fn two_messages_back_to_back() {
        let mut a = Message::request(Method::Get);
        a.set_uri_path("/a");
        let mut b = Message::request(Method::Get);
        b.set_uri_path("/b");

        let mut wire = encode(&a).unwrap();
        let second_at = wire.len();
        wire.extend(encode(&b).unwrap());

        let (first, consumed) = decode(&wire).unwrap().unwrap();
        assert_eq!(consumed, second_at);
        assert_eq!(first.uri_path(), "/a");

        let (second, _) = decode(&wire[consumed..]).unwrap().unwrap();
        assert_eq!(second.uri_path(), "/b");
    }

    #[test]
    fn csm_round_trip() {
        let announced = CsmSettings {
            max_message_size: 1024 * 1024,
            block_wise_transfer: true,
        };
        let wire = encode(&csm(announced)).unwrap();
        let (decoded, _) = decode(&wire).unwrap().unwrap();
        assert_eq!(decoded.code, MsgCode::SignalCsm);
        assert_eq!(parse_csm(&decoded).unwrap(), announced);
    }

    #[test]
    fn csm_defaults() {
        let wire = encode(&csm(CsmSettings {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            block_wise_transfer: false,
        }))
        .unwrap();
        let (decoded, _) = decode(&wire).unwrap().unwrap();
        let settings = parse_csm(&decoded).unwrap();
        assert_eq!(settings.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(!settings.block_wise_transfer);
    }
}
