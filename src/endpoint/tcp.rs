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

//! Per-connection state for the stream transport: frame accumulation and
//! the Capabilities-and-Settings exchange.

use crate::error::Error;
use crate::message::framed::{self, CsmSettings};
use crate::message::Message;

/// Accumulates stream bytes and peels complete frames off the front.
pub(crate) struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> FrameBuffer {
        FrameBuffer { buf: Vec::new() }
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Removes and returns the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Message>, Error> {
        match framed::decode(&self.buf)? {
            Some((message, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}

/// One stream connection's signalling state.
///
/// A CSM must arrive before anything else; until then every non-signal
/// frame aborts the connection.
pub(crate) struct ConnectionState {
    /// The peer's CSM arrived.
    pub csm_received: bool,

    /// What the peer announced.
    pub peer_settings: CsmSettings,
}

impl ConnectionState {
    pub fn new() -> ConnectionState {
        ConnectionState {
            csm_received: false,
            peer_settings: CsmSettings::default(),
        }
    }

    /// Records the peer's CSM.
    pub fn record_csm(&mut self, message: &Message) -> Result<(), Error> {
        self.peer_settings = framed::parse_csm(message)?;
        self.csm_received = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Method, MsgCode, Token};

    #[test]
    fn frames_split_across_reads() {
        let mut msg = Message::request(Method::Get);
        msg.token = Token::new(&[1]);
        msg.set_uri_path("/big");
        msg.payload = vec![0x61; 500];
        let wire = framed::encode(&msg).unwrap();

        let mut buffer = FrameBuffer::new();
        let (head, tail) = wire.split_at(7);

        buffer.extend(head);
        assert!(buffer.next_frame().unwrap().is_none());

        buffer.extend(tail);
        let decoded = buffer.next_frame().unwrap().unwrap();
        assert_eq!(decoded.uri_path(), "/big");
        assert_eq!(decoded.payload.len(), 500);
        assert!(buffer.next_frame().unwrap().is_none());
    }

    #[test]
    fn csm_exchange_state() {
        let mut state = ConnectionState::new();
        assert!(!state.csm_received);

        let wire = framed::encode(&framed::csm(CsmSettings {
            max_message_size: 4096,
            block_wise_transfer: true,
        }))
        .unwrap();
        let (csm_msg, _) = framed::decode(&wire).unwrap().unwrap();
        assert_eq!(csm_msg.code, MsgCode::SignalCsm);

        state.record_csm(&csm_msg).unwrap();
        assert!(state.csm_received);
        assert_eq!(state.peer_settings.max_message_size, 4096);
        assert!(state.peer_settings.block_wise_transfer);
    }
}
