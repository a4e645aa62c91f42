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

//! The CoAP message model: header fields, token, options, payload, and the
//! endpoint annotations the engine routes by.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::block::Block;
use crate::consts::{
    Scheme, NO_RESPONSE_CLIENT_ERROR, NO_RESPONSE_SERVER_ERROR, NO_RESPONSE_SUCCESS,
};
use crate::content_format::ContentFormat;
use crate::option::OptionNumber;
use crate::util::{encode_uint, try_decode_u16, try_decode_u32};

mod msg_code;
mod msg_type;
mod token;

pub mod codec;
pub mod framed;

pub use msg_code::{Method, MsgCode, MsgCodeClass};
pub use msg_type::MsgType;
pub use token::Token;

/// A CoAP protocol data unit.
///
/// Options are kept sorted by number; repeated values preserve insertion
/// order. The endpoint annotations (`source`, `destination`, `scheme`,
/// `multicast`) never appear on the wire; they are filled in by the endpoint
/// multiplexer on reception and consulted by it on transmission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// CON/NON/ACK/RST. `None` until the message layer decides how the
    /// message travels.
    pub msg_type: Option<MsgType>,

    /// The message code.
    pub code: MsgCode,

    /// The message-ID. `None` until assigned; never assigned on stream
    /// transports.
    pub mid: Option<u16>,

    /// The token correlating a request with its response.
    pub token: Token,

    options: BTreeMap<OptionNumber, Vec<Vec<u8>>>,

    /// The message payload.
    pub payload: Vec<u8>,

    /// Where the message came from (inbound) or a source-address hint
    /// (outbound).
    pub source: Option<SocketAddr>,

    /// Where the message is going (outbound) or was addressed to (inbound).
    pub destination: Option<SocketAddr>,

    /// The transport the message travels over.
    pub scheme: Scheme,

    /// Set when the message arrived on (or is destined for) a multicast
    /// group.
    pub multicast: bool,
}

impl Message {
    /// Creates a new empty message.
    pub fn new() -> Message {
        Default::default()
    }

    /// Creates a new confirmable request with the given method.
    pub fn request(method: Method) -> Message {
        Message {
            msg_type: Some(MsgType::Con),
            code: method.code(),
            ..Default::default()
        }
    }

    /// Creates a new response with the given code. The message type is left
    /// for the message layer to decide.
    pub fn response(code: MsgCode) -> Message {
        Message {
            msg_type: None,
            code,
            ..Default::default()
        }
    }

    /// Creates an empty acknowledgement for the given message-ID.
    pub fn empty_ack(mid: u16) -> Message {
        Message {
            msg_type: Some(MsgType::Ack),
            code: MsgCode::Empty,
            mid: Some(mid),
            ..Default::default()
        }
    }

    /// Creates a reset referencing the given message-ID, carrying `code` to
    /// describe why the referenced message was rejected.
    pub fn reset(mid: u16, code: MsgCode) -> Message {
        Message {
            msg_type: Some(MsgType::Rst),
            code,
            mid: Some(mid),
            ..Default::default()
        }
    }

    /// Returns true if this message carries a request method.
    pub fn is_request(&self) -> bool {
        self.code.is_method()
    }

    /// Returns true if this message carries a response code.
    pub fn is_response(&self) -> bool {
        self.code.is_response()
    }

    /// Returns true if this message carries the empty code.
    pub fn is_empty_code(&self) -> bool {
        self.code.is_empty()
    }

    // ---------------------------------------------------------------------
    // Raw option access

    /// Appends a value for the given option, preserving insertion order
    /// among repeats.
    pub fn add_option(&mut self, number: OptionNumber, value: Vec<u8>) {
        self.options.entry(number).or_insert_with(Vec::new).push(value);
    }

    /// Replaces all values of the given option with a single value.
    pub fn set_option(&mut self, number: OptionNumber, value: Vec<u8>) {
        self.options.insert(number, vec![value]);
    }

    /// Removes all values of the given option.
    pub fn clear_option(&mut self, number: OptionNumber) {
        self.options.remove(&number);
    }

    /// Returns true if at least one value of the given option is present.
    pub fn has_option(&self, number: OptionNumber) -> bool {
        self.options.contains_key(&number)
    }

    /// The first value of the given option, if present.
    pub fn option_first(&self, number: OptionNumber) -> Option<&[u8]> {
        self.options
            .get(&number)
            .and_then(|v| v.first())
            .map(|v| v.as_slice())
    }

    /// All values of the given option, in insertion order.
    pub fn option_values(&self, number: OptionNumber) -> Vec<&[u8]> {
        match self.options.get(&number) {
            Some(values) => values.iter().map(|v| v.as_slice()).collect(),
            None => Vec::new(),
        }
    }

    /// Iterates every option in ascending number order, repeats in
    /// insertion order.
    pub fn options(&self) -> impl Iterator<Item = (OptionNumber, &[u8])> {
        self.options
            .iter()
            .flat_map(|(number, values)| values.iter().map(move |v| (*number, v.as_slice())))
    }

    fn option_u32(&self, number: OptionNumber) -> Option<u32> {
        self.option_first(number).and_then(try_decode_u32)
    }

    fn option_u16(&self, number: OptionNumber) -> Option<u16> {
        self.option_first(number).and_then(try_decode_u16)
    }

    // ---------------------------------------------------------------------
    // Typed option access

    /// The absolute request path assembled from the `Uri-Path` options,
    /// always with a leading slash.
    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for segment in self.option_values(OptionNumber::URI_PATH) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    /// Replaces the `Uri-Path` options with the segments of `path`.
    pub fn set_uri_path(&mut self, path: &str) {
        self.clear_option(OptionNumber::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(OptionNumber::URI_PATH, segment.as_bytes().to_vec());
        }
    }

    /// The query string assembled from the `Uri-Query` options, without the
    /// leading `?`.
    pub fn uri_query(&self) -> Option<String> {
        let items = self.option_values(OptionNumber::URI_QUERY);
        if items.is_empty() {
            return None;
        }
        Some(
            items
                .iter()
                .map(|item| String::from_utf8_lossy(item).into_owned())
                .collect::<Vec<_>>()
                .join("&"),
        )
    }

    /// Replaces the `Uri-Query` options with the `&`-separated items of
    /// `query`.
    pub fn set_uri_query(&mut self, query: &str) {
        self.clear_option(OptionNumber::URI_QUERY);
        for item in query.split('&').filter(|s| !s.is_empty()) {
            self.add_option(OptionNumber::URI_QUERY, item.as_bytes().to_vec());
        }
    }

    /// The `Content-Format` option.
    pub fn content_format(&self) -> Option<ContentFormat> {
        self.option_u16(OptionNumber::CONTENT_FORMAT).map(ContentFormat)
    }

    /// Sets the `Content-Format` option.
    pub fn set_content_format(&mut self, format: ContentFormat) {
        self.set_option(OptionNumber::CONTENT_FORMAT, encode_uint(u32::from(format.0)));
    }

    /// The `Accept` option.
    pub fn accept(&self) -> Option<ContentFormat> {
        self.option_u16(OptionNumber::ACCEPT).map(ContentFormat)
    }

    /// Sets the `Accept` option.
    pub fn set_accept(&mut self, format: ContentFormat) {
        self.set_option(OptionNumber::ACCEPT, encode_uint(u32::from(format.0)));
    }

    /// The `Observe` option.
    pub fn observe(&self) -> Option<u32> {
        self.option_u32(OptionNumber::OBSERVE)
    }

    /// Sets the `Observe` option.
    pub fn set_observe(&mut self, value: u32) {
        self.set_option(OptionNumber::OBSERVE, encode_uint(value & 0x00FF_FFFF));
    }

    /// The `Block1` option.
    pub fn block1(&self) -> Option<Block> {
        self.option_u32(OptionNumber::BLOCK1).and_then(Block::from_raw)
    }

    /// Sets the `Block1` option.
    pub fn set_block1(&mut self, block: Block) {
        self.set_option(OptionNumber::BLOCK1, encode_uint(block.to_raw()));
    }

    /// The `Block2` option.
    pub fn block2(&self) -> Option<Block> {
        self.option_u32(OptionNumber::BLOCK2).and_then(Block::from_raw)
    }

    /// Sets the `Block2` option.
    pub fn set_block2(&mut self, block: Block) {
        self.set_option(OptionNumber::BLOCK2, encode_uint(block.to_raw()));
    }

    /// The `Size1` option.
    pub fn size1(&self) -> Option<u32> {
        self.option_u32(OptionNumber::SIZE1)
    }

    /// Sets the `Size1` option.
    pub fn set_size1(&mut self, size: u32) {
        self.set_option(OptionNumber::SIZE1, encode_uint(size));
    }

    /// The `Size2` option.
    pub fn size2(&self) -> Option<u32> {
        self.option_u32(OptionNumber::SIZE2)
    }

    /// Sets the `Size2` option.
    pub fn set_size2(&mut self, size: u32) {
        self.set_option(OptionNumber::SIZE2, encode_uint(size));
    }

    /// The `Max-Age` option.
    pub fn max_age(&self) -> Option<u32> {
        self.option_u32(OptionNumber::MAX_AGE)
    }

    /// Sets the `Max-Age` option.
    pub fn set_max_age(&mut self, seconds: u32) {
        self.set_option(OptionNumber::MAX_AGE, encode_uint(seconds));
    }

    /// All `ETag` option values.
    pub fn etags(&self) -> Vec<&[u8]> {
        self.option_values(OptionNumber::ETAG)
    }

    /// Appends an `ETag` option value.
    pub fn add_etag(&mut self, etag: &[u8]) {
        self.add_option(OptionNumber::ETAG, etag.to_vec());
    }

    /// All `If-Match` option values.
    pub fn if_match(&self) -> Vec<&[u8]> {
        self.option_values(OptionNumber::IF_MATCH)
    }

    /// Returns true if at least one `If-Match` option is present.
    pub fn has_if_match(&self) -> bool {
        self.has_option(OptionNumber::IF_MATCH)
    }

    /// Appends an `If-Match` option value.
    pub fn add_if_match(&mut self, etag: &[u8]) {
        self.add_option(OptionNumber::IF_MATCH, etag.to_vec());
    }

    /// Presence of the `If-None-Match` option.
    pub fn if_none_match(&self) -> bool {
        self.has_option(OptionNumber::IF_NONE_MATCH)
    }

    /// Sets the `If-None-Match` flag option.
    pub fn set_if_none_match(&mut self) {
        self.set_option(OptionNumber::IF_NONE_MATCH, Vec::new());
    }

    /// The location path assembled from the `Location-Path` options,
    /// without a leading slash.
    pub fn location_path(&self) -> Option<String> {
        let segments = self.option_values(OptionNumber::LOCATION_PATH);
        if segments.is_empty() {
            return None;
        }
        Some(
            segments
                .iter()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }

    /// Replaces the `Location-Path` options with the segments of `path`.
    pub fn set_location_path(&mut self, path: &str) {
        self.clear_option(OptionNumber::LOCATION_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(OptionNumber::LOCATION_PATH, segment.as_bytes().to_vec());
        }
    }

    /// The location query assembled from the `Location-Query` options.
    pub fn location_query(&self) -> Option<String> {
        let items = self.option_values(OptionNumber::LOCATION_QUERY);
        if items.is_empty() {
            return None;
        }
        Some(
            items
                .iter()
                .map(|item| String::from_utf8_lossy(item).into_owned())
                .collect::<Vec<_>>()
                .join("&"),
        )
    }

    /// Replaces the `Location-Query` options with the `&`-separated items
    /// of `query`.
    pub fn set_location_query(&mut self, query: &str) {
        self.clear_option(OptionNumber::LOCATION_QUERY);
        for item in query.split('&').filter(|s| !s.is_empty()) {
            self.add_option(OptionNumber::LOCATION_QUERY, item.as_bytes().to_vec());
        }
    }

    /// The `No-Response` suppression mask, if present.
    pub fn no_response(&self) -> Option<u8> {
        self.option_u32(OptionNumber::NO_RESPONSE).map(|v| v as u8)
    }

    /// Returns true if this request's `No-Response` mask suppresses a
    /// response of the given code.
    pub fn suppresses_response(&self, code: MsgCode) -> bool {
        let mask = match self.no_response() {
            Some(mask) => mask,
            None => return false,
        };
        match code.class() {
            2 => mask & NO_RESPONSE_SUCCESS != 0,
            4 => mask & NO_RESPONSE_CLIENT_ERROR != 0,
            5 => mask & NO_RESPONSE_SERVER_ERROR != 0,
            _ => false,
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.msg_type {
            Some(t) => write!(f, "{} ", t)?,
            None => f.write_str("??? ")?,
        }
        write!(f, "{}", self.code)?;
        if let Some(mid) = self.mid {
            write!(f, " MID={}", mid)?;
        }
        if !self.token.is_empty() {
            write!(f, " Token={}", self.token)?;
        }
        for (number, value) in self.options() {
            f.write_str(" ")?;
            number.fmt_with_value(f, value)?;
        }
        if !self.payload.is_empty() {
            write!(f, " [{} byte payload]", self.payload.len())?;
        }
        Ok(())
    }
}
