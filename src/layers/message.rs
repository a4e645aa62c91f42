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

//! The message layer: matching by (peer, message-ID) and (peer, token),
//! duplicate suppression, and MID/token assignment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use crate::message::{Message, MsgType, Token};
use crate::transaction::{shared, SharedTransaction};

/// How the message layer classified an inbound request.
pub(crate) enum RequestDisposition {
    /// First sighting; a fresh transaction was created and indexed.
    New(SharedTransaction),

    /// The (peer, message-ID) pair matched a live transaction.
    Duplicate(SharedTransaction),
}

/// How the message layer classified an inbound response.
pub(crate) enum ResponseMatch {
    /// The response belongs to this transaction.
    Matched {
        /// The matched transaction.
        transaction: SharedTransaction,
        /// The response matched on (peer, message-ID) rather than token;
        /// the caller must verify the token agrees.
        by_mid: bool,
        /// The response was confirmable and wants an empty Ack.
        send_ack: bool,
    },

    /// Nothing matched; log and discard.
    Unmatched,
}

/// The four exchange tables plus the MID allocator.
pub(crate) struct MessageLayer {
    recv_mid: HashMap<(SocketAddr, u16), SharedTransaction>,
    recv_token: HashMap<(SocketAddr, Token), SharedTransaction>,
    sent_mid: HashMap<(SocketAddr, u16), SharedTransaction>,
    sent_token: HashMap<(SocketAddr, Token), SharedTransaction>,
    next_mid: u16,
}

impl MessageLayer {
    /// Creates the layer with a randomized initial message-ID.
    pub fn new() -> MessageLayer {
        MessageLayer {
            recv_mid: HashMap::new(),
            recv_token: HashMap::new(),
            sent_mid: HashMap::new(),
            sent_token: HashMap::new(),
            next_mid: rand::thread_rng().gen(),
        }
    }

    /// The next message-ID, incrementing modulo 2^16.
    pub fn fetch_mid(&mut self) -> u16 {
        let mid = self.next_mid;
        self.next_mid = self.next_mid.wrapping_add(1);
        mid
    }

    /// A fresh 8-byte random token.
    pub fn fetch_token() -> Token {
        Token::random()
    }

    /// A fresh token, redrawn until it is unique among the in-flight
    /// requests to `dest`.
    pub fn unique_token(&self, dest: SocketAddr) -> Token {
        let mut token = Self::fetch_token();
        while self.sent_token.contains_key(&(dest, token)) {
            token = Self::fetch_token();
        }
        token
    }

    /// Classifies an inbound request, indexing it when it is new.
    ///
    /// Multicast requests are indexed by token only, under the group
    /// address the request was sent to.
    pub fn receive_request(&mut self, request: Message) -> RequestDisposition {
        let source = match request.source {
            Some(addr) => addr,
            None => {
                // The driver always stamps a source; treat a missing one as new.
                debug!("receive_request: no source address");
                return RequestDisposition::New(shared(request));
            }
        };

        if request.multicast {
            let group = request.destination.unwrap_or(source);
            let key = (group, request.token);
            if let Some(transaction) = self.recv_token.get(&key) {
                debug!("duplicate multicast request from {}", source);
                return RequestDisposition::Duplicate(transaction.clone());
            }
            let transaction = shared(request);
            self.recv_token.insert(key, transaction.clone());
            return RequestDisposition::New(transaction);
        }

        if let Some(mid) = request.mid {
            if let Some(transaction) = self.recv_mid.get(&(source, mid)) {
                debug!("duplicate request MID={} from {}", mid, source);
                return RequestDisposition::Duplicate(transaction.clone());
            }
        }

        let mid = request.mid;
        let token = request.token;
        let transaction = shared(request);
        if let Some(mid) = mid {
            self.recv_mid.insert((source, mid), transaction.clone());
        }
        self.recv_token.insert((source, token), transaction.clone());
        RequestDisposition::New(transaction)
    }

    /// Pairs an inbound response with the request that caused it.
    ///
    /// Lookup order is `sent_mid`, then `sent_token`, then the token-only
    /// index of multicast requests.
    pub fn receive_response(&mut self, response: &Message) -> ResponseMatch {
        let source = match response.source {
            Some(addr) => addr,
            None => return ResponseMatch::Unmatched,
        };

        let send_ack = response.msg_type == Some(MsgType::Con);
        let is_ack_or_rst = matches!(
            response.msg_type,
            Some(MsgType::Ack) | Some(MsgType::Rst)
        );

        if is_ack_or_rst {
            if let Some(mid) = response.mid {
                if let Some(transaction) = self.sent_mid.get(&(source, mid)) {
                    return ResponseMatch::Matched {
                        transaction: transaction.clone(),
                        by_mid: true,
                        send_ack,
                    };
                }
            }
        }

        if let Some(transaction) = self.sent_token.get(&(source, response.token)) {
            return ResponseMatch::Matched {
                transaction: transaction.clone(),
                by_mid: false,
                send_ack,
            };
        }

        // A unicast response to a multicast request arrives from an address
        // we never indexed; fall back to the token-only multicast index.
        let multicast_hit = self
            .sent_token
            .iter()
            .find(|((addr, token), _)| addr.ip().is_multicast() && *token == response.token)
            .map(|(_, transaction)| transaction.clone());
        if let Some(transaction) = multicast_hit {
            return ResponseMatch::Matched {
                transaction,
                by_mid: false,
                send_ack,
            };
        }

        warn!("un-matched incoming response from {}", source);
        ResponseMatch::Unmatched
    }

    /// Pairs an inbound empty Ack/Reset with the confirmable it references:
    /// either a request we sent, or a separately-sent response of ours.
    pub fn receive_empty(&mut self, message: &Message) -> Option<SharedTransaction> {
        let source = message.source?;

        if let Some(mid) = message.mid {
            if let Some(transaction) = self.sent_mid.get(&(source, mid)) {
                return Some(transaction.clone());
            }
            if let Some(transaction) = self.recv_mid.get(&(source, mid)) {
                return Some(transaction.clone());
            }
        }

        if !message.token.is_empty() {
            if let Some(transaction) = self.sent_token.get(&(source, message.token)) {
                return Some(transaction.clone());
            }
            if let Some(transaction) = self.recv_token.get(&(source, message.token)) {
                return Some(transaction.clone());
            }
        }

        warn!("un-matched incoming empty message from {}", source);
        None
    }

    /// Fills in type, message-ID, and token for an outbound request, and
    /// indexes the new transaction.
    ///
    /// Auto-assigned tokens are redrawn until they are unique among the
    /// in-flight requests to the same peer.
    pub fn send_request(
        &mut self,
        request: &mut Message,
    ) -> Result<SharedTransaction, crate::error::Error> {
        if request.msg_type.is_none() {
            request.msg_type = Some(MsgType::Con);
        }

        let stream = request.scheme.is_stream();
        if !stream && request.mid.is_none() {
            request.mid = Some(self.fetch_mid());
        }

        let dest = request
            .destination
            .ok_or(crate::error::Error::InvalidArgument)?;

        if request.token.is_empty() {
            let mut token = Self::fetch_token();
            while self.sent_token.contains_key(&(dest, token)) {
                token = Self::fetch_token();
            }
            request.token = token;
        }

        let transaction = shared(request.clone());

        if request.multicast {
            self.sent_token
                .insert((dest, request.token), transaction.clone());
        } else {
            if let Some(mid) = request.mid {
                self.sent_mid.insert((dest, mid), transaction.clone());
            }
            self.sent_token
                .insert((dest, request.token), transaction.clone());
        }

        Ok(transaction)
    }

    /// Decides how an outbound response travels: piggybacked on the Ack,
    /// non-confirmable mirroring a NON request, or as a separate
    /// confirmable with its own message-ID.
    ///
    /// Needs the shared handle so separately-identified responses can be
    /// indexed for later Ack/Reset matching.
    pub fn send_response(
        &mut self,
        transaction: &SharedTransaction,
        tx: &mut crate::transaction::Transaction,
    ) {
        let mut response = match tx.response.take() {
            Some(response) => response,
            None => {
                tx.completed = true;
                return;
            }
        };

        if response.scheme.is_stream() {
            if response.msg_type.is_none() {
                response.msg_type = Some(MsgType::Non);
            }
            response.mid = None;
            tx.response = Some(response);
            tx.request_acknowledged = true;
            tx.completed = true;
            return;
        }

        if response.msg_type.is_none() {
            if tx.can_piggyback() {
                response.msg_type = Some(MsgType::Ack);
                response.mid = tx.request.mid;
                tx.response_acknowledged = true;
                tx.completed = true;
            } else if tx.request.msg_type == Some(MsgType::Non) {
                response.msg_type = Some(MsgType::Non);
            } else {
                response.msg_type = Some(MsgType::Con);
            }
        }

        if response.mid.is_none() {
            let mid = self.fetch_mid();
            response.mid = Some(mid);
            if let Some(dest) = response.destination {
                // Index separately-identified responses so a Reset (for
                // example to an observe notification) finds its exchange.
                self.recv_mid.insert((dest, mid), transaction.clone());
            }
        }

        tx.response = Some(response);
        tx.request_acknowledged = true;
    }

    /// Drops transactions older than the exchange lifetime, or already
    /// completed, from all four tables. Returns the token keys that were
    /// evicted so the block layer can clear its reassembly buffers.
    pub fn purge(&mut self, lifetime: Duration) -> Vec<(SocketAddr, Token)> {
        let expired = |transaction: &SharedTransaction| -> bool {
            match transaction.try_lock() {
                Ok(tx) => tx.completed || tx.timestamp.elapsed() > lifetime,
                // Locked means in use; keep it this sweep.
                Err(_) => false,
            }
        };

        self.recv_mid.retain(|_, v| !expired(v));
        self.sent_mid.retain(|_, v| !expired(v));
        self.sent_token.retain(|_, v| !expired(v));

        let mut evicted = Vec::new();
        self.recv_token.retain(|key, v| {
            if expired(v) {
                evicted.push(*key);
                false
            } else {
                true
            }
        });
        debug!(
            "purge: {} exchanges evicted, {} live",
            evicted.len(),
            self.recv_token.len()
        );
        evicted
    }

    /// Forgets a single sent exchange, e.g. when its waiter is gone.
    pub fn forget_sent(&mut self, dest: SocketAddr, mid: Option<u16>, token: Token) {
        if let Some(mid) = mid {
            self.sent_mid.remove(&(dest, mid));
        }
        self.sent_token.remove(&(dest, token));
    }
}
