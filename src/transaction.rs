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

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Notify};

use crate::message::{Message, MsgType};

/// State for one request/response exchange.
///
/// A transaction is born when a message expecting a correlated follow-up is
/// sent or received, lingers for one exchange lifetime after completion so
/// duplicates can revive it, and is purged afterwards.
#[derive(Debug)]
pub struct Transaction {
    /// The request this exchange is about.
    pub request: Message,

    /// The response, once one exists.
    pub response: Option<Message>,

    /// The path of the resource the request resolved to.
    pub resource_path: Option<String>,

    /// Set once the exchange will see no further processing.
    pub completed: bool,

    /// Set while the block layer holds the exchange (2.31 Continue or an
    /// out-of-order error is on its way back).
    pub block_transfer: bool,

    /// Set when the response is an observe notification.
    pub notification: bool,

    /// Set when an observe relation was created for this exchange.
    pub observe_registered: bool,

    /// The request has been acknowledged (piggyback or empty Ack).
    pub request_acknowledged: bool,

    /// Our separately-sent confirmable response has been acknowledged.
    pub response_acknowledged: bool,

    /// The peer rejected the request with a Reset.
    pub request_rejected: bool,

    /// The peer rejected our response with a Reset.
    pub response_rejected: bool,

    /// Retransmission gave up without an acknowledgement.
    pub timed_out: bool,

    /// When the transaction was created; drives the purge sweep.
    pub timestamp: Instant,

    pub(crate) retransmit_stop: Option<Arc<Notify>>,
}

impl Transaction {
    /// Creates a transaction around `request`.
    pub fn new(request: Message) -> Transaction {
        Transaction {
            request,
            response: None,
            resource_path: None,
            completed: false,
            block_transfer: false,
            notification: false,
            observe_registered: false,
            request_acknowledged: false,
            response_acknowledged: false,
            request_rejected: false,
            response_rejected: false,
            timed_out: false,
            timestamp: Instant::now(),
            retransmit_stop: None,
        }
    }

    /// Builds a response template for this transaction's request: code set,
    /// token and addressing inherited, message type left for the message
    /// layer.
    pub fn reply(&self, code: crate::message::MsgCode) -> Message {
        let mut response = Message::response(code);
        response.token = self.request.token;
        response.destination = self.request.source;
        response.source = self.request.destination;
        response.scheme = self.request.scheme;
        response.multicast = false;
        response
    }

    /// Whether the request still awaits its acknowledgement, meaning a
    /// response sent now may ride piggyback on the Ack.
    pub fn can_piggyback(&self) -> bool {
        self.request.msg_type == Some(MsgType::Con) && !self.request_acknowledged
    }

    /// Stops the retransmission task attached to this transaction, if any.
    pub(crate) fn stop_retransmit(&mut self) {
        if let Some(stop) = self.retransmit_stop.take() {
            stop.notify_one();
        }
    }
}

/// A transaction behind its per-exchange lock.
///
/// Work that must not interleave (the request pipeline, retransmission
/// restart, Ack emission) runs while holding this lock; taking it is a
/// cooperative suspension point.
pub type SharedTransaction = Arc<Mutex<Transaction>>;

/// Wraps a request into a shared transaction.
pub fn shared(request: Message) -> SharedTransaction {
    Arc::new(Mutex::new(Transaction::new(request)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Method, MsgCode};

    #[test]
    fn reply_inherits_addressing() {
        let mut request = Message::request(Method::Get);
        request.token = crate::message::Token::new(&[1, 2, 3]);
        request.source = Some("127.0.0.1:40000".parse().unwrap());
        request.destination = Some("127.0.0.1:5683".parse().unwrap());

        let tx = Transaction::new(request);
        let reply = tx.reply(MsgCode::SuccessContent);

        assert_eq!(reply.code, MsgCode::SuccessContent);
        assert_eq!(reply.token.as_bytes(), &[1, 2, 3]);
        assert_eq!(reply.destination, tx.request.source);
        assert_eq!(reply.source, tx.request.destination);
        assert_eq!(reply.msg_type, None);
    }

    #[test]
    fn piggyback_window() {
        let request = Message::request(Method::Get);
        let mut tx = Transaction::new(request);
        assert!(tx.can_piggyback());

        tx.request_acknowledged = true;
        assert!(!tx.can_piggyback());
    }
}
