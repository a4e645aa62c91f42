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

//! The block layer: segmentation of outbound payloads and reassembly of
//! inbound ones, keyed by (peer, token).

use std::collections::HashMap;
use std::net::SocketAddr;

use log::{debug, warn};

use crate::block::Block;
use crate::content_format::ContentFormat;
use crate::message::{Message, MsgCode, Token};
use crate::transaction::Transaction;

/// An inbound Block1 transfer being reassembled.
#[derive(Debug)]
struct IncomingTransfer {
    payload: Vec<u8>,
    next_num: u32,
    declared_size: u32,
}

/// A response representation retained for Block2 continuation requests.
#[derive(Debug)]
struct StoredRepresentation {
    payload: Vec<u8>,
    format: Option<ContentFormat>,
    code: MsgCode,
}

/// An outbound request payload being sent block by block.
#[derive(Debug)]
struct OutgoingPayload {
    payload: Vec<u8>,
    szx: u8,
}

/// Block-wise transfer state. One transfer per (peer, token) is active at
/// a time in each direction.
pub(crate) struct BlockLayer {
    block1_receive: HashMap<(SocketAddr, Token), IncomingTransfer>,
    block2_send: HashMap<(SocketAddr, Token), StoredRepresentation>,
    block1_send: HashMap<(SocketAddr, Token), OutgoingPayload>,
    preferred_szx: u8,
    max_payload: usize,
}

impl BlockLayer {
    /// Creates the layer with the given single-message payload bound.
    pub fn new(max_payload: usize) -> BlockLayer {
        BlockLayer {
            block1_receive: HashMap::new(),
            block2_send: HashMap::new(),
            block1_send: HashMap::new(),
            preferred_szx: Block::szx_for_size(max_payload),
            max_payload,
        }
    }

    /// Handles the block options of an inbound request.
    ///
    /// Returns with `tx.block_transfer` set when the layer already built
    /// the response (an intermediate Continue, an out-of-order error, or a
    /// Block2 slice served from the retained representation) and the rest
    /// of the pipeline must be skipped.
    pub fn receive_request(&mut self, tx: &mut Transaction) {
        let source = match tx.request.source {
            Some(addr) => addr,
            None => return,
        };
        let key = (source, tx.request.token);

        if let Some(block1) = tx.request.block1() {
            self.receive_block1(key, block1, tx);
            if tx.block_transfer {
                return;
            }
        }

        if let Some(block2) = tx.request.block2() {
            // Continuation of a transfer we retained earlier; serve the
            // requested slice without re-running the handlers. Without a
            // retained representation the request renders afresh.
            self.serve_block2(key, block2, tx);
        }
    }

    fn receive_block1(&mut self, key: (SocketAddr, Token), block1: Block, tx: &mut Transaction) {
        use std::collections::hash_map::Entry;

        let declared = tx.request.size1().unwrap_or(0);

        let transfer = match self.block1_receive.entry(key) {
            Entry::Occupied(entry) => {
                if block1.num != entry.get().next_num {
                    warn!(
                        "out-of-order block {} (expected {})",
                        block1.num,
                        entry.get().next_num
                    );
                    tx.block_transfer = true;
                    tx.response =
                        Some(tx.reply(MsgCode::ClientErrorRequestEntityIncomplete));
                    return;
                }
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                if block1.num != 0 {
                    warn!("transfer starts at block {} instead of 0", block1.num);
                    tx.block_transfer = true;
                    tx.response =
                        Some(tx.reply(MsgCode::ClientErrorRequestEntityIncomplete));
                    return;
                }
                entry.insert(IncomingTransfer {
                    payload: Vec::new(),
                    next_num: 0,
                    declared_size: 0,
                })
            }
        };

        // Size1 advertises the total length and may only grow.
        if declared > transfer.declared_size {
            transfer.declared_size = declared;
        }

        transfer.payload.extend_from_slice(&tx.request.payload);
        transfer.next_num = block1.num + 1;

        let assembled = transfer.payload.len();
        let declared_size = transfer.declared_size;

        if declared_size != 0 && assembled > declared_size as usize {
            warn!(
                "assembled {} bytes but peer advertised Size1={}",
                assembled, declared_size
            );
            self.block1_receive.remove(&key);
            tx.block_transfer = true;
            tx.response = Some(tx.reply(MsgCode::ClientErrorRequestEntityTooLarge));
            return;
        }

        if block1.more {
            tx.block_transfer = true;
            let mut response = tx.reply(MsgCode::SuccessContinue);
            response.set_block1(block1);
            tx.response = Some(response);
        } else if let Some(transfer) = self.block1_receive.remove(&key) {
            // Last block: hand the assembled payload to the request layer.
            debug!("block1 transfer complete, {} bytes", transfer.payload.len());
            tx.request.payload = transfer.payload;
        }
    }

    fn serve_block2(&mut self, key: (SocketAddr, Token), block2: Block, tx: &mut Transaction) {
        let (payload_slice, more, total, format, code) = {
            let stored = match self.block2_send.get(&key) {
                Some(stored) => stored,
                None => return,
            };
            let szx = block2.szx.min(self.preferred_szx);
            let size = 1usize << (szx as usize + 4);
            let offset = block2.num as usize * size;

            if offset >= stored.payload.len() {
                tx.block_transfer = true;
                tx.response = Some(tx.reply(MsgCode::ClientErrorBadOption));
                return;
            }

            let end = (offset + size).min(stored.payload.len());
            (
                stored.payload[offset..end].to_vec(),
                end < stored.payload.len(),
                stored.payload.len(),
                stored.format,
                stored.code,
            )
        };

        tx.block_transfer = true;
        let mut response = tx.reply(code);
        if let Some(format) = format {
            response.set_content_format(format);
        }
        response.set_block2(Block {
            num: block2.num,
            more,
            szx: block2.szx.min(self.preferred_szx),
        });
        response.set_size2(total as u32);
        response.payload = payload_slice;
        tx.response = Some(response);

        if !more {
            debug!("block2 transfer exhausted");
            self.block2_send.remove(&key);
        }
    }

    /// Segments an oversized outbound response, or the slice of it the
    /// request asked for, retaining the full representation for
    /// continuation requests.
    pub fn send_response(&mut self, tx: &mut Transaction) {
        if tx.block_transfer {
            return;
        }

        // Acknowledge a completed Block1 upload in the final response.
        let request_block1 = tx.request.block1();
        let requested = tx.request.block2();

        let mut response = match tx.response.take() {
            Some(response) => response,
            None => return,
        };

        if let Some(block1) = request_block1 {
            if !response.code.is_error() {
                response.set_block1(block1.with_more(false));
            }
        }

        let splittable = response.code.is_success()
            && !response.payload.is_empty()
            && (response.payload.len() > self.max_payload || requested.is_some());
        if !splittable {
            tx.response = Some(response);
            return;
        }

        let dest = match response.destination {
            Some(addr) => addr,
            None => {
                tx.response = Some(response);
                return;
            }
        };

        let block = requested.unwrap_or(Block {
            num: 0,
            more: false,
            szx: self.preferred_szx,
        });
        let szx = block.szx.min(self.preferred_szx);
        let size = 1usize << (szx as usize + 4);
        let offset = block.num as usize * size;
        let total = response.payload.len();

        if offset >= total {
            tx.response = Some(tx.reply(MsgCode::ClientErrorBadOption));
            return;
        }

        let end = (offset + size).min(total);
        let more = end < total;

        let full = std::mem::replace(&mut response.payload, Vec::new());
        response.payload = full[offset..end].to_vec();
        response.set_block2(Block {
            num: block.num,
            more,
            szx,
        });
        response.set_size2(total as u32);

        if more {
            self.block2_send.insert(
                (dest, response.token),
                StoredRepresentation {
                    payload: full,
                    format: response.content_format(),
                    code: response.code,
                },
            );
        } else {
            self.block2_send.remove(&(dest, response.token));
        }

        tx.response = Some(response);
    }

    /// Splits an oversized outbound request, retaining the remainder.
    /// Returns true when the request was turned into a staged transfer.
    pub fn send_request(&mut self, request: &mut Message) -> bool {
        if request.payload.len() <= self.max_payload {
            return false;
        }
        let dest = match request.destination {
            Some(addr) => addr,
            None => return false,
        };

        let szx = self.preferred_szx;
        let size = 1usize << (szx as usize + 4);
        let total = request.payload.len();

        let full = std::mem::replace(&mut request.payload, Vec::new());
        request.payload = full[..size].to_vec();
        request.set_block1(Block {
            num: 0,
            more: true,
            szx,
        });
        request.set_size1(total as u32);

        self.block1_send
            .insert((dest, request.token), OutgoingPayload { payload: full, szx });
        true
    }

    /// Produces the (payload, descriptor) of the block following `acked`,
    /// or `None` when the transfer is exhausted (clearing the store).
    pub fn next_block1(
        &mut self,
        dest: SocketAddr,
        token: Token,
        acked: Block,
    ) -> Option<(Vec<u8>, Block)> {
        let key = (dest, token);
        let result = {
            let outgoing = self.block1_send.get(&key)?;
            let szx = acked.szx.min(outgoing.szx);
            let size = 1usize << (szx as usize + 4);
            let offset = (acked.num as usize + 1) * size;

            if offset >= outgoing.payload.len() {
                None
            } else {
                let end = (offset + size).min(outgoing.payload.len());
                Some((
                    outgoing.payload[offset..end].to_vec(),
                    Block {
                        num: acked.num + 1,
                        more: end < outgoing.payload.len(),
                        szx,
                    },
                ))
            }
        };

        if result.is_none() {
            self.block1_send.remove(&key);
        }
        result
    }

    /// Clears the outbound request store for an exhausted transfer.
    pub fn finish_block1(&mut self, dest: SocketAddr, token: Token) {
        self.block1_send.remove(&(dest, token));
    }

    /// Drops all state for an evicted exchange.
    pub fn purge(&mut self, key: &(SocketAddr, Token)) {
        self.block1_receive.remove(key);
        self.block2_send.remove(key);
        self.block1_send.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;

    fn request_with_block1(payload: &[u8], num: u32, more: bool, szx: u8) -> Transaction {
        let mut request = Message::request(Method::Post);
        request.mid = Some(100 + num as u16);
        request.source = Some("127.0.0.1:40000".parse().unwrap());
        request.destination = Some("127.0.0.1:5683".parse().unwrap());
        request.set_uri_path("/big");
        request.payload = payload.to_vec();
        request.set_block1(Block::new(num, more, szx).unwrap());
        Transaction::new(request)
    }

    #[test]
    fn block1_reassembles_in_order() {
        let mut layer = BlockLayer::new(1024);

        let mut tx = request_with_block1(b"aaaa", 0, true, 0);
        layer.receive_request(&mut tx);
        assert!(tx.block_transfer);
        let response = tx.response.as_ref().unwrap();
        assert_eq!(response.code, MsgCode::SuccessContinue);
        assert_eq!(response.block1(), Block::new(0, true, 0));

        let mut tx = request_with_block1(b"bbbb", 1, false, 0);
        layer.receive_request(&mut tx);
        assert!(!tx.block_transfer);
        assert_eq!(tx.request.payload, b"aaaabbbb");
    }

    #[test]
    fn block1_out_of_order_rejected() {
        let mut layer = BlockLayer::new(1024);

        // Starting anywhere but block 0 is incomplete.
        let mut tx = request_with_block1(b"xxxx", 1, true, 6);
        layer.receive_request(&mut tx);
        assert_eq!(
            tx.response.as_ref().unwrap().code,
            MsgCode::ClientErrorRequestEntityIncomplete
        );

        // Accept 0, then reject a skip to 3; the expected number stays 2.
        let mut tx = request_with_block1(b"aa", 0, true, 6);
        layer.receive_request(&mut tx);
        let mut tx = request_with_block1(b"bb", 1, true, 2);
        layer.receive_request(&mut tx);
        assert_eq!(tx.response.as_ref().unwrap().code, MsgCode::SuccessContinue);

        let mut tx = request_with_block1(b"dd", 3, true, 2);
        layer.receive_request(&mut tx);
        assert_eq!(
            tx.response.as_ref().unwrap().code,
            MsgCode::ClientErrorRequestEntityIncomplete
        );

        let mut tx = request_with_block1(b"cc", 2, false, 2);
        layer.receive_request(&mut tx);
        assert!(!tx.block_transfer);
        assert_eq!(tx.request.payload, b"aabbcc");
    }

    #[test]
    fn block1_size1_shrink_rejected() {
        let mut layer = BlockLayer::new(1024);

        let mut tx = request_with_block1(&[0x61; 100], 0, true, 2);
        tx.request.set_size1(120);
        layer.receive_request(&mut tx);
        assert_eq!(tx.response.as_ref().unwrap().code, MsgCode::SuccessContinue);

        // More data than the advertised total.
        let mut tx = request_with_block1(&[0x62; 100], 1, true, 2);
        tx.request.set_size1(120);
        layer.receive_request(&mut tx);
        assert_eq!(
            tx.response.as_ref().unwrap().code,
            MsgCode::ClientErrorRequestEntityTooLarge
        );
    }

    fn get_transaction(block2: Option<Block>) -> Transaction {
        let mut request = Message::request(Method::Get);
        request.mid = Some(7);
        request.source = Some("127.0.0.1:40000".parse().unwrap());
        request.destination = Some("127.0.0.1:5683".parse().unwrap());
        request.set_uri_path("/big");
        if let Some(b) = block2 {
            request.set_block2(b);
        }
        Transaction::new(request)
    }

    fn content_response(tx: &Transaction, len: usize) -> Message {
        let mut response = tx.reply(MsgCode::SuccessContent);
        response.payload = (0..len).map(|i| i as u8).collect();
        response.set_content_format(ContentFormat::TEXT_PLAIN_UTF8);
        response
    }

    #[test]
    fn block2_auto_split_and_serve() {
        let mut layer = BlockLayer::new(1024);

        // First GET: the 2041-byte representation is split and retained.
        let mut tx = get_transaction(None);
        tx.response = Some(content_response(&tx, 2041));
        layer.send_response(&mut tx);

        let response = tx.response.as_ref().unwrap();
        assert_eq!(response.block2(), Block::new(0, true, 6));
        assert_eq!(response.size2(), Some(2041));
        assert_eq!(response.payload.len(), 1024);

        // Continuation at a smaller size is served from the store.
        let mut tx = get_transaction(Block::new(3, false, 2));
        layer.receive_request(&mut tx);
        assert!(tx.block_transfer);
        let response = tx.response.as_ref().unwrap();
        assert_eq!(response.code, MsgCode::SuccessContent);
        assert_eq!(response.block2(), Block::new(3, true, 2));
        assert_eq!(response.size2(), Some(2041));
        assert_eq!(response.payload, (192..256).map(|i| i as u8).collect::<Vec<u8>>());
    }

    #[test]
    fn block2_final_slice_clears_store() {
        let mut layer = BlockLayer::new(1024);

        let mut tx = get_transaction(None);
        tx.response = Some(content_response(&tx, 1200));
        layer.send_response(&mut tx);
        assert!(tx.response.as_ref().unwrap().block2().unwrap().more);

        let mut tx = get_transaction(Block::new(1, false, 6));
        layer.receive_request(&mut tx);
        let response = tx.response.as_ref().unwrap();
        assert_eq!(response.block2(), Block::new(1, false, 6));
        assert_eq!(response.payload.len(), 1200 - 1024);

        // Store is gone; the next continuation renders afresh.
        let mut tx = get_transaction(Block::new(1, false, 6));
        layer.receive_request(&mut tx);
        assert!(!tx.block_transfer);
    }

    #[test]
    fn client_block1_staging() {
        let mut layer = BlockLayer::new(1024);
        let dest: SocketAddr = "127.0.0.1:5683".parse().unwrap();

        let mut request = Message::request(Method::Post);
        request.destination = Some(dest);
        request.token = Token::new(&[9]);
        request.payload = vec![0x61; 2500];

        assert!(layer.send_request(&mut request));
        assert_eq!(request.payload.len(), 1024);
        assert_eq!(request.block1(), Block::new(0, true, 6));
        assert_eq!(request.size1(), Some(2500));

        let (payload, block) = layer
            .next_block1(dest, request.token, Block::new(0, true, 6).unwrap())
            .unwrap();
        assert_eq!(payload.len(), 1024);
        assert_eq!(block, Block::new(1, true, 6).unwrap());

        let (payload, block) = layer
            .next_block1(dest, request.token, Block::new(1, true, 6).unwrap())
            .unwrap();
        assert_eq!(payload.len(), 2500 - 2048);
        assert_eq!(block, Block::new(2, false, 6).unwrap());

        assert!(layer
            .next_block1(dest, request.token, Block::new(2, false, 6).unwrap())
            .is_none());
    }

    #[test]
    fn large_transfer_reassembles_exactly() {
        let mut layer = BlockLayer::new(1024);
        let total = 200 * 1024 + 37;
        let body: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

        let mut num = 0u32;
        let mut offset = 0usize;
        let mut last = None;
        while offset < body.len() {
            let end = (offset + 1024).min(body.len());
            let more = end < body.len();
            let mut tx = request_with_block1(&body[offset..end], num, more, 6);
            layer.receive_request(&mut tx);
            if more {
                assert_eq!(
                    tx.response.as_ref().unwrap().code,
                    MsgCode::SuccessContinue
                );
            } else {
                last = Some(tx);
            }
            num += 1;
            offset = end;
        }

        let tx = last.unwrap();
        assert!(!tx.block_transfer);
        assert_eq!(tx.request.payload, body);
    }

    #[test]
    fn small_payloads_untouched() {
        let mut layer = BlockLayer::new(1024);
        let mut request = Message::request(Method::Post);
        request.destination = Some("127.0.0.1:5683".parse().unwrap());
        request.payload = vec![0x61; 100];
        assert!(!layer.send_request(&mut request));
        assert_eq!(request.block1(), None);

        let mut tx = get_transaction(None);
        tx.response = Some(content_response(&tx, 100));
        layer.send_response(&mut tx);
        assert_eq!(tx.response.as_ref().unwrap().block2(), None);
    }
}
