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

//! The observe layer: per-resource subscription lists and the 24-bit
//! notification sequence numbers.

use std::collections::HashMap;
use std::net::SocketAddr;

use log::{debug, info};

use crate::consts::{OBSERVE_DEREGISTER, OBSERVE_REGISTER};
use crate::content_format::ContentFormat;
use crate::message::{Message, MsgCode, Token};
use crate::resource::ResourceTree;
use crate::transaction::Transaction;

const OBSERVE_MODULUS: u32 = 1 << 24;

/// A registered observer of one resource: the subscriber's address and
/// token, the sequence counter, and the cached request used to rebuild
/// notifications.
#[derive(Debug, Clone)]
pub(crate) struct Subscription {
    /// Where notifications go.
    pub peer: SocketAddr,

    /// The token every notification carries.
    pub token: Token,

    /// The registration request, replayed through the request layer for
    /// each notification.
    pub request: Message,

    /// The last sequence number stamped on a notification.
    pub sequence: u32,

    /// The content format the subscriber asked for.
    pub accept: Option<ContentFormat>,
}

/// Subscription lists, keyed by resource path.
///
/// Only the subscriber's address and token are stored here, never a
/// transaction handle; notifications synthesize a fresh exchange.
pub(crate) struct ObserveLayer {
    relations: HashMap<String, HashMap<(SocketAddr, Token), Subscription>>,
}

impl ObserveLayer {
    pub fn new() -> ObserveLayer {
        ObserveLayer {
            relations: HashMap::new(),
        }
    }

    /// Handles the `Observe` option of an inbound GET: 0 registers the
    /// subscriber (if the resource is observable), 1 removes it.
    pub fn receive_request(&mut self, tx: &mut Transaction, tree: &ResourceTree) {
        if tx.request.code != MsgCode::MethodGet {
            return;
        }
        let peer = match tx.request.source {
            Some(addr) => addr,
            None => return,
        };
        let path = ResourceTree::normalize(&tx.request.uri_path());

        match tx.request.observe() {
            Some(OBSERVE_REGISTER) => {
                let observable = tree
                    .get(&path)
                    .map(|r| r.is_observable())
                    .unwrap_or(false);
                if !observable {
                    return;
                }
                info!("observe register {} {} on {}", peer, tx.request.token, path);
                let subscription = Subscription {
                    peer,
                    token: tx.request.token,
                    request: tx.request.clone(),
                    sequence: 0,
                    accept: tx.request.accept(),
                };
                self.relations
                    .entry(path)
                    .or_insert_with(HashMap::new)
                    .insert((peer, tx.request.token), subscription);
                tx.observe_registered = true;
            }
            Some(OBSERVE_DEREGISTER) => {
                info!("observe deregister {} on {}", peer, path);
                self.remove(&path, peer, tx.request.token);
            }
            _ => {}
        }
    }

    /// Stamps the next sequence number onto a response headed for a
    /// registered subscriber; an error response drops the relation
    /// instead.
    pub fn send_response(&mut self, tx: &mut Transaction) {
        let peer = match tx.request.source {
            Some(addr) => addr,
            None => return,
        };
        let path = match tx.resource_path.clone() {
            Some(path) => path,
            None => ResourceTree::normalize(&tx.request.uri_path()),
        };

        let response = match tx.response.as_mut() {
            Some(response) => response,
            None => return,
        };

        let key = (peer, tx.request.token);
        let drop_relation = {
            let subscription = match self
                .relations
                .get_mut(&path)
                .and_then(|subs| subs.get_mut(&key))
            {
                Some(subscription) => subscription,
                None => return,
            };

            if response.code.is_success() {
                subscription.sequence = (subscription.sequence + 1) % OBSERVE_MODULUS;
                response.set_observe(subscription.sequence);
                false
            } else {
                true
            }
        };

        if drop_relation {
            debug!("error response tears down observe relation on {}", path);
            self.remove(&path, peer, tx.request.token);
        }
    }

    /// The current subscribers of `path`, for the notification sweep.
    pub fn notify(&self, path: &str) -> Vec<Subscription> {
        let path = ResourceTree::normalize(path);
        match self.relations.get(&path) {
            Some(subs) => subs.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Removes one subscriber from one resource.
    pub fn remove(&mut self, path: &str, peer: SocketAddr, token: Token) -> bool {
        let mut removed = false;
        if let Some(subs) = self.relations.get_mut(path) {
            removed = subs.remove(&(peer, token)).is_some();
            if subs.is_empty() {
                self.relations.remove(path);
            }
        }
        removed
    }

    /// Removes a subscriber wherever it appears. A Reset to a
    /// notification, or retransmission exhaustion, lands here with only
    /// the peer address and token to go by.
    pub fn remove_subscriber(&mut self, peer: SocketAddr, token: Token) -> bool {
        let mut removed = false;
        self.relations.retain(|path, subs| {
            if subs.remove(&(peer, token)).is_some() {
                info!("observe relation on {} removed for {}", path, peer);
                removed = true;
            }
            !subs.is_empty()
        });
        removed
    }

    /// Takes every subscriber of `path`, e.g. to tell them the resource
    /// was deleted.
    pub fn take_all(&mut self, path: &str) -> Vec<Subscription> {
        let path = ResourceTree::normalize(path);
        match self.relations.remove(&path) {
            Some(subs) => subs.into_iter().map(|(_, s)| s).collect(),
            None => Vec::new(),
        }
    }
}

/// The reordering detector of RFC7641 §3.4: is sequence `b` newer than
/// `a` under 24-bit wrap-around?
pub(crate) fn sequence_newer(a: u32, b: u32) -> bool {
    (a < b && b - a < (1 << 23)) || (a > b && a - b > (1 << 23))
}
