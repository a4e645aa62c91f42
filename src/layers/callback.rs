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

//! The callback layer: pairing client requests with their eventual
//! response, timeout, or cancellation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::warn;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::message::{Message, Token};

type Waiter = oneshot::Sender<Result<Message, Error>>;

/// Single-shot completion handles for in-flight client requests, keyed by
/// token.
pub(crate) struct CallbackLayer {
    waiters: Mutex<HashMap<Token, Waiter>>,
}

impl CallbackLayer {
    pub fn new() -> CallbackLayer {
        CallbackLayer {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a waiter for `token`. Register before transmitting, so a
    /// fast response cannot slip past the table.
    pub fn register(&self, token: Token) -> oneshot::Receiver<Result<Message, Error>> {
        let (sender, receiver) = oneshot::channel();
        self.waiters
            .lock()
            .expect("Lock failed")
            .insert(token, sender);
        receiver
    }

    /// Suspends until the registered waiter is completed or `timeout`
    /// elapses. The handle is always removed on exit.
    pub async fn wait(
        &self,
        token: Token,
        receiver: oneshot::Receiver<Result<Message, Error>>,
        timeout: Duration,
    ) -> Result<Message, Error> {
        let result = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            // Sender dropped without completing: the engine went away.
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout),
        };
        self.remove(token);
        result
    }

    /// Completes the waiter registered for `token`, if any.
    pub fn complete(&self, token: Token, result: Result<Message, Error>) -> bool {
        let waiter = self.waiters.lock().expect("Lock failed").remove(&token);
        match waiter {
            Some(sender) => sender.send(result).is_ok(),
            None => {
                warn!("no awaited request for token {}", token);
                false
            }
        }
    }

    /// Returns true if a waiter is registered for `token`.
    pub fn is_waiting(&self, token: Token) -> bool {
        self.waiters.lock().expect("Lock failed").contains_key(&token)
    }

    /// Fails every outstanding waiter, e.g. on shutdown.
    pub fn fail_all(&self, error: Error) {
        let waiters: Vec<Waiter> = {
            let mut map = self.waiters.lock().expect("Lock failed");
            map.drain().map(|(_, sender)| sender).collect()
        };
        for sender in waiters {
            let _ = sender.send(Err(error));
        }
    }

    fn remove(&self, token: Token) {
        self.waiters.lock().expect("Lock failed").remove(&token);
    }
}
