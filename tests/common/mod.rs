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

//! A raw UDP CoAP client for exercising the engine from the outside.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use simple_logger::SimpleLogger;
use tokio::net::UdpSocket;

use coap_node::message::codec;
use coap_node::Message;

/// Wires the `log` facade to stderr once per test binary.
pub fn init_logging() {
    let _ = SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
}

pub struct RawClient {
    socket: UdpSocket,
    pub server: SocketAddr,
}

impl RawClient {
    pub async fn new(server: SocketAddr) -> RawClient {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("UDP bind failed");
        RawClient { socket, server }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("no local addr")
    }

    pub async fn send(&self, message: &Message) {
        let data = codec::encode(message).expect("encode failed");
        self.send_raw(&data).await;
    }

    pub async fn send_raw(&self, data: &[u8]) {
        self.socket
            .send_to(data, self.server)
            .await
            .expect("send failed");
    }

    /// Receives and decodes one datagram, panicking after five seconds.
    pub async fn recv(&self) -> Message {
        self.try_recv(Duration::from_secs(5))
            .await
            .expect("no datagram within deadline")
    }

    /// Receives one datagram, or `None` when `deadline` passes silently.
    pub async fn try_recv(&self, deadline: Duration) -> Option<Message> {
        let mut buf = vec![0u8; 65536];
        let received = tokio::time::timeout(deadline, self.socket.recv_from(&mut buf)).await;
        match received {
            Ok(Ok((len, _))) => Some(codec::decode(&buf[..len]).expect("decode failed")),
            Ok(Err(e)) => panic!("recv failed: {:?}", e),
            Err(_) => None,
        }
    }

    /// One request/response round trip.
    pub async fn exchange(&self, message: &Message) -> Message {
        self.send(message).await;
        self.recv().await
    }
}

/// A deterministic test body of the given length.
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
