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

//! The length-prefix-framed stream transport, driven by a raw TCP peer.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use coap_node::message::framed;
use coap_node::{
    EndpointParams, Message, Method, MsgCode, Outcome, Resource, Server, Token,
};

struct RawStream {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl RawStream {
    async fn connect(addr: std::net::SocketAddr) -> RawStream {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        RawStream {
            stream,
            buf: Vec::new(),
        }
    }

    async fn send(&mut self, message: &Message) {
        let data = framed::encode(message).expect("encode failed");
        self.stream.write_all(&data).await.expect("write failed");
    }

    async fn recv(&mut self) -> Message {
        let deadline = Duration::from_secs(5);
        loop {
            if let Some((message, consumed)) =
                framed::decode(&self.buf).expect("framing error")
            {
                self.buf.drain(..consumed);
                return message;
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(deadline, self.stream.read(&mut chunk))
                .await
                .expect("no frame within deadline")
                .expect("read failed");
            assert_ne!(n, 0, "connection closed while awaiting a frame");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

async fn stream_server() -> (Server, std::net::SocketAddr) {
    let server = Server::new();
    let bound = server
        .add_endpoint("coap+tcp://127.0.0.1:0", EndpointParams::default())
        .await
        .expect("bind failed");
    server.add_resource(
        "basic/",
        Resource::new("basic")
            .payload("over the stream")
            .handle(Method::Get, |resource, _request| {
                let (payload, format) = resource.stored_payload(None).unwrap();
                Ok(Outcome::content(payload.to_vec(), format))
            }),
    );
    (server, bound[0])
}

#[tokio::test]
async fn csm_then_request() {
    let (server, addr) = stream_server().await;
    let mut peer = RawStream::connect(addr).await;

    // The server leads with its capabilities.
    let server_csm = peer.recv().await;
    assert_eq!(server_csm.code, MsgCode::SignalCsm);
    let settings = framed::parse_csm(&server_csm).unwrap();
    assert!(settings.max_message_size >= 1152);
    assert!(settings.block_wise_transfer);

    // Announce ours, then ask for the resource. No message-ID anywhere.
    peer.send(&framed::csm(framed::CsmSettings::default())).await;

    let mut request = Message::request(Method::Get);
    request.msg_type = None;
    request.token = Token::new(&[0x51]);
    request.set_uri_path("/basic");
    peer.send(&request).await;

    let response = peer.recv().await;
    assert_eq!(response.code, MsgCode::SuccessContent);
    assert_eq!(response.token, request.token);
    assert_eq!(response.payload, b"over the stream");
    assert_eq!(response.mid, None);

    server.close().await;
}

#[tokio::test]
async fn ping_draws_pong() {
    let (server, addr) = stream_server().await;
    let mut peer = RawStream::connect(addr).await;

    let _server_csm = peer.recv().await;
    peer.send(&framed::csm(framed::CsmSettings::default())).await;

    let mut ping = Message::new();
    ping.code = MsgCode::SignalPing;
    ping.token = Token::new(&[0x77]);
    peer.send(&ping).await;

    let pong = peer.recv().await;
    assert_eq!(pong.code, MsgCode::SignalPong);
    assert_eq!(pong.token, ping.token);

    server.close().await;
}

#[tokio::test]
async fn request_before_csm_aborts() {
    let (server, addr) = stream_server().await;
    let mut peer = RawStream::connect(addr).await;

    let _server_csm = peer.recv().await;

    // Skip the CSM and go straight to a request.
    let mut request = Message::request(Method::Get);
    request.msg_type = None;
    request.set_uri_path("/basic");
    peer.send(&request).await;

    let abort = peer.recv().await;
    assert_eq!(abort.code, MsgCode::SignalAbort);

    server.close().await;
}
