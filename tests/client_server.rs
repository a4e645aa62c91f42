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

//! Two engines talking to each other through the client API.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::body;

use coap_node::message::codec;
use coap_node::{
    ContentFormat, EndpointParams, Error, Message, Method, MsgCode, MsgType, Outcome, Resource,
    Server, TransParams,
};
use futures::FutureExt;

fn fast_params() -> TransParams {
    TransParams {
        ack_timeout: Duration::from_millis(100),
        max_retransmit: 2,
        response_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn serving_server() -> (Server, SocketAddr) {
    let server = Server::new();
    let bound = server
        .add_endpoint("coap://127.0.0.1:0", EndpointParams::default())
        .await
        .expect("bind failed");

    server.add_resource(
        "basic/",
        Resource::new("basic")
            .payload("hello world")
            .handle(Method::Get, |resource, _request| {
                let (payload, format) = resource.stored_payload(None).unwrap();
                Ok(Outcome::content(payload.to_vec(), format))
            }),
    );
    (server, bound[0])
}

async fn client_server() -> (Server, SocketAddr) {
    let client = Server::with_params(fast_params());
    let bound = client
        .add_endpoint("coap://127.0.0.1:0", EndpointParams::default())
        .await
        .expect("bind failed");
    (client, bound[0])
}

#[tokio::test]
async fn request_response_round_trip() {
    common::init_logging();
    let (server, server_addr) = serving_server().await;
    let (client, _) = client_server().await;

    let mut request = Message::request(Method::Get);
    request.destination = Some(server_addr);
    request.set_uri_path("/basic");

    let response = client
        .send_message(request, false, None)
        .await
        .expect("request failed")
        .expect("a response was awaited");

    assert_eq!(response.code, MsgCode::SuccessContent);
    assert_eq!(response.payload, b"hello world");
    assert_eq!(
        response.content_format(),
        Some(ContentFormat::TEXT_PLAIN_UTF8)
    );

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn unanswered_confirmable_times_out() {
    let (client, _) = client_server().await;

    // Nobody listens here.
    let mut request = Message::request(Method::Get);
    request.destination = Some("127.0.0.1:9".parse().unwrap());
    request.set_uri_path("/basic");

    let result = client.send_message(request, false, None).await;
    assert_eq!(result.unwrap_err(), Error::Timeout);

    client.close().await;
}

#[tokio::test]
async fn retransmission_bound() {
    // A mute peer counts how often the confirmable arrives: the initial
    // transmission plus MAX_RETRANSMIT copies, no more.
    let mute = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mute_addr = mute.local_addr().unwrap();

    let (client, _) = client_server().await;

    let mut request = Message::request(Method::Get);
    request.destination = Some(mute_addr);
    request.set_uri_path("/basic");

    let send = client.send_message(request, false, None);

    let count_copies = async {
        let mut buf = [0u8; 1500];
        let mut copies = 0usize;
        loop {
            match tokio::time::timeout(Duration::from_secs(2), mute.recv_from(&mut buf)).await {
                Ok(Ok(_)) => copies += 1,
                _ => break,
            }
        }
        copies
    };

    let (result, copies) = tokio::join!(send, count_copies);
    assert_eq!(result.unwrap_err(), Error::Timeout);
    assert_eq!(copies, 3, "initial transmission plus MAX_RETRANSMIT copies");

    client.close().await;
}

#[tokio::test]
async fn empty_ack_then_separate_response() {
    // A handler that outlives PROCESSING_DELAY forces separate-response
    // mode: empty Ack first, confirmable response later.
    let server = Server::with_params(fast_params());
    let bound = server
        .add_endpoint("coap://127.0.0.1:0", EndpointParams::default())
        .await
        .unwrap();
    server.add_resource(
        "slow/",
        Resource::new("slow").handle_deferred(Method::Get, |_resource, _request| {
            async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok(Outcome::text("eventually"))
            }
            .boxed()
        }),
    );

    let client = common::RawClient::new(bound[0]).await;
    let mut request = Message::request(Method::Get);
    request.mid = Some(9000);
    request.destination = Some(bound[0]);
    request.set_uri_path("/slow");

    client.send(&request).await;

    let ack = client.recv().await;
    assert_eq!(ack.msg_type, Some(MsgType::Ack));
    assert!(ack.is_empty_code());
    assert_eq!(ack.mid, Some(9000));

    let response = client.recv().await;
    assert_eq!(response.msg_type, Some(MsgType::Con));
    assert_eq!(response.code, MsgCode::SuccessContent);
    assert_eq!(response.payload, b"eventually");
    assert_ne!(response.mid, Some(9000));

    // Acknowledge so the server's retransmission loop stands down.
    let mut ack_out = Message::empty_ack(response.mid.unwrap());
    ack_out.destination = Some(bound[0]);
    client.send(&ack_out).await;

    server.close().await;
}

#[tokio::test]
async fn client_block1_upload() {
    let server = Server::new();
    let bound = server
        .add_endpoint("coap://127.0.0.1:0", EndpointParams::default())
        .await
        .unwrap();

    let expected = body(2500);
    let check = expected.clone();
    server.add_resource(
        "sink/",
        Resource::new("sink").handle(Method::Post, move |_resource, request| {
            if request.payload == check {
                Ok(Outcome::content(Vec::new(), ContentFormat::TEXT_PLAIN_UTF8))
            } else {
                Err(Error::InvalidArgument)
            }
        }),
    );

    let (client, _) = client_server().await;

    let mut request = Message::request(Method::Post);
    request.destination = Some(bound[0]);
    request.set_uri_path("/sink");
    request.payload = expected;

    let response = client
        .send_message(request, false, Some(Duration::from_secs(5)))
        .await
        .expect("upload failed")
        .expect("a response was awaited");

    assert_eq!(response.code, MsgCode::SuccessChanged);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn client_block2_download() {
    let payload = body(2041);

    let server = Server::new();
    let bound = server
        .add_endpoint("coap://127.0.0.1:0", EndpointParams::default())
        .await
        .unwrap();
    server.add_resource(
        "big/",
        Resource::new("big")
            .payload(payload.clone())
            .handle(Method::Get, |resource, _request| {
                let (payload, format) = resource.stored_payload(None).unwrap();
                Ok(Outcome::content(payload.to_vec(), format))
            }),
    );

    let (client, _) = client_server().await;

    let mut request = Message::request(Method::Get);
    request.destination = Some(bound[0]);
    request.set_uri_path("/big");

    let response = client
        .send_message(request, false, Some(Duration::from_secs(5)))
        .await
        .expect("download failed")
        .expect("a response was awaited");

    assert_eq!(response.code, MsgCode::SuccessContent);
    assert_eq!(response.payload, payload);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn no_response_send_returns_immediately() {
    let (server, server_addr) = serving_server().await;
    let (client, _) = client_server().await;

    let mut request = Message::request(Method::Get);
    request.destination = Some(server_addr);
    request.set_uri_path("/basic");

    let result = client.send_message(request, true, None).await.unwrap();
    assert!(result.is_none());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn close_cancels_pending_waits() {
    let (client, _) = client_server().await;

    let mut request = Message::request(Method::Get);
    request.destination = Some("127.0.0.1:9".parse().unwrap());
    request.set_uri_path("/basic");

    let pending = client.send_message(request, false, Some(Duration::from_secs(30)));
    let closer = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.close().await;
    };

    let (result, ()) = tokio::join!(pending, closer);
    assert_eq!(result.unwrap_err(), Error::Cancelled);

    // Closing twice is fine.
    client.close().await;

    // And sending afterwards reports cancellation.
    let mut request = Message::request(Method::Get);
    request.destination = Some("127.0.0.1:9".parse().unwrap());
    let result = client.send_message(request, false, None).await;
    assert_eq!(result.unwrap_err(), Error::Cancelled);
}

#[tokio::test]
async fn coaps_needs_a_secure_transport() {
    let server = Server::new();
    let result = server
        .add_endpoint("coaps://127.0.0.1:0", EndpointParams::default())
        .await;
    assert_eq!(result.unwrap_err(), Error::UnsupportedUriScheme);
}

#[tokio::test]
async fn reset_aborts_waiter() {
    // A raw peer answering with Reset fails the client's wait.
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let (client, _) = client_server().await;

    let mut request = Message::request(Method::Get);
    request.destination = Some(peer_addr);
    request.set_uri_path("/basic");

    let send = client.send_message(request, false, None);
    let rejecter = async {
        let mut buf = [0u8; 1500];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        let received = codec::decode(&buf[..len]).unwrap();
        let reset = Message::reset(received.mid.unwrap(), MsgCode::Empty);
        let data = codec::encode(&reset).unwrap();
        peer.send_to(&data, from).await.unwrap();
    };

    let (result, ()) = tokio::join!(send, rejecter);
    assert_eq!(result.unwrap_err(), Error::Reset);

    client.close().await;
}
