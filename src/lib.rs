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

//! An asynchronous, symmetric implementation of the Constrained
//! Application Protocol (CoAP) for Tokio.
//!
//! One [`Server`] instance acts as CoAP client and server at the same
//! time, over plain UDP (`coap:`), DTLS (`coaps:`, through an injected
//! [secure socket](endpoint::SecureDatagramSocket)), and a
//! length-prefix-framed stream transport (`coap+tcp:`).
//!
//! The engine is a stack of layers composed from the socket upward: the
//! wire [codec](message::codec), the message layer matching exchanges and
//! retransmitting confirmables, the block-wise transfer assembler, the
//! observe relationship manager, and the request router over a
//! path-indexed [resource tree](ResourceTree).
//!
//! ## Serving a resource
//!
//! ```no_run
//! use coap_node::{EndpointParams, Method, Outcome, Resource, Server};
//!
//! # async fn demo() -> Result<(), coap_node::Error> {
//! let server = Server::new();
//! server
//!     .add_endpoint("coap://0.0.0.0:5683", EndpointParams::default())
//!     .await?;
//!
//! server.add_resource(
//!     "basic/",
//!     Resource::new("basic")
//!         .observable()
//!         .payload("hello world")
//!         .handle(Method::Get, |resource, _request| {
//!             let (payload, format) = resource.stored_payload(None).unwrap();
//!             Ok(Outcome::content(payload.to_vec(), format))
//!         }),
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Sending a request
//!
//! ```no_run
//! use coap_node::{Message, Method, Server};
//!
//! # async fn demo(server: Server) -> Result<(), coap_node::Error> {
//! let mut request = Message::request(Method::Get);
//! request.destination = Some("127.0.0.1:5683".parse().unwrap());
//! request.set_uri_path("/basic");
//!
//! if let Some(response) = server.send_message(request, false, None).await? {
//!     println!("{}", String::from_utf8_lossy(&response.payload));
//! }
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod consts;
pub mod content_format;
pub mod endpoint;
pub mod error;
pub mod link_format;
pub mod message;
pub mod option;
pub mod resource;
pub mod trans_params;
pub mod transaction;

pub(crate) mod layers;
pub(crate) mod util;

mod server;

pub use block::Block;
pub use consts::{AddressFamily, Scheme};
pub use content_format::ContentFormat;
pub use endpoint::{Endpoint, EndpointParams};
pub use error::Error;
pub use message::{Message, Method, MsgCode, MsgCodeClass, MsgType, Token};
pub use option::OptionNumber;
pub use resource::{Outcome, Resource, ResourceTree};
pub use server::Server;
pub use trans_params::TransParams;
