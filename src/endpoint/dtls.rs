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

//! The secure datagram abstraction behind `coaps:` endpoints.
//!
//! The handshake machinery is an external collaborator: the engine
//! consumes any implementation of [`SecureDatagramSocket`] and never looks
//! inside the crypto. Install a [`SecureTransportFactory`] on the engine
//! and `coaps://` endpoints bind through it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;

/// Bind-time material for a secure endpoint, taken from the
/// `add_endpoint` options.
#[derive(Debug, Clone, Default)]
pub struct SecureParams {
    /// Path of the certificate chain file.
    pub certfile: Option<String>,

    /// Path of the private key file.
    pub keyfile: Option<String>,
}

/// A datagram socket whose payloads are protected by the implementation.
///
/// Mirrors the plain UDP socket surface: the engine reads and writes whole
/// datagrams and never sees handshake traffic.
pub trait SecureDatagramSocket: Send + Sync + 'static {
    /// The bound local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Sends one protected datagram to `dest`.
    fn send_to<'a>(&'a self, buf: &'a [u8], dest: SocketAddr) -> BoxFuture<'a, io::Result<usize>>;

    /// Receives one plaintext datagram, returning its length and origin.
    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>>;
}

/// Binds secure datagram sockets for `coaps:` endpoints.
pub trait SecureTransportFactory: Send + Sync + 'static {
    /// Binds a secure socket on `addr` using the given key material.
    fn bind<'a>(
        &'a self,
        addr: SocketAddr,
        params: &'a SecureParams,
    ) -> BoxFuture<'a, io::Result<Arc<dyn SecureDatagramSocket>>>;
}
